use clap::Args;

use super::OutputFormat;
use crate::grammar::RoleClass;
use crate::router::Router;

#[derive(Debug, Args)]
pub struct ListArgs {
    /// Only list one role class
    #[arg(long, value_parser = ["orchestrator", "integrator", "role"])]
    pub role: Option<String>,
    /// Output format
    #[arg(long, value_enum, default_value_t)]
    pub format: OutputFormat,
}

impl ListArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let class = self.role.as_deref().map(RoleClass::of);
        let commands = Router::with_default_handlers().list_commands(class);
        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&commands)?),
            OutputFormat::Text => {
                for (class, names) in &commands {
                    println!("{class}:");
                    for name in names {
                        println!("  {name}");
                    }
                }
            }
        }
        Ok(())
    }
}
