use clap::Args;

use super::{OutputFormat, print_result};
use crate::error::ExitError;
use crate::grammar;
use crate::router::{Context, Router};

#[derive(Debug, Args)]
pub struct ExecArgs {
    /// Command text, e.g. `/integrator::apply_ready(dry-run)`
    pub command: String,
    /// Output format
    #[arg(long, value_enum, default_value_t)]
    pub format: OutputFormat,
}

impl ExecArgs {
    pub fn execute(&self, ctx: &Context) -> anyhow::Result<()> {
        let cmd = grammar::parse(&self.command)
            .ok_or_else(|| ExitError::InvalidCommand(format!("not a command: {}", self.command)))?;
        let result = Router::with_default_handlers().route(&cmd, ctx);
        print_result(&result, self.format)?;
        if result.success {
            Ok(())
        } else {
            Err(ExitError::new(1, format!("{cmd} failed")).into())
        }
    }
}
