use clap::Args;

use crate::error::ExitError;
use crate::grammar;

#[derive(Debug, Args)]
pub struct ValidateArgs {
    /// Command text to check without running it
    pub command: String,
}

impl ValidateArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let cmd = grammar::parse(&self.command)
            .ok_or_else(|| ExitError::InvalidCommand(format!("not a command: {}", self.command)))?;
        grammar::validate(&cmd).map_err(ExitError::InvalidCommand)?;
        println!("OK {cmd} ({})", cmd.role_class());
        Ok(())
    }
}
