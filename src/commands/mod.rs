pub mod exec;
pub mod list;
pub mod memos;
pub mod repl;
pub mod schema;
pub mod validate;
pub mod worktree;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::Context as _;
use tracing::debug;

use crate::config::Config;
use crate::git::find_repo_root;
use crate::router::{CommandResult, Context};

#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Build the handler context: the explicit project root, else the git repo
/// enclosing the working directory, else the working directory itself.
pub fn load_context(project_root: Option<&Path>, cancel: Arc<AtomicBool>) -> anyhow::Result<Context> {
    let root: PathBuf = match project_root {
        Some(root) => root.to_path_buf(),
        None => {
            let cwd = std::env::current_dir().context("reading current directory")?;
            find_repo_root(&cwd).unwrap_or_else(|err| {
                debug!(error = %err, "not in a git repository, using working directory");
                cwd
            })
        }
    };
    let config = Config::load_from_dir(&root)?;
    Ok(Context::new(root, config).with_cancel(cancel))
}

/// Print a routed result: `[OK] message` plus pretty data, or the whole result as JSON.
pub fn print_result(result: &CommandResult, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(result)?),
        OutputFormat::Text => {
            println!("{result}");
            if !result.data.is_null() {
                println!("{}", serde_json::to_string_pretty(&result.data)?);
            }
        }
    }
    Ok(())
}
