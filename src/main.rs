use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Parser, Subcommand};

use convoy::commands::{
    self, exec::ExecArgs, list::ListArgs, memos::MemosArgs, validate::ValidateArgs,
    worktree::WorktreeCommand,
};
use convoy::{error, telemetry};

#[derive(Debug, Parser)]
#[command(
    name = "convoy",
    version,
    about = "Dispatch agents into git worktrees and converge their work"
)]
struct Cli {
    /// Project root directory (defaults to the enclosing git repository)
    #[arg(long, global = true)]
    project_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse, validate and run one command
    Exec(ExecArgs),
    /// Check a command without running it
    Validate(ValidateArgs),
    /// List registered commands
    List(ListArgs),
    /// Read commands from stdin, one per line
    Repl,
    /// Manage agent worktrees
    Worktree {
        #[command(subcommand)]
        command: WorktreeCommand,
    },
    /// Show coordination memos and their states
    Memos(MemosArgs),
    /// Print the JSON Schema for .convoy.toml
    Schema,
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Exec(_) => "exec",
            Self::Validate(_) => "validate",
            Self::List(_) => "list",
            Self::Repl => "repl",
            Self::Worktree { .. } => "worktree",
            Self::Memos(_) => "memos",
            Self::Schema => "schema",
        }
    }
}

fn main() -> ExitCode {
    telemetry::init();

    let cli = Cli::parse();

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("interrupt received, finishing running tasks");
        flag.store(true, Ordering::SeqCst);
    }) {
        tracing::warn!(error = %e, "could not install Ctrl-C handler");
    }

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let context = || commands::load_context(cli.project_root.as_deref(), Arc::clone(&cancel));
    let result = match &cli.command {
        Commands::Exec(args) => context().and_then(|ctx| args.execute(&ctx)),
        Commands::Validate(args) => args.execute(),
        Commands::List(args) => args.execute(),
        Commands::Repl => context().and_then(|ctx| commands::repl::run_repl(&ctx)),
        Commands::Worktree { command } => {
            let _sub = tracing::info_span!("worktree", action = command.name()).entered();
            context().and_then(|ctx| command.execute(&ctx))
        }
        Commands::Memos(args) => context().and_then(|ctx| args.execute(&ctx)),
        Commands::Schema => commands::schema::run_schema(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(exit_err) = e.downcast_ref::<error::ExitError>() {
                eprintln!("error: {exit_err}");
                exit_err.exit_code()
            } else {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        }
    }
}
