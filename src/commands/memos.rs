use clap::Args;
use serde::Serialize;

use super::OutputFormat;
use crate::memo::{Memo, MemoScanner, MemoState};
use crate::router::Context;

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum StateFilter {
    Draft,
    ReadyToConsume,
    ReadyToMerge,
    Blocked,
    Unknown,
}

impl From<StateFilter> for MemoState {
    fn from(filter: StateFilter) -> Self {
        match filter {
            StateFilter::Draft => Self::Draft,
            StateFilter::ReadyToConsume => Self::ReadyToConsume,
            StateFilter::ReadyToMerge => Self::ReadyToMerge,
            StateFilter::Blocked => Self::Blocked,
            StateFilter::Unknown => Self::Unknown,
        }
    }
}

#[derive(Debug, Args)]
pub struct MemosArgs {
    /// Only show memos in this state
    #[arg(long, value_enum)]
    pub state: Option<StateFilter>,
    /// Output format
    #[arg(long, value_enum, default_value_t)]
    pub format: OutputFormat,
}

#[derive(Debug, Serialize)]
struct MemoRow<'a> {
    state: MemoState,
    #[serde(flatten)]
    memo: &'a Memo,
}

impl MemosArgs {
    pub fn execute(&self, ctx: &Context) -> anyhow::Result<()> {
        let scanner = MemoScanner::new(ctx.config.agent_sync_dir(&ctx.repo_root));
        let memos = match self.state {
            Some(state) => scanner.scan_state(state.into()),
            None => scanner.scan_all(),
        };

        match self.format {
            OutputFormat::Json => {
                let rows: Vec<MemoRow<'_>> = memos
                    .iter()
                    .map(|memo| MemoRow {
                        state: memo.state(),
                        memo,
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            }
            OutputFormat::Text => {
                if memos.is_empty() {
                    println!("No memos in {}", scanner.dir().display());
                }
                for memo in &memos {
                    println!(
                        "{:<16} {}  {}",
                        memo.state().as_str(),
                        memo.file_name(),
                        memo.branch.as_deref().unwrap_or("-")
                    );
                }
            }
        }
        Ok(())
    }
}
