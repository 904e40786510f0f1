//! Convoy - dispatch agents into git worktrees and converge their work

pub mod commands;
pub mod config;
pub mod error;
pub mod git;
pub mod grammar;
pub mod handlers;
pub mod integration;
pub mod launcher;
pub mod memo;
pub mod router;
pub mod subprocess;
pub mod tasks;
pub mod telemetry;
pub mod template;
pub mod workflow;
pub mod worktree;
