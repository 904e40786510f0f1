use serde_json::json;
use tracing::debug;

use crate::grammar::ParsedCommand;
use crate::router::{CommandResult, Context};
use crate::tasks::{self, TaskCard};
use crate::worktree::WorktreeManager;

/// `/<role>::start_task(task)`: make sure the task has its worktree.
///
/// An existing `(role, task)` worktree is reused; otherwise one is branched
/// from trunk.
pub fn start_task(cmd: &ParsedCommand, ctx: &Context) -> anyhow::Result<CommandResult> {
    let role = cmd.role();
    let task = &cmd.args()[0];
    let root = &ctx.repo_root;
    let config = &ctx.config;
    let card = config.tasks_dir(root).join(format!("{task}.md"));
    let card = card.is_file().then_some(card);

    if !config.worktrees.enabled {
        return Ok(CommandResult::ok(
            format!("Task '{task}' ready for {role}"),
            json!({
                "role": role,
                "task": task,
                "card": card,
                "worktree": null,
                "note": "worktrees are disabled; work in the main checkout",
            }),
        ));
    }

    let mgr = WorktreeManager::new(root, config.worktree_base(root));
    let branch = WorktreeManager::branch_name(&config.worktrees.branch_prefix, role, task);
    let (path, created) = if mgr.exists(role, task) {
        (mgr.path_for(role, task), false)
    } else {
        let wt = mgr.create(
            role,
            task,
            &config.project.trunk_branch,
            &config.worktrees.branch_prefix,
        )?;
        (wt.path, true)
    };

    let verb = if created { "Created" } else { "Reusing" };
    Ok(CommandResult::ok(
        format!("{verb} worktree for {role}/{task} at {}", path.display()),
        json!({
            "role": role,
            "task": task,
            "card": card,
            "worktree": path,
            "branch": branch,
            "created": created,
        }),
    ))
}

/// `/<role>::start_next`: start the first card for this role, in the newest
/// index, that has no worktree yet.
pub fn start_next(cmd: &ParsedCommand, ctx: &Context) -> anyhow::Result<CommandResult> {
    let role = cmd.role();
    let root = &ctx.repo_root;
    let config = &ctx.config;
    let Some(index) = tasks::newest_index(&config.tasks_dir(root)) else {
        return Ok(CommandResult::ok(
            format!("No task index found; nothing to start for {role}"),
            json!({ "role": role, "task": null }),
        ));
    };

    let mgr = WorktreeManager::new(root, config.worktree_base(root));
    let mut next = None;
    for path in tasks::index_cards(&index)? {
        let card = TaskCard::load(&path)?;
        if card.role != role {
            continue;
        }
        if config.worktrees.enabled && mgr.exists(role, &card.task_id) {
            debug!(task = %card.task_id, "already started");
            continue;
        }
        next = Some(card);
        break;
    }

    let Some(card) = next else {
        return Ok(CommandResult::ok(
            format!("No pending tasks for {role}"),
            json!({ "role": role, "task": null, "index": index }),
        ));
    };
    let delegated = ParsedCommand::new(role, "start_task", vec![card.task_id.clone()]);
    start_task(&delegated, ctx)
}

/// `/<role>::report_token_usage`: agents report usage in their memo; this only
/// tells them where.
pub fn report_token_usage(cmd: &ParsedCommand, ctx: &Context) -> anyhow::Result<CommandResult> {
    let role = cmd.role();
    Ok(CommandResult::ok(
        format!("Token usage report for {role}"),
        json!({
            "role": role,
            "memo_dir": ctx.config.agent_sync_dir(&ctx.repo_root),
            "note": "Add a **Token Usage** line to your ready-to-consume memo",
        }),
    ))
}
