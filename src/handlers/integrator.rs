use chrono::Local;
use serde_json::json;

use crate::grammar::{ParsedCommand, is_dry_run};
use crate::integration::IntegrationManager;
use crate::router::{CommandResult, Context};
use crate::tasks;
use crate::workflow::Workflow;

/// `/integrator::apply_ready([target][, dry-run])`
pub fn apply_ready(cmd: &ParsedCommand, ctx: &Context) -> anyhow::Result<CommandResult> {
    let dry_run = cmd.args().iter().any(|a| is_dry_run(a));
    let target = cmd.args().iter().find(|a| !is_dry_run(a));
    let manager = IntegrationManager::from_config(
        &ctx.repo_root,
        &ctx.config,
        target.map(String::as_str),
        Local::now().date_naive(),
    );

    let result = manager.apply_ready(dry_run);
    let mut data = serde_json::to_value(&result)?;
    data["trunk_branch"] = json!(ctx.config.project.trunk_branch);
    data["total_processed"] = json!(result.total_processed());
    Ok(CommandResult {
        success: result.success,
        message: result.message,
        data,
    })
}

/// `/integrator::check_conflicts(branch)`: trial merge against the checked-out HEAD.
pub fn check_conflicts(cmd: &ParsedCommand, ctx: &Context) -> anyhow::Result<CommandResult> {
    let branch = &cmd.args()[0];
    let manager =
        IntegrationManager::from_config(&ctx.repo_root, &ctx.config, None, Local::now().date_naive());
    let (has_conflicts, detail) = manager.check_merge_conflicts(branch)?;
    let data = json!({
        "branch": branch,
        "has_conflicts": has_conflicts,
        "detail": detail,
    });
    Ok(if has_conflicts {
        CommandResult::err(format!("Conflicts merging {branch}: {detail}"), data)
    } else {
        CommandResult::ok(detail, data)
    })
}

/// `/integrator::distribute_tasks(iteration)`: write the iteration's task cards and
/// index from whichever workflow defines it. No worktrees, no iteration docs.
pub fn distribute_tasks(cmd: &ParsedCommand, ctx: &Context) -> anyhow::Result<CommandResult> {
    let iteration_id = &cmd.args()[0];
    let root = &ctx.repo_root;
    let workflows_dir = ctx.config.workflows_dir(root);
    let Some((path, workflow)) = Workflow::find_defining(&workflows_dir, iteration_id)? else {
        return Ok(CommandResult::err(
            format!(
                "No workflow in {} defines iteration '{iteration_id}'",
                workflows_dir.display()
            ),
            json!({ "iteration": iteration_id }),
        ));
    };
    let (phase, iteration) = workflow
        .iteration_by_id(iteration_id)
        .ok_or_else(|| anyhow::anyhow!("iteration '{iteration_id}' vanished from {}", path.display()))?;

    let generated = tasks::generate_task_cards(
        &ctx.config.tasks_dir(root),
        iteration_id,
        iteration,
        Local::now().date_naive(),
    )?;
    Ok(CommandResult::ok(
        format!("Distributed {} task(s) for '{iteration_id}'", generated.cards.len()),
        json!({
            "iteration": iteration_id,
            "workflow": workflow.display_name(),
            "workflow_path": path,
            "phase": phase.key(),
            "task_count": generated.cards.len(),
            "task_cards": generated.cards.iter().map(|c| &c.path).collect::<Vec<_>>(),
            "index": generated.index,
        }),
    ))
}
