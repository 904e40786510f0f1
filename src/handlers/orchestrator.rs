use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context as _;
use chrono::Local;
use serde_json::json;
use tracing::{info, warn};

use crate::grammar::{LaunchOptions, ParsedCommand, trailing_dry_run};
use crate::integration::IntegrationManager;
use crate::launcher::{AgentCommand, Launcher, agent_prompt};
use crate::memo::{MemoScanner, MemoState};
use crate::router::{CommandResult, Context};
use crate::tasks::{self, IterationTasks};
use crate::template::{self, DispatchMemoContext, IterationDocContext};
use crate::workflow::Workflow;
use crate::worktree::WorktreeManager;

/// `/orchestrator::start_workflow(workflow, phase, iteration)`
///
/// Writes the iteration docs, task cards with their index, and a draft
/// dispatch memo, then prepares one worktree per role.
pub fn start_workflow(cmd: &ParsedCommand, ctx: &Context) -> anyhow::Result<CommandResult> {
    let [workflow_name, phase, iteration_id] = cmd.args() else {
        anyhow::bail!("start_workflow requires 3 args");
    };
    let root = &ctx.repo_root;
    let config = &ctx.config;

    let path = Workflow::resolve_path(workflow_name, root, &config.workflows_dir(root));
    if !path.exists() {
        return Ok(CommandResult::err(
            format!("Workflow config not found: {}", path.display()),
            json!({ "workflow": workflow_name, "searched": path }),
        ));
    }
    let workflow = Workflow::load(&path)?;
    let iteration = workflow.find_iteration(phase, iteration_id)?;

    let iteration_dir = config.iterations_dir(root).join(iteration_id);
    std::fs::create_dir_all(&iteration_dir)
        .with_context(|| format!("creating {}", iteration_dir.display()))?;
    let doc = IterationDocContext {
        workflow: workflow.display_name(),
        phase,
        iteration: iteration_id,
        source: path
            .strip_prefix(root)
            .unwrap_or(&path)
            .display()
            .to_string(),
        goal: iteration.goal_text(),
        tasks_dir: &config.tasks.cards_dir,
        agent_sync_dir: &config.coordination.agent_sync_dir,
        deliverables: iteration.deliverable_paths(),
        requirements: &iteration.completion_criteria.requirements,
    };
    write(&iteration_dir.join("CONTEXT.md"), &template::render_context(&doc)?)?;
    write(
        &iteration_dir.join("COMPLETION_CRITERIA.md"),
        &template::render_completion_criteria(&doc)?,
    )?;

    let today = Local::now().date_naive();
    let generated =
        tasks::generate_task_cards(&config.tasks_dir(root), iteration_id, iteration, today)?;

    let mut created = Vec::new();
    let mut reused = Vec::new();
    let mut worktree_failures = Vec::new();
    let manager = config
        .worktrees
        .enabled
        .then(|| WorktreeManager::new(root, config.worktree_base(root)));
    if let Some(mgr) = &manager {
        for role in iteration.roles() {
            if mgr.exists(&role, iteration_id) {
                reused.push(mgr.path_for(&role, iteration_id));
                continue;
            }
            match mgr.create(
                &role,
                iteration_id,
                &config.project.trunk_branch,
                &config.worktrees.branch_prefix,
            ) {
                Ok(wt) => created.push(wt.path),
                Err(err) => {
                    warn!(role = %role, error = %err, "could not create worktree");
                    worktree_failures.push(json!({ "role": role, "error": format!("{err:#}") }));
                }
            }
        }
    }

    let mut agent_commands = Vec::new();
    if config.agent.enabled {
        for card in &generated.cards {
            let worktree = manager
                .as_ref()
                .filter(|mgr| mgr.exists(&card.role, iteration_id))
                .map(|mgr| mgr.path_for(&card.role, iteration_id));
            let prompt = agent_prompt(&config.agent, card, iteration_id, worktree.as_deref())?;
            agent_commands.push(AgentCommand::build(&config.agent, &prompt).heredoc());
        }
    }

    let date = today.format("%Y-%m-%d").to_string();
    let start_commands: Vec<String> = generated.cards.iter().map(|c| c.start_command()).collect();
    let memo_path = config
        .agent_sync_dir(root)
        .join(format!("{date}_orchestrator_task-dispatch_{iteration_id}.md"));
    let memo = template::render_dispatch_memo(&DispatchMemoContext {
        iteration: iteration_id,
        date: &date,
        workflow: workflow.display_name(),
        phase,
        index: Path::new(&config.tasks.cards_dir)
            .join(tasks::index_file_name(today, iteration_id))
            .display()
            .to_string(),
        start_commands: &start_commands,
        agent_commands: &agent_commands,
    })?;
    write(&memo_path, &memo)?;
    info!(workflow = %workflow.display_name(), phase = %phase, iteration = %iteration_id, tasks = generated.cards.len(), "workflow started");

    Ok(CommandResult::ok(
        format!(
            "Workflow '{}' generated: {phase} / {iteration_id} ({} task(s))",
            workflow.display_name(),
            generated.cards.len()
        ),
        json!({
            "workflow": workflow.display_name(),
            "phase": phase,
            "iteration": iteration_id,
            "iteration_dir": iteration_dir,
            "task_count": generated.cards.len(),
            "tasks": generated.cards.iter().map(|c| &c.task_id).collect::<Vec<_>>(),
            "index": generated.index,
            "dispatch_memo": memo_path,
            "worktrees_created": created,
            "worktrees_reused": reused,
            "worktree_failures": worktree_failures,
            "agent_commands": agent_commands,
        }),
    ))
}

/// `/orchestrator::generate_iteration(workflow:phase:iteration)`: `start_workflow`
/// with its three arguments packed into one.
pub fn generate_iteration(cmd: &ParsedCommand, ctx: &Context) -> anyhow::Result<CommandResult> {
    let packed = &cmd.args()[0];
    let parts: Vec<String> = packed.splitn(3, ':').map(|p| p.trim().to_string()).collect();
    if parts.len() != 3 || parts.iter().any(String::is_empty) {
        return Ok(CommandResult::err(
            "generate_iteration expects 'workflow:phase:iteration' (single arg)",
            json!({ "arg": packed }),
        ));
    }
    let delegated = ParsedCommand::new("orchestrator", "start_workflow", parts);
    start_workflow(&delegated, ctx)
}

fn write(path: &Path, text: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))
}

/// `/orchestrator::launch_agents(iteration, flags..)`
pub fn launch_agents(cmd: &ParsedCommand, ctx: &Context) -> anyhow::Result<CommandResult> {
    let options = LaunchOptions::from_args(cmd.args()).map_err(anyhow::Error::msg)?;
    let launcher = Launcher::new(&ctx.repo_root, &ctx.config, ctx.cancel.clone());
    let plan = match launcher.plan(&options) {
        Ok(plan) => plan,
        Err(err) => {
            return Ok(CommandResult::err(
                format!("{err:#}"),
                json!({ "iteration": options.iteration }),
            ));
        }
    };

    let converge = IntegrationManager::from_config(
        &ctx.repo_root,
        &ctx.config,
        options.apply_ready_target.as_deref(),
        Local::now().date_naive(),
    );
    let report = launcher.run(&plan, Some(&converge))?;
    let mut data = serde_json::to_value(&report)?;
    data["options"] = serde_json::to_value(&options)?;
    data["allow_auto_apply_ready"] = json!(ctx.config.orchestration.allow_auto_apply_ready);
    Ok(CommandResult {
        success: report.success,
        message: report.message,
        data,
    })
}

/// `/orchestrator::apply_ready_to(target[, dry-run])`: integrator `apply_ready` with
/// an explicit target.
pub fn apply_ready_to(cmd: &ParsedCommand, ctx: &Context) -> anyhow::Result<CommandResult> {
    let target = &cmd.args()[0];
    let dry_run = trailing_dry_run(cmd.command(), cmd.args()).map_err(anyhow::Error::msg)?;
    let mut args = vec![target.clone()];
    if dry_run {
        args.push("dry-run".to_string());
    }
    let delegated = ParsedCommand::new("integrator", "apply_ready", args);
    let result = super::integrator::apply_ready(&delegated, ctx)?;
    Ok(CommandResult {
        message: format!("apply_ready_to({target}) -> {}", result.message),
        ..result
    })
}

/// `/orchestrator::archive_tasks(iteration[, dry-run])`
pub fn archive_tasks(cmd: &ParsedCommand, ctx: &Context) -> anyhow::Result<CommandResult> {
    let iteration = &cmd.args()[0];
    let dry_run = trailing_dry_run(cmd.command(), cmd.args()).map_err(anyhow::Error::msg)?;
    let result = tasks::archive_iteration(
        &ctx.config.tasks_dir(&ctx.repo_root),
        iteration,
        &ctx.config.archive_dir(&ctx.repo_root),
        dry_run,
        None,
        Local::now(),
    )?;
    Ok(CommandResult {
        success: result.success,
        message: result.message.clone(),
        data: serde_json::to_value(&result)?,
    })
}

/// `/orchestrator::monitor_progress(iteration)`: task count plus memo counts per state.
pub fn monitor_progress(cmd: &ParsedCommand, ctx: &Context) -> anyhow::Result<CommandResult> {
    let iteration = &cmd.args()[0];
    let root = &ctx.repo_root;

    let selection = IterationTasks::resolve(&ctx.config.tasks_dir(root), iteration).ok();
    let task_count = selection.as_ref().map_or(0, |s| s.cards.len());

    let memos = MemoScanner::new(ctx.config.agent_sync_dir(root)).scan_all();
    let mut by_state: BTreeMap<&str, usize> =
        MemoState::ALL.iter().map(|s| (s.as_str(), 0)).collect();
    for memo in &memos {
        *by_state.entry(memo.state().as_str()).or_insert(0) += 1;
    }
    let ready: Vec<String> = memos
        .iter()
        .filter(|m| m.state() == MemoState::ReadyToConsume)
        .map(|m| m.file_name())
        .collect();

    let logs_dir = ctx
        .config
        .iterations_dir(root)
        .join(iteration)
        .join("agent-cli-logs");
    let log_count = std::fs::read_dir(&logs_dir)
        .map(|entries| entries.filter_map(Result::ok).count())
        .unwrap_or(0);

    let summary = MemoState::ALL
        .iter()
        .map(|s| format!("{}={}", s.as_str(), by_state[s.as_str()]))
        .collect::<Vec<_>>()
        .join(", ");
    Ok(CommandResult::ok(
        format!("Iteration '{iteration}': {task_count} task(s); memos: {summary}"),
        json!({
            "iteration": iteration,
            "index": selection.as_ref().map(|s| &s.index),
            "task_count": task_count,
            "memos": by_state,
            "ready_to_consume": ready,
            "log_files": log_count,
        }),
    ))
}
