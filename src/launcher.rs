//! Runs an iteration's task cards as external agent processes.
//!
//! Three modes: dry-run (no process, log only), sequential (input order), and
//! bounded parallel (a scoped-thread worker per running task reporting over a
//! completion channel). Every launch attempt gets its own log file. Optional
//! post-run steps converge finished work and archive the consumed cards.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use chrono::Local;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::{AgentConfig, Config};
use crate::error::ExitError;
use crate::grammar::LaunchOptions;
use crate::integration::{Converge, IntegrationResult};
use crate::subprocess::{RunOutput, Tool};
use crate::tasks::{self, ArchiveResult, IterationTasks, TaskCard};
use crate::template::{self, PromptContext};
use crate::worktree::WorktreeManager;

/// How long the coordinator waits on the completion channel before
/// re-checking the cancellation flag.
const COMPLETION_POLL: Duration = Duration::from_millis(250);

/// One agent invocation: `[prefix..] command [extra..] -p <prompt> [--model m] [--output-format f]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    head: Vec<String>,
    prompt: String,
    tail: Vec<String>,
}

impl AgentCommand {
    pub fn build(agent: &AgentConfig, prompt: &str) -> Self {
        let mut head = agent.runner_prefix.clone();
        head.push(agent.command.clone());
        head.extend(agent.extra_args.iter().cloned());

        let mut tail = Vec::new();
        if let Some(model) = agent.model.as_deref().filter(|m| !m.is_empty()) {
            tail.push("--model".to_string());
            tail.push(model.to_string());
        }
        if !agent.output_format.is_empty() {
            tail.push("--output-format".to_string());
            tail.push(agent.output_format.clone());
        }

        Self {
            head,
            prompt: prompt.to_string(),
            tail,
        }
    }

    pub fn argv(&self) -> Vec<String> {
        let mut argv = self.head.clone();
        argv.push("-p".to_string());
        argv.push(self.prompt.clone());
        argv.extend(self.tail.iter().cloned());
        argv
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn to_tool(&self) -> anyhow::Result<Tool> {
        Tool::from_argv(&self.argv())
    }

    /// Single-line, shell-quoted rendering for logs.
    pub fn display(&self) -> String {
        self.argv()
            .iter()
            .map(|a| shell_quote(a))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Copy/paste form that passes the prompt through a quoted heredoc.
    pub fn heredoc(&self) -> String {
        let quote_all = |args: &[String]| {
            args.iter()
                .map(|a| shell_quote(a))
                .collect::<Vec<_>>()
                .join(" ")
        };
        let mut line = format!("{} -p \"$PROMPT\"", quote_all(&self.head));
        if !self.tail.is_empty() {
            line.push(' ');
            line.push_str(&quote_all(&self.tail));
        }
        format!(
            "PROMPT=$(cat <<'CONVOY_PROMPT'\n{}\nCONVOY_PROMPT\n)\n{line}",
            self.prompt.trim_end()
        )
    }
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

fn drive_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-Za-z]):[\\/](.*)$").expect("drive pattern compiles"))
}

/// `C:\work\repo` -> `/mnt/c/work/repo`. Non-drive paths are returned unchanged.
pub fn windows_path_to_wsl(path: &str) -> String {
    match drive_re().captures(path) {
        Some(caps) => format!(
            "/mnt/{}/{}",
            caps[1].to_lowercase(),
            caps[2].replace('\\', "/")
        ),
        None => path.to_string(),
    }
}

/// Render the prompt for one card, converting paths for WSL runners.
pub fn agent_prompt(
    agent: &AgentConfig,
    card: &TaskCard,
    iteration: &str,
    worktree: Option<&Path>,
) -> anyhow::Result<String> {
    let wsl = agent.uses_wsl();
    let show = |p: &Path| {
        let s = p.display().to_string();
        if wsl { windows_path_to_wsl(&s) } else { s }
    };
    template::render_prompt(
        agent.prompt_template.as_deref(),
        &PromptContext {
            role: card.role.clone(),
            task_id: card.task_id.clone(),
            card_path: show(&card.path),
            iteration: iteration.to_string(),
            worktree: worktree.map(show),
            start_command: card.start_command(),
        },
    )
}

/// A task card ready to run.
#[derive(Debug, Clone)]
pub struct LaunchTask {
    pub card: TaskCard,
    pub command: AgentCommand,
    pub cwd: PathBuf,
}

/// Everything resolved before the first process starts.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub options: LaunchOptions,
    pub selection: IterationTasks,
    pub tasks: Vec<LaunchTask>,
    /// Requested value clamped to `[1, agent.max_parallel]`.
    pub max_parallel: usize,
    pub logs_dir: PathBuf,
}

impl LaunchPlan {
    pub fn is_parallel(&self) -> bool {
        self.options.parallel && !self.options.dry_run && self.max_parallel > 1
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LaunchFailure {
    pub task_id: String,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub log: Option<PathBuf>,
}

/// One convergence attempt made during or after the run.
#[derive(Debug, Clone, Serialize)]
pub struct ConvergeRun {
    /// `after-task`, `after-batch` or `after-run`.
    pub when: &'static str,
    pub task_id: Option<String>,
    pub skipped: Option<String>,
    pub result: Option<IntegrationResult>,
}

impl ConvergeRun {
    fn succeeded(&self) -> bool {
        self.result.as_ref().is_none_or(|r| r.success)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LaunchReport {
    pub success: bool,
    pub message: String,
    pub iteration: String,
    pub dry_run: bool,
    pub mode: &'static str,
    pub max_parallel: usize,
    pub index: PathBuf,
    pub tasks: Vec<String>,
    pub launched: Vec<String>,
    pub failures: Vec<LaunchFailure>,
    pub not_started: Vec<String>,
    pub cancelled: bool,
    /// A convergence step ran and failed. Fails the run and skips the archive.
    pub converge_failed: bool,
    pub logs_dir: PathBuf,
    pub log_files: Vec<PathBuf>,
    pub integrate_runs: Vec<ConvergeRun>,
    pub archive: Option<ArchiveResult>,
}

/// What a worker sends back when its process exits.
struct Completion {
    task_id: String,
    log: Option<PathBuf>,
    outcome: Result<RunOutput, String>,
}

pub struct Launcher<'a> {
    repo_root: &'a Path,
    config: &'a Config,
    cancel: Arc<AtomicBool>,
}

impl<'a> Launcher<'a> {
    pub fn new(repo_root: &'a Path, config: &'a Config, cancel: Arc<AtomicBool>) -> Self {
        Self {
            repo_root,
            config,
            cancel,
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Resolve the iteration's cards and build a prompt and command for each.
    pub fn plan(&self, options: &LaunchOptions) -> anyhow::Result<LaunchPlan> {
        let agent = &self.config.agent;
        if !options.dry_run && (!agent.enabled || agent.command.trim().is_empty()) {
            return Err(ExitError::Config(
                "agent integration is not enabled (set agent.enabled and agent.command)".to_string(),
            )
            .into());
        }

        let tasks_dir = self.config.tasks_dir(self.repo_root);
        let selection = IterationTasks::resolve(&tasks_dir, &options.iteration)?;
        if selection.cards.is_empty() {
            anyhow::bail!(
                "Task index found but no task cards could be resolved: {}",
                selection.index.display()
            );
        }

        let worktrees = self.config.worktrees.enabled.then(|| {
            WorktreeManager::new(self.repo_root, self.config.worktree_base(self.repo_root))
        });
        let mut tasks = Vec::with_capacity(selection.cards.len());
        for card in selection.load_cards()? {
            let worktree = worktrees.as_ref().and_then(|mgr| {
                [card.task_id.as_str(), options.iteration.as_str()]
                    .into_iter()
                    .find(|key| mgr.exists(&card.role, key))
                    .map(|key| mgr.path_for(&card.role, key))
            });
            let prompt = agent_prompt(agent, &card, &options.iteration, worktree.as_deref())?;
            tasks.push(LaunchTask {
                command: AgentCommand::build(agent, &prompt),
                cwd: worktree.unwrap_or_else(|| self.repo_root.to_path_buf()),
                card,
            });
        }

        let ceiling = agent.max_parallel.max(1);
        let max_parallel = options
            .max_parallel
            .map_or(ceiling, |requested| requested.clamp(1, ceiling));

        Ok(LaunchPlan {
            options: options.clone(),
            selection,
            tasks,
            max_parallel,
            logs_dir: self
                .config
                .iterations_dir(self.repo_root)
                .join(&options.iteration)
                .join("agent-cli-logs"),
        })
    }

    /// Execute a plan. `converge` is consulted only when apply-ready was requested.
    #[instrument(skip_all, fields(iteration = %plan.options.iteration, tasks = plan.tasks.len()))]
    pub fn run(
        &self,
        plan: &LaunchPlan,
        converge: Option<&dyn Converge>,
    ) -> anyhow::Result<LaunchReport> {
        std::fs::create_dir_all(&plan.logs_dir)
            .with_context(|| format!("creating {}", plan.logs_dir.display()))?;
        let opts = &plan.options;
        let mut report = LaunchReport {
            success: false,
            message: String::new(),
            iteration: opts.iteration.clone(),
            dry_run: opts.dry_run,
            mode: if plan.is_parallel() { "parallel" } else { "sequential" },
            max_parallel: plan.max_parallel,
            index: plan.selection.index.clone(),
            tasks: plan.tasks.iter().map(|t| t.card.task_id.clone()).collect(),
            launched: Vec::new(),
            failures: Vec::new(),
            not_started: Vec::new(),
            cancelled: false,
            converge_failed: false,
            logs_dir: plan.logs_dir.clone(),
            log_files: Vec::new(),
            integrate_runs: Vec::new(),
            archive: None,
        };

        if opts.dry_run {
            self.run_dry(plan, &mut report)?;
        } else if plan.is_parallel() {
            self.run_parallel(plan, converge, &mut report);
        } else {
            self.run_sequential(plan, converge, &mut report);
        }
        report.cancelled = self.cancelled();

        let mut ok = report.failures.is_empty()
            && report.not_started.is_empty()
            && !report.converge_failed;
        if !opts.dry_run && ok && opts.apply_ready && !opts.apply_ready_each {
            let run = self.converge_step(converge, "after-run", None);
            ok = run.succeeded();
            report.converge_failed = !ok;
            report.integrate_runs.push(run);
        }
        if !opts.dry_run && ok && opts.archive_tasks {
            let archive = tasks::archive_iteration(
                &self.config.tasks_dir(self.repo_root),
                &opts.iteration,
                &self.config.archive_dir(self.repo_root),
                false,
                Some(&plan.selection),
                Local::now(),
            )?;
            ok = archive.success;
            report.archive = Some(archive);
        }

        report.success = ok;
        report.message = format!(
            "launch_agents processed {} task(s) from {}: {} succeeded, {} failed, {} not started",
            plan.tasks.len(),
            plan.selection
                .index
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            report.launched.len(),
            report.failures.len(),
            report.not_started.len()
        );
        if report.converge_failed {
            report.message.push_str("; convergence failed");
        }
        if report.cancelled {
            report.message.push_str(" (cancelled)");
        }
        info!(success = ok, launched = report.launched.len(), failed = report.failures.len(), "launch finished");
        Ok(report)
    }

    fn run_dry(&self, plan: &LaunchPlan, report: &mut LaunchReport) -> anyhow::Result<()> {
        for task in &plan.tasks {
            let (path, mut log) = open_log(&plan.logs_dir, &task.card.task_id)?;
            write_and_flush(
                &mut log,
                &format!(
                    "[DRY RUN] Would run agent for {}\n\ncommand: {}\ncwd: {}\n\nPrompt:\n{}\n",
                    task.card.task_id,
                    task.command.display(),
                    task.cwd.display(),
                    task.command.prompt()
                ),
            )?;
            report.launched.push(task.card.task_id.clone());
            report.log_files.push(path);
        }
        Ok(())
    }

    fn run_sequential(
        &self,
        plan: &LaunchPlan,
        converge: Option<&dyn Converge>,
        report: &mut LaunchReport,
    ) {
        let mut queue: VecDeque<&LaunchTask> = plan.tasks.iter().collect();
        while let Some(task) = queue.pop_front() {
            if self.cancelled() {
                queue.push_front(task);
                break;
            }
            let done = self.execute(task, &plan.logs_dir);
            let succeeded = record(report, done);
            if succeeded && plan.options.apply_ready_each {
                let run = self.converge_step(converge, "after-task", Some(&task.card.task_id));
                let ok = run.succeeded();
                report.integrate_runs.push(run);
                if !ok {
                    warn!(task = %task.card.task_id, "convergence failed, stopping the queue");
                    report.converge_failed = true;
                    break;
                }
            }
        }
        report
            .not_started
            .extend(queue.into_iter().map(|t| t.card.task_id.clone()));
    }

    fn run_parallel(
        &self,
        plan: &LaunchPlan,
        converge: Option<&dyn Converge>,
        report: &mut LaunchReport,
    ) {
        let mut queue: VecDeque<&LaunchTask> = plan.tasks.iter().collect();
        let (tx, rx) = mpsc::channel::<Completion>();

        thread::scope(|scope| {
            let mut running = 0usize;
            let mut halted = false;
            loop {
                while !halted && !self.cancelled() && running < plan.max_parallel {
                    let Some(task) = queue.pop_front() else { break };
                    let tx = tx.clone();
                    running += 1;
                    debug!(task = %task.card.task_id, running, "starting task");
                    scope.spawn(move || {
                        let _ = tx.send(self.execute(task, &plan.logs_dir));
                    });
                }
                if running == 0 {
                    break;
                }

                let first = match rx.recv_timeout(COMPLETION_POLL) {
                    Ok(done) => done,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                };
                let mut batch = vec![first];
                batch.extend(rx.try_iter());
                running -= batch.len();

                let mut any_success = false;
                for done in batch {
                    any_success |= record(report, done);
                }
                if any_success && plan.options.apply_ready_each && !halted {
                    let run = self.converge_step(converge, "after-batch", None);
                    if !run.succeeded() {
                        warn!("convergence failed, no further tasks will start");
                        halted = true;
                        report.converge_failed = true;
                    }
                    report.integrate_runs.push(run);
                }
            }
        });

        report
            .not_started
            .extend(queue.into_iter().map(|t| t.card.task_id.clone()));
    }

    /// Run one task to completion, logging before and after.
    fn execute(&self, task: &LaunchTask, logs_dir: &Path) -> Completion {
        let task_id = task.card.task_id.clone();
        let (log_path, mut log) = match open_log(logs_dir, &task_id) {
            Ok(opened) => opened,
            Err(err) => {
                return Completion {
                    task_id,
                    log: None,
                    outcome: Err(format!("{err:#}")),
                };
            }
        };
        let header = format!(
            "command: {}\ncwd: {}\n",
            task.command.display(),
            task.cwd.display()
        );
        if let Err(err) = write_and_flush(&mut log, &header) {
            warn!(task = %task_id, error = %err, "could not write log");
        }

        info!(task = %task_id, cwd = %task.cwd.display(), "launching agent");
        let outcome = task
            .command
            .to_tool()
            .map(|tool| {
                let tool = tool.current_dir(&task.cwd);
                match self.config.agent.timeout_secs {
                    Some(secs) => tool.timeout(Duration::from_secs(secs)),
                    None => tool,
                }
            })
            .and_then(|tool| tool.run())
            .map_err(|err| format!("{err:#}"));

        let body = match &outcome {
            Ok(out) => format!(
                "returncode: {}\nsuccess: {}\nstdout:\n{}\nstderr:\n{}\n",
                out.exit_code,
                out.success(),
                out.stdout,
                out.stderr
            ),
            Err(err) => format!("returncode: none\nsuccess: false\nerror: {err}\n"),
        };
        if let Err(err) = write_and_flush(&mut log, &body) {
            warn!(task = %task_id, error = %err, "could not write log");
        }

        Completion {
            task_id,
            log: Some(log_path),
            outcome,
        }
    }

    fn converge_step(
        &self,
        converge: Option<&dyn Converge>,
        when: &'static str,
        task_id: Option<&str>,
    ) -> ConvergeRun {
        let mut run = ConvergeRun {
            when,
            task_id: task_id.map(str::to_string),
            skipped: None,
            result: None,
        };
        if !self.config.orchestration.allow_auto_apply_ready {
            run.skipped = Some("allow_auto_apply_ready is false".to_string());
            return run;
        }
        match converge {
            Some(target) => run.result = Some(target.converge(false)),
            None => run.skipped = Some("no convergence target".to_string()),
        }
        run
    }
}

/// Fold a completion into the report. Returns whether the task succeeded.
fn record(report: &mut LaunchReport, done: Completion) -> bool {
    if let Some(log) = &done.log {
        report.log_files.push(log.clone());
    }
    match done.outcome {
        Ok(out) if out.success() => {
            report.launched.push(done.task_id);
            true
        }
        Ok(out) => {
            warn!(task = %done.task_id, exit_code = out.exit_code, "agent failed");
            report.failures.push(LaunchFailure {
                task_id: done.task_id,
                exit_code: Some(out.exit_code),
                error: Some(out.error_text()).filter(|e| !e.is_empty()),
                log: done.log,
            });
            false
        }
        Err(error) => {
            warn!(task = %done.task_id, error = %error, "agent did not run");
            report.failures.push(LaunchFailure {
                task_id: done.task_id,
                exit_code: None,
                error: Some(error),
                log: done.log,
            });
            false
        }
    }
}

/// Create `<task_id>.<stamp>.log`, or `<task_id>.<stamp>.<n>.log` when taken.
/// Existing logs are never opened for writing.
fn open_log(logs_dir: &Path, task_id: &str) -> anyhow::Result<(PathBuf, File)> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("creating {}", logs_dir.display()))?;
    let stamp = Local::now().format("%Y%m%d-%H%M%S").to_string();
    let mut n = 0u32;
    loop {
        let name = if n == 0 {
            format!("{task_id}.{stamp}.log")
        } else {
            format!("{task_id}.{stamp}.{n}.log")
        };
        let path = logs_dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => n += 1,
            Err(err) => {
                return Err(anyhow::Error::new(err).context(format!("creating {}", path.display())));
            }
        }
    }
}

fn write_and_flush(file: &mut File, text: &str) -> anyhow::Result<()> {
    file.write_all(text.as_bytes())?;
    file.flush()?;
    Ok(())
}
