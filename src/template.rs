//! Template rendering for task cards, iteration docs, dispatch memos, and agent prompts.

use minijinja::Environment;
use serde::Serialize;

const TASK_CARD_TEMPLATE: &str = include_str!("templates/task-card.md.jinja");
const TASK_INDEX_TEMPLATE: &str = include_str!("templates/task-index.md.jinja");
const CONTEXT_TEMPLATE: &str = include_str!("templates/context.md.jinja");
const COMPLETION_TEMPLATE: &str = include_str!("templates/completion-criteria.md.jinja");
const DISPATCH_MEMO_TEMPLATE: &str = include_str!("templates/dispatch-memo.md.jinja");
const AGENT_PROMPT_TEMPLATE: &str = include_str!("templates/agent-prompt.jinja");

/// Context for one task card file.
#[derive(Debug, Serialize)]
pub struct TaskCardContext<'a> {
    pub task_id: &'a str,
    pub role: &'a str,
    pub work_item: &'a str,
    pub priority: &'a str,
    pub effort: &'a str,
    /// Pre-formatted with thousands separators.
    pub token_budget: String,
    pub dependencies: &'a [String],
    pub deliverables: &'a [String],
    pub goal: &'a str,
    pub requirements: &'a [String],
    pub start_command: String,
}

#[derive(Debug, Serialize)]
pub struct IndexEntry {
    pub task_id: String,
    pub file_name: String,
    pub start_command: String,
}

#[derive(Debug, Serialize)]
pub struct RoleCount {
    pub role: String,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct TaskIndexContext<'a> {
    pub iteration: &'a str,
    pub date: &'a str,
    pub tasks: &'a [IndexEntry],
    pub roles: &'a [RoleCount],
}

#[derive(Debug, Serialize)]
pub struct IterationDocContext<'a> {
    pub workflow: &'a str,
    pub phase: &'a str,
    pub iteration: &'a str,
    pub source: String,
    pub goal: &'a str,
    pub tasks_dir: &'a str,
    pub agent_sync_dir: &'a str,
    pub deliverables: Vec<String>,
    pub requirements: &'a [String],
}

#[derive(Debug, Serialize)]
pub struct DispatchMemoContext<'a> {
    pub iteration: &'a str,
    pub date: &'a str,
    pub workflow: &'a str,
    pub phase: &'a str,
    pub index: String,
    pub start_commands: &'a [String],
    pub agent_commands: &'a [String],
}

/// Values available to the agent prompt template.
#[derive(Debug, Clone, Serialize)]
pub struct PromptContext {
    pub role: String,
    pub task_id: String,
    pub card_path: String,
    pub iteration: String,
    pub worktree: Option<String>,
    pub start_command: String,
}

fn environment() -> anyhow::Result<Environment<'static>> {
    let mut env = Environment::new();
    env.set_keep_trailing_newline(true);
    env.add_template("task-card", TASK_CARD_TEMPLATE)?;
    env.add_template("task-index", TASK_INDEX_TEMPLATE)?;
    env.add_template("context", CONTEXT_TEMPLATE)?;
    env.add_template("completion-criteria", COMPLETION_TEMPLATE)?;
    env.add_template("dispatch-memo", DISPATCH_MEMO_TEMPLATE)?;
    env.add_template("agent-prompt", AGENT_PROMPT_TEMPLATE)?;
    Ok(env)
}

fn render(name: &str, ctx: impl Serialize) -> anyhow::Result<String> {
    let env = environment()?;
    let template = env.get_template(name)?;
    Ok(template.render(ctx)?)
}

pub fn render_task_card(ctx: &TaskCardContext<'_>) -> anyhow::Result<String> {
    render("task-card", ctx)
}

pub fn render_task_index(ctx: &TaskIndexContext<'_>) -> anyhow::Result<String> {
    render("task-index", ctx)
}

pub fn render_context(ctx: &IterationDocContext<'_>) -> anyhow::Result<String> {
    render("context", ctx)
}

pub fn render_completion_criteria(ctx: &IterationDocContext<'_>) -> anyhow::Result<String> {
    render("completion-criteria", ctx)
}

pub fn render_dispatch_memo(ctx: &DispatchMemoContext<'_>) -> anyhow::Result<String> {
    render("dispatch-memo", ctx)
}

/// Render the agent prompt, using `custom` (from `agent.prompt_template`) when set.
pub fn render_prompt(custom: Option<&str>, ctx: &PromptContext) -> anyhow::Result<String> {
    match custom {
        Some(source) => {
            let mut env = Environment::new();
            env.add_template("custom-prompt", source)?;
            Ok(env.get_template("custom-prompt")?.render(ctx)?)
        }
        None => render("agent-prompt", ctx),
    }
}

/// `20000` -> `20,000`.
pub fn thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
