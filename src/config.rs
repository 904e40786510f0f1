use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::NaiveDate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ExitError;

/// Config file name constants.
pub const CONFIG_TOML: &str = ".convoy.toml";
pub const CONFIG_JSON: &str = ".convoy.json";

/// Find the config file path, preferring .convoy.toml over .convoy.json.
/// Returns None if neither exists.
pub fn find_config(dir: &Path) -> Option<PathBuf> {
    let toml_path = dir.join(CONFIG_TOML);
    if toml_path.exists() {
        return Some(toml_path);
    }
    let json_path = dir.join(CONFIG_JSON);
    if json_path.exists() {
        return Some(json_path);
    }
    None
}

/// Top-level .convoy.toml config.
///
/// Every section is optional; a repository without a config file behaves as
/// `Config::default()`. Field names are snake_case with camelCase aliases for
/// hand-written JSON configs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub coordination: CoordinationConfig,
    #[serde(default)]
    pub worktrees: WorktreesConfig,
    #[serde(default)]
    pub orchestration: OrchestrationConfig,
    #[serde(default)]
    pub integration: IntegrationConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProjectConfig {
    /// Defaults to the repository directory name.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_trunk_branch", alias = "trunkBranch")]
    pub trunk_branch: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: None,
            trunk_branch: default_trunk_branch(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CoordinationConfig {
    /// Directory holding status memos, relative to the repository root.
    #[serde(default = "default_agent_sync_dir", alias = "agentSyncDir")]
    pub agent_sync_dir: String,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            agent_sync_dir: default_agent_sync_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorktreesConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Base directory for worktrees. May contain `{project}`. Relative paths
    /// resolve against the repository root.
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default = "default_branch_prefix", alias = "branchPrefix")]
    pub branch_prefix: String,
}

impl Default for WorktreesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            location: None,
            branch_prefix: default_branch_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OrchestrationConfig {
    #[serde(default = "default_workflows_dir", alias = "workflowsDir")]
    pub workflows_dir: String,
    #[serde(default = "default_iterations_dir", alias = "iterationsDir")]
    pub iterations_dir: String,
    /// Gate for `launch_agents(.., apply-ready)`. When false the convergence
    /// step is reported as skipped.
    #[serde(default, alias = "allowAutoApplyReady")]
    pub allow_auto_apply_ready: bool,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            workflows_dir: default_workflows_dir(),
            iterations_dir: default_iterations_dir(),
            allow_auto_apply_ready: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct IntegrationConfig {
    /// `{date}` expands to today's ISO date.
    #[serde(default = "default_target_branch_pattern", alias = "targetBranchPattern")]
    pub target_branch_pattern: String,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            target_branch_pattern: default_target_branch_pattern(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TasksConfig {
    #[serde(default = "default_cards_dir", alias = "cardsDir")]
    pub cards_dir: String,
    /// Defaults to `<cards_dir>/_archive`.
    #[serde(default, alias = "archiveDir")]
    pub archive_dir: Option<String>,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            cards_dir: default_cards_dir(),
            archive_dir: None,
        }
    }
}

/// External agent executable used by `launch_agents`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AgentConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_agent_command")]
    pub command: String,
    /// Prepended to the command line, e.g. `["wsl", "-d", "Ubuntu", "--"]`.
    #[serde(default, alias = "runnerPrefix")]
    pub runner_prefix: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Passed as `--output-format`; empty omits the flag.
    #[serde(default = "default_output_format", alias = "outputFormat")]
    pub output_format: String,
    #[serde(default, alias = "extraArgs")]
    pub extra_args: Vec<String>,
    #[serde(default = "default_max_parallel", alias = "maxParallel")]
    pub max_parallel: usize,
    #[serde(default, alias = "timeoutSecs")]
    pub timeout_secs: Option<u64>,
    /// Minijinja template for the per-task prompt; the built-in one is used when unset.
    #[serde(default, alias = "promptTemplate")]
    pub prompt_template: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: default_agent_command(),
            runner_prefix: Vec::new(),
            model: None,
            output_format: default_output_format(),
            extra_args: Vec::new(),
            max_parallel: default_max_parallel(),
            timeout_secs: None,
            prompt_template: None,
        }
    }
}

impl AgentConfig {
    /// True when the runner prefix hands the command to WSL.
    pub fn uses_wsl(&self) -> bool {
        self.runner_prefix
            .first()
            .is_some_and(|first| matches!(first.to_lowercase().as_str(), "wsl" | "wsl.exe"))
    }
}

// Default value functions for serde
fn default_trunk_branch() -> String { "main".into() }
fn default_agent_sync_dir() -> String { "agent-sync".into() }
fn default_branch_prefix() -> String { "feat".into() }
fn default_workflows_dir() -> String { "workflows".into() }
fn default_iterations_dir() -> String { ".orchestration/runtime/iterations".into() }
fn default_target_branch_pattern() -> String { "integration/{date}".into() }
fn default_cards_dir() -> String { "agent-sync/tasks".into() }
fn default_agent_command() -> String { "agent".into() }
fn default_output_format() -> String { "text".into() }
fn default_max_parallel() -> usize { 1 }
fn default_true() -> bool { true }

impl Config {
    /// Load config from a file (TOML or JSON, auto-detected by extension).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            "toml" => Self::parse_toml(&contents),
            "json" => Self::parse_json(&contents),
            _ => Self::parse_toml(&contents).or_else(|_| Self::parse_json(&contents)),
        }
    }

    /// Load the repository's config, or defaults when it has none.
    pub fn load_from_dir(root: &Path) -> anyhow::Result<Self> {
        match find_config(root) {
            Some(path) => {
                tracing::debug!(path = %path.display(), "loading config");
                Self::load(&path)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string.
    pub fn parse_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| ExitError::Config(format!("invalid {CONFIG_TOML}: {e}")).into())
    }

    /// Parse config from a JSON string.
    pub fn parse_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| ExitError::Config(format!("invalid {CONFIG_JSON}: {e}")).into())
    }

    /// Project name, falling back to the repository directory name.
    pub fn project_name(&self, root: &Path) -> String {
        self.project.name.clone().unwrap_or_else(|| {
            root.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "project".to_string())
        })
    }

    pub fn agent_sync_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.coordination.agent_sync_dir)
    }

    pub fn workflows_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.orchestration.workflows_dir)
    }

    pub fn iterations_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.orchestration.iterations_dir)
    }

    pub fn tasks_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.tasks.cards_dir)
    }

    pub fn archive_dir(&self, root: &Path) -> PathBuf {
        match self.tasks.archive_dir {
            Some(ref dir) => root.join(dir),
            None => self.tasks_dir(root).join("_archive"),
        }
    }

    /// Configured worktree base with `{project}` expanded, or None for the
    /// `<parent>/<repo>.worktrees` default.
    pub fn worktree_base(&self, root: &Path) -> Option<PathBuf> {
        let location = self.worktrees.location.as_deref().filter(|l| !l.is_empty())?;
        let expanded = PathBuf::from(location.replace("{project}", &self.project_name(root)));
        if expanded.is_absolute() {
            Some(expanded)
        } else {
            Some(root.join(expanded))
        }
    }

    /// Integration target for the given day; falls back to trunk when the pattern is empty.
    pub fn target_branch(&self, today: NaiveDate) -> String {
        let pattern = self.integration.target_branch_pattern.trim();
        if pattern.is_empty() {
            return self.project.trunk_branch.clone();
        }
        pattern.replace("{date}", &today.format("%Y-%m-%d").to_string())
    }
}
