//! Workflow definitions: phases of iterations, each assigning inputs to agent roles.
//!
//! Workflows are TOML files. Both a top-level `[workflow]` table and a bare
//! document are accepted:
//!
//! ```toml
//! name = "refinement"
//!
//! [[phases]]
//! id = "phase-1"
//!
//! [[phases.iterations]]
//! id = "iter-1"
//! goal = "Extract requirements"
//!
//! [[phases.iterations.agents]]
//! role = "product_analyst"
//! inputs = ["US-E01-010", "US-E01-020"]
//! deliverables = [{ path = "work_items/E01/US-E01-010.md" }]
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::error::ExitError;

#[derive(Debug, Clone, Deserialize)]
pub struct Workflow {
    #[serde(default, alias = "id")]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub phases: Vec<Phase>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Phase {
    #[serde(default, alias = "phase")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "goal")]
    pub description: Option<String>,
    #[serde(default)]
    pub iterations: Vec<Iteration>,
}

impl Phase {
    pub fn key(&self) -> &str {
        self.id.as_deref().or(self.name.as_deref()).unwrap_or("phase")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Iteration {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub goal: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub agents: Vec<AgentAssignment>,
    #[serde(default)]
    pub completion_criteria: CompletionCriteria,
}

impl Iteration {
    pub fn key(&self) -> Option<&str> {
        self.id.as_deref().or(self.name.as_deref())
    }

    pub fn goal_text(&self) -> &str {
        self.goal
            .as_deref()
            .or(self.description.as_deref())
            .unwrap_or("")
    }

    /// Every deliverable path across agents, sorted and deduplicated.
    pub fn deliverable_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .agents
            .iter()
            .flat_map(|a| a.deliverables.iter())
            .map(|d| d.path.clone())
            .filter(|p| !p.is_empty())
            .collect();
        paths.sort();
        paths.dedup();
        paths
    }

    /// Distinct roles, sorted.
    pub fn roles(&self) -> Vec<String> {
        let mut roles: Vec<String> = self.agents.iter().map(|a| a.role.clone()).collect();
        roles.sort();
        roles.dedup();
        roles
    }
}

/// One role's share of an iteration; each input becomes a task card.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentAssignment {
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub deliverables: Vec<Deliverable>,
    #[serde(default = "default_token_budget")]
    pub token_budget: u64,
    #[serde(default = "default_priority")]
    pub priority: String,
    #[serde(default = "default_effort")]
    pub effort: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Deliverable {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletionCriteria {
    #[serde(default)]
    pub requirements: Vec<String>,
}

fn default_role() -> String { "unknown".into() }
fn default_token_budget() -> u64 { 20_000 }
fn default_priority() -> String { "Normal".into() }
fn default_effort() -> String { "Unknown".into() }

#[derive(Deserialize)]
struct Catalog {
    workflow: Workflow,
}

impl Workflow {
    /// Resolve a workflow argument: a `.toml` path (relative to the repo root),
    /// else `<workflows_dir>/<name>.toml`, else `<workflows_dir>/<name>`.
    pub fn resolve_path(name: &str, repo_root: &Path, workflows_dir: &Path) -> PathBuf {
        if Path::new(name).extension().is_some_and(|e| e == "toml") {
            let p = PathBuf::from(name);
            return if p.is_absolute() { p } else { repo_root.join(p) };
        }
        let with_ext = workflows_dir.join(format!("{name}.toml"));
        if with_ext.exists() {
            return with_ext;
        }
        let bare = workflows_dir.join(name);
        if bare.exists() { bare } else { with_ext }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading workflow {}", path.display()))?;
        let mut workflow = Self::parse(&text)
            .with_context(|| format!("parsing workflow {}", path.display()))?;
        if workflow.name.is_none() {
            workflow.name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned());
        }
        Ok(workflow)
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let value: toml::Table = toml::from_str(text)
            .map_err(|e| ExitError::Config(format!("invalid workflow: {e}")))?;
        let catalog = value.contains_key("workflow");
        let value = toml::Value::Table(value);
        let workflow = if catalog {
            value.try_into::<Catalog>().map(|c| c.workflow)
        } else {
            value.try_into::<Self>()
        };
        workflow.map_err(|e| ExitError::Config(format!("invalid workflow: {e}")).into())
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("workflow")
    }

    /// First iteration with this id in any phase, with its phase.
    pub fn iteration_by_id(&self, iteration: &str) -> Option<(&Phase, &Iteration)> {
        self.phases.iter().find_map(|phase| {
            phase
                .iterations
                .iter()
                .find(|it| it.key() == Some(iteration))
                .map(|it| (phase, it))
        })
    }

    /// The first `<workflows_dir>/*.toml`, by file name, that defines `iteration`.
    /// A missing directory finds nothing; an unparsable workflow is an error.
    pub fn find_defining(
        workflows_dir: &Path,
        iteration: &str,
    ) -> anyhow::Result<Option<(PathBuf, Self)>> {
        let Ok(entries) = std::fs::read_dir(workflows_dir) else {
            return Ok(None);
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == "toml"))
            .collect();
        paths.sort();
        for path in paths {
            let workflow = Self::load(&path)?;
            if workflow.iteration_by_id(iteration).is_some() {
                return Ok(Some((path, workflow)));
            }
        }
        Ok(None)
    }

    pub fn find_iteration(&self, phase: &str, iteration: &str) -> anyhow::Result<&Iteration> {
        self.phases
            .iter()
            .filter(|p| p.key() == phase)
            .flat_map(|p| p.iterations.iter())
            .find(|it| it.key() == Some(iteration))
            .ok_or_else(|| {
                anyhow::anyhow!("Iteration not found: phase={phase}, iteration={iteration}")
            })
    }
}
