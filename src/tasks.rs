//! Task cards and the per-iteration index that links them.
//!
//! Cards are generated from a workflow iteration (one per role input), read
//! back by the launcher, and archived once an iteration is consumed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, bail};
use chrono::{DateTime, Local, NaiveDate};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};

use crate::memo::field_re;
use crate::template::{self, IndexEntry, RoleCount, TaskCardContext, TaskIndexContext};
use crate::workflow::Iteration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskCard {
    pub task_id: String,
    pub role: String,
    pub work_item: String,
    pub deliverables: Vec<String>,
    pub priority: String,
    pub effort: String,
    pub token_budget: u64,
    pub dependencies: Vec<String>,
    pub path: PathBuf,
}

impl TaskCard {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading task card {}", path.display()))?;
        Ok(Self::from_text(path, &text))
    }

    /// Parse a card. The role comes from the `**Role**` field and falls back
    /// to the task id only when that field is missing.
    pub fn from_text(path: &Path, text: &str) -> Self {
        let task_id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut fields: BTreeMap<String, String> = BTreeMap::new();
        for line in text.lines() {
            if let Some(caps) = field_re().captures(line) {
                fields
                    .entry(caps[2].trim().to_lowercase())
                    .or_insert_with(|| caps[3].trim().trim_matches('`').trim().to_string());
            }
        }
        let field = |name: &str| fields.get(name).filter(|v| !v.is_empty()).cloned();

        let role = field("role").unwrap_or_else(|| role_from_task_id(&task_id));
        let token_budget = field("token budget")
            .map(|v| v.chars().filter(char::is_ascii_digit).collect::<String>())
            .and_then(|digits| digits.parse().ok())
            .unwrap_or(0);
        let dependencies = field("dependencies")
            .filter(|v| !v.eq_ignore_ascii_case("none"))
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            role,
            work_item: field("work item").unwrap_or_default(),
            deliverables: section_list(text, "deliverables"),
            priority: field("priority").unwrap_or_else(|| "Normal".to_string()),
            effort: field("estimated effort")
                .or_else(|| field("effort"))
                .unwrap_or_else(|| "Unknown".to_string()),
            token_budget,
            dependencies,
            path: path.to_path_buf(),
            task_id,
        }
    }

    pub fn start_command(&self) -> String {
        start_command(&self.role, &self.task_id)
    }
}

pub fn start_command(role: &str, task_id: &str) -> String {
    format!("/{role}::start_task({task_id})")
}

/// Role embedded in a `YYYY-MM-DD-ROLE-PARTS-NN` task id: the segments between
/// the date and the counter, lower-cased and joined with `_`.
pub fn role_from_task_id(task_id: &str) -> String {
    let parts: Vec<&str> = task_id.split('-').collect();
    if parts.len() > 4 {
        parts[3..parts.len() - 1].join("_").to_lowercase()
    } else {
        "unknown".to_string()
    }
}

/// Items of a `## <heading>` section's `- ` list, backticks stripped.
fn section_list(text: &str, heading: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut inside = false;
    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(title) = trimmed.strip_prefix('#') {
            if inside {
                break;
            }
            inside = title.trim_start_matches('#').trim().eq_ignore_ascii_case(heading);
            continue;
        }
        if !inside {
            continue;
        }
        if let Some(item) = trimmed.strip_prefix("- ") {
            let item = item.trim().trim_matches('`').trim();
            if !item.is_empty() && !item.starts_with('(') {
                items.push(item.to_string());
            }
        }
    }
    items
}

fn link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\]\(([^)]+\.md)\)").expect("link pattern compiles"))
}

/// Card file names linked from an index, in order, without duplicates or index links.
pub fn index_links(index_text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for caps in link_re().captures_iter(index_text) {
        let name = caps[1].trim().to_string();
        if name.ends_with("_INDEX.md") || out.contains(&name) {
            continue;
        }
        out.push(name);
    }
    out
}

pub fn index_file_name(date: NaiveDate, iteration: &str) -> String {
    format!("{}_{iteration}_INDEX.md", date.format("%Y-%m-%d"))
}

/// The lexically last `*_<iteration>_INDEX.md` in `tasks_dir`.
pub fn latest_index(tasks_dir: &Path, iteration: &str) -> Option<PathBuf> {
    last_with_suffix(tasks_dir, &format!("_{iteration}_INDEX.md"))
}

/// The newest index of any iteration (file names start with the date).
pub fn newest_index(tasks_dir: &Path) -> Option<PathBuf> {
    last_with_suffix(tasks_dir, "_INDEX.md")
}

fn last_with_suffix(dir: &Path, suffix: &str) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(suffix))
        })
        .collect();
    candidates.sort();
    candidates.pop()
}

/// Cards linked from `index` that exist next to it, in index order.
pub fn index_cards(index: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let text =
        std::fs::read_to_string(index).with_context(|| format!("reading {}", index.display()))?;
    let dir = index.parent().unwrap_or_else(|| Path::new("."));
    Ok(index_links(&text)
        .into_iter()
        .map(|name| dir.join(name))
        .filter(|p| p.is_file())
        .collect())
}

/// An iteration's index and the card files it links to.
#[derive(Debug, Clone)]
pub struct IterationTasks {
    pub index: PathBuf,
    pub cards: Vec<PathBuf>,
}

impl IterationTasks {
    /// Resolve the latest index for `iteration`. Links to missing files are dropped.
    pub fn resolve(tasks_dir: &Path, iteration: &str) -> anyhow::Result<Self> {
        if !tasks_dir.is_dir() {
            bail!("Tasks directory not found: {}", tasks_dir.display());
        }
        let Some(index) = latest_index(tasks_dir, iteration) else {
            bail!(
                "No task index found for iteration '{iteration}' in {}",
                tasks_dir.display()
            );
        };
        let cards = index_cards(&index)?;
        debug!(index = %index.display(), cards = cards.len(), "resolved iteration tasks");
        Ok(Self { index, cards })
    }

    pub fn load_cards(&self) -> anyhow::Result<Vec<TaskCard>> {
        self.cards.iter().map(|p| TaskCard::load(p)).collect()
    }
}

/// Cards and index written for one iteration.
#[derive(Debug, Clone)]
pub struct GeneratedTasks {
    pub cards: Vec<TaskCard>,
    pub index: PathBuf,
}

/// Write one card per (role, input) plus the iteration index.
///
/// Task ids are `<date>-<ROLE>-<NN>`, numbered per role. Re-running on the
/// same day rewrites the same files.
pub fn generate_task_cards(
    tasks_dir: &Path,
    iteration_id: &str,
    iteration: &Iteration,
    date: NaiveDate,
) -> anyhow::Result<GeneratedTasks> {
    std::fs::create_dir_all(tasks_dir)
        .with_context(|| format!("creating {}", tasks_dir.display()))?;
    let date_str = date.format("%Y-%m-%d").to_string();
    let goal = iteration.goal_text();
    let requirements = &iteration.completion_criteria.requirements;

    let mut counters: BTreeMap<String, usize> = BTreeMap::new();
    let mut cards = Vec::new();
    for agent in &iteration.agents {
        let deliverables: Vec<String> = agent
            .deliverables
            .iter()
            .map(|d| d.path.clone())
            .filter(|p| !p.is_empty())
            .collect();

        for work_item in &agent.inputs {
            let n = counters.entry(agent.role.clone()).or_insert(0);
            *n += 1;
            let task_id = format!(
                "{date_str}-{}-{n:02}",
                agent.role.to_uppercase().replace('_', "-")
            );
            let path = tasks_dir.join(format!("{task_id}.md"));
            let text = template::render_task_card(&TaskCardContext {
                task_id: &task_id,
                role: &agent.role,
                work_item,
                priority: &agent.priority,
                effort: &agent.effort,
                token_budget: template::thousands(agent.token_budget),
                dependencies: &agent.dependencies,
                deliverables: &deliverables,
                goal,
                requirements,
                start_command: start_command(&agent.role, &task_id),
            })?;
            std::fs::write(&path, text).with_context(|| format!("writing {}", path.display()))?;

            cards.push(TaskCard {
                task_id,
                role: agent.role.clone(),
                work_item: work_item.clone(),
                deliverables: deliverables.clone(),
                priority: agent.priority.clone(),
                effort: agent.effort.clone(),
                token_budget: agent.token_budget,
                dependencies: agent.dependencies.clone(),
                path,
            });
        }
    }

    let mut entries: Vec<IndexEntry> = cards
        .iter()
        .map(|c| IndexEntry {
            task_id: c.task_id.clone(),
            file_name: format!("{}.md", c.task_id),
            start_command: c.start_command(),
        })
        .collect();
    entries.sort_by(|a, b| a.task_id.cmp(&b.task_id));
    let mut by_role: BTreeMap<&str, usize> = BTreeMap::new();
    for card in &cards {
        *by_role.entry(card.role.as_str()).or_insert(0) += 1;
    }
    let roles: Vec<RoleCount> = by_role
        .into_iter()
        .map(|(role, count)| RoleCount {
            role: role.to_string(),
            count,
        })
        .collect();

    let index = tasks_dir.join(index_file_name(date, iteration_id));
    let text = template::render_task_index(&TaskIndexContext {
        iteration: iteration_id,
        date: &date_str,
        tasks: &entries,
        roles: &roles,
    })?;
    std::fs::write(&index, text).with_context(|| format!("writing {}", index.display()))?;
    info!(iteration = iteration_id, count = cards.len(), index = %index.display(), "generated task cards");

    Ok(GeneratedTasks { cards, index })
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveResult {
    pub success: bool,
    pub message: String,
    pub archive_dir: Option<PathBuf>,
    /// `src -> dst` per file.
    pub moved: Vec<String>,
    pub skipped: Vec<String>,
}

impl ArchiveResult {
    fn failed(message: String) -> Self {
        Self {
            success: false,
            message,
            archive_dir: None,
            moved: Vec::new(),
            skipped: Vec::new(),
        }
    }
}

/// Move an iteration's index and cards to `<archive_root>/<iteration>/<stamp>/`.
///
/// `selection` overrides the latest-index lookup (the launcher passes the
/// exact set it ran). Existing archive files are never overwritten; a
/// `.<n>` suffix is added instead.
pub fn archive_iteration(
    tasks_dir: &Path,
    iteration: &str,
    archive_root: &Path,
    dry_run: bool,
    selection: Option<&IterationTasks>,
    now: DateTime<Local>,
) -> anyhow::Result<ArchiveResult> {
    if !tasks_dir.is_dir() {
        return Ok(ArchiveResult::failed(format!(
            "Tasks dir not found: {}",
            tasks_dir.display()
        )));
    }
    let resolved;
    let selection = match selection {
        Some(sel) => sel,
        None => {
            let Some(index) = latest_index(tasks_dir, iteration) else {
                return Ok(ArchiveResult::failed(format!(
                    "No task index found for iteration '{iteration}' in {}",
                    tasks_dir.display()
                )));
            };
            resolved = IterationTasks {
                cards: index_cards(&index)?,
                index,
            };
            &resolved
        }
    };

    let archive_dir = archive_root
        .join(iteration)
        .join(now.format("%Y%m%d-%H%M%S").to_string());
    if !dry_run {
        std::fs::create_dir_all(&archive_dir)
            .with_context(|| format!("creating {}", archive_dir.display()))?;
    }

    let to_move: Vec<&PathBuf> = std::iter::once(&selection.index)
        .chain(selection.cards.iter())
        .collect();
    let mut moved = Vec::new();
    let mut skipped = Vec::new();
    for src in &to_move {
        if !src.exists() {
            skipped.push(src.display().to_string());
            continue;
        }
        let Some(name) = src.file_name() else {
            skipped.push(src.display().to_string());
            continue;
        };
        let mut dst = archive_dir.join(name);
        if dry_run {
            moved.push(format!("{} -> {}", src.display(), dst.display()));
            continue;
        }
        if dst.exists() {
            dst = free_name(&dst);
        }
        move_file(src, &dst)?;
        moved.push(format!("{} -> {}", src.display(), dst.display()));
    }

    let mut message = format!(
        "Archived {} file(s) for iteration '{iteration}'",
        to_move.len() - skipped.len()
    );
    if dry_run {
        message.push_str(" (dry-run)");
    }
    info!(iteration, moved = moved.len(), dry_run, "archived tasks");
    Ok(ArchiveResult {
        success: true,
        message,
        archive_dir: Some(archive_dir),
        moved,
        skipped,
    })
}

/// `dir/name.md` -> first free `dir/name.<n>.md`.
fn free_name(dst: &Path) -> PathBuf {
    let stem = dst
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = dst
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let parent = dst.parent().unwrap_or_else(|| Path::new("."));
    (1..)
        .map(|i| parent.join(format!("{stem}.{i}{ext}")))
        .find(|p| !p.exists())
        .unwrap_or_else(|| dst.to_path_buf())
}

fn move_file(src: &Path, dst: &Path) -> anyhow::Result<()> {
    if std::fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    // rename fails across filesystems
    std::fs::copy(src, dst)
        .with_context(|| format!("copying {} to {}", src.display(), dst.display()))?;
    std::fs::remove_file(src).with_context(|| format!("removing {}", src.display()))?;
    Ok(())
}
