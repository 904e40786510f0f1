//! Status memos: markdown files agents write to announce their work.
//!
//! A memo carries a loose header of `**Label**: value` lines. Parsing is
//! tolerant: unknown or malformed fields are left empty and a memo without a
//! status reads as `unknown`. The only writes this module performs are
//! [`rewrite_status`], which swaps the status value and stamps one
//! `**Integrated**:` line.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::Context;
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, SecondsFormat};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

/// Markdown files in the coordination directory that are documentation, not memos.
pub const EXCLUDED_FILES: [&str; 4] = [
    "README.md",
    "COMMAND_SHORTHAND.md",
    "COMMUNICATION_CONVENTIONS.md",
    "WORKTREE_OPERATING_MODEL.md",
];

/// Lifecycle label derived from a memo's free-text status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemoState {
    Draft,
    ReadyToConsume,
    ReadyToMerge,
    Blocked,
    Unknown,
}

impl MemoState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::ReadyToConsume => "ready-to-consume",
            Self::ReadyToMerge => "ready-to-merge",
            Self::Blocked => "blocked",
            Self::Unknown => "unknown",
        }
    }

    pub const ALL: [Self; 5] = [
        Self::Draft,
        Self::ReadyToConsume,
        Self::ReadyToMerge,
        Self::Blocked,
        Self::Unknown,
    ];
}

impl fmt::Display for MemoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Memo {
    pub path: PathBuf,
    pub date: Option<NaiveDate>,
    /// `@mentions` from the Audience line, without the `@`.
    pub audience: Vec<String>,
    /// Raw status text; `"unknown"` when the memo has none.
    pub status: String,
    pub branch: Option<String>,
    pub sha: Option<String>,
    /// Second `_`-separated segment of the file stem (`DATE_role_topic.md`).
    pub role: Option<String>,
    pub work_item: Option<String>,
    pub deliverables: Vec<String>,
}

impl Memo {
    /// Parse memo text. Never fails; missing fields are left empty.
    pub fn from_text(path: &Path, text: &str) -> Self {
        let mut date = None;
        let mut audience = Vec::new();
        let mut status = None;
        let mut branch = None;
        let mut sha = None;
        let mut work_item = None;
        let mut deliverables = Vec::new();
        let mut seen_deliverables = false;

        let lines: Vec<&str> = text.lines().collect();
        for (idx, line) in lines.iter().enumerate() {
            let Some(caps) = field_re().captures(line) else {
                continue;
            };
            let value = caps[3].trim();
            match caps[2].trim().to_lowercase().as_str() {
                "date" if date.is_none() => date = parse_date(value),
                "audience" if audience.is_empty() => {
                    audience = mention_re()
                        .captures_iter(value)
                        .map(|c| c[1].to_string())
                        .collect();
                }
                "status" if status.is_none() => status = Some(backticked_value(value)),
                "branch" if branch.is_none() => {
                    branch = Some(backticked_value(value)).filter(|b| !b.is_empty());
                }
                "sha" if sha.is_none() => {
                    sha = sha_re().captures(value).map(|c| c[1].to_string());
                }
                "work item" if work_item.is_none() => {
                    work_item = Some(value.trim_matches('`').trim().to_string())
                        .filter(|w| !w.is_empty());
                }
                "deliverables" if !seen_deliverables => {
                    seen_deliverables = true;
                    deliverables = list_after(&lines[idx + 1..]);
                }
                _ => {}
            }
        }

        let role = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|stem| stem.split('_').nth(1))
            .filter(|r| !r.is_empty())
            .map(str::to_string);

        Self {
            path: path.to_path_buf(),
            date,
            audience,
            status: status
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "unknown".to_string()),
            branch,
            sha,
            role,
            work_item,
            deliverables,
        }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn is_draft(&self) -> bool {
        self.status_contains("draft")
    }

    pub fn is_ready_to_consume(&self) -> bool {
        self.status_contains("ready-to-consume")
    }

    pub fn is_ready_to_merge(&self) -> bool {
        self.status_contains("ready-to-merge")
    }

    pub fn is_blocked(&self) -> bool {
        self.status_contains("blocked")
    }

    /// Single label for the status. When the text matches several predicates,
    /// blocked wins, then ready-to-merge, ready-to-consume, draft.
    pub fn state(&self) -> MemoState {
        if self.is_blocked() {
            MemoState::Blocked
        } else if self.is_ready_to_merge() {
            MemoState::ReadyToMerge
        } else if self.is_ready_to_consume() {
            MemoState::ReadyToConsume
        } else if self.is_draft() {
            MemoState::Draft
        } else {
            MemoState::Unknown
        }
    }

    fn status_contains(&self, needle: &str) -> bool {
        self.status.to_lowercase().contains(needle)
    }
}

/// Reads memos from one directory. All scans are read-only.
#[derive(Debug, Clone)]
pub struct MemoScanner {
    dir: PathBuf,
}

impl MemoScanner {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Every memo in the directory, ordered by file name. A missing directory
    /// yields nothing; unreadable files are skipped.
    pub fn scan_all(&self) -> Vec<Memo> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            debug!(dir = %self.dir.display(), "memo directory not readable");
            return Vec::new();
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "md"))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| !EXCLUDED_FILES.contains(&n))
            })
            .collect();
        paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

        paths.iter().filter_map(|p| self.parse(p)).collect()
    }

    /// Parse one memo file. None when it cannot be read as UTF-8 text.
    pub fn parse(&self, path: &Path) -> Option<Memo> {
        match std::fs::read_to_string(path) {
            Ok(text) => Some(Memo::from_text(path, &text)),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "skipping unreadable memo");
                None
            }
        }
    }

    pub fn scan_ready_to_consume(&self) -> Vec<Memo> {
        self.scan_where(Memo::is_ready_to_consume)
    }

    pub fn scan_ready_to_merge(&self) -> Vec<Memo> {
        self.scan_where(Memo::is_ready_to_merge)
    }

    pub fn scan_blocked(&self) -> Vec<Memo> {
        self.scan_where(Memo::is_blocked)
    }

    pub fn scan_drafts(&self) -> Vec<Memo> {
        self.scan_where(Memo::is_draft)
    }

    /// Memos whose single derived state is `state`.
    pub fn scan_state(&self, state: MemoState) -> Vec<Memo> {
        self.scan_where(|m| m.state() == state)
    }

    fn scan_where(&self, pred: impl Fn(&Memo) -> bool) -> Vec<Memo> {
        self.scan_all().into_iter().filter(|m| pred(m)).collect()
    }
}

/// Set a memo's status and stamp the integration time.
///
/// The first status value becomes `` `new_status` `` (followed by ` - <error>`
/// collapsed to one line when given). Exactly one `**Integrated**:` line is
/// kept: an existing one is updated in place, otherwise one is appended.
pub fn rewrite_status(
    path: &Path,
    new_status: &str,
    error: Option<&str>,
    now: DateTime<Local>,
) -> anyhow::Result<()> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let updated = rewrite_status_text(&content, new_status, error, now);
    std::fs::write(path, updated).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn rewrite_status_text(
    content: &str,
    new_status: &str,
    error: Option<&str>,
    now: DateTime<Local>,
) -> String {
    let mut value = format!("`{new_status}`");
    if let Some(err) = error {
        let one_line = err.split_whitespace().collect::<Vec<_>>().join(" ");
        if !one_line.is_empty() {
            value.push_str(" - ");
            value.push_str(&one_line);
        }
    }
    let stamp = now.to_rfc3339_opts(SecondsFormat::Secs, false);

    let mut out: Vec<String> = Vec::new();
    let mut status_done = false;
    let mut integrated_done = false;
    for line in content.lines() {
        if let Some(caps) = field_re().captures(line) {
            let label = caps[2].trim().to_lowercase();
            if label == "status" && !status_done {
                out.push(format!("{} {value}", &caps[1]));
                status_done = true;
                continue;
            }
            if label == "integrated" {
                if !integrated_done {
                    out.push(format!("{} {stamp}", &caps[1]));
                    integrated_done = true;
                }
                continue;
            }
        }
        out.push(line.to_string());
    }

    if !status_done {
        out.push(format!("- **Status**: {value}"));
    }
    if !integrated_done {
        if out.last().is_some_and(|l| !l.trim().is_empty()) {
            out.push(String::new());
        }
        out.push(format!("**Integrated**: {stamp}"));
    }

    let mut text = out.join("\n");
    text.push('\n');
    text
}

/// `- **Label**: value`, list marker and indentation optional.
/// Groups: 1 = everything through the colon, 2 = label, 3 = value.
pub(crate) fn field_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\s*(?:[-*+]\s+)?\*\*([^*]+)\*\*:)[ \t]*(.*)$").expect("field pattern compiles")
    })
}

fn mention_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@([\w-]+)").expect("mention pattern compiles"))
}

fn sha_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^`?([0-9a-fA-F]{6,40})\b").expect("sha pattern compiles"))
}

/// Value up to the first backtick after an optional opening one.
fn backticked_value(value: &str) -> String {
    let inner = value.strip_prefix('`').unwrap_or(value);
    inner.split('`').next().unwrap_or("").trim().to_string()
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    let token = value.trim_matches('`').split_whitespace().next()?;
    let token = token.trim_matches('`');
    NaiveDate::parse_from_str(token, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(token, "%Y-%m-%dT%H:%M:%S")
                .or_else(|_| NaiveDateTime::parse_from_str(token, "%Y-%m-%dT%H:%M:%S%.f"))
                .ok()
                .map(|dt| dt.date())
        })
        .or_else(|| DateTime::parse_from_rfc3339(token).ok().map(|dt| dt.date_naive()))
}

/// `- ` items following a label line. Blank lines are skipped; the first
/// other line ends the list.
fn list_after(lines: &[&str]) -> Vec<String> {
    let mut items = Vec::new();
    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Some(item) = trimmed.strip_prefix('-') else {
            break;
        };
        let item = item.trim();
        if !item.is_empty() {
            items.push(item.to_string());
        }
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    const READY: &str = "# Ready-to-Consume: US-E01-010

- **Date**: 2026-01-10
- **Audience**: `@integrator` `@qa-lead`
- **Status**: `ready-to-consume`
- **Branch**: `feat/backend/US-E01-010`
- **SHA**: `a1b2c3d`
- **Work Item**: US-E01-010

**Deliverables**:
- `feature.md` (created)

- `docs/api.md`

Ready to integrate!
";

    fn memo(name: &str, text: &str) -> Memo {
        Memo::from_text(Path::new(name), text)
    }

    #[test]
    fn parses_header_fields() {
        let m = memo("2026-01-10_backend_US-E01-010.md", READY);
        assert_eq!(m.date, NaiveDate::from_ymd_opt(2026, 1, 10));
        assert_eq!(m.audience, vec!["integrator", "qa-lead"]);
        assert_eq!(m.status, "ready-to-consume");
        assert_eq!(m.branch.as_deref(), Some("feat/backend/US-E01-010"));
        assert_eq!(m.sha.as_deref(), Some("a1b2c3d"));
        assert_eq!(m.work_item.as_deref(), Some("US-E01-010"));
        assert_eq!(m.role.as_deref(), Some("backend"));
        assert_eq!(m.deliverables, vec!["`feature.md` (created)", "`docs/api.md`"]);
        assert_eq!(m.state(), MemoState::ReadyToConsume);
    }

    #[test]
    fn labels_are_case_insensitive_without_list_markers() {
        let m = memo("x.md", "**STATUS**: Draft\n**branch**: topic\n**Date**: 2026-02-03T10:11:12\n");
        assert_eq!(m.status, "Draft");
        assert!(m.is_draft());
        assert_eq!(m.branch.as_deref(), Some("topic"));
        assert_eq!(m.date, NaiveDate::from_ymd_opt(2026, 2, 3));
        assert_eq!(m.role, None);
    }

    #[test]
    fn missing_status_is_unknown() {
        let m = memo("2026-01-01_qa_notes.md", "# Notes\n\nnothing here\n");
        assert_eq!(m.status, "unknown");
        assert_eq!(m.state(), MemoState::Unknown);
        assert!(!m.is_draft() && !m.is_ready_to_consume() && !m.is_ready_to_merge() && !m.is_blocked());
    }

    #[test]
    fn status_stops_at_backtick() {
        let m = memo("m.md", "- **Status**: `blocked` - CONFLICT in ready-to-consume.md\n");
        assert_eq!(m.status, "blocked");
        assert!(!m.is_ready_to_consume());
    }

    #[test]
    fn bad_date_and_sha_are_absent() {
        let m = memo("m.md", "- **Date**: last tuesday\n- **SHA**: `xyz123`\n- **Status**: draft\n");
        assert_eq!(m.date, None);
        assert_eq!(m.sha, None);
    }

    #[test]
    fn state_precedence() {
        let m = memo("m.md", "- **Status**: ready-to-consume (was blocked)\n");
        assert!(m.is_ready_to_consume() && m.is_blocked());
        assert_eq!(m.state(), MemoState::Blocked);
    }

    #[test]
    fn deliverables_end_at_first_non_list_line() {
        let m = memo(
            "m.md",
            "- **Deliverables**:\n- a\n- b\nSome prose\n- not a deliverable\n- **Status**: draft\n",
        );
        assert_eq!(m.deliverables, vec!["a", "b"]);
    }

    #[test]
    fn rewrite_sets_status_and_appends_timestamp() {
        let now = Local::now();
        let out = rewrite_status_text(READY, "ready-to-merge", None, now);
        assert!(out.contains("- **Status**: `ready-to-merge`\n"));
        assert!(!out.contains("ready-to-consume`"));
        let stamp = now.to_rfc3339_opts(SecondsFormat::Secs, false);
        assert!(out.trim_end().ends_with(&format!("**Integrated**: {stamp}")));
        assert_eq!(memo("m.md", &out).state(), MemoState::ReadyToMerge);
    }

    #[test]
    fn rewrite_is_idempotent_on_integrated_line() {
        let now = Local::now();
        let once = rewrite_status_text(READY, "ready-to-merge", None, now);
        let twice = rewrite_status_text(&once, "ready-to-merge", None, now);
        assert_eq!(once, twice);
        assert_eq!(twice.matches("**Integrated**").count(), 1);
    }

    #[test]
    fn rewrite_blocked_collapses_error_to_one_line() {
        let now = Local::now();
        let out = rewrite_status_text(
            READY,
            "blocked",
            Some("CONFLICT (content):\n  Merge conflict in $file"),
            now,
        );
        assert!(out.contains(
            "- **Status**: `blocked` - CONFLICT (content): Merge conflict in $file\n"
        ));
        let m = memo("m.md", &out);
        assert_eq!(m.status, "blocked");
        assert_eq!(m.state(), MemoState::Blocked);
    }

    #[test]
    fn rewrite_adds_status_when_missing() {
        let out = rewrite_status_text("# Memo\n", "blocked", None, Local::now());
        assert_eq!(memo("m.md", &out).state(), MemoState::Blocked);
    }

    #[test]
    fn scan_missing_dir_is_empty() {
        let scanner = MemoScanner::new("/definitely/not/here");
        assert!(scanner.scan_all().is_empty());
    }

    #[test]
    fn scan_orders_by_name_and_skips_docs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README.md"), "- **Status**: ready-to-consume\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "- **Status**: ready-to-consume\n").unwrap();
        std::fs::write(dir.path().join("b_qa_two.md"), "- **Status**: `draft`\n").unwrap();
        std::fs::write(dir.path().join("a_qa_one.md"), READY).unwrap();
        std::fs::write(dir.path().join("c_qa_bad.md"), [0xff, 0xfe, 0x00]).unwrap();
        std::fs::create_dir(dir.path().join("d.md")).unwrap();

        let scanner = MemoScanner::new(dir.path());
        let all = scanner.scan_all();
        let names: Vec<String> = all.iter().map(Memo::file_name).collect();
        assert_eq!(names, vec!["a_qa_one.md", "b_qa_two.md"]);

        assert_eq!(scanner.scan_ready_to_consume().len(), 1);
        assert_eq!(scanner.scan_drafts().len(), 1);
        assert!(scanner.scan_blocked().is_empty());
        assert_eq!(scanner.scan_state(MemoState::Draft).len(), 1);

        // repeated scans see the same thing
        assert_eq!(scanner.scan_all(), all);
    }

    #[test]
    fn rewrite_status_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2026-01-10_backend_x.md");
        std::fs::write(&path, READY).unwrap();
        rewrite_status(&path, "blocked", Some("boom"), Local::now()).unwrap();
        let m = MemoScanner::new(dir.path()).parse(&path).unwrap();
        assert!(m.is_blocked());
        assert_eq!(m.branch.as_deref(), Some("feat/backend/US-E01-010"));
    }
}
