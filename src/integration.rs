//! Convergence: merge every `ready-to-consume` branch into the integration
//! branch and record the outcome in each memo.
//!
//! There is no lock around a target branch. Two `apply_ready` runs against the
//! same checkout must not overlap; the caller serializes them.

use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDate};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::git::Git;
use crate::memo::{Memo, MemoScanner, MemoState, rewrite_status};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedMerge {
    pub branch: String,
    /// Memo file name.
    pub memo: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrationResult {
    pub success: bool,
    pub message: String,
    pub target_branch: String,
    pub dry_run: bool,
    pub merged_branches: Vec<String>,
    pub failed_branches: Vec<FailedMerge>,
    pub skipped_memos: Vec<String>,
}

impl IntegrationResult {
    fn empty(target_branch: &str, dry_run: bool) -> Self {
        Self {
            success: true,
            message: String::new(),
            target_branch: target_branch.to_string(),
            dry_run,
            merged_branches: Vec::new(),
            failed_branches: Vec::new(),
            skipped_memos: Vec::new(),
        }
    }

    pub fn total_processed(&self) -> usize {
        self.merged_branches.len() + self.failed_branches.len() + self.skipped_memos.len()
    }
}

/// Something that can fold finished work into the integration branch.
///
/// The launcher calls this after a run, after each task, or after each
/// parallel batch.
pub trait Converge: Sync {
    fn converge(&self, dry_run: bool) -> IntegrationResult;
}

#[derive(Debug, Clone)]
pub struct IntegrationManager {
    repo_root: PathBuf,
    target_branch: String,
    trunk_branch: String,
    agent_sync_dir: PathBuf,
}

impl IntegrationManager {
    pub fn new(
        repo_root: &Path,
        target_branch: &str,
        trunk_branch: &str,
        agent_sync_dir: &Path,
    ) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            target_branch: target_branch.to_string(),
            trunk_branch: trunk_branch.to_string(),
            agent_sync_dir: agent_sync_dir.to_path_buf(),
        }
    }

    /// Manager for the configured repo; `target` overrides the dated pattern.
    pub fn from_config(
        repo_root: &Path,
        config: &Config,
        target: Option<&str>,
        today: NaiveDate,
    ) -> Self {
        let target = target
            .map(str::to_string)
            .unwrap_or_else(|| config.target_branch(today));
        Self::new(
            repo_root,
            &target,
            &config.project.trunk_branch,
            &config.agent_sync_dir(repo_root),
        )
    }

    pub fn target_branch(&self) -> &str {
        &self.target_branch
    }

    fn git(&self) -> Git {
        Git::new(&self.repo_root)
    }

    /// Merge every ready-to-consume branch, in memo file-name order.
    ///
    /// A failed merge is aborted, its memo marked blocked, and processing
    /// moves on to the next memo. When the target branch cannot be checked out
    /// or created, every mergeable branch is reported failed and no memo changes.
    #[instrument(skip_all, fields(target = %self.target_branch, dry_run))]
    pub fn apply_ready(&self, dry_run: bool) -> IntegrationResult {
        let mut result = IntegrationResult::empty(&self.target_branch, dry_run);
        let ready = MemoScanner::new(&self.agent_sync_dir).scan_ready_to_consume();
        if ready.is_empty() {
            result.message = "No ready-to-consume work found".to_string();
            return result;
        }

        let (mergeable, skipped): (Vec<&Memo>, Vec<&Memo>) =
            ready.iter().partition(|m| m.branch.is_some());
        for memo in skipped {
            debug!(memo = %memo.file_name(), "memo has no branch, skipping");
            result.skipped_memos.push(memo.file_name());
        }

        if !dry_run && !mergeable.is_empty() {
            if let Err(err) = self.ensure_target() {
                // memos are left ready-to-consume
                let error = format!(
                    "failed to prepare target branch {}: {err:#}",
                    self.target_branch
                );
                warn!(error = %error, "could not prepare target branch");
                result.failed_branches = mergeable
                    .iter()
                    .filter_map(|memo| {
                        memo.branch.as_ref().map(|branch| FailedMerge {
                            branch: branch.clone(),
                            memo: memo.file_name(),
                            error: error.clone(),
                        })
                    })
                    .collect();
                result.success = false;
                result.message = format!(
                    "Failed to prepare target branch {}: {} memo(s) not merged, {} skipped",
                    self.target_branch,
                    result.failed_branches.len(),
                    result.skipped_memos.len()
                );
                return result;
            }
        }

        for memo in mergeable {
            let Some(branch) = memo.branch.as_deref() else {
                continue;
            };
            if dry_run {
                info!(branch, "would merge");
                result.merged_branches.push(branch.to_string());
                continue;
            }
            match self.git().merge_no_ff(branch, &merge_message(memo, branch)) {
                Ok(()) => {
                    info!(branch, memo = %memo.file_name(), "merged");
                    result.merged_branches.push(branch.to_string());
                    self.mark(memo, MemoState::ReadyToMerge, None);
                }
                Err(err) => {
                    let error = format!("{err:#}");
                    warn!(branch, error = %error, "merge failed");
                    // leave a clean tree for the next merge
                    if let Err(abort_err) = self.git().merge_abort() {
                        debug!(error = %abort_err, "merge --abort failed");
                    }
                    self.mark(memo, MemoState::Blocked, Some(&error));
                    result.failed_branches.push(FailedMerge {
                        branch: branch.to_string(),
                        memo: memo.file_name(),
                        error,
                    });
                }
            }
        }

        result.success = result.failed_branches.is_empty();
        result.message = format!(
            "Processed {} memo(s): {} merged, {} failed, {} skipped",
            result.total_processed(),
            result.merged_branches.len(),
            result.failed_branches.len(),
            result.skipped_memos.len()
        );
        if dry_run {
            result.message.push_str(" (dry-run)");
        }
        result
    }

    /// Check out the target, creating it from trunk when it does not exist yet.
    /// Pulls are best-effort; a repo without a remote is normal.
    fn ensure_target(&self) -> anyhow::Result<()> {
        let git = self.git();
        if git.checkout(&self.target_branch).is_err() {
            git.checkout(&self.trunk_branch)?;
            best_effort_pull(&git, &self.trunk_branch);
            git.checkout_new_branch(&self.target_branch)?;
            info!(target = %self.target_branch, trunk = %self.trunk_branch, "created target branch");
        }
        best_effort_pull(&git, &self.target_branch);
        Ok(())
    }

    fn mark(&self, memo: &Memo, state: MemoState, error: Option<&str>) {
        if let Err(err) = rewrite_status(&memo.path, state.as_str(), error, Local::now()) {
            warn!(memo = %memo.path.display(), error = %err, "could not update memo status");
        }
    }

    /// Check whether `branch` merges cleanly into the checked-out HEAD.
    ///
    /// Returns `(has_conflicts, detail)`. The trial merge is always aborted.
    #[instrument(skip_all, fields(branch))]
    pub fn check_merge_conflicts(&self, branch: &str) -> anyhow::Result<(bool, String)> {
        let git = self.git();
        let trial = git.merge_no_commit(branch);
        let abort = git.merge_abort();
        if let Err(err) = abort {
            debug!(error = %err, "merge --abort failed");
        }
        let trial = trial?;
        if trial.success() {
            Ok((false, format!("No conflicts merging {branch}")))
        } else {
            Ok((true, trial.error_text()))
        }
    }
}

impl Converge for IntegrationManager {
    fn converge(&self, dry_run: bool) -> IntegrationResult {
        self.apply_ready(dry_run)
    }
}

fn best_effort_pull(git: &Git, branch: &str) {
    match git.pull("origin", branch) {
        Ok(out) if !out.success() => debug!(branch, error = %out.error_text(), "pull skipped"),
        Err(err) => debug!(branch, error = %err, "pull skipped"),
        Ok(_) => {}
    }
}

fn merge_message(memo: &Memo, branch: &str) -> String {
    format!(
        "feat: integrate {}\n\nFrom: {}\nMemo: {}",
        memo.work_item.as_deref().unwrap_or(branch),
        memo.role.as_deref().unwrap_or("agent"),
        memo.file_name()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subprocess::Tool;

    fn git(dir: &Path, args: &[&str]) {
        Tool::new("git").args(args).current_dir(dir).run_ok().unwrap();
    }

    fn init_repo(dir: &Path) {
        git(dir, &["init", "-q"]);
        git(dir, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        git(dir, &["config", "user.email", "test@example.com"]);
        git(dir, &["config", "user.name", "Test"]);
        std::fs::write(dir.join("README.md"), "# test\n").unwrap();
        git(dir, &["add", "."]);
        git(dir, &["commit", "-q", "-m", "init"]);
    }

    fn branch_with_file(dir: &Path, branch: &str, file: &str, contents: &str) {
        git(dir, &["checkout", "-q", "-b", branch, "main"]);
        std::fs::write(dir.join(file), contents).unwrap();
        git(dir, &["add", "."]);
        git(dir, &["commit", "-q", "-m", branch]);
        git(dir, &["checkout", "-q", "main"]);
    }

    fn write_memo(dir: &Path, name: &str, branch: Option<&str>) {
        let sync = dir.join("agent-sync");
        std::fs::create_dir_all(&sync).unwrap();
        let branch_line = branch
            .map(|b| format!("- **Branch**: `{b}`\n"))
            .unwrap_or_default();
        std::fs::write(
            sync.join(name),
            format!("# Memo\n\n- **Status**: `ready-to-consume`\n{branch_line}- **Work Item**: W-1\n"),
        )
        .unwrap();
    }

    fn manager(dir: &Path) -> IntegrationManager {
        IntegrationManager::new(dir, "integration/test", "main", &dir.join("agent-sync"))
    }

    #[test]
    fn nothing_ready_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let result = manager(dir.path()).apply_ready(false);
        assert!(result.success);
        assert_eq!(result.message, "No ready-to-consume work found");
        assert_eq!(result.total_processed(), 0);
    }

    #[test]
    fn merges_ready_branch_and_marks_memo() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        branch_with_file(dir.path(), "feat/qa/t1", "a.txt", "a\n");
        write_memo(dir.path(), "2026-01-10_qa_done.md", Some("feat/qa/t1"));
        write_memo(dir.path(), "2026-01-10_qa_nobranch.md", None);

        let result = manager(dir.path()).apply_ready(false);
        assert!(result.success, "{}", result.message);
        assert_eq!(result.merged_branches, vec!["feat/qa/t1"]);
        assert_eq!(result.skipped_memos, vec!["2026-01-10_qa_nobranch.md"]);
        assert!(dir.path().join("a.txt").exists());

        let memo = MemoScanner::new(dir.path().join("agent-sync"))
            .parse(&dir.path().join("agent-sync/2026-01-10_qa_done.md"))
            .unwrap();
        assert_eq!(memo.state(), MemoState::ReadyToMerge);

        let head = Tool::new("git")
            .args(&["rev-parse", "--abbrev-ref", "HEAD"])
            .current_dir(dir.path())
            .run_ok()
            .unwrap();
        assert_eq!(head.stdout.trim(), "integration/test");
    }

    #[test]
    fn dry_run_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        branch_with_file(dir.path(), "feat/qa/t1", "a.txt", "a\n");
        write_memo(dir.path(), "m1.md", Some("feat/qa/t1"));
        let before = std::fs::read_to_string(dir.path().join("agent-sync/m1.md")).unwrap();

        let result = manager(dir.path()).apply_ready(true);
        assert!(result.success);
        assert!(result.dry_run);
        assert_eq!(result.merged_branches, vec!["feat/qa/t1"]);
        assert!(result.message.ends_with("(dry-run)"));
        assert!(!dir.path().join("a.txt").exists());
        let after = std::fs::read_to_string(dir.path().join("agent-sync/m1.md")).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn conflict_check_reports_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        branch_with_file(dir.path(), "left", "README.md", "left\n");
        branch_with_file(dir.path(), "clean", "new.txt", "new\n");
        std::fs::write(dir.path().join("README.md"), "main\n").unwrap();
        git(dir.path(), &["commit", "-q", "-am", "main edit"]);

        let mgr = manager(dir.path());
        let (conflicts, detail) = mgr.check_merge_conflicts("left").unwrap();
        assert!(conflicts);
        assert!(!detail.is_empty());

        let (conflicts, _) = mgr.check_merge_conflicts("clean").unwrap();
        assert!(!conflicts);
        assert!(!dir.path().join("new.txt").exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("README.md")).unwrap(),
            "main\n"
        );
    }

    #[test]
    fn merge_message_falls_back_to_branch() {
        let memo = Memo::from_text(Path::new("m.md"), "- **Status**: ready-to-consume\n");
        assert_eq!(
            merge_message(&memo, "feat/x"),
            "feat: integrate feat/x\n\nFrom: agent\nMemo: m.md"
        );
    }
}
