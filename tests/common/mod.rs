#![allow(dead_code)]

use std::path::Path;
use std::process::Command;

/// Run git in `dir`, panicking with its stderr on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git runs");
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).into_owned()
}

/// A repo on `main` with one commit.
pub fn init_repo(dir: &Path) {
    git(dir, &["init", "-q"]);
    git(dir, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    git(dir, &["config", "user.email", "test@example.com"]);
    git(dir, &["config", "user.name", "Test"]);
    git(dir, &["config", "commit.gpgsign", "false"]);
    std::fs::write(dir.join("README.md"), "# test\n").unwrap();
    git(dir, &["add", "."]);
    git(dir, &["commit", "-q", "-m", "init"]);
}

/// Commit `file` with `contents` on a new branch forked from main, then return to main.
pub fn branch_with_file(dir: &Path, branch: &str, file: &str, contents: &str) {
    git(dir, &["checkout", "-q", "-b", branch, "main"]);
    std::fs::write(dir.join(file), contents).unwrap();
    git(dir, &["add", "."]);
    git(dir, &["commit", "-q", "-m", &format!("work on {branch}")]);
    git(dir, &["checkout", "-q", "main"]);
}

pub fn current_branch(dir: &Path) -> String {
    git(dir, &["rev-parse", "--abbrev-ref", "HEAD"]).trim().to_string()
}

/// Write a memo into `<dir>/agent-sync/`.
pub fn write_memo(dir: &Path, name: &str, status: &str, branch: Option<&str>) {
    let sync = dir.join("agent-sync");
    std::fs::create_dir_all(&sync).unwrap();
    let mut text = format!(
        "# Handoff\n\n- **Date**: 2026-01-10\n- **Audience**: @integrator\n- **Status**: `{status}`\n"
    );
    if let Some(branch) = branch {
        text.push_str(&format!("- **Branch**: `{branch}`\n"));
    }
    text.push_str("- **Work Item**: US-1\n");
    std::fs::write(sync.join(name), text).unwrap();
}

pub const WORKFLOW: &str = r#"
name = "refinement"

[[phases]]
id = "phase-1"

[[phases.iterations]]
id = "iter-1"
goal = "Refine the backlog"
completion_criteria = { requirements = ["Every story has acceptance criteria"] }

[[phases.iterations.agents]]
role = "product_analyst"
inputs = ["US-1", "US-2"]
deliverables = [{ path = "docs/stories.md" }]

[[phases.iterations.agents]]
role = "qa"
inputs = ["US-3", "US-4"]
dependencies = ["product_analyst"]
"#;
