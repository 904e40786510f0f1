mod common;

use std::path::Path;

use common::{branch_with_file, current_branch, git, init_repo, write_memo};
use convoy::config::Config;
use convoy::grammar;
use convoy::integration::IntegrationManager;
use convoy::memo::{MemoScanner, MemoState};
use convoy::router::{Context, Router};

/// Five ready branches; b3 edits the same line as b2.
fn five_ready(dir: &Path) {
    init_repo(dir);
    branch_with_file(dir, "feat/dev/b1", "b1.txt", "one\n");
    branch_with_file(dir, "feat/dev/b2", "README.md", "two\n");
    branch_with_file(dir, "feat/dev/b3", "README.md", "three\n");
    branch_with_file(dir, "feat/dev/b4", "b4.txt", "four\n");
    branch_with_file(dir, "feat/dev/b5", "b5.txt", "five\n");
    for n in 1..=5 {
        write_memo(
            dir,
            &format!("2026-01-10_dev_b{n}.md"),
            "ready-to-consume",
            Some(&format!("feat/dev/b{n}")),
        );
    }
}

fn manager(dir: &Path) -> IntegrationManager {
    IntegrationManager::new(dir, "integration/2026-01-10", "main", &dir.join("agent-sync"))
}

#[test]
fn conflicting_branch_is_blocked_and_others_merge() {
    let dir = tempfile::tempdir().unwrap();
    five_ready(dir.path());

    let result = manager(dir.path()).apply_ready(false);
    assert!(!result.success);
    assert_eq!(
        result.merged_branches,
        vec!["feat/dev/b1", "feat/dev/b2", "feat/dev/b4", "feat/dev/b5"]
    );
    assert_eq!(result.failed_branches.len(), 1);
    assert_eq!(result.failed_branches[0].branch, "feat/dev/b3");
    assert_eq!(result.failed_branches[0].memo, "2026-01-10_dev_b3.md");
    assert_eq!(result.message, "Processed 5 memo(s): 4 merged, 1 failed, 0 skipped");

    let scanner = MemoScanner::new(dir.path().join("agent-sync"));
    let blocked = scanner.scan_blocked();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].file_name(), "2026-01-10_dev_b3.md");
    assert_eq!(scanner.scan_ready_to_merge().len(), 4);
    assert!(scanner.scan_ready_to_consume().is_empty());

    let text = std::fs::read_to_string(dir.path().join("agent-sync/2026-01-10_dev_b3.md")).unwrap();
    assert!(text.contains("- **Status**: `blocked` - "));
    assert_eq!(text.matches("**Integrated**:").count(), 1);

    // the aborted merge left no conflict markers behind
    assert_eq!(current_branch(dir.path()), "integration/2026-01-10");
    let status = git(dir.path(), &["status", "--porcelain"]);
    assert!(!status.lines().any(|l| l.starts_with("UU")), "{status}");
    assert!(dir.path().join("b5.txt").exists());
}

#[test]
fn second_run_finds_nothing_to_do() {
    let dir = tempfile::tempdir().unwrap();
    five_ready(dir.path());
    let mgr = manager(dir.path());
    mgr.apply_ready(false);

    let again = mgr.apply_ready(false);
    assert!(again.success);
    assert_eq!(again.message, "No ready-to-consume work found");
}

#[test]
fn dry_run_reports_real_order_and_mutates_nothing() {
    let dir = tempfile::tempdir().unwrap();
    five_ready(dir.path());
    let memo = dir.path().join("agent-sync/2026-01-10_dev_b3.md");
    let before = std::fs::read_to_string(&memo).unwrap();

    let result = manager(dir.path()).apply_ready(true);
    assert!(result.success);
    assert_eq!(
        result.merged_branches,
        (1..=5).map(|n| format!("feat/dev/b{n}")).collect::<Vec<_>>()
    );
    assert_eq!(current_branch(dir.path()), "main");
    assert_eq!(std::fs::read_to_string(&memo).unwrap(), before);
    assert!(!dir.path().join("b1.txt").exists());
}

#[test]
fn unknown_and_draft_memos_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    write_memo(dir.path(), "2026-01-10_dev_draft.md", "draft", Some("feat/x"));
    std::fs::write(dir.path().join("agent-sync/2026-01-10_dev_bare.md"), "# no status\n").unwrap();

    let scanner = MemoScanner::new(dir.path().join("agent-sync"));
    let states: Vec<MemoState> = scanner.scan_all().iter().map(|m| m.state()).collect();
    assert_eq!(states, vec![MemoState::Unknown, MemoState::Draft]);

    let result = manager(dir.path()).apply_ready(false);
    assert!(result.success);
    assert_eq!(result.total_processed(), 0);
    assert_eq!(current_branch(dir.path()), "main");
}

#[test]
fn routed_apply_ready_with_target_override() {
    let dir = tempfile::tempdir().unwrap();
    five_ready(dir.path());
    let ctx = Context::new(dir.path().to_path_buf(), Config::default());
    let router = Router::with_default_handlers();

    let cmd = grammar::parse("/orchestrator::apply_ready_to(release, dry-run)").unwrap();
    let result = router.route(&cmd, &ctx);
    assert!(result.success, "{}", result.message);
    assert!(result.message.starts_with("apply_ready_to(release) -> Processed 5 memo(s)"));
    assert_eq!(result.data["target_branch"], "release");
    assert_eq!(result.data["dry_run"], true);

    let cmd = grammar::parse("/integrator::apply_ready(release)").unwrap();
    let result = router.route(&cmd, &ctx);
    assert!(!result.success);
    assert_eq!(current_branch(dir.path()), "release");
    assert_eq!(result.data["failed_branches"][0]["branch"], "feat/dev/b3");
}

#[test]
fn routed_conflict_check() {
    let dir = tempfile::tempdir().unwrap();
    five_ready(dir.path());
    git(dir.path(), &["merge", "-q", "--no-ff", "-m", "take b2", "feat/dev/b2"]);
    let ctx = Context::new(dir.path().to_path_buf(), Config::default());
    let router = Router::with_default_handlers();

    let check = |branch: &str| {
        let cmd = grammar::parse(&format!("/integrator::check_conflicts({branch})")).unwrap();
        router.route(&cmd, &ctx)
    };
    let clean = check("feat/dev/b1");
    assert!(clean.success, "{}", clean.message);
    assert_eq!(clean.data["has_conflicts"], false);

    let conflicted = check("feat/dev/b3");
    assert!(!conflicted.success);
    assert_eq!(conflicted.data["has_conflicts"], true);
    assert!(!dir.path().join("b1.txt").exists());
}

#[test]
fn unpreparable_target_fails_every_mergeable_branch() {
    let dir = tempfile::tempdir().unwrap();
    five_ready(dir.path());
    write_memo(dir.path(), "2026-01-10_dev_b6.md", "ready-to-consume", None);
    let mgr = IntegrationManager::new(
        dir.path(),
        "integration/2026-01-10",
        "no-such-trunk",
        &dir.path().join("agent-sync"),
    );

    let result = mgr.apply_ready(false);
    assert!(!result.success);
    assert!(result.merged_branches.is_empty());
    assert_eq!(
        result.failed_branches.iter().map(|f| f.branch.as_str()).collect::<Vec<_>>(),
        (1..=5).map(|n| format!("feat/dev/b{n}")).collect::<Vec<_>>()
    );
    assert!(result.failed_branches.iter().all(|f| f.error.contains("no-such-trunk")));
    assert_eq!(result.skipped_memos, vec!["2026-01-10_dev_b6.md"]);
    assert_eq!(result.total_processed(), 6);
    assert!(result.message.starts_with("Failed to prepare target branch integration/2026-01-10"));

    // nothing merged and nothing marked; the batch can be retried
    assert_eq!(current_branch(dir.path()), "main");
    let scanner = MemoScanner::new(dir.path().join("agent-sync"));
    assert_eq!(scanner.scan_ready_to_consume().len(), 6);
    assert!(scanner.scan_blocked().is_empty());
}
