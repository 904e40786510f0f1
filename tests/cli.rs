mod common;

use assert_cmd::Command;
use predicates::prelude::*;

fn convoy() -> Command {
    Command::cargo_bin("convoy").unwrap()
}

#[test]
fn validate_accepts_well_formed_command() {
    convoy()
        .args(["validate", "/orchestrator::start_workflow(refine, phase-1, iter-1)"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("OK /orchestrator::start_workflow"))
        .stdout(predicate::str::contains("(orchestrator)"));
}

#[test]
fn validate_rejects_wrong_arity() {
    convoy()
        .args(["validate", "/orchestrator::start_workflow(refine)"])
        .assert()
        .code(6)
        .stderr(predicate::str::contains("start_workflow requires 3 args"));
}

#[test]
fn validate_rejects_garbage() {
    convoy()
        .args(["validate", "start everything please"])
        .assert()
        .code(6)
        .stderr(predicate::str::contains("not a command"));
}

#[test]
fn list_shows_every_class() {
    convoy()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("orchestrator:"))
        .stdout(predicate::str::contains("apply_ready_to"))
        .stdout(predicate::str::contains("report_token_usage"));

    convoy()
        .args(["list", "--role", "integrator", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("check_conflicts"))
        .stdout(predicate::str::contains("start_workflow").not());
}

#[test]
fn schema_describes_config() {
    convoy()
        .arg("schema")
        .assert()
        .success()
        .stdout(predicate::str::contains("agent_sync_dir"))
        .stdout(predicate::str::contains("trunk_branch"));
}

#[test]
fn exec_success_and_failure_exit_codes() {
    let root = tempfile::tempdir().unwrap();
    convoy()
        .arg("--project-root")
        .arg(root.path())
        .args(["exec", "/qa::report_token_usage", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"success\": true"));

    convoy()
        .arg("--project-root")
        .arg(root.path())
        .args(["exec", "/qa::dance"])
        .assert()
        .code(1)
        .stdout(predicate::str::starts_with("[ERR]"));

    convoy()
        .arg("--project-root")
        .arg(root.path())
        .args(["exec", "qa dance"])
        .assert()
        .code(6);
}

#[test]
fn bad_config_exits_with_config_code() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join(".convoy.toml"), "[agent]\nmax_parallel = \"many\"\n").unwrap();
    convoy()
        .arg("--project-root")
        .arg(root.path())
        .args(["exec", "/qa::report_token_usage"])
        .assert()
        .code(2);
}

#[test]
fn memos_filter_by_state() {
    let root = tempfile::tempdir().unwrap();
    common::write_memo(root.path(), "2026-01-10_dev_a.md", "blocked", Some("feat/dev/a"));
    common::write_memo(root.path(), "2026-01-10_dev_b.md", "ready-to-consume", Some("feat/dev/b"));

    convoy()
        .arg("--project-root")
        .arg(root.path())
        .args(["memos", "--state", "blocked"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2026-01-10_dev_a.md"))
        .stdout(predicate::str::contains("2026-01-10_dev_b.md").not());

    convoy()
        .arg("--project-root")
        .arg(root.path())
        .args(["memos", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"state\": \"ready-to-consume\""));
}

#[test]
fn repl_routes_each_line() {
    let root = tempfile::tempdir().unwrap();
    convoy()
        .arg("--project-root")
        .arg(root.path())
        .arg("repl")
        .write_stdin("# comment\n/qa::start_next\nnonsense\nquit\n/qa::report_token_usage\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("[OK] No task index found"))
        .stdout(predicate::str::contains("[ERR] Not a command: nonsense"))
        .stdout(predicate::str::contains("Token usage").not());
}

#[test]
fn worktree_subcommands_round_trip() {
    let repo = tempfile::tempdir().unwrap();
    let trees = tempfile::tempdir().unwrap();
    common::init_repo(repo.path());
    std::fs::write(
        repo.path().join(".convoy.toml"),
        format!("[worktrees]\nlocation = \"{}\"\n", trees.path().display()),
    )
    .unwrap();
    let run = |args: &[&str]| {
        let mut cmd = convoy();
        cmd.arg("--project-root").arg(repo.path()).arg("worktree").args(args);
        cmd.assert()
    };

    run(&["create", "qa", "T-1"])
        .success()
        .stdout(predicate::str::contains("on feat/qa/T-1"));
    run(&["list"])
        .success()
        .stdout(predicate::str::contains("feat/qa/T-1"));

    let path = trees.path().join("qa").join("T-1");
    run(&["remove", path.to_str().unwrap()]).success();
    assert!(!path.exists());
    run(&["prune"]).success();
    run(&["create", "qa", "T-2", "--base", "no-such-branch"]).code(4);
}
