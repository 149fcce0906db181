//! CLI integration tests for wayfinder
//!
//! Runs the binary end-to-end with the offline echo provider.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Command with its config directory isolated in `dir`
#[allow(deprecated)]
fn wayfinder_cmd(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("wayfinder").unwrap();
    cmd.env("WAYFINDER_CONFIG_DIR", dir.path());
    cmd.env("RUST_LOG", "off");
    cmd
}

#[test]
fn test_offline_run_completes() {
    let dir = TempDir::new().unwrap();

    wayfinder_cmd(&dir)
        .args(["--offline", "run", "Say hello to the team"])
        .assert()
        .success()
        .stdout(predicate::str::contains("completed"))
        .stdout(predicate::str::contains("echo/default"))
        .stdout(predicate::str::contains("Say hello to the team"))
        .stdout(predicate::str::contains("echo/default: 1 call(s)"));
}

#[test]
fn test_failed_acceptance_exits_nonzero() {
    let dir = TempDir::new().unwrap();

    wayfinder_cmd(&dir)
        .args(["--offline", "run", "Say hello", "--contains", "goodbye"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("output does not contain 'goodbye'"));
}

#[test]
fn test_goals_persist_in_database() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("goals.db");
    let db = db.to_str().unwrap();

    wayfinder_cmd(&dir)
        .args(["--offline", "--db", db, "run", "Write a limerick, then shorten it"])
        .assert()
        .success();

    wayfinder_cmd(&dir)
        .args(["--offline", "--db", db, "goals", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[completed]"))
        .stdout(predicate::str::contains("Write a limerick"));

    wayfinder_cmd(&dir)
        .args(["--offline", "--db", db, "learning"])
        .assert()
        .success()
        .stdout(predicate::str::contains("echo/default"));
}

#[test]
fn test_unknown_goal_shows_hint() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("goals.db");

    wayfinder_cmd(&dir)
        .args(["--offline", "--db", db.to_str().unwrap(), "goals", "show", "missing"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"))
        .stderr(predicate::str::contains("Hint: wayfinder goals list"));
}

#[test]
fn test_models_list_offline() {
    let dir = TempDir::new().unwrap();

    wayfinder_cmd(&dir)
        .args(["--offline", "models", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("echo/default"))
        .stdout(predicate::str::contains("Routing rules:"));
}

#[test]
fn test_config_set_and_get() {
    let dir = TempDir::new().unwrap();

    wayfinder_cmd(&dir)
        .args(["config", "set", "engine.max_retries", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Set engine.max_retries = 5"));

    wayfinder_cmd(&dir)
        .args(["config", "get", "engine.max_retries"])
        .assert()
        .success()
        .stdout(predicate::str::diff("5\n"));

    wayfinder_cmd(&dir).args(["config", "reset"]).assert().success();

    wayfinder_cmd(&dir)
        .args(["config", "get", "engine.max_retries"])
        .assert()
        .success()
        .stdout(predicate::str::diff("3\n"));
}

#[test]
fn test_config_rejects_unknown_key() {
    let dir = TempDir::new().unwrap();

    wayfinder_cmd(&dir)
        .args(["config", "get", "llm.model"])
        .assert()
        .failure();
}

#[test]
fn test_json_output() {
    let dir = TempDir::new().unwrap();

    let output = wayfinder_cmd(&dir)
        .args(["--offline", "--format", "json", "run", "Say hi"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["goal"]["state"], "completed");
    assert_eq!(value["tasks"].as_array().unwrap().len(), 2);
    let calls = value["calls"].as_array().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0]["model"], "echo/default");
}
