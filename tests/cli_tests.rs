//! CLI surface tests.
//!
//! The binary is a thin adapter: these tests cover argument handling, the
//! offline commands, exit-code mapping, and one full build driven through a
//! shell-script provider.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn foundry() -> Command {
    let mut cmd = Command::cargo_bin("foundry").unwrap();
    cmd.env_remove("FOUNDRY_PROVIDER_CMD");
    cmd
}

#[test]
fn help_and_version() {
    foundry().arg("--help").assert().success();
    foundry().arg("--version").assert().success();
}

#[test]
fn list_on_fresh_workspace_is_empty() {
    let dir = TempDir::new().unwrap();
    foundry()
        .args(["--workspace", dir.path().to_str().unwrap(), "list"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn status_of_unknown_task_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    foundry()
        .args(["--workspace", dir.path().to_str().unwrap(), "status", "nope"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("No checkpoint"));
}

#[test]
fn events_of_unknown_task_is_empty_stream() {
    let dir = TempDir::new().unwrap();
    foundry()
        .args(["--workspace", dir.path().to_str().unwrap(), "events", "nope"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn start_without_provider_fails_fast() {
    let dir = TempDir::new().unwrap();
    foundry()
        .args([
            "--workspace",
            dir.path().to_str().unwrap(),
            "start",
            "build something",
        ])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("provider"));
}

#[test]
fn start_rejects_malformed_options() {
    let dir = TempDir::new().unwrap();
    foundry()
        .args([
            "--workspace",
            dir.path().to_str().unwrap(),
            "start",
            "build something",
            "--option",
            "max_parallel_scouts",
            "--provider-cmd",
            "true",
        ])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("key=value"));
}

#[test]
fn sweep_on_fresh_workspace_reports_nothing_removed() {
    let dir = TempDir::new().unwrap();
    foundry()
        .args(["--workspace", dir.path().to_str().unwrap(), "sweep"])
        .assert()
        .success()
        .stdout(predicate::str::contains("removed 0"));
}

/// Full build through a shell-script provider: the script answers planning,
/// architecting, building, and summarization prompts by grepping stdin.
#[test]
fn end_to_end_build_via_script_provider() {
    let dir = TempDir::new().unwrap();
    let script = dir.path().join("provider.sh");
    fs::write(
        &script,
        r#"#!/bin/sh
input=$(cat)
case "$input" in
*"planning stage"*)
    echo '{"topics": [], "build_tasks": [{"id": "t1", "title": "emit hello", "outputs": ["hello.txt"], "max_tokens": 256}]}'
    ;;
*"architecture stage"*)
    echo '[{"id": "t1", "title": "emit hello", "outputs": ["hello.txt"], "max_tokens": 256}]'
    ;;
*"Implement build task"*)
    printf 'hi\n'
    ;;
*)
    echo 'summary of prior work in this session'
    ;;
esac
"#,
    )
    .unwrap();

    let workspace = dir.path().join("project");
    fs::create_dir_all(&workspace).unwrap();

    foundry()
        .args([
            "--workspace",
            workspace.to_str().unwrap(),
            "start",
            "emit a file hello.txt containing exactly hi",
            "--provider-cmd",
            &format!("sh {}", script.display()),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Completed"));

    assert_eq!(
        fs::read(workspace.join("hello.txt")).unwrap(),
        vec![0x68, 0x69, 0x0A]
    );

    // The state surface works against the finished task.
    let list = foundry()
        .args(["--workspace", workspace.to_str().unwrap(), "list"])
        .output()
        .unwrap();
    let task_id = String::from_utf8(list.stdout).unwrap().trim().to_string();
    assert!(!task_id.is_empty());

    foundry()
        .args(["--workspace", workspace.to_str().unwrap(), "status", &task_id])
        .assert()
        .success()
        .stdout(predicate::str::contains("completed"));

    foundry()
        .args(["--workspace", workspace.to_str().unwrap(), "events", &task_id])
        .assert()
        .success()
        .stdout(predicate::str::contains("phase_change"));
}
