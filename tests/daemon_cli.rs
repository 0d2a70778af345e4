//! Daemon lifecycle tests for the braid binary
//!
//! The daemon subcommands are the binary's whole surface; these cover the
//! status/logs paths that work without actually backgrounding a process.

use predicates::prelude::*;
use tempfile::TempDir;

use braid::storage::Workspace;

/// Get a command instance for the braid binary
fn braid_cmd() -> assert_cmd::Command {
    assert_cmd::Command::new(assert_cmd::cargo::cargo_bin!("braid"))
}

#[test]
fn status_outside_workspace_fails_with_guidance() {
    let dir = TempDir::new().unwrap();

    braid_cmd()
        .current_dir(dir.path())
        .args(["daemon", "status"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Not in a braid workspace"));
}

#[test]
fn status_reports_stopped_daemon() {
    let dir = TempDir::new().unwrap();
    Workspace::init(dir.path()).unwrap();

    braid_cmd()
        .current_dir(dir.path())
        .args(["daemon", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("STOPPED"));
}

#[test]
fn stop_without_running_daemon_is_clean() {
    let dir = TempDir::new().unwrap();
    Workspace::init(dir.path()).unwrap();

    braid_cmd()
        .current_dir(dir.path())
        .args(["daemon", "stop"])
        .assert()
        .success()
        .stdout(predicate::str::contains("not running"));
}

#[test]
fn logs_without_log_file() {
    let dir = TempDir::new().unwrap();
    Workspace::init(dir.path()).unwrap();

    braid_cmd()
        .current_dir(dir.path())
        .args(["daemon", "logs"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No daemon logs"));
}

#[test]
fn start_respects_disable_env() {
    let dir = TempDir::new().unwrap();
    Workspace::init(dir.path()).unwrap();

    braid_cmd()
        .current_dir(dir.path())
        .env("BRAID_NO_DAEMON", "1")
        .args(["daemon", "start"])
        .assert()
        .success()
        .stderr(predicate::str::contains("disabled"));
}
