#[path = "common/mod.rs"]
mod common;

use std::{fs, path::Path, time::Duration};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn devsup(dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("devsup"));
    cmd.current_dir(dir)
        .env_remove("DEVSUP_LOG_DIR")
        .env_remove("BACKEND_PORT")
        .env_remove("FRONTEND_PORT")
        .env("RUST_LOG", "warn");
    cmd
}

/// Two services that never bind their ports, so readiness gives up quickly.
fn idle_stack(dir: &Path) -> (u16, u16) {
    let api = common::free_port();
    let web = common::free_port();
    common::write_config(
        dir,
        &format!(
            r#"
version: "1"
log_dir: run
timing:
  readiness_attempts: 1
  readiness_interval: 10ms
  stagger: 0s
  restart_delay: 0s
  early_exit_window: 200ms
  stop_grace: 2s
services:
  - name: api
    port: {api}
    command: ["sh", "-c", "echo api up on {{port}}; exec sleep 30"]
  - name: web
    port: {web}
    command: ["sleep", "30"]
"#
        ),
    );
    (api, web)
}

#[test]
fn status_with_nothing_running_suggests_start() {
    let dir = tempdir().unwrap();
    idle_stack(dir.path());

    devsup(dir.path())
        .args(["status", "--no-color"])
        .assert()
        .success()
        .stdout(predicate::str::contains("● api - Stopped"))
        .stdout(predicate::str::contains("devsup start"))
        .stdout(predicate::str::contains("\x1b[").not());
}

#[test]
fn status_json_reports_missing_pid_records() {
    let dir = tempdir().unwrap();
    idle_stack(dir.path());

    let output = devsup(dir.path())
        .args(["status", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["recommendation"], "start");
    let services = report["services"].as_array().unwrap();
    assert_eq!(services.len(), 2);
    for service in services {
        assert_eq!(service["pid_found"], false);
        assert_eq!(service["pid_alive"], false);
    }
}

#[test]
fn stop_is_idempotent() {
    let dir = tempdir().unwrap();
    idle_stack(dir.path());

    for _ in 0..2 {
        devsup(dir.path())
            .arg("stop")
            .assert()
            .success()
            .stdout(predicate::str::contains("api was not running"));
    }
    assert!(!dir.path().join("run/api.pid").exists());
    assert!(!dir.path().join("run/web.pid").exists());
}

#[test]
fn start_then_stop_manages_real_processes() {
    let dir = tempdir().unwrap();
    idle_stack(dir.path());

    devsup(dir.path())
        .arg("start")
        .assert()
        .success()
        .stdout(predicate::str::contains("did not answer HTTP"));

    let api_pid = common::read_pid(&dir.path().join("run/api.pid"));
    let web_pid = common::read_pid(&dir.path().join("run/web.pid"));
    assert!(common::is_process_alive(api_pid));
    assert!(common::is_process_alive(web_pid));
    common::wait_for_content(&dir.path().join("run/api.log"), "api up on");

    let output = devsup(dir.path()).args(["status", "--json"]).output().unwrap();
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["recommendation"], "restart_or_stop");
    assert_eq!(report["services"][0]["pid"], api_pid);

    devsup(dir.path())
        .args(["stop", "--clean-logs"])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("Stopped api (PID {api_pid})")));

    assert!(common::wait_until(Duration::from_secs(5), || {
        !common::is_process_alive(api_pid) && !common::is_process_alive(web_pid)
    }));
    assert!(!dir.path().join("run/api.pid").exists());
    assert_eq!(fs::read_to_string(dir.path().join("run/api.log")).unwrap(), "");
}

#[test]
fn crashing_service_fails_start_with_log_excerpt() {
    let dir = tempdir().unwrap();
    let port = common::free_port();
    common::write_config(
        dir.path(),
        &format!(
            r#"
timing:
  early_exit_window: 2s
services:
  - name: api
    port: {port}
    command: ["sh", "-c", "echo 'address already in use' >&2; exit 1"]
"#
        ),
    );

    devsup(dir.path())
        .arg("start")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("error: Failed to start service 'api'"))
        .stderr(predicate::str::contains("address already in use"));
}

#[test]
fn invalid_config_exits_with_one() {
    let dir = tempdir().unwrap();
    common::write_config(dir.path(), "services: []\n");

    devsup(dir.path())
        .arg("status")
        .assert()
        .code(1)
        .stderr(predicate::str::starts_with("error: Invalid configuration"));
}

#[test]
fn unknown_subcommand_is_a_usage_error() {
    let dir = tempdir().unwrap();

    devsup(dir.path()).arg("logs").assert().code(2);
}
