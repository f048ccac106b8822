#[path = "common/mod.rs"]
mod common;

use std::{
    collections::BTreeMap,
    fs::File,
    net::TcpListener,
    path::Path,
    time::Duration,
};

use devsup::{
    config::CommandSpec,
    error::SupervisorError,
    host::{Host, OsHost, PortInspector, ProcessHandle},
    launch::ProcessLauncher,
    logs::LogManager,
    test_utils::descriptor,
};
use nix::unistd::{Pid, getpgid};
use tempfile::tempdir;

fn shell(script: &str, cwd: &Path) -> CommandSpec {
    CommandSpec {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        cwd: cwd.to_path_buf(),
        env: BTreeMap::new(),
    }
}

#[test]
fn started_process_writes_to_log_and_stops_on_sigterm() {
    let dir = tempdir().unwrap();
    let log_path = dir.path().join("svc.log");
    let host = OsHost::new();

    let pid = host
        .start(
            "svc",
            &shell("echo hello from svc; exec sleep 30", dir.path()),
            File::create(&log_path).unwrap(),
        )
        .unwrap();

    common::wait_for_content(&log_path, "hello from svc");
    assert!(host.is_alive(pid));

    host.terminate(pid).unwrap();
    assert!(common::wait_until(Duration::from_secs(5), || !host.is_alive(pid)));
}

#[test]
fn service_runs_in_its_own_session() {
    let dir = tempdir().unwrap();
    let host = OsHost::new();

    let pid = host
        .start(
            "svc",
            &shell("exec sleep 30", dir.path()),
            File::create(dir.path().join("svc.log")).unwrap(),
        )
        .unwrap();

    let group = getpgid(Some(Pid::from_raw(pid as i32))).unwrap();
    assert_eq!(group.as_raw() as u32, pid);
    assert_ne!(group, getpgid(None).unwrap());

    host.force_kill(pid).unwrap();
    assert!(common::wait_until(Duration::from_secs(5), || !host.is_alive(pid)));
}

#[test]
fn terminate_reaches_grandchildren() {
    let dir = tempdir().unwrap();
    let host = OsHost::new();
    let child_pid_file = dir.path().join("child.pid");

    let pid = host
        .start(
            "svc",
            &shell("sleep 30 & echo $! > child.pid; wait", dir.path()),
            File::create(dir.path().join("svc.log")).unwrap(),
        )
        .unwrap();

    assert!(common::wait_until(Duration::from_secs(5), || {
        std::fs::read_to_string(&child_pid_file)
            .map(|content| content.trim().parse::<u32>().is_ok())
            .unwrap_or(false)
    }));
    let grandchild = common::read_pid(&child_pid_file);
    assert!(common::is_process_alive(grandchild));

    host.terminate(pid).unwrap();

    assert!(common::wait_until(Duration::from_secs(5), || !host.is_alive(pid)));
    assert!(common::wait_until(Duration::from_secs(5), || {
        !common::is_process_alive(grandchild)
    }));
}

#[test]
fn force_kill_stops_a_process_that_ignores_sigterm() {
    let dir = tempdir().unwrap();
    let log_path = dir.path().join("svc.log");
    let host = OsHost::new();

    let pid = host
        .start(
            "svc",
            &shell(
                "trap '' TERM; echo armed; while true; do sleep 0.1; done",
                dir.path(),
            ),
            File::create(&log_path).unwrap(),
        )
        .unwrap();
    common::wait_for_content(&log_path, "armed");

    host.terminate(pid).unwrap();
    std::thread::sleep(Duration::from_millis(300));
    assert!(host.is_alive(pid));

    host.force_kill(pid).unwrap();
    assert!(common::wait_until(Duration::from_secs(5), || !host.is_alive(pid)));
}

#[test]
fn launcher_reports_immediate_exit_with_log_tail() {
    let dir = tempdir().unwrap();
    let host = Host::os().unwrap();
    let launcher = ProcessLauncher::new(
        &host,
        LogManager::new(dir.path()),
        Duration::from_secs(2),
        Duration::from_millis(50),
    );

    let mut service = descriptor("backend", common::free_port(), dir.path());
    service.start_command = shell("echo 'ModuleNotFoundError: app' >&2; exit 3", dir.path());

    let err = launcher.launch(&service).unwrap_err();
    match err {
        SupervisorError::SpawnFailed { service, reason } => {
            assert_eq!(service, "backend");
            assert!(reason.contains("ModuleNotFoundError: app"), "{reason}");
        }
        other => panic!("expected SpawnFailed, got {other:?}"),
    }
}

#[test]
fn launcher_reports_missing_executable() {
    let dir = tempdir().unwrap();
    let host = Host::os().unwrap();
    let launcher = ProcessLauncher::new(
        &host,
        LogManager::new(dir.path()),
        Duration::from_millis(100),
        Duration::from_millis(20),
    );

    let mut service = descriptor("frontend", common::free_port(), dir.path());
    service.start_command.program = "devsup-no-such-binary".to_string();

    let err = launcher.launch(&service).unwrap_err();
    assert!(matches!(err, SupervisorError::SpawnFailed { .. }));
}

#[test]
fn port_inspector_sees_a_bound_listener() {
    let host = OsHost::new();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    assert!(host.is_occupied(port));
    let holders = host.listeners(port);
    assert!(
        holders.is_empty() || holders.contains(&std::process::id()),
        "unexpected holders {holders:?}"
    );

    drop(listener);
    assert!(common::wait_until(Duration::from_secs(2), || !host.is_occupied(port)));
}
