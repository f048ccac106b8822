use std::{path::Path, sync::Arc};

use devsup::{
    config::{PolicyConfig, Preflight},
    error::SupervisorError,
    logs::LogManager,
    pid::{PidFileStore, PidStore, ProcessRecord},
    readiness::Readiness,
    status::Recommendation,
    supervisor::{ServiceState, StopResult, Supervisor},
    test_utils::{FakeHost, descriptor, descriptor_with_preflight, instant_timings},
};
use tempfile::tempdir;

const BACKEND_PORT: u16 = 8000;
const FRONTEND_PORT: u16 = 3010;

fn stack(fake: &Arc<FakeHost>, dir: &Path) -> Supervisor {
    let logs = LogManager::new(dir);
    Supervisor::new(
        vec![
            descriptor("backend", BACKEND_PORT, dir),
            descriptor("frontend", FRONTEND_PORT, dir),
        ],
        logs.clone(),
        Arc::new(PidFileStore::new(logs)),
        fake.host(),
        instant_timings(),
        PolicyConfig::default(),
    )
}

fn healthy(fake: &FakeHost) {
    fake.bind_on_start("backend", BACKEND_PORT);
    fake.bind_on_start("frontend", FRONTEND_PORT);
    fake.serve_http(BACKEND_PORT);
    fake.serve_http(FRONTEND_PORT);
}

#[test]
fn start_reclaims_a_squatted_backend_port() {
    let dir = tempdir().unwrap();
    let fake = FakeHost::new();
    healthy(&fake);
    let squatter = fake.occupy(BACKEND_PORT);
    let mut supervisor = stack(&fake, dir.path());

    let summary = supervisor.start().unwrap();

    assert!(!fake.is_running(squatter));
    let order: Vec<String> = fake.started().into_iter().map(|(name, _)| name).collect();
    assert_eq!(order, vec!["backend", "frontend"]);

    let report = supervisor.status(false);
    assert_eq!(report.recommendation, Recommendation::RestartOrStop);
    for (status, outcome) in report.services.iter().zip(&summary.outcomes) {
        assert!(status.pid_alive, "{} should be alive", status.name);
        assert!(status.port_occupied);
        assert_eq!(status.pid, Some(outcome.pid));
        assert_eq!(status.port_owner_pid, Some(outcome.pid));
        assert!(!status.drift);
    }
}

#[test]
fn stop_after_start_leaves_no_pid_files_and_free_ports() {
    let dir = tempdir().unwrap();
    let fake = FakeHost::new();
    healthy(&fake);
    let mut supervisor = stack(&fake, dir.path());
    let started = supervisor.start().unwrap();
    assert!(dir.path().join("backend.pid").exists());

    let stopped = supervisor.stop(false).unwrap();

    let names: Vec<&str> = stopped.iter().map(|o| o.service.as_str()).collect();
    assert_eq!(names, vec!["frontend", "backend"]);
    for outcome in &started.outcomes {
        assert!(!fake.is_running(outcome.pid));
    }
    assert!(!dir.path().join("backend.pid").exists());
    assert!(!dir.path().join("frontend.pid").exists());
    assert!(fake.holders(BACKEND_PORT).is_empty());
    assert!(fake.holders(FRONTEND_PORT).is_empty());
    assert_eq!(supervisor.state("backend"), ServiceState::Stopped);
}

#[test]
fn stop_with_nothing_running_is_a_no_op() {
    let dir = tempdir().unwrap();
    let fake = FakeHost::new();
    let mut supervisor = stack(&fake, dir.path());

    let first = supervisor.stop(false).unwrap();
    let second = stack(&fake, dir.path()).stop(false).unwrap();

    for outcome in first.iter().chain(&second) {
        assert_eq!(outcome.result, StopResult::NotRunning);
        assert!(outcome.reclaimed.is_empty());
    }
    assert!(fake.signals().is_empty());
    assert!(!dir.path().join("backend.pid").exists());
}

#[test]
fn restart_hands_out_new_pids() {
    let dir = tempdir().unwrap();
    let fake = FakeHost::new();
    healthy(&fake);
    let before = stack(&fake, dir.path()).start().unwrap();

    let restarted = stack(&fake, dir.path()).restart().unwrap();

    assert_eq!(restarted.stopped.len(), 2);
    for (old, new) in before.outcomes.iter().zip(&restarted.started.outcomes) {
        assert_eq!(old.service, new.service);
        assert_ne!(old.pid, new.pid);
        assert!(!fake.is_running(old.pid));
        assert!(fake.is_running(new.pid));
    }
}

#[test]
fn status_with_nothing_running_recommends_start() {
    let dir = tempdir().unwrap();
    let fake = FakeHost::new();

    let report = stack(&fake, dir.path()).status(true);

    assert_eq!(report.recommendation, Recommendation::Start);
    assert!(report.services.iter().all(|s| !s.pid_found));
    assert!(report.host.is_some());
}

#[test]
fn silent_frontend_is_degraded_not_fatal() {
    let dir = tempdir().unwrap();
    let fake = FakeHost::new();
    fake.bind_on_start("backend", BACKEND_PORT);
    fake.bind_on_start("frontend", FRONTEND_PORT);
    fake.serve_http_path(BACKEND_PORT, "/");
    let mut supervisor = stack(&fake, dir.path());

    let summary = supervisor.start().unwrap();

    assert!(summary.outcomes[0].readiness.is_ready());
    assert_eq!(summary.outcomes[1].readiness, Readiness::Timeout { attempts: 3 });
    assert_eq!(supervisor.state("frontend"), ServiceState::Degraded);
    let frontend = &summary.report.services[1];
    assert!(frontend.pid_alive && !frontend.http_responsive);
}

#[test]
fn frontend_spawn_failure_aborts_but_keeps_backend() {
    let dir = tempdir().unwrap();
    let fake = FakeHost::new();
    healthy(&fake);
    fake.fail_spawn("frontend");
    let mut supervisor = stack(&fake, dir.path());

    let err = supervisor.start().unwrap_err();

    assert!(matches!(err, SupervisorError::SpawnFailed { ref service, .. } if service == "frontend"));
    assert!(err.is_fatal());
    let store = PidFileStore::new(LogManager::new(dir.path()));
    let backend = store.load_pid("backend").unwrap().expect("backend record");
    assert!(fake.is_running(backend));
    assert!(store.load("frontend").unwrap().is_none());
}

#[test]
fn missing_dependency_prevents_launch() {
    let dir = tempdir().unwrap();
    let fake = FakeHost::new();
    fake.missing_program("npm");
    let logs = LogManager::new(dir.path());
    let mut supervisor = Supervisor::new(
        vec![descriptor_with_preflight(
            "frontend",
            FRONTEND_PORT,
            dir.path(),
            Preflight::PackageManager {
                program: "npm".into(),
                deps_dir: "node_modules".into(),
                install: vec!["npm".into(), "install".into()],
            },
        )],
        logs.clone(),
        Arc::new(PidFileStore::new(logs)),
        fake.host(),
        instant_timings(),
        PolicyConfig::default(),
    );

    let err = supervisor.start().unwrap_err();

    assert!(matches!(err, SupervisorError::DependencyMissing { .. }));
    assert!(err.to_string().contains("npm"));
    assert!(fake.started().is_empty());
}

#[test]
fn stop_fails_with_port_busy_when_the_port_stays_held() {
    let dir = tempdir().unwrap();
    let fake = FakeHost::new();
    let store = PidFileStore::new(LogManager::new(dir.path()));
    let backend = fake.spawn_unrelated();
    store.save(&ProcessRecord::new("backend", backend)).unwrap();
    fake.occupy_anonymously(BACKEND_PORT);
    let mut supervisor = stack(&fake, dir.path());

    let err = supervisor.stop(false).unwrap_err();

    assert!(matches!(err, SupervisorError::PortBusy { port: BACKEND_PORT, .. }));
    assert!(err.is_fatal());
    assert!(!fake.is_running(backend));
    assert!(store.load("backend").unwrap().is_none());
    assert_eq!(supervisor.state("backend"), ServiceState::Stopping);
}
