use std::{fs, path::Path, sync::Arc};

use devsup::{
    config::PolicyConfig,
    error::PidFileError,
    logs::LogManager,
    pid::{PidFileStore, PidStore, ProcessRecord},
    supervisor::{StopResult, Supervisor},
    test_utils::{FakeHost, descriptor, instant_timings},
};
use tempfile::tempdir;

fn supervisor(fake: &Arc<FakeHost>, dir: &Path) -> Supervisor {
    let logs = LogManager::new(dir);
    Supervisor::new(
        vec![descriptor("backend", 8000, dir), descriptor("frontend", 3010, dir)],
        logs.clone(),
        Arc::new(PidFileStore::new(logs)),
        fake.host(),
        instant_timings(),
        PolicyConfig::default(),
    )
}

#[test]
fn pid_files_survive_between_invocations() {
    let dir = tempdir().unwrap();
    let fake = FakeHost::new();
    fake.bind_on_start("backend", 8000);
    fake.bind_on_start("frontend", 3010);

    let started = supervisor(&fake, dir.path()).start().unwrap();

    for outcome in &started.outcomes {
        let raw = fs::read_to_string(dir.path().join(format!("{}.pid", outcome.service))).unwrap();
        assert_eq!(raw.trim(), outcome.pid.to_string());
    }

    let report = supervisor(&fake, dir.path()).status(false);
    for (status, outcome) in report.services.iter().zip(&started.outcomes) {
        assert!(status.pid_found);
        assert_eq!(status.pid, Some(outcome.pid));
        assert!(status.uptime.is_some());
    }
}

#[test]
fn status_never_repairs_a_stale_record() {
    let dir = tempdir().unwrap();
    let fake = FakeHost::new();
    let store = PidFileStore::new(LogManager::new(dir.path()));
    let gone = fake.spawn_unrelated();
    store.save(&ProcessRecord::new("backend", gone)).unwrap();
    fake.crash(gone);

    let report = supervisor(&fake, dir.path()).status(false);

    assert!(report.services[0].pid_found);
    assert!(!report.services[0].pid_alive);
    assert_eq!(store.load_pid("backend").unwrap(), Some(gone));
}

#[test]
fn stop_discards_stale_and_corrupt_records() {
    let dir = tempdir().unwrap();
    let fake = FakeHost::new();
    let store = PidFileStore::new(LogManager::new(dir.path()));
    let gone = fake.spawn_unrelated();
    store.save(&ProcessRecord::new("backend", gone)).unwrap();
    fake.crash(gone);
    fs::write(dir.path().join("frontend.pid"), "garbage\n").unwrap();

    let status = supervisor(&fake, dir.path()).status(false);
    assert!(status.services[1].pid_found);
    assert_eq!(status.services[1].pid, None);

    let outcomes = supervisor(&fake, dir.path()).stop(false).unwrap();

    assert_eq!(outcomes[0].service, "frontend");
    assert_eq!(outcomes[0].result, StopResult::NotRunning);
    assert_eq!(outcomes[1].result, StopResult::StaleRecord { pid: gone });
    assert!(!dir.path().join("backend.pid").exists());
    assert!(!dir.path().join("frontend.pid").exists());
    assert!(fake.signals().is_empty());
}

#[test]
fn oversized_pid_is_treated_as_corrupt() {
    let dir = tempdir().unwrap();
    let fake = FakeHost::new();
    let store = PidFileStore::new(LogManager::new(dir.path()));
    fs::write(dir.path().join("backend.pid"), "4294967295\n").unwrap();

    assert!(matches!(
        store.load_pid("backend"),
        Err(PidFileError::Parse { ref contents, .. }) if contents == "4294967295"
    ));

    let status = supervisor(&fake, dir.path()).status(false);
    assert!(status.services[0].pid_found);
    assert_eq!(status.services[0].pid, None);
    assert!(!status.services[0].pid_alive);

    let outcomes = supervisor(&fake, dir.path()).stop(false).unwrap();

    assert_eq!(outcomes[1].service, "backend");
    assert_eq!(outcomes[1].result, StopResult::NotRunning);
    assert!(!dir.path().join("backend.pid").exists());
    assert!(fake.signals().is_empty());
}
