//! Helpers shared by unit and integration tests.
//!
//! [`FakeHost`] implements every host capability in memory so lifecycle scenarios can run
//! without spawning real processes or binding real ports.
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fs::File,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, OnceLock},
    time::Duration,
};

use crate::{
    config::{CommandSpec, Preflight, ServiceDescriptor, Timings},
    host::{CommandRunner, Host, HttpCheck, PortInspector, ProcessHandle},
    logs::LogManager,
    retry::RetryPolicy,
};

/// Global lock for environment variable modifications in tests.
/// Tests that set or remove environment variables must hold it to avoid racing each other.
pub static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

pub fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Timings with every wait collapsed so scenarios run instantly.
pub fn instant_timings() -> Timings {
    Timings {
        reclaim_grace: Duration::ZERO,
        stop_grace: Duration::ZERO,
        exit_poll_interval: Duration::from_millis(1),
        readiness: RetryPolicy::new(3, Duration::ZERO),
        stagger: Duration::ZERO,
        restart_delay: Duration::ZERO,
        early_exit_window: Duration::ZERO,
    }
}

/// Descriptor for a service whose files live under `log_dir`.
pub fn descriptor(name: &str, port: u16, log_dir: &Path) -> ServiceDescriptor {
    let logs = LogManager::new(log_dir);
    ServiceDescriptor {
        name: name.to_string(),
        port,
        start_command: CommandSpec {
            program: format!("run-{name}"),
            args: vec!["--port".to_string(), port.to_string()],
            cwd: log_dir.to_path_buf(),
            env: BTreeMap::new(),
        },
        log_path: logs.log_path_for(name),
        pid_path: logs.pid_path_for(name),
        readiness_path: "/".to_string(),
        alternate_readiness_paths: Vec::new(),
        preflight: None,
    }
}

/// Same as [`descriptor`] with a preflight attached.
pub fn descriptor_with_preflight(
    name: &str,
    port: u16,
    log_dir: &Path,
    preflight: Preflight,
) -> ServiceDescriptor {
    ServiceDescriptor {
        preflight: Some(preflight),
        ..descriptor(name, port, log_dir)
    }
}

/// A signal observed by the fake host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeSignal {
    Term(u32),
    Kill(u32),
}

#[derive(Debug, Default)]
struct FakeState {
    next_pid: u32,
    alive: HashSet<u32>,
    listeners: HashMap<u16, Vec<u32>>,
    phantom_ports: HashSet<u16>,
    stubborn: HashSet<u32>,
    bind_on_start: HashMap<String, u16>,
    exit_on_start: HashSet<String>,
    fail_spawn: HashSet<String>,
    http: HashMap<u16, Option<HashSet<String>>>,
    missing_programs: HashSet<String>,
    failing_programs: HashSet<String>,
    runs: Vec<CommandSpec>,
    started: Vec<(String, u32)>,
    signals: Vec<FakeSignal>,
    http_requests: Vec<String>,
}

impl FakeState {
    fn allocate_pid(&mut self) -> u32 {
        if self.next_pid == 0 {
            self.next_pid = 40_000;
        }
        self.next_pid += 1;
        self.next_pid
    }

    fn reap(&mut self, pid: u32) {
        self.alive.remove(&pid);
        for holders in self.listeners.values_mut() {
            holders.retain(|holder| *holder != pid);
        }
    }

    fn live_listeners(&self, port: u16) -> Vec<u32> {
        self.listeners
            .get(&port)
            .map(|holders| {
                holders
                    .iter()
                    .copied()
                    .filter(|pid| self.alive.contains(pid))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// In-memory host: processes are pids in a set, ports are a map of listeners.
#[derive(Debug, Default)]
pub struct FakeHost {
    state: Mutex<FakeState>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bundles this fake as every capability of a [`Host`].
    pub fn host(self: &Arc<Self>) -> Host {
        Host {
            processes: self.clone(),
            ports: self.clone(),
            commands: self.clone(),
            http: self.clone(),
        }
    }

    /// Starts an unrelated process listening on `port` and returns its pid.
    pub fn occupy(&self, port: u16) -> u32 {
        let mut state = self.state();
        let pid = state.allocate_pid();
        state.alive.insert(pid);
        state.listeners.entry(port).or_default().push(pid);
        pid
    }

    /// Marks `port` as taken by something whose pid cannot be discovered.
    pub fn occupy_anonymously(&self, port: u16) {
        self.state().phantom_ports.insert(port);
    }

    /// Starts an unrelated live process that holds no port.
    pub fn spawn_unrelated(&self) -> u32 {
        let mut state = self.state();
        let pid = state.allocate_pid();
        state.alive.insert(pid);
        pid
    }

    /// Makes `pid` ignore SIGTERM; only SIGKILL removes it.
    pub fn ignore_sigterm(&self, pid: u32) {
        self.state().stubborn.insert(pid);
    }

    /// Processes started for `service` will listen on `port`.
    pub fn bind_on_start(&self, service: &str, port: u16) {
        self.state().bind_on_start.insert(service.to_string(), port);
    }

    /// Processes started for `service` exit immediately.
    pub fn exit_on_start(&self, service: &str) {
        self.state().exit_on_start.insert(service.to_string());
    }

    /// Spawning `service` fails as if the executable did not exist.
    pub fn fail_spawn(&self, service: &str) {
        self.state().fail_spawn.insert(service.to_string());
    }

    /// Every path on `port` answers HTTP while a live process listens there.
    pub fn serve_http(&self, port: u16) {
        self.state().http.insert(port, None);
    }

    /// Only `path` on `port` answers HTTP while a live process listens there.
    pub fn serve_http_path(&self, port: u16, path: &str) {
        let mut state = self.state();
        let entry = state.http.entry(port).or_insert_with(|| Some(HashSet::new()));
        if let Some(paths) = entry {
            paths.insert(path.to_string());
        }
    }

    /// `program` is not on the fake `PATH`.
    pub fn missing_program(&self, program: &str) {
        self.state().missing_programs.insert(program.to_string());
    }

    /// Helper commands whose program is `program` exit unsuccessfully.
    pub fn failing_program(&self, program: &str) {
        self.state().failing_programs.insert(program.to_string());
    }

    /// Simulates a process dying without devsup's involvement.
    pub fn crash(&self, pid: u32) {
        self.state().reap(pid);
    }

    pub fn is_running(&self, pid: u32) -> bool {
        self.state().alive.contains(&pid)
    }

    /// Live pids listening on `port`.
    pub fn holders(&self, port: u16) -> Vec<u32> {
        self.state().live_listeners(port)
    }

    /// `(service, pid)` for every process started, in order.
    pub fn started(&self) -> Vec<(String, u32)> {
        self.state().started.clone()
    }

    pub fn signals(&self) -> Vec<FakeSignal> {
        self.state().signals.clone()
    }

    /// Helper commands run so far.
    pub fn runs(&self) -> Vec<CommandSpec> {
        self.state().runs.clone()
    }

    pub fn http_requests(&self) -> Vec<String> {
        self.state().http_requests.clone()
    }
}

impl ProcessHandle for FakeHost {
    fn start(&self, service: &str, command: &CommandSpec, mut log: File) -> io::Result<u32> {
        let mut state = self.state();
        if state.fail_spawn.contains(service) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{}: command not found", command.program),
            ));
        }

        let pid = state.allocate_pid();
        state.started.push((service.to_string(), pid));
        writeln!(log, "{} listening (pid {pid})", command.display())?;

        if state.exit_on_start.contains(service) {
            writeln!(log, "{service}: fatal error during startup")?;
            return Ok(pid);
        }

        state.alive.insert(pid);
        if let Some(port) = state.bind_on_start.get(service).copied() {
            state.listeners.entry(port).or_default().push(pid);
        }
        Ok(pid)
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.state().alive.contains(&pid)
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        let mut state = self.state();
        state.signals.push(FakeSignal::Term(pid));
        if !state.stubborn.contains(&pid) {
            state.reap(pid);
        }
        Ok(())
    }

    fn force_kill(&self, pid: u32) -> io::Result<()> {
        let mut state = self.state();
        state.signals.push(FakeSignal::Kill(pid));
        state.reap(pid);
        Ok(())
    }
}

impl PortInspector for FakeHost {
    fn listeners(&self, port: u16) -> Vec<u32> {
        self.state().live_listeners(port)
    }

    fn is_occupied(&self, port: u16) -> bool {
        let state = self.state();
        state.phantom_ports.contains(&port) || !state.live_listeners(port).is_empty()
    }
}

impl CommandRunner for FakeHost {
    fn locate(&self, program: &str) -> Option<PathBuf> {
        let state = self.state();
        (!state.missing_programs.contains(program))
            .then(|| PathBuf::from("/usr/bin").join(program))
    }

    fn run(&self, command: &CommandSpec, log: Option<File>) -> io::Result<bool> {
        let mut state = self.state();
        state.runs.push(command.clone());
        if let Some(mut log) = log {
            writeln!(log, "$ {}", command.display())?;
        }
        Ok(!state.failing_programs.contains(&command.program))
    }
}

impl HttpCheck for FakeHost {
    fn responds(&self, url: &str) -> bool {
        let mut state = self.state();
        state.http_requests.push(url.to_string());

        let Some(rest) = url.strip_prefix("http://") else {
            return false;
        };
        let (authority, path) = match rest.find('/') {
            Some(index) => (&rest[..index], &rest[index..]),
            None => (rest, "/"),
        };
        let Some(port) = authority
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse::<u16>().ok())
        else {
            return false;
        };

        if state.live_listeners(port).is_empty() {
            return false;
        }
        match state.http.get(&port) {
            Some(None) => true,
            Some(Some(paths)) => paths.contains(path),
            None => false,
        }
    }
}
