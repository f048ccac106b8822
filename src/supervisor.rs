use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io,
    sync::Arc,
    thread,
};

use fs2::FileExt;
use serde::Serialize;
use strum_macros::Display;
use tracing::{debug, info, warn};

use crate::{
    config::{Config, PolicyConfig, ServiceDescriptor, Timings},
    constants::KILL_SETTLE,
    error::{PidFileError, SupervisorError},
    host::Host,
    launch::ProcessLauncher,
    logs::LogManager,
    pid::{PidFileStore, PidStore},
    readiness::{Readiness, ReadinessPolicy, ReadinessProbe},
    reclaim::{PortReclaimer, ReclaimPolicy, Reclaimed},
    retry::RetryPolicy,
    status::{StatusReport, StatusReporter},
};

/// Lifecycle state of a managed service within one devsup invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Unknown,
    Starting,
    Ready,
    Degraded,
    Stopping,
    Stopped,
}

impl ServiceState {
    pub fn can_transition_to(self, next: ServiceState) -> bool {
        use ServiceState::*;
        matches!(
            (self, next),
            (Unknown | Stopped, Starting)
                | (Starting, Ready | Degraded)
                | (Unknown | Starting | Ready | Degraded, Stopping)
                | (Stopping, Stopped)
        )
    }
}

/// Result of starting one service.
#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub service: String,
    pub pid: u32,
    pub state: ServiceState,
    pub readiness: Readiness,
}

/// Result of a `start` (or the second half of a `restart`).
#[derive(Debug, Clone)]
pub struct StartSummary {
    pub outcomes: Vec<StartOutcome>,
    pub report: StatusReport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopResult {
    /// No PID record existed.
    NotRunning,
    /// The recorded process was running and is gone now.
    Stopped { pid: u32, forced: bool },
    /// The recorded process was already dead.
    StaleRecord { pid: u32 },
}

/// Result of stopping one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopOutcome {
    pub service: String,
    pub result: StopResult,
    /// Extra processes killed because they still held the service port.
    pub reclaimed: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct RestartSummary {
    pub stopped: Vec<StopOutcome>,
    pub started: StartSummary,
}

/// Composes reclaim, launch, PID tracking and readiness into the devsup commands.
pub struct Supervisor {
    descriptors: Vec<ServiceDescriptor>,
    logs: LogManager,
    store: Arc<dyn PidStore>,
    host: Host,
    timings: Timings,
    policy: PolicyConfig,
    states: HashMap<String, ServiceState>,
}

impl Supervisor {
    pub fn new(
        descriptors: Vec<ServiceDescriptor>,
        logs: LogManager,
        store: Arc<dyn PidStore>,
        host: Host,
        timings: Timings,
        policy: PolicyConfig,
    ) -> Self {
        Self {
            descriptors,
            logs,
            store,
            host,
            timings,
            policy,
            states: HashMap::new(),
        }
    }

    /// Builds a supervisor backed by PID files in the configured log directory.
    pub fn from_config(config: &Config, host: Host) -> Result<Self, SupervisorError> {
        let logs = LogManager::new(config.resolved_log_dir());
        let store: Arc<dyn PidStore> = Arc::new(PidFileStore::new(logs.clone()));
        Ok(Self::new(
            config.descriptors()?,
            logs,
            store,
            host,
            config.timing.resolve()?,
            config.policy,
        ))
    }

    pub fn descriptors(&self) -> &[ServiceDescriptor] {
        &self.descriptors
    }

    pub fn logs(&self) -> &LogManager {
        &self.logs
    }

    /// Current lifecycle state of `service` in this invocation.
    pub fn state(&self, service: &str) -> ServiceState {
        self.states
            .get(service)
            .copied()
            .unwrap_or(ServiceState::Unknown)
    }

    /// Starts every service in configured order, then waits for readiness.
    pub fn start(&mut self) -> Result<StartSummary, SupervisorError> {
        let _lock = self.acquire_lock()?;
        self.start_all()
    }

    /// Stops every service in reverse configured order.
    pub fn stop(&mut self, clean_logs: bool) -> Result<Vec<StopOutcome>, SupervisorError> {
        let _lock = self.acquire_lock()?;
        let stopped = self.stop_all()?;
        if clean_logs {
            for descriptor in &self.descriptors {
                self.logs.truncate(&descriptor.name)?;
            }
            info!("Cleared service logs in {}", self.logs.log_dir().display());
        }
        Ok(stopped)
    }

    /// Stops everything, waits for the settle delay, then starts everything again.
    pub fn restart(&mut self) -> Result<RestartSummary, SupervisorError> {
        let _lock = self.acquire_lock()?;
        let stopped = self.stop_all()?;
        if !self.timings.restart_delay.is_zero() {
            info!(
                "Waiting {:?} before starting services again",
                self.timings.restart_delay
            );
            thread::sleep(self.timings.restart_delay);
        }
        let started = self.start_all()?;
        Ok(RestartSummary { stopped, started })
    }

    /// Reports the current state without changing anything.
    pub fn status(&self, detailed: bool) -> StatusReport {
        StatusReporter::new(&self.host, self.store.clone()).report(&self.descriptors, detailed)
    }

    fn start_all(&mut self) -> Result<StartSummary, SupervisorError> {
        let descriptors = self.descriptors.clone();
        let reclaimer = PortReclaimer::new(
            &self.host,
            self.timings.reclaim_grace,
            self.timings.exit_poll_interval,
        );
        let launcher = ProcessLauncher::new(
            &self.host,
            self.logs.clone(),
            self.timings.early_exit_window,
            self.timings.exit_poll_interval,
        );

        let mut launched = Vec::with_capacity(descriptors.len());
        for (index, descriptor) in descriptors.iter().enumerate() {
            let name = descriptor.name.as_str();
            if self.needs_stop_before_start(descriptor)? {
                info!("'{name}' is already running; replacing it");
                self.stop_service(descriptor)?;
            }

            reclaimer.reclaim(descriptor.port, self.policy.reclaim)?;
            let record = launcher.launch(descriptor)?;
            self.store.save(&record)?;
            self.transition(name, ServiceState::Starting)?;
            launched.push(record.pid);

            let is_last = index + 1 == descriptors.len();
            if !is_last && !self.timings.stagger.is_zero() {
                debug!(
                    "Waiting {:?} before launching the next service",
                    self.timings.stagger
                );
                thread::sleep(self.timings.stagger);
            }
        }

        let probe = ReadinessProbe::new(&self.host);
        let mut outcomes = Vec::with_capacity(descriptors.len());
        for (descriptor, pid) in descriptors.iter().zip(launched) {
            let name = descriptor.name.as_str();
            let readiness = probe.wait_ready(descriptor, self.timings.readiness);
            let state = match &readiness {
                Readiness::Ready { .. } => ServiceState::Ready,
                Readiness::Timeout { attempts } => {
                    let timeout = SupervisorError::ReadinessTimeout {
                        service: name.to_string(),
                        attempts: *attempts,
                    };
                    if self.policy.readiness == ReadinessPolicy::FailFast {
                        self.transition(name, ServiceState::Degraded)?;
                        return Err(timeout);
                    }
                    warn!("{timeout}; leaving it running (check {})", descriptor.log_path.display());
                    ServiceState::Degraded
                }
            };
            self.transition(name, state)?;
            outcomes.push(StartOutcome {
                service: name.to_string(),
                pid,
                state,
                readiness,
            });
        }

        Ok(StartSummary {
            outcomes,
            report: self.status(false),
        })
    }

    fn stop_all(&mut self) -> Result<Vec<StopOutcome>, SupervisorError> {
        let descriptors = self.descriptors.clone();
        descriptors
            .iter()
            .rev()
            .map(|descriptor| self.stop_service(descriptor))
            .collect()
    }

    fn needs_stop_before_start(&self, descriptor: &ServiceDescriptor) -> Result<bool, SupervisorError> {
        if !self
            .state(&descriptor.name)
            .can_transition_to(ServiceState::Starting)
        {
            return Ok(true);
        }
        let recorded = match self.store.load_pid(&descriptor.name) {
            Ok(pid) => pid,
            Err(PidFileError::Parse { .. }) => None,
            Err(err) => return Err(err.into()),
        };
        Ok(recorded.is_some_and(|pid| self.host.processes.is_alive(pid)))
    }

    fn stop_service(&mut self, descriptor: &ServiceDescriptor) -> Result<StopOutcome, SupervisorError> {
        let name = descriptor.name.as_str();
        // A second stop in the same invocation re-checks the record and port.
        let already_stopped = self.state(name) == ServiceState::Stopped;
        if !already_stopped {
            self.transition(name, ServiceState::Stopping)?;
        }

        let record = match self.store.load(name) {
            Ok(record) => record,
            Err(err @ PidFileError::Parse { .. }) => {
                warn!("{err}; discarding it");
                None
            }
            Err(err) => return Err(err.into()),
        };

        let result = match record {
            None => {
                debug!("'{name}' has no PID record");
                StopResult::NotRunning
            }
            Some(record) if self.host.processes.is_alive(record.pid) => {
                let forced = self.terminate(name, record.pid)?;
                info!("Stopped '{name}' (PID {})", record.pid);
                StopResult::Stopped {
                    pid: record.pid,
                    forced,
                }
            }
            Some(record) => {
                let stale = SupervisorError::StaleProcessRecord {
                    service: name.to_string(),
                    pid: record.pid,
                };
                warn!("{stale}; treating it as stopped");
                StopResult::StaleRecord { pid: record.pid }
            }
        };

        // The record is cleared even when the port reclaim below fails.
        self.store.clear(name)?;

        let mut reclaimed = Vec::new();
        if self.host.ports.is_occupied(descriptor.port) {
            let reclaimer = PortReclaimer::new(
                &self.host,
                self.timings.reclaim_grace,
                self.timings.exit_poll_interval,
            );
            if let Reclaimed::Freed { pids } =
                reclaimer.reclaim(descriptor.port, ReclaimPolicy::KillOccupant)?
            {
                reclaimed = pids;
            }
        }

        if !already_stopped {
            self.transition(name, ServiceState::Stopped)?;
        }
        Ok(StopOutcome {
            service: name.to_string(),
            result,
            reclaimed,
        })
    }

    /// SIGTERM, wait for the grace window, then SIGKILL. Returns whether SIGKILL was needed.
    fn terminate(&self, service: &str, pid: u32) -> Result<bool, SupervisorError> {
        let processes = &self.host.processes;
        let stop_failed = |source: io::Error| SupervisorError::StopFailed {
            service: service.to_string(),
            source,
        };

        debug!("Sending SIGTERM to '{service}' (PID {pid})");
        processes.terminate(pid).map_err(stop_failed)?;
        let exited = RetryPolicy::within(self.timings.stop_grace, self.timings.exit_poll_interval)
            .poll(|_| !processes.is_alive(pid));
        if exited.is_satisfied() {
            return Ok(false);
        }

        warn!(
            "'{service}' (PID {pid}) still running {:?} after SIGTERM; sending SIGKILL",
            self.timings.stop_grace
        );
        processes.force_kill(pid).map_err(stop_failed)?;
        let killed = RetryPolicy::within(KILL_SETTLE, self.timings.exit_poll_interval)
            .poll(|_| !processes.is_alive(pid));
        if !killed.is_satisfied() {
            return Err(stop_failed(io::Error::other(format!(
                "PID {pid} survived SIGKILL"
            ))));
        }
        Ok(true)
    }

    fn transition(&mut self, service: &str, to: ServiceState) -> Result<(), SupervisorError> {
        let from = self.state(service);
        if !from.can_transition_to(to) {
            return Err(SupervisorError::InvalidTransition {
                service: service.to_string(),
                from,
                to,
            });
        }
        debug!("'{service}': {from} -> {to}");
        self.states.insert(service.to_string(), to);
        Ok(())
    }

    fn acquire_lock(&self) -> Result<File, SupervisorError> {
        self.logs.ensure_dir()?;
        let path = self.logs.lock_path();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(file),
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => {
                Err(SupervisorError::Busy { path })
            }
            Err(err) => Err(err.into()),
        }
    }
}
