//! Freeing a TCP port held by a stale or unrelated process before a service starts.
use std::{sync::Arc, time::Duration};

use serde::Deserialize;
use strum_macros::{Display, EnumString};
use tracing::{debug, info, warn};

use crate::{
    constants::KILL_SETTLE,
    error::SupervisorError,
    host::{Host, PortInspector, ProcessHandle},
    retry::RetryPolicy,
};

/// What to do when a service's port is already taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReclaimPolicy {
    /// Terminate whatever listens on the port, escalating to SIGKILL.
    #[default]
    KillOccupant,
    /// Leave the occupant alone and fail with `PortBusy`.
    Refuse,
}

/// Outcome of a successful reclaim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reclaimed {
    /// Nothing was listening.
    AlreadyFree,
    /// These processes were signalled and the port is now free.
    Freed { pids: Vec<u32> },
}

pub struct PortReclaimer {
    processes: Arc<dyn ProcessHandle>,
    ports: Arc<dyn PortInspector>,
    grace: Duration,
    poll_interval: Duration,
}

impl PortReclaimer {
    pub fn new(host: &Host, grace: Duration, poll_interval: Duration) -> Self {
        Self {
            processes: host.processes.clone(),
            ports: host.ports.clone(),
            grace,
            poll_interval,
        }
    }

    /// Makes sure nothing listens on `port`.
    ///
    /// Under [`ReclaimPolicy::KillOccupant`] every listener gets SIGTERM, then SIGKILL if the
    /// port is still held once the grace window has passed. This can kill processes devsup
    /// never started.
    pub fn reclaim(&self, port: u16, policy: ReclaimPolicy) -> Result<Reclaimed, SupervisorError> {
        if !self.ports.is_occupied(port) {
            debug!("Port {port} is free");
            return Ok(Reclaimed::AlreadyFree);
        }

        let own_pid = std::process::id();
        let pids: Vec<u32> = self
            .ports
            .listeners(port)
            .into_iter()
            .filter(|pid| *pid != own_pid)
            .collect();

        if policy == ReclaimPolicy::Refuse || pids.is_empty() {
            return Err(SupervisorError::PortBusy { port, pids });
        }

        warn!(
            "Port {port} is held by PID(s) {}; terminating to reclaim it",
            join_pids(&pids)
        );
        for pid in &pids {
            if let Err(err) = self.processes.terminate(*pid) {
                warn!("Failed to send SIGTERM to PID {pid}: {err}");
            }
        }

        let released = RetryPolicy::within(self.grace, self.poll_interval)
            .poll(|_| !self.ports.is_occupied(port));
        if released.is_satisfied() {
            info!("Port {port} reclaimed");
            return Ok(Reclaimed::Freed { pids });
        }

        let survivors: Vec<u32> = self
            .ports
            .listeners(port)
            .into_iter()
            .filter(|pid| *pid != own_pid)
            .collect();
        warn!(
            "Port {port} still held after {:?}; sending SIGKILL to {}",
            self.grace,
            join_pids(&survivors)
        );
        for pid in &survivors {
            if let Err(err) = self.processes.force_kill(*pid) {
                warn!("Failed to send SIGKILL to PID {pid}: {err}");
            }
        }

        let settle = RetryPolicy::within(KILL_SETTLE, self.poll_interval);
        if settle.poll(|_| !self.ports.is_occupied(port)).is_satisfied() {
            info!("Port {port} reclaimed after SIGKILL");
            return Ok(Reclaimed::Freed { pids });
        }

        Err(SupervisorError::PortBusy {
            port,
            pids: self.ports.listeners(port),
        })
    }
}

fn join_pids(pids: &[u32]) -> String {
    pids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
