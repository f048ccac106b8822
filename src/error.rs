//! Error handling for devsup.
use std::path::PathBuf;

use thiserror::Error;

use crate::supervisor::ServiceState;

/// Defines every failure a supervisor command can run into.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Error loading or validating the configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Error reading, writing or parsing a PID file.
    #[error("PID file error: {0}")]
    PidFile(#[from] PidFileError),

    /// A port is still held after reclaim was attempted (or refused).
    #[error("Port {port} is still in use (held by {}); refusing to start a conflicting service", format_pids(.pids))]
    PortBusy {
        /// The contested port.
        port: u16,
        /// Process ids observed listening on the port, if known.
        pids: Vec<u32>,
    },

    /// A required runtime, package manager or library is not available.
    #[error("Service '{service}' is missing a required dependency: {detail}")]
    DependencyMissing {
        /// The service whose preflight failed.
        service: String,
        /// Human-readable description of what is missing.
        detail: String,
    },

    /// The service process could not be started or exited right after spawning.
    #[error("Failed to start service '{service}': {reason}")]
    SpawnFailed {
        /// The service that failed to start.
        service: String,
        /// Why the spawn is considered failed.
        reason: String,
    },

    /// The service never answered its readiness endpoint.
    #[error("Service '{service}' did not become ready after {attempts} attempts")]
    ReadinessTimeout {
        /// The service that timed out.
        service: String,
        /// Number of probe attempts made.
        attempts: u32,
    },

    /// A PID file names a process that is no longer alive.
    #[error("Service '{service}' has a stale PID record ({pid} is not running)")]
    StaleProcessRecord {
        /// The service with the stale record.
        service: String,
        /// The recorded, dead pid.
        pid: u32,
    },

    /// Error signalling a service process.
    #[error("Failed to stop service '{service}': {source}")]
    StopFailed {
        /// The service that failed to stop.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Another mutating command already holds the supervisor lock.
    #[error("Another devsup command is already running (lock held on {})", .path.display())]
    Busy {
        /// Path of the contested lock file.
        path: PathBuf,
    },

    /// The orchestrator attempted a lifecycle transition that is not allowed.
    #[error("Service '{service}' cannot move from {from} to {to}")]
    InvalidTransition {
        /// The service whose state was being changed.
        service: String,
        /// Current state.
        from: ServiceState,
        /// Requested state.
        to: ServiceState,
    },

    /// Generic I/O failure (log directory, lock file, ...).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    /// Whether the error must abort the current command with exit code 1.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SupervisorError::ReadinessTimeout { .. }
                | SupervisorError::StaleProcessRecord { .. }
        )
    }
}

fn format_pids(pids: &[u32]) -> String {
    if pids.is_empty() {
        return "an unknown process".to_string();
    }
    let list: Vec<String> = pids.iter().map(|pid| format!("PID {pid}")).collect();
    list.join(", ")
}

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading a configuration or env file.
    #[error("Failed to read config file {}: {source}", .path.display())]
    Read {
        /// File that could not be read.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A `${VAR}` reference has no value and no default.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// A port override from the environment is not a valid port.
    #[error("Invalid port '{value}' in {variable}")]
    InvalidPort {
        /// The environment variable that was read.
        variable: String,
        /// The rejected value.
        value: String,
    },

    /// A duration string could not be parsed.
    #[error("Invalid duration value: '{0}'")]
    InvalidDuration(String),

    /// The configuration is well-formed but semantically invalid.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Error type for PID file operations.
#[derive(Debug, Error)]
pub enum PidFileError {
    /// Error reading or writing a PID file.
    #[error("Failed to access PID file {}: {source}", .path.display())]
    Io {
        /// The PID file.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The PID file does not contain a decimal process id.
    #[error("Failed to parse PID file {}: {contents:?}", .path.display())]
    Parse {
        /// The PID file.
        path: PathBuf,
        /// The raw (trimmed) contents.
        contents: String,
    },
}
