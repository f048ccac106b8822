//! devsup supervises a small local development stack: a backend API and a frontend dev
//! server. It frees their ports, launches them as detached background processes, tracks
//! their PIDs across invocations, waits for them to answer HTTP and reports their status.

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Constants and defaults.
pub mod constants;

/// Error handling.
pub mod error;

/// Host capabilities: processes, ports, helper commands and HTTP.
pub mod host;

/// Service launching.
pub mod launch;

/// Logs management.
pub mod logs;

/// PID persistence.
pub mod pid;

/// Readiness probing.
pub mod readiness;

/// Port reclaiming.
pub mod reclaim;

/// Bounded polling.
pub mod retry;

/// Status reporting.
pub mod status;

/// Start, stop and restart orchestration.
pub mod supervisor;

#[doc(hidden)]
pub mod test_utils;
