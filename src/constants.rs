//! Constants and default values for devsup.
//!
//! Timing defaults mirror the behaviour operators of the stack are used to:
//! a two second reclaim grace window, thirty readiness probes two seconds
//! apart, and three second pauses between staggered launches and restarts.

use std::time::Duration;

// ============================================================================
// File System Constants
// ============================================================================

/// Default configuration file looked up in the current directory.
pub const DEFAULT_CONFIG_FILE: &str = "devsup.yaml";

/// Default directory (relative to the project root) for logs and PID files.
pub const DEFAULT_LOG_DIR: &str = "logs";

/// Extension of per-service PID files.
pub const PID_FILE_EXTENSION: &str = "pid";

/// Extension of per-service log files.
pub const LOG_FILE_EXTENSION: &str = "log";

/// Name of the advisory lock file held by mutating commands.
pub const LOCK_FILE_NAME: &str = "devsup.lock";

/// Environment variable overriding the log directory.
pub const LOG_DIR_ENV: &str = "DEVSUP_LOG_DIR";

// ============================================================================
// Service Defaults
// ============================================================================

/// Name of the backend API service.
pub const BACKEND_SERVICE: &str = "backend";

/// Name of the frontend dev-server service.
pub const FRONTEND_SERVICE: &str = "frontend";

/// Default backend port.
pub const DEFAULT_BACKEND_PORT: u16 = 8000;

/// Default frontend port.
pub const DEFAULT_FRONTEND_PORT: u16 = 3010;

/// Environment variable overriding the backend port.
pub const BACKEND_PORT_ENV: &str = "BACKEND_PORT";

/// Environment variable overriding the frontend port.
pub const FRONTEND_PORT_ENV: &str = "FRONTEND_PORT";

/// Environment variable overriding the readiness policy (`best_effort` or `fail_fast`).
pub const READINESS_POLICY_ENV: &str = "DEVSUP_READINESS_POLICY";

/// Environment variable overriding the reclaim policy (`kill_occupant` or `refuse`).
pub const RECLAIM_POLICY_ENV: &str = "DEVSUP_RECLAIM_POLICY";

/// Placeholder substituted with the service port in command arguments.
pub const PORT_PLACEHOLDER: &str = "{port}";

/// Host used for readiness and status HTTP checks.
pub const PROBE_HOST: &str = "127.0.0.1";

/// Maximum number of services a single configuration may declare.
pub const MAX_SERVICES: usize = 2;

// ============================================================================
// Process Management Timing
// ============================================================================

/// Time a port occupant is given to exit after SIGTERM.
pub const RECLAIM_GRACE: Duration = Duration::from_secs(2);

/// Time a stopped service is given to exit after SIGTERM before SIGKILL.
pub const STOP_GRACE: Duration = Duration::from_secs(2);

/// Interval between liveness and port re-checks while waiting for an exit.
pub const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Time waited after SIGKILL for the kernel to tear a process down.
pub const KILL_SETTLE: Duration = Duration::from_millis(500);

/// Number of readiness probes before a service is considered degraded.
pub const READINESS_ATTEMPTS: u32 = 30;

/// Interval between readiness probes.
pub const READINESS_INTERVAL: Duration = Duration::from_secs(2);

/// Per-request timeout for readiness and status HTTP checks.
pub const HTTP_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Delay between launching one service and the next.
pub const LAUNCH_STAGGER: Duration = Duration::from_secs(3);

/// Delay between the stop and start halves of a restart.
pub const RESTART_SETTLE: Duration = Duration::from_secs(3);

/// Window during which a freshly spawned child exiting counts as a failed spawn.
pub const EARLY_EXIT_WINDOW: Duration = Duration::from_secs(1);

// ============================================================================
// Logging and Output Constants
// ============================================================================

/// Number of log lines quoted when a launch fails.
pub const FAILURE_LOG_LINES: usize = 10;

/// Exit code used when the operator interrupts a command.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;
