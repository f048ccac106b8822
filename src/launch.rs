//! Starting managed services as detached background processes.
use std::{sync::Arc, time::Duration};

use tracing::{debug, error, info};

use crate::{
    config::{CommandSpec, Preflight, ServiceDescriptor},
    constants::FAILURE_LOG_LINES,
    error::SupervisorError,
    host::{CommandRunner, Host, ProcessHandle},
    logs::LogManager,
    pid::ProcessRecord,
    retry::RetryPolicy,
};

/// Runs dependency checks, spawns services and watches for immediate crashes.
pub struct ProcessLauncher {
    processes: Arc<dyn ProcessHandle>,
    commands: Arc<dyn CommandRunner>,
    logs: LogManager,
    early_exit_window: Duration,
    poll_interval: Duration,
}

impl ProcessLauncher {
    pub fn new(
        host: &Host,
        logs: LogManager,
        early_exit_window: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            processes: host.processes.clone(),
            commands: host.commands.clone(),
            logs,
            early_exit_window,
            poll_interval,
        }
    }

    /// Spawns the service and returns its record without waiting for readiness.
    ///
    /// The child runs in its own session with stdin from `/dev/null` and both output streams
    /// appended to the service log. A child that dies within the early-exit window is reported
    /// as [`SupervisorError::SpawnFailed`] with the tail of its log.
    pub fn launch(&self, descriptor: &ServiceDescriptor) -> Result<ProcessRecord, SupervisorError> {
        self.preflight(descriptor)?;

        let service = descriptor.name.as_str();
        let log = self.logs.open_append(service)?;
        debug!(
            "Launching '{service}': {} (cwd {})",
            descriptor.start_command.display(),
            descriptor.start_command.cwd.display()
        );

        let pid = self
            .processes
            .start(service, &descriptor.start_command, log)
            .map_err(|err| {
                error!("Failed to spawn '{service}': {err}");
                SupervisorError::SpawnFailed {
                    service: service.to_string(),
                    reason: format!(
                        "could not execute '{}': {err}",
                        descriptor.start_command.program
                    ),
                }
            })?;

        let exited = RetryPolicy::within(self.early_exit_window, self.poll_interval)
            .poll(|_| !self.processes.is_alive(pid));
        if exited.is_satisfied() {
            error!("Service '{service}' (PID {pid}) exited immediately after launch");
            return Err(SupervisorError::SpawnFailed {
                service: service.to_string(),
                reason: self.early_exit_reason(descriptor, pid),
            });
        }

        info!(
            "Started '{service}' with PID {pid} (logs: {})",
            descriptor.log_path.display()
        );
        Ok(ProcessRecord::new(service, pid))
    }

    /// Verifies the runtime and dependencies a service needs before it is spawned.
    pub fn preflight(&self, descriptor: &ServiceDescriptor) -> Result<(), SupervisorError> {
        let Some(preflight) = &descriptor.preflight else {
            return Ok(());
        };
        let service = descriptor.name.as_str();
        let cwd = &descriptor.start_command.cwd;
        let missing = |detail: String| SupervisorError::DependencyMissing {
            service: service.to_string(),
            detail,
        };

        match preflight {
            Preflight::PythonModule {
                interpreter,
                module,
            } => {
                if self.commands.locate(interpreter).is_none() {
                    return Err(missing(format!("'{interpreter}' was not found on PATH")));
                }
                let probe = CommandSpec {
                    program: interpreter.clone(),
                    args: vec!["-c".to_string(), format!("import {module}")],
                    cwd: cwd.clone(),
                    env: descriptor.start_command.env.clone(),
                };
                let log = self.logs.open_append(service)?;
                match self.commands.run(&probe, Some(log)) {
                    Ok(true) => {
                        debug!("'{service}': {interpreter} can import {module}");
                        Ok(())
                    }
                    Ok(false) => Err(missing(format!(
                        "Python module '{module}' cannot be imported by {interpreter}; install the service requirements"
                    ))),
                    Err(err) => Err(missing(format!("could not run {interpreter}: {err}"))),
                }
            }
            Preflight::PackageManager {
                program,
                deps_dir,
                install,
            } => {
                if self.commands.locate(program).is_none() {
                    return Err(missing(format!("'{program}' was not found on PATH")));
                }

                let deps_path = cwd.join(deps_dir);
                if deps_path.exists() {
                    return Ok(());
                }

                let mut install_cmd = CommandSpec::from_argv(install, cwd).ok_or_else(|| {
                    missing(format!(
                        "{} is missing and no install command is configured",
                        deps_path.display()
                    ))
                })?;
                install_cmd.env = descriptor.start_command.env.clone();

                info!(
                    "Installing dependencies for '{service}' ({})",
                    install_cmd.display()
                );
                let log = self.logs.open_append(service)?;
                match self.commands.run(&install_cmd, Some(log)) {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(missing(format!(
                        "'{}' failed; see {}",
                        install_cmd.display(),
                        descriptor.log_path.display()
                    ))),
                    Err(err) => Err(missing(format!(
                        "could not run '{}': {err}",
                        install_cmd.display()
                    ))),
                }
            }
        }
    }

    fn early_exit_reason(&self, descriptor: &ServiceDescriptor, pid: u32) -> String {
        let service = descriptor.name.as_str();
        let mut reason = format!(
            "process {pid} exited within {:?} of starting",
            self.early_exit_window
        );
        if self.logs.indicates_port_conflict(service) {
            reason.push_str(&format!(
                " because port {} is already in use (another process bound it first)",
                descriptor.port
            ));
        }
        let tail = self.logs.tail(service, FAILURE_LOG_LINES).unwrap_or_default();
        if !tail.is_empty() {
            reason.push_str(&format!(
                "; last {} line(s) of {}:\n{}",
                tail.len(),
                self.logs.log_path_for(service).display(),
                tail.join("\n")
            ));
        }
        reason
    }
}
