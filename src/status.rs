//! Status reporting for managed services.
use std::{collections::HashMap, fmt::Write as _, sync::Arc, thread};

use chrono::{DateTime, Utc};
use serde::Serialize;
use strum_macros::Display;
use sysinfo::{Disks, Pid, ProcessesToUpdate, System};
use tracing::{debug, warn};

use crate::{
    config::ServiceDescriptor,
    error::PidFileError,
    host::{Host, PortInspector, ProcessHandle},
    pid::PidStore,
    readiness::ReadinessProbe,
};

const GREEN_BOLD: &str = "\x1b[1;32m"; // Bright Green
const RED_BOLD: &str = "\x1b[1;31m"; // Bright Red
const MAGENTA_BOLD: &str = "\x1b[1;35m"; // Magenta
const YELLOW_BOLD: &str = "\x1b[1;33m"; // Yellow/Gold
const RESET: &str = "\x1b[0m"; // Reset color

/// Point-in-time view of one service. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub port: u16,
    pub pid: Option<u32>,
    pub pid_found: bool,
    pub pid_alive: bool,
    pub port_occupied: bool,
    pub port_owner_pid: Option<u32>,
    pub http_responsive: bool,
    /// The port is held by a process outside the recorded pid's process group.
    pub drift: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<UptimeInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ProcessUsage>,
}

/// Captures how long a process has been active.
#[derive(Debug, Clone, Serialize)]
pub struct UptimeInfo {
    pub seconds: u64,
    pub human: String,
    pub started_at: DateTime<Utc>,
}

/// CPU and memory usage of a single process.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProcessUsage {
    pub cpu_percent: f32,
    pub memory_bytes: u64,
}

/// Whole-machine resource usage shown by `status --detailed`.
#[derive(Debug, Clone, Serialize)]
pub struct HostMetrics {
    pub cpu_percent: f32,
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    pub disks: Vec<DiskUsage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskUsage {
    pub mount_point: String,
    pub total_bytes: u64,
    pub available_bytes: u64,
}

/// What the operator should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Recommendation {
    /// Nothing is running.
    Start,
    /// Everything is running.
    RestartOrStop,
    /// Some services run and some do not.
    Inconsistent,
}

impl Recommendation {
    pub fn from_counts(live: usize, total: usize) -> Self {
        match live {
            0 => Recommendation::Start,
            n if n == total => Recommendation::RestartOrStop,
            _ => Recommendation::Inconsistent,
        }
    }
}

/// Aggregated status of every managed service.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub captured_at: DateTime<Utc>,
    pub services: Vec<ServiceStatus>,
    pub live_services: usize,
    pub recommendation: Recommendation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<HostMetrics>,
}

impl StatusReport {
    pub fn new(services: Vec<ServiceStatus>, host: Option<HostMetrics>) -> Self {
        let live_services = services.iter().filter(|s| s.pid_alive).count();
        let recommendation = Recommendation::from_counts(live_services, services.len());
        Self {
            captured_at: Utc::now(),
            services,
            live_services,
            recommendation,
            host,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Human-readable rendering; ANSI colors only when `color` is set.
    pub fn render(&self, color: bool) -> String {
        let paint = |code: &'static str| if color { code } else { "" };
        let reset = paint(RESET);
        let mut out = String::new();

        let _ = writeln!(out, "Service statuses:");
        for service in &self.services {
            let (code, label) = service_label(service);
            let code = paint(code);
            let _ = writeln!(out, "{code}● {} - {label}{reset}", service.name);

            match (service.pid, service.pid_found) {
                (Some(pid), _) => {
                    let state = if service.pid_alive { "alive" } else { "not running" };
                    let _ = writeln!(out, "     PID: {pid} ({state})");
                }
                (None, true) => {
                    let _ = writeln!(out, "     PID: unreadable PID file");
                }
                (None, false) => {
                    let _ = writeln!(out, "     PID: no record");
                }
            }

            let port_line = match (service.port_occupied, service.port_owner_pid) {
                (true, Some(owner)) => format!("in use by PID {owner}"),
                (true, None) => "in use".to_string(),
                (false, _) => "free".to_string(),
            };
            let _ = writeln!(out, "    Port: {} ({port_line})", service.port);
            if service.drift {
                let _ = writeln!(
                    out,
                    "          {}port owner differs from the recorded PID{reset}",
                    paint(YELLOW_BOLD)
                );
            }

            let http = if service.http_responsive {
                "responding"
            } else {
                "not responding"
            };
            let _ = writeln!(out, "    HTTP: {http}");

            if let Some(uptime) = &service.uptime {
                let _ = writeln!(
                    out,
                    "  Uptime: {}; since {}",
                    uptime.human,
                    uptime.started_at.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
            if let Some(usage) = &service.resources {
                let _ = writeln!(
                    out,
                    "     {}CPU: {:.1}%{reset}",
                    paint(MAGENTA_BOLD),
                    usage.cpu_percent
                );
                let _ = writeln!(
                    out,
                    "  {}Memory: {}{reset}",
                    paint(MAGENTA_BOLD),
                    format_bytes(usage.memory_bytes)
                );
            }
        }

        if let Some(host) = &self.host {
            let _ = writeln!(out);
            let _ = writeln!(out, "Host:");
            let _ = writeln!(out, "     CPU: {:.1}%", host.cpu_percent);
            let _ = writeln!(
                out,
                "  Memory: {} / {}",
                format_bytes(host.memory_used_bytes),
                format_bytes(host.memory_total_bytes)
            );
            for disk in &host.disks {
                let _ = writeln!(
                    out,
                    "    Disk: {} {} free of {}",
                    disk.mount_point,
                    format_bytes(disk.available_bytes),
                    format_bytes(disk.total_bytes)
                );
            }
        }

        let _ = writeln!(out);
        let total = self.services.len();
        let advice = match self.recommendation {
            Recommendation::Start => format!(
                "{}No services are running.{reset} Run `devsup start` to launch them.",
                paint(RED_BOLD)
            ),
            Recommendation::RestartOrStop => format!(
                "{}All {total} services are running.{reset} Use `devsup restart` to restart or `devsup stop` to stop them.",
                paint(GREEN_BOLD)
            ),
            Recommendation::Inconsistent => format!(
                "{}Inconsistent state: {} of {total} services running.{reset} Run `devsup restart` to recover.",
                paint(YELLOW_BOLD),
                self.live_services
            ),
        };
        let _ = writeln!(out, "{advice}");
        out
    }
}

fn service_label(service: &ServiceStatus) -> (&'static str, &'static str) {
    match (service.pid_alive, service.http_responsive) {
        (true, true) => (GREEN_BOLD, "Running"),
        (true, false) => (YELLOW_BOLD, "Running (not responding)"),
        (false, _) if service.pid_found => (RED_BOLD, "Stopped (stale PID file)"),
        (false, _) if service.port_occupied => (YELLOW_BOLD, "Not managed (port in use)"),
        (false, _) => (RED_BOLD, "Stopped"),
    }
}

/// Builds [`StatusReport`]s from the PID store and live host checks. Never mutates state.
pub struct StatusReporter {
    store: Arc<dyn PidStore>,
    processes: Arc<dyn ProcessHandle>,
    ports: Arc<dyn PortInspector>,
    probe: ReadinessProbe,
}

impl StatusReporter {
    pub fn new(host: &Host, store: Arc<dyn PidStore>) -> Self {
        Self {
            store,
            processes: host.processes.clone(),
            ports: host.ports.clone(),
            probe: ReadinessProbe::new(host),
        }
    }

    pub fn report(&self, descriptors: &[ServiceDescriptor], detailed: bool) -> StatusReport {
        let mut services: Vec<ServiceStatus> =
            descriptors.iter().map(|d| self.inspect(d)).collect();

        let host = if detailed {
            let live: Vec<u32> = services
                .iter()
                .filter(|s| s.pid_alive)
                .filter_map(|s| s.pid)
                .collect();
            let usage = process_usage(&live);
            for service in &mut services {
                service.resources = service.pid.and_then(|pid| usage.get(&pid).copied());
            }
            Some(collect_host_metrics())
        } else {
            None
        };

        StatusReport::new(services, host)
    }

    /// Status of a single service.
    pub fn inspect(&self, descriptor: &ServiceDescriptor) -> ServiceStatus {
        let name = descriptor.name.as_str();
        let (record, pid_found) = match self.store.load(name) {
            Ok(Some(record)) => (Some(record), true),
            Ok(None) => (None, false),
            Err(err @ PidFileError::Parse { .. }) => {
                warn!("{err}");
                (None, true)
            }
            Err(err) => {
                warn!("{err}");
                (None, false)
            }
        };

        let pid = record.as_ref().map(|r| r.pid);
        let pid_alive = pid.is_some_and(|pid| self.processes.is_alive(pid));
        let port_occupied = self.ports.is_occupied(descriptor.port);
        let port_owner_pid = if port_occupied {
            self.ports.listeners(descriptor.port).first().copied()
        } else {
            None
        };
        let drift = match (pid, port_owner_pid) {
            (Some(pid), Some(owner)) => !self.processes.is_in_group(owner, pid),
            _ => false,
        };
        let http_responsive = self.probe.is_responsive(descriptor);

        let uptime = record
            .filter(|_| pid_alive)
            .map(|record| uptime_since(record.started_at));

        debug!(
            "'{name}': pid={pid:?} alive={pid_alive} port_occupied={port_occupied} owner={port_owner_pid:?} http={http_responsive}"
        );

        ServiceStatus {
            name: name.to_string(),
            port: descriptor.port,
            pid,
            pid_found,
            pid_alive,
            port_occupied,
            port_owner_pid,
            http_responsive,
            drift,
            uptime,
            resources: None,
        }
    }
}

fn uptime_since(started_at: DateTime<Utc>) -> UptimeInfo {
    let seconds = Utc::now()
        .signed_duration_since(started_at)
        .to_std()
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    UptimeInfo {
        seconds,
        human: format_elapsed(seconds),
        started_at,
    }
}

fn format_elapsed(total_seconds: u64) -> String {
    match total_seconds {
        0..=59 => format!("{total_seconds} secs"),
        60..=3_599 => format!("{} mins", total_seconds / 60),
        3_600..=86_399 => format!("{} hours", total_seconds / 3_600),
        _ => format!("{} days", total_seconds / 86_400),
    }
}

fn format_bytes(bytes: u64) -> String {
    const MIB: f64 = 1024.0 * 1024.0;
    const GIB: f64 = MIB * 1024.0;
    let bytes = bytes as f64;
    if bytes >= GIB {
        format!("{:.1}G", bytes / GIB)
    } else {
        format!("{:.1}M", bytes / MIB)
    }
}

fn process_usage(pids: &[u32]) -> HashMap<u32, ProcessUsage> {
    if pids.is_empty() {
        return HashMap::new();
    }

    let targets: Vec<Pid> = pids.iter().map(|pid| Pid::from_u32(*pid)).collect();
    let mut system = System::new();
    // CPU usage is a delta between two refreshes.
    system.refresh_processes(ProcessesToUpdate::Some(&targets), true);
    thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    system.refresh_processes(ProcessesToUpdate::Some(&targets), true);

    pids.iter()
        .filter_map(|pid| {
            let process = system.process(Pid::from_u32(*pid))?;
            Some((
                *pid,
                ProcessUsage {
                    cpu_percent: process.cpu_usage(),
                    memory_bytes: process.memory(),
                },
            ))
        })
        .collect()
}

fn collect_host_metrics() -> HostMetrics {
    let mut system = System::new();
    system.refresh_cpu_usage();
    thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    system.refresh_cpu_usage();
    system.refresh_memory();

    let disks = Disks::new_with_refreshed_list()
        .list()
        .iter()
        .map(|disk| DiskUsage {
            mount_point: disk.mount_point().display().to_string(),
            total_bytes: disk.total_space(),
            available_bytes: disk.available_space(),
        })
        .collect();

    HostMetrics {
        cpu_percent: system.global_cpu_usage(),
        memory_total_bytes: system.total_memory(),
        memory_used_bytes: system.used_memory(),
        disks,
    }
}
