//! Capabilities the supervisor needs from the host, and their OS-backed implementations.
//!
//! Every interaction with real processes, TCP ports, helper commands and HTTP endpoints goes
//! through one of the traits below so orchestration logic can run against a fake host.
use std::{
    collections::HashMap,
    env,
    fs::File,
    io,
    net::{Ipv4Addr, Ipv6Addr, TcpListener},
    os::unix::{fs::PermissionsExt, process::CommandExt},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::{Arc, Mutex, MutexGuard},
};

use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::{Pid, getpgid},
};
use reqwest::blocking::Client;
use tracing::{debug, trace, warn};

use crate::{config::CommandSpec, constants::HTTP_CHECK_TIMEOUT};

/// Spawning and signalling of OS processes.
pub trait ProcessHandle: Send + Sync {
    /// Starts `command` in its own session with stdout and stderr sent to `log`.
    fn start(&self, service: &str, command: &CommandSpec, log: File) -> io::Result<u32>;

    /// Whether `pid` names a live (non-zombie) process.
    fn is_alive(&self, pid: u32) -> bool;

    /// Asks the process (and the process group it leads) to exit with SIGTERM.
    fn terminate(&self, pid: u32) -> io::Result<()>;

    /// Kills the process (and the process group it leads) with SIGKILL.
    fn force_kill(&self, pid: u32) -> io::Result<()>;

    /// Whether `pid` is `leader` itself or belongs to the process group `leader` leads.
    fn is_in_group(&self, pid: u32, leader: u32) -> bool {
        pid == leader
    }
}

/// Discovery of which processes hold a TCP port.
pub trait PortInspector: Send + Sync {
    /// Pids of processes listening on `port`. May be empty even when the port is taken.
    fn listeners(&self, port: u16) -> Vec<u32>;

    /// Whether anything is listening on `port`.
    fn is_occupied(&self, port: u16) -> bool;
}

/// Synchronous helper commands (dependency checks, installs).
pub trait CommandRunner: Send + Sync {
    /// Resolves `program` against `PATH`.
    fn locate(&self, program: &str) -> Option<PathBuf>;

    /// Runs `command` to completion, optionally appending its output to `log`.
    fn run(&self, command: &CommandSpec, log: Option<File>) -> io::Result<bool>;
}

/// Lightweight HTTP reachability checks.
pub trait HttpCheck: Send + Sync {
    /// Whether a GET on `url` produced a successful (2xx/3xx) response.
    fn responds(&self, url: &str) -> bool;
}

/// The full set of capabilities handed to the supervisor.
#[derive(Clone)]
pub struct Host {
    pub processes: Arc<dyn ProcessHandle>,
    pub ports: Arc<dyn PortInspector>,
    pub commands: Arc<dyn CommandRunner>,
    pub http: Arc<dyn HttpCheck>,
}

impl Host {
    /// Capabilities backed by the real operating system.
    pub fn os() -> io::Result<Self> {
        let os = Arc::new(OsHost::new());
        let http = ReqwestHttpCheck::new().map_err(io::Error::other)?;
        Ok(Self {
            processes: os.clone(),
            ports: os.clone(),
            commands: os,
            http: Arc::new(http),
        })
    }
}

/// Unix implementation of the process, port and command capabilities.
#[derive(Debug, Default)]
pub struct OsHost {
    /// Children spawned by this invocation, kept so exits can be reaped.
    children: Mutex<HashMap<u32, Child>>,
}

impl OsHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn children(&self) -> MutexGuard<'_, HashMap<u32, Child>> {
        self.children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn signal_tree(&self, pid: u32, sig: Signal) -> io::Result<()> {
        let Some(target) = os_pid(pid) else {
            debug!("PID {pid} is out of range; nothing to signal");
            return Ok(());
        };

        // Managed services lead their own session and process group; signal the whole group so
        // dev servers that fork workers go down together. Foreign processes get a direct signal.
        if let Ok(group) = getpgid(Some(target))
            && group == target
            && getpgid(None).is_ok_and(|own| own != group)
        {
            match signal::killpg(group, sig) {
                Ok(()) => debug!("Sent {sig} to process group {group}"),
                Err(Errno::ESRCH) => {}
                Err(Errno::EPERM) => warn!(
                    "Insufficient permissions to signal process group {group}; falling back to direct signal"
                ),
                Err(err) => return Err(io::Error::from_raw_os_error(err as i32)),
            }
        }

        match signal::kill(target, sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(io::Error::from_raw_os_error(err as i32)),
        }
    }
}

impl ProcessHandle for OsHost {
    fn start(&self, service: &str, command: &CommandSpec, log: File) -> io::Result<u32> {
        let stderr = log.try_clone()?;

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(&command.cwd)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr));

        unsafe {
            cmd.pre_exec(|| {
                // A new session keeps the service alive after devsup exits and out of reach of
                // terminal signals aimed at devsup itself.
                if libc::setsid() < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        debug!("Executing command for '{service}': {cmd:?}");
        let child = cmd.spawn()?;
        let pid = child.id();
        self.children().insert(pid, child);
        Ok(pid)
    }

    fn is_alive(&self, pid: u32) -> bool {
        {
            let mut children = self.children();
            if let Some(child) = children.get_mut(&pid) {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        debug!("Child {pid} exited with {status}");
                        children.remove(&pid);
                        return false;
                    }
                    Ok(None) => return true,
                    Err(err) => trace!("try_wait on {pid} failed: {err}"),
                }
            }
        }

        let Some(target) = os_pid(pid) else {
            return false;
        };
        match signal::kill(target, None) {
            Ok(()) => !is_zombie(pid),
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        self.signal_tree(pid, Signal::SIGTERM)
    }

    fn force_kill(&self, pid: u32) -> io::Result<()> {
        self.signal_tree(pid, Signal::SIGKILL)
    }

    fn is_in_group(&self, pid: u32, leader: u32) -> bool {
        if pid == leader {
            return true;
        }
        let (Some(pid), Some(leader)) = (os_pid(pid), os_pid(leader)) else {
            return false;
        };
        getpgid(Some(pid)).is_ok_and(|group| group == leader)
    }
}

/// Converts a recorded pid for the signal APIs. Values that would be read as `0` or negative
/// (a process group or every process) are rejected.
fn os_pid(pid: u32) -> Option<Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .map(Pid::from_raw)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let state_part = stat.get(stat.rfind(')')? + 1..)?;
            state_part.trim_start().chars().next()
        })
        .is_some_and(|state| matches!(state, 'Z' | 'X'))
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

impl PortInspector for OsHost {
    fn listeners(&self, port: u16) -> Vec<u32> {
        match lsof_listeners(port) {
            Ok(pids) => pids,
            Err(err) => {
                trace!("lsof unavailable ({err}); scanning /proc for port {port}");
                proc_listeners(port)
            }
        }
    }

    fn is_occupied(&self, port: u16) -> bool {
        if !self.listeners(port).is_empty() {
            return true;
        }

        let v4_taken = matches!(
            TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)),
            Err(ref err) if err.kind() == io::ErrorKind::AddrInUse
        );
        let v6_taken = matches!(
            TcpListener::bind((Ipv6Addr::LOCALHOST, port)),
            Err(ref err) if err.kind() == io::ErrorKind::AddrInUse
        );
        v4_taken || v6_taken
    }
}

fn lsof_listeners(port: u16) -> io::Result<Vec<u32>> {
    let filter = format!("-iTCP:{port}");
    let output = Command::new("lsof")
        .args(["-nP", filter.as_str(), "-sTCP:LISTEN", "-t"])
        .stdin(Stdio::null())
        .output()?;

    // lsof exits non-zero when nothing matches.
    let mut pids: Vec<u32> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    Ok(pids)
}

#[cfg(target_os = "linux")]
fn proc_listeners(port: u16) -> Vec<u32> {
    use std::{collections::HashSet, fs};

    const TCP_LISTEN: &str = "0A";

    let mut inodes = HashSet::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        let Ok(content) = fs::read_to_string(table) else {
            continue;
        };
        for line in content.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 || fields[3] != TCP_LISTEN {
                continue;
            }
            let local_port = fields[1]
                .rsplit_once(':')
                .and_then(|(_, hex)| u16::from_str_radix(hex, 16).ok());
            if local_port == Some(port) {
                inodes.insert(format!("socket:[{}]", fields[9]));
            }
        }
    }
    if inodes.is_empty() {
        return Vec::new();
    }

    let mut pids = Vec::new();
    let Ok(entries) = fs::read_dir("/proc") else {
        return pids;
    };
    for entry in entries.filter_map(Result::ok) {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        let holds_socket = fds.filter_map(Result::ok).any(|fd| {
            fs::read_link(fd.path())
                .ok()
                .and_then(|target| target.to_str().map(|t| inodes.contains(t)))
                .unwrap_or(false)
        });
        if holds_socket {
            pids.push(pid);
        }
    }
    pids.sort_unstable();
    pids
}

#[cfg(not(target_os = "linux"))]
fn proc_listeners(_port: u16) -> Vec<u32> {
    Vec::new()
}

impl CommandRunner for OsHost {
    fn locate(&self, program: &str) -> Option<PathBuf> {
        if program.contains('/') {
            let path = PathBuf::from(program);
            return is_executable(&path).then_some(path);
        }

        let paths = env::var_os("PATH")?;
        env::split_paths(&paths)
            .map(|dir| dir.join(program))
            .find(|candidate| is_executable(candidate))
    }

    fn run(&self, command: &CommandSpec, log: Option<File>) -> io::Result<bool> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(&command.cwd)
            .envs(&command.env)
            .stdin(Stdio::null());

        match log {
            Some(log) => {
                let stderr = log.try_clone()?;
                cmd.stdout(Stdio::from(log)).stderr(Stdio::from(stderr));
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        debug!("Running helper command: {}", command.display());
        let status = cmd.status()?;
        Ok(status.success())
    }
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// HTTP checks over a blocking reqwest client with a short per-request timeout.
#[derive(Debug, Clone)]
pub struct ReqwestHttpCheck {
    client: Client,
}

impl ReqwestHttpCheck {
    pub fn new() -> Result<Self, reqwest::Error> {
        // Probes only ever target the loopback interface.
        let client = Client::builder()
            .timeout(HTTP_CHECK_TIMEOUT)
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }
}

impl HttpCheck for ReqwestHttpCheck {
    fn responds(&self, url: &str) -> bool {
        match self.client.get(url).send() {
            Ok(response) => {
                let status = response.status();
                trace!("GET {url} -> {status}");
                status.is_success() || status.is_redirection()
            }
            Err(err) => {
                trace!("GET {url} failed: {err}");
                false
            }
        }
    }
}
