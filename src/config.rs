//! Configuration management for devsup.
use regex::{Captures, Regex};
use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashSet},
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::LazyLock,
    time::Duration,
};
use tracing::{debug, warn};

use crate::{
    constants::{
        BACKEND_PORT_ENV, BACKEND_SERVICE, DEFAULT_BACKEND_PORT, DEFAULT_CONFIG_FILE,
        DEFAULT_FRONTEND_PORT, DEFAULT_LOG_DIR, EARLY_EXIT_WINDOW, EXIT_POLL_INTERVAL,
        FRONTEND_PORT_ENV, FRONTEND_SERVICE, LAUNCH_STAGGER, LOG_DIR_ENV, MAX_SERVICES,
        PORT_PLACEHOLDER, PROBE_HOST, READINESS_ATTEMPTS, READINESS_INTERVAL,
        READINESS_POLICY_ENV, RECLAIM_GRACE, RECLAIM_POLICY_ENV, RESTART_SETTLE, STOP_GRACE,
    },
    error::ConfigError,
    logs::LogManager,
    readiness::ReadinessPolicy,
    reclaim::ReclaimPolicy,
    retry::RetryPolicy,
};

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("valid env pattern")
});

/// Represents the structure of the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Configuration version.
    #[serde(default = "default_version")]
    pub version: String,
    /// Directory for logs and PID files, relative to the project directory.
    pub log_dir: Option<String>,
    /// Named best-effort / fail-fast choices.
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Overrides for waits and delays.
    #[serde(default)]
    pub timing: TimingConfig,
    /// Managed services, in start order.
    pub services: Vec<ServiceConfig>,
    /// Root directory from which relative paths are resolved.
    #[serde(skip)]
    pub project_dir: PathBuf,
}

/// Configuration for an individual service.
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Service identifier, also used for log and PID file names.
    pub name: String,
    /// TCP port the service binds.
    pub port: u16,
    /// Program followed by its arguments. `{port}` is replaced with `port`.
    pub command: Vec<String>,
    /// Working directory, relative to the project directory.
    pub cwd: Option<String>,
    /// Optional environment variables for the service.
    pub env: Option<EnvConfig>,
    /// HTTP path probed for readiness.
    #[serde(default = "default_readiness_path")]
    pub readiness_path: String,
    /// Extra paths whose success also counts as ready.
    #[serde(default)]
    pub alternate_readiness_paths: Vec<String>,
    /// Dependency check run before launching.
    pub preflight: Option<Preflight>,
}

/// Represents environment variables for a service.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct EnvConfig {
    /// Optional path to an environment file.
    pub file: Option<String>,
    /// Key-value pairs of environment variables.
    pub vars: Option<BTreeMap<String, String>>,
}

impl EnvConfig {
    /// Resolves the full path to the env file based on a base directory.
    pub fn path(&self, base: &Path) -> Option<PathBuf> {
        self.file.as_ref().map(|f| {
            let path = Path::new(f);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                base.join(path)
            }
        })
    }
}

/// Dependency verification performed before a service is spawned.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Preflight {
    /// The interpreter must be able to import `module`.
    PythonModule { interpreter: String, module: String },
    /// `program` must exist; `install` runs once when `deps_dir` is absent.
    PackageManager {
        program: String,
        #[serde(default = "default_deps_dir")]
        deps_dir: String,
        install: Vec<String>,
    },
}

/// Policy section of the configuration file.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolicyConfig {
    #[serde(default)]
    pub readiness: ReadinessPolicy,
    #[serde(default)]
    pub reclaim: ReclaimPolicy,
}

/// Timing section of the configuration file; every field is optional.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TimingConfig {
    pub reclaim_grace: Option<String>,
    pub stop_grace: Option<String>,
    pub readiness_attempts: Option<u32>,
    pub readiness_interval: Option<String>,
    pub stagger: Option<String>,
    pub restart_delay: Option<String>,
    pub early_exit_window: Option<String>,
}

/// Resolved waits and delays used by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub reclaim_grace: Duration,
    pub stop_grace: Duration,
    pub exit_poll_interval: Duration,
    pub readiness: RetryPolicy,
    pub stagger: Duration,
    pub restart_delay: Duration,
    pub early_exit_window: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            reclaim_grace: RECLAIM_GRACE,
            stop_grace: STOP_GRACE,
            exit_poll_interval: EXIT_POLL_INTERVAL,
            readiness: RetryPolicy::new(READINESS_ATTEMPTS, READINESS_INTERVAL),
            stagger: LAUNCH_STAGGER,
            restart_delay: RESTART_SETTLE,
            early_exit_window: EARLY_EXIT_WINDOW,
        }
    }
}

impl TimingConfig {
    /// Applies the configured overrides on top of the defaults.
    pub fn resolve(&self) -> Result<Timings, ConfigError> {
        let mut timings = Timings::default();
        let pick = |raw: &Option<String>, fallback: Duration| match raw {
            Some(value) => parse_duration(value),
            None => Ok(fallback),
        };

        timings.reclaim_grace = pick(&self.reclaim_grace, timings.reclaim_grace)?;
        timings.stop_grace = pick(&self.stop_grace, timings.stop_grace)?;
        timings.readiness.interval =
            pick(&self.readiness_interval, timings.readiness.interval)?;
        if let Some(attempts) = self.readiness_attempts {
            timings.readiness.max_attempts = attempts;
        }
        timings.stagger = pick(&self.stagger, timings.stagger)?;
        timings.restart_delay = pick(&self.restart_delay, timings.restart_delay)?;
        timings.early_exit_window = pick(&self.early_exit_window, timings.early_exit_window)?;
        Ok(timings)
    }
}

/// A program invocation: executable, arguments, working directory, environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    /// Builds a spec from a `[program, args...]` vector.
    pub fn from_argv(argv: &[String], cwd: &Path) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            cwd: cwd.to_path_buf(),
            env: BTreeMap::new(),
        })
    }

    /// Shell-like rendering for log messages.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Immutable description of one managed service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub port: u16,
    pub start_command: CommandSpec,
    pub log_path: PathBuf,
    pub pid_path: PathBuf,
    pub readiness_path: String,
    pub alternate_readiness_paths: Vec<String>,
    pub preflight: Option<Preflight>,
}

impl ServiceDescriptor {
    /// Base URL of the service on the loopback interface.
    pub fn base_url(&self) -> String {
        format!("http://{PROBE_HOST}:{}", self.port)
    }

    /// Every URL whose success counts as the service being ready, primary first.
    pub fn readiness_urls(&self) -> Vec<String> {
        let base = self.base_url();
        std::iter::once(&self.readiness_path)
            .chain(self.alternate_readiness_paths.iter())
            .map(|path| format!("{base}{path}"))
            .collect()
    }
}

impl Config {
    /// Built-in two-service layout used when no configuration file exists.
    pub fn builtin(project_dir: PathBuf) -> Result<Self, ConfigError> {
        let backend_port = port_from_env(BACKEND_PORT_ENV, DEFAULT_BACKEND_PORT)?;
        let frontend_port = port_from_env(FRONTEND_PORT_ENV, DEFAULT_FRONTEND_PORT)?;
        let argv = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        Ok(Self {
            version: default_version(),
            log_dir: None,
            policy: PolicyConfig::default(),
            timing: TimingConfig::default(),
            services: vec![
                ServiceConfig {
                    name: BACKEND_SERVICE.to_string(),
                    port: backend_port,
                    command: argv(&[
                        "python3",
                        "-m",
                        "uvicorn",
                        "app.main:app",
                        "--host",
                        "0.0.0.0",
                        "--port",
                        PORT_PLACEHOLDER,
                    ]),
                    cwd: Some(BACKEND_SERVICE.to_string()),
                    env: None,
                    readiness_path: default_readiness_path(),
                    alternate_readiness_paths: vec!["/docs".to_string()],
                    preflight: Some(Preflight::PythonModule {
                        interpreter: "python3".to_string(),
                        module: "uvicorn".to_string(),
                    }),
                },
                ServiceConfig {
                    name: FRONTEND_SERVICE.to_string(),
                    port: frontend_port,
                    command: argv(&["npm", "run", "dev", "--", "--port", PORT_PLACEHOLDER]),
                    cwd: Some(FRONTEND_SERVICE.to_string()),
                    env: None,
                    readiness_path: default_readiness_path(),
                    alternate_readiness_paths: Vec::new(),
                    preflight: Some(Preflight::PackageManager {
                        program: "npm".to_string(),
                        deps_dir: default_deps_dir(),
                        install: argv(&["npm", "install"]),
                    }),
                },
            ],
            project_dir,
        })
    }

    /// Checks the invariants the orchestrator relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.services.is_empty() {
            return Err(ConfigError::Invalid("no services configured".into()));
        }
        if self.services.len() > MAX_SERVICES {
            return Err(ConfigError::Invalid(format!(
                "at most {MAX_SERVICES} services are supported, found {}",
                self.services.len()
            )));
        }

        let mut names = HashSet::new();
        let mut ports = HashSet::new();
        for service in &self.services {
            let name = service.name.as_str();
            if name.is_empty()
                || !name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                return Err(ConfigError::Invalid(format!(
                    "service name '{name}' must be non-empty and use only letters, digits, '-' or '_'"
                )));
            }
            if !names.insert(name) {
                return Err(ConfigError::Invalid(format!("duplicate service '{name}'")));
            }
            if service.port == 0 {
                return Err(ConfigError::Invalid(format!(
                    "service '{name}' must declare a non-zero port"
                )));
            }
            if !ports.insert(service.port) {
                return Err(ConfigError::Invalid(format!(
                    "port {} is declared by more than one service",
                    service.port
                )));
            }
            if service.command.first().is_none_or(|program| program.trim().is_empty()) {
                return Err(ConfigError::Invalid(format!(
                    "service '{name}' has an empty command"
                )));
            }
            let paths = std::iter::once(&service.readiness_path)
                .chain(service.alternate_readiness_paths.iter());
            for path in paths {
                if !path.starts_with('/') {
                    return Err(ConfigError::Invalid(format!(
                        "readiness path '{path}' of service '{name}' must start with '/'"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Directory holding logs, PID files and the lock file.
    pub fn resolved_log_dir(&self) -> PathBuf {
        let raw = env::var(LOG_DIR_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .or_else(|| self.log_dir.clone())
            .unwrap_or_else(|| DEFAULT_LOG_DIR.to_string());
        let path = PathBuf::from(raw);
        if path.is_absolute() {
            path
        } else {
            self.project_dir.join(path)
        }
    }

    /// Lets `DEVSUP_READINESS_POLICY` and `DEVSUP_RECLAIM_POLICY` override the file.
    pub fn apply_policy_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(policy) = policy_from_env(READINESS_POLICY_ENV)? {
            self.policy.readiness = policy;
        }
        if let Some(policy) = policy_from_env(RECLAIM_POLICY_ENV)? {
            self.policy.reclaim = policy;
        }
        Ok(())
    }

    /// Builds the immutable descriptors, in configured start order.
    pub fn descriptors(&self) -> Result<Vec<ServiceDescriptor>, ConfigError> {
        let logs = LogManager::new(self.resolved_log_dir());
        self.services
            .iter()
            .map(|service| {
                let cwd = match &service.cwd {
                    Some(dir) if Path::new(dir).is_absolute() => PathBuf::from(dir),
                    Some(dir) => self.project_dir.join(dir),
                    None => self.project_dir.clone(),
                };
                let argv: Vec<String> = service
                    .command
                    .iter()
                    .map(|arg| arg.replace(PORT_PLACEHOLDER, &service.port.to_string()))
                    .collect();
                let mut start_command = CommandSpec::from_argv(&argv, &cwd).ok_or_else(|| {
                    ConfigError::Invalid(format!("service '{}' has an empty command", service.name))
                })?;
                start_command.env =
                    collect_service_env(&service.env, &self.project_dir, &service.name)?;

                Ok(ServiceDescriptor {
                    name: service.name.clone(),
                    port: service.port,
                    start_command,
                    log_path: logs.log_path_for(&service.name),
                    pid_path: logs.pid_path_for(&service.name),
                    readiness_path: service.readiness_path.clone(),
                    alternate_readiness_paths: service.alternate_readiness_paths.clone(),
                    preflight: service.preflight.clone(),
                })
            })
            .collect()
    }
}

fn default_version() -> String {
    "1".to_string()
}

fn default_readiness_path() -> String {
    "/".to_string()
}

fn default_deps_dir() -> String {
    "node_modules".to_string()
}

fn port_from_env(variable: &str, fallback: u16) -> Result<u16, ConfigError> {
    match env::var(variable) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u16>()
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| ConfigError::InvalidPort {
                variable: variable.to_string(),
                value,
            }),
        _ => Ok(fallback),
    }
}

fn policy_from_env<P: FromStr>(variable: &str) -> Result<Option<P>, ConfigError> {
    match env::var(variable) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<P>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(format!("unknown policy '{value}' in {variable}"))),
        _ => Ok(None),
    }
}

/// Build the environment map for a service, giving inline `env.vars` precedence over entries
/// loaded from `env.file`.
fn collect_service_env(
    env: &Option<EnvConfig>,
    project_root: &Path,
    service_name: &str,
) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut resolved = BTreeMap::new();
    let Some(env_config) = env else {
        return Ok(resolved);
    };

    if let Some(path) = env_config.path(project_root) {
        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
            match trimmed.split_once('=') {
                Some((key, value)) => {
                    let mut value = value.trim();
                    if value.len() >= 2
                        && ((value.starts_with('"') && value.ends_with('"'))
                            || (value.starts_with('\'') && value.ends_with('\'')))
                    {
                        value = &value[1..value.len() - 1];
                    }
                    resolved.insert(key.trim().to_string(), value.to_string());
                }
                None => {
                    warn!("Ignoring malformed line in env file for '{service_name}': {trimmed}");
                }
            }
        }
    }

    if let Some(vars) = &env_config.vars {
        for (key, value) in vars {
            resolved.insert(key.clone(), value.clone());
        }
    }

    Ok(resolved)
}

/// Expands `${VAR}` and `${VAR:-default}` references within a string.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut missing: Option<String> = None;
    let expanded = ENV_VAR_PATTERN.replace_all(input, |caps: &Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => match caps.get(2) {
                Some(default) => default.as_str().to_string(),
                None => {
                    missing.get_or_insert_with(|| var_name.to_string());
                    String::new()
                }
            },
        }
    });

    match missing {
        Some(var_name) => Err(ConfigError::MissingEnvVar(var_name)),
        None => Ok(expanded.into_owned()),
    }
}

/// Parses a user-facing duration string in the format `<number>[ms|s|m]`.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(ConfigError::InvalidDuration(raw.to_string()));
    }

    let (amount_str, millis_per_unit) = if let Some(stripped) = value.strip_suffix("ms") {
        (stripped.trim(), 1)
    } else if let Some(stripped) = value.strip_suffix('s') {
        (stripped.trim(), 1_000)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped.trim(), 60_000)
    } else {
        (value, 1_000)
    };

    let amount: u64 = amount_str
        .parse()
        .map_err(|_| ConfigError::InvalidDuration(raw.to_string()))?;

    Ok(Duration::from_millis(amount.saturating_mul(millis_per_unit)))
}

/// Loads the configuration file (or the built-in layout) and validates it.
///
/// With no explicit path, `devsup.yaml` in the current directory is used when present and the
/// built-in backend/frontend layout otherwise. An explicit path must exist.
pub fn load_config(config_path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = match config_path {
        Some(path) => path.to_path_buf(),
        None => {
            let candidate = PathBuf::from(DEFAULT_CONFIG_FILE);
            if !candidate.exists() {
                let cwd = env::current_dir().map_err(|source| ConfigError::Read {
                    path: PathBuf::from("."),
                    source,
                })?;
                debug!("No {DEFAULT_CONFIG_FILE} found; using built-in service layout");
                let mut config = Config::builtin(cwd)?;
                config.apply_policy_overrides()?;
                config.validate()?;
                return Ok(config);
            }
            candidate
        }
    };

    let content = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    let expanded = expand_env_vars(&content)?;
    let mut config: Config = serde_yaml::from_str(&expanded)?;

    let base = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    config.project_dir = std::path::absolute(&base).map_err(|source| ConfigError::Read {
        path: base.clone(),
        source,
    })?;

    config.apply_policy_overrides()?;
    config.validate()?;
    debug!(
        "Loaded {} service(s) from {}",
        config.services.len(),
        path.display()
    );
    Ok(config)
}
