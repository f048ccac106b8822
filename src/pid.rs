//! Persistence of the process id of each managed service between invocations.
use std::{
    collections::HashMap,
    fs, io,
    path::PathBuf,
    sync::{Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::{error::PidFileError, logs::LogManager};

/// One running instance of a managed service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessRecord {
    pub service_name: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

impl ProcessRecord {
    /// Record for a process that was just spawned.
    pub fn new(service_name: impl Into<String>, pid: u32) -> Self {
        Self {
            service_name: service_name.into(),
            pid,
            started_at: Utc::now(),
        }
    }
}

/// Storage for [`ProcessRecord`]s.
///
/// A stored record says nothing about liveness: callers must check the OS.
pub trait PidStore: Send + Sync {
    /// Persists `record`, replacing any previous record for the service.
    fn save(&self, record: &ProcessRecord) -> Result<(), PidFileError>;

    /// Returns the stored record for `service`, if any.
    fn load(&self, service: &str) -> Result<Option<ProcessRecord>, PidFileError>;

    /// Removes the record for `service`. Clearing a missing record is not an error.
    fn clear(&self, service: &str) -> Result<(), PidFileError>;

    /// Convenience accessor for the recorded pid.
    fn load_pid(&self, service: &str) -> Result<Option<u32>, PidFileError> {
        Ok(self.load(service)?.map(|record| record.pid))
    }
}

/// One plain-text file per service containing the decimal pid.
#[derive(Debug, Clone)]
pub struct PidFileStore {
    logs: LogManager,
}

impl PidFileStore {
    pub fn new(logs: LogManager) -> Self {
        Self { logs }
    }

    /// Returns the PID file path for a service.
    pub fn path(&self, service: &str) -> PathBuf {
        self.logs.pid_path_for(service)
    }
}

impl PidStore for PidFileStore {
    fn save(&self, record: &ProcessRecord) -> Result<(), PidFileError> {
        let path = self.path(&record.service_name);
        let io_err = |source| PidFileError::Io {
            path: path.clone(),
            source,
        };
        self.logs.ensure_dir().map_err(io_err)?;
        fs::write(&path, format!("{}\n", record.pid)).map_err(io_err)?;
        debug!(
            "Recorded PID {} for '{}' in {}",
            record.pid,
            record.service_name,
            path.display()
        );
        Ok(())
    }

    fn load(&self, service: &str) -> Result<Option<ProcessRecord>, PidFileError> {
        let path = self.path(service);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(PidFileError::Io { path, source }),
        };

        let trimmed = contents.trim();
        // Anything outside 1..=i32::MAX would address a process group or every process.
        let pid = trimmed
            .parse::<i32>()
            .ok()
            .filter(|pid| *pid > 0)
            .map(|pid| pid as u32)
            .ok_or_else(|| PidFileError::Parse {
                path: path.clone(),
                contents: trimmed.to_string(),
            })?;

        let started_at = fs::metadata(&path)
            .and_then(|meta| meta.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        Ok(Some(ProcessRecord {
            service_name: service.to_string(),
            pid,
            started_at,
        }))
    }

    fn clear(&self, service: &str) -> Result<(), PidFileError> {
        let path = self.path(service);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Cleared PID record for '{service}'");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PidFileError::Io { path, source }),
        }
    }
}

/// In-memory store, used when no real filesystem state should be touched.
#[derive(Debug, Default)]
pub struct MemoryPidStore {
    records: Mutex<HashMap<String, ProcessRecord>>,
}

impl MemoryPidStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, ProcessRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Names of services that currently have a record.
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.records().keys().cloned().collect();
        names.sort();
        names
    }
}

impl PidStore for MemoryPidStore {
    fn save(&self, record: &ProcessRecord) -> Result<(), PidFileError> {
        self.records()
            .insert(record.service_name.clone(), record.clone());
        Ok(())
    }

    fn load(&self, service: &str) -> Result<Option<ProcessRecord>, PidFileError> {
        Ok(self.records().get(service).cloned())
    }

    fn clear(&self, service: &str) -> Result<(), PidFileError> {
        self.records().remove(service);
        Ok(())
    }
}
