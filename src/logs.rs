//! Per-service log and PID file layout.
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::constants::{LOCK_FILE_NAME, LOG_FILE_EXTENSION, PID_FILE_EXTENSION};

/// Owns the per-service log and PID file layout under a single directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogManager {
    log_dir: PathBuf,
}

impl LogManager {
    /// Creates a manager rooted at `log_dir`. Nothing is created on disk yet.
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// `<logdir>/<service>.log`
    pub fn log_path_for(&self, service: &str) -> PathBuf {
        self.log_dir.join(format!("{service}.{LOG_FILE_EXTENSION}"))
    }

    /// `<logdir>/<service>.pid`
    pub fn pid_path_for(&self, service: &str) -> PathBuf {
        self.log_dir.join(format!("{service}.{PID_FILE_EXTENSION}"))
    }

    /// Advisory lock file held by mutating commands.
    pub fn lock_path(&self) -> PathBuf {
        self.log_dir.join(LOCK_FILE_NAME)
    }

    /// Makes sure the log directory exists before anything writes into it.
    pub fn ensure_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.log_dir)
    }

    /// Opens the service log for appending, creating directory and file as needed.
    pub fn open_append(&self, service: &str) -> io::Result<File> {
        self.ensure_dir()?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path_for(service))
    }

    /// Empties the service log. A missing log is left missing.
    pub fn truncate(&self, service: &str) -> io::Result<()> {
        let path = self.log_path_for(service);
        match OpenOptions::new().write(true).open(&path) {
            Ok(file) => {
                file.set_len(0)?;
                debug!("Truncated log for '{service}' at {}", path.display());
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Returns the last `lines` lines of the service log (empty if there is no log).
    pub fn tail(&self, service: &str, lines: usize) -> io::Result<Vec<String>> {
        let path = self.log_path_for(service);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        if lines == 0 {
            return Ok(Vec::new());
        }
        let mut buffer: VecDeque<String> = VecDeque::with_capacity(lines);
        for line in BufReader::new(file).lines().map_while(Result::ok) {
            if buffer.len() == lines {
                buffer.pop_front();
            }
            buffer.push_back(line);
        }
        Ok(buffer.into_iter().collect())
    }

    /// Whether the recent log output looks like the service lost a port race.
    pub fn indicates_port_conflict(&self, service: &str) -> bool {
        self.tail(service, 50)
            .map(|lines| {
                lines.iter().rev().any(|line| {
                    let lower = line.to_ascii_lowercase();
                    lower.contains("address already in use")
                        || lower.contains("os error 48")
                        || lower.contains("os error 98")
                        || lower.contains("eaddrinuse")
                })
            })
            .unwrap_or(false)
    }
}
