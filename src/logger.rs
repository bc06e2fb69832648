//! Append-only process log shared by the master and every worker.
//!
//! Records are single lines:
//!
//! ```text
//! [2026-08-02 14:03:07.4821][INFO][pid=4711]worker started
//! ```
//!
//! The log file is shared by path across all processes on the host, so both
//! rotation and appends are coordinated with advisory file locks: appends
//! take a blocking exclusive lock, while rotation is attempted under a
//! non-blocking lock and simply skipped when another process is already
//! rotating. When the active file grows past 10 MiB it is rotated through a
//! sliding window of suffixes `.1` through `.5`; the oldest file falls off
//! the end.
//!
//! Logging must never take a process down: every error on this path is
//! swallowed.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

/// Rotation threshold for the active file.
const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// Number of rotated files kept next to the active one.
const ROTATE_DEPTH: u32 = 5;

#[derive(Debug, Clone, Copy)]
enum Level {
    Info,
    Error,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Error => "ERROR",
        }
    }
}

/// Writer for the shared process log.
#[derive(Debug, Clone)]
pub struct Logger {
    path: PathBuf,
}

impl Logger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends an INFO record.
    pub fn info(&self, text: &str) {
        let _ = self.append(Level::Info, text);
    }

    /// Appends an ERROR record.
    pub fn error(&self, text: &str) {
        let _ = self.append(Level::Error, text);
    }

    fn append(&self, level: Level, text: &str) -> io::Result<()> {
        // Rotation failures must not block the append.
        let _ = self.rotate_if_oversized();

        let line = format_line(level, text);
        let mut file = match self.open_active() {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                if let Some(parent) = self.path.parent() {
                    fs::create_dir_all(parent)?;
                }
                self.open_active()?
            }
            Err(err) => return Err(err),
        };
        file.lock_exclusive()?;
        let outcome = file.write_all(line.as_bytes());
        let _ = file.unlock();
        outcome
    }

    fn open_active(&self) -> io::Result<fs::File> {
        OpenOptions::new().create(true).append(true).open(&self.path)
    }

    /// Rotates the suffix window when the active file exceeds the threshold.
    ///
    /// The lock is non-blocking: failing to take it means another process is
    /// mid-rotation, and this writer can go straight to appending.
    fn rotate_if_oversized(&self) -> io::Result<()> {
        let file = match OpenOptions::new().write(true).open(&self.path) {
            Ok(file) => file,
            Err(_) => return Ok(()),
        };
        if file.metadata()?.len() <= MAX_LOG_SIZE {
            return Ok(());
        }
        if file.try_lock_exclusive().is_err() {
            return Ok(());
        }
        // Size may have changed while we waited on nothing; re-check under
        // the lock before shifting the window.
        if file.metadata()?.len() > MAX_LOG_SIZE {
            for slot in (1..ROTATE_DEPTH).rev() {
                let from = self.rotated(slot);
                if from.exists() {
                    let _ = fs::rename(&from, self.rotated(slot + 1));
                }
            }
            fs::rename(&self.path, self.rotated(1))?;
        }
        let _ = file.unlock();
        Ok(())
    }

    fn rotated(&self, slot: u32) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{}", slot));
        PathBuf::from(name)
    }
}

fn format_line(level: Level, text: &str) -> String {
    let now = chrono::Local::now();
    let flattened = text.replace(['\n', '\r'], " ");
    format!(
        "[{}.{:04}][{}][pid={}]{}\n",
        now.format("%Y-%m-%d %H:%M:%S"),
        now.timestamp_subsec_micros() / 100,
        level.as_str(),
        std::process::id(),
        flattened
    )
}
