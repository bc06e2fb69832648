//! Master PID persistence.
//!
//! A single file holds the master's PID as decimal ASCII. The file serves two
//! purposes at once:
//!
//! - **Singleton guard**: `start` refuses to launch a second master while the
//!   recorded PID belongs to a live process.
//! - **Stop channel**: writing `0` is the cooperative stop directive. The
//!   master re-reads the file periodically and begins draining when the value
//!   no longer matches its own PID, so external tooling never has to guess a
//!   signal number.

use std::fs;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use nix::sys::signal::kill;
use nix::unistd::Pid;

/// The value written to request a cooperative stop.
pub const STOP_DIRECTIVE: u32 = 0;

/// Handle to the PID file under the runtime directory.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the PID of the live master, or 0 when there is none.
    ///
    /// The recorded PID only counts when the process still answers a signal-0
    /// liveness probe. Missing file, unreadable contents and stale PIDs all
    /// read as "no master".
    pub fn read_live_master(&self) -> u32 {
        let pid = match fs::read_to_string(&self.path) {
            Ok(contents) => match contents.trim().parse::<i32>() {
                Ok(pid) if pid > 0 => pid,
                _ => return 0,
            },
            Err(_) => return 0,
        };
        if kill(Pid::from_raw(pid), None).is_ok() {
            pid as u32
        } else {
            0
        }
    }

    /// Records `pid` in the file, replacing any previous value atomically.
    ///
    /// Parent directories are created on demand with a permissive mode so
    /// unprivileged tooling can read the file. Write failures propagate; a
    /// master that cannot record itself must not keep running.
    pub fn write_master(&self, pid: u32) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                fs::DirBuilder::new().recursive(true).mode(0o777).create(parent)?;
            }
        }
        // Write-then-rename so a concurrent reader never sees a torn value.
        let staging = self.path.with_extension(format!("tmp.{}", std::process::id()));
        fs::write(&staging, pid.to_string())?;
        fs::rename(&staging, &self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn absent_file_reads_as_no_master() {
        let dir = tempdir().unwrap();
        let pidfile = PidFile::new(dir.path().join("master.pid"));
        assert_eq!(pidfile.read_live_master(), 0);
    }

    #[test]
    fn garbage_contents_read_as_no_master() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("master.pid");
        fs::write(&path, "not-a-pid").unwrap();
        assert_eq!(PidFile::new(&path).read_live_master(), 0);
    }

    #[test]
    fn stale_pid_reads_as_no_master() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("master.pid");
        // PIDs near the default pid_max are vanishingly unlikely to be live
        // in a test environment.
        fs::write(&path, "4194303").unwrap();
        assert_eq!(PidFile::new(&path).read_live_master(), 0);
    }

    #[test]
    fn live_pid_round_trips() {
        let dir = tempdir().unwrap();
        let pidfile = PidFile::new(dir.path().join("master.pid"));
        let own_pid = std::process::id();
        pidfile.write_master(own_pid).unwrap();
        assert_eq!(pidfile.read_live_master(), own_pid);
    }

    #[test]
    fn stop_directive_reads_as_no_master() {
        let dir = tempdir().unwrap();
        let pidfile = PidFile::new(dir.path().join("master.pid"));
        pidfile.write_master(std::process::id()).unwrap();
        pidfile.write_master(STOP_DIRECTIVE).unwrap();
        assert_eq!(pidfile.read_live_master(), 0);
    }

    #[test]
    fn write_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let pidfile = PidFile::new(dir.path().join("nested/runtime/master.pid"));
        pidfile.write_master(std::process::id()).unwrap();
        assert!(pidfile.path().exists());
    }
}
