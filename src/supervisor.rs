//! Master process: baseline fork policy, reaping, autoscaling and drain.
//!
//! The master is a single-threaded poll loop over three concerns:
//!
//! 1. **Reaping**: children are collected with `WNOHANG`, one per iteration.
//!    A non-zero exit stamps a 60-second back-off on the topic; a baseline
//!    worker is replaced immediately (the replacement honors the back-off),
//!    a burst worker is not.
//! 2. **Housekeeping**: each pass the master re-reads the PID file and
//!    drains itself when the file no longer names it; this is how an
//!    external `stop` reaches a running master. Every 60 seconds the
//!    autoscaler additionally gets a pass over every topic.
//! 3. **Drain**: SIGUSR1 sets a flag; the loop observes it, forwards SIGUSR1
//!    to every tracked worker, drops the poll interval to 100 ms and exits
//!    once `waitpid` reports no children remain.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use thiserror::Error;
use tracing::debug;

use crate::daemon;
use crate::job::Job;
use crate::logger::Logger;
use crate::pidfile::{PidFile, STOP_DIRECTIVE};
use crate::proctitle;
use crate::worker;

/// Poll interval while running normally.
const POLL_IDLE: Duration = Duration::from_secs(1);

/// Poll interval once a drain has begun.
const POLL_DRAIN: Duration = Duration::from_millis(100);

/// Spacing of the autoscaler pass.
const AUTOSCALE_INTERVAL: Duration = Duration::from_secs(60);

/// Per-topic back-off imposed after a worker exits non-zero.
const CRASH_BACKOFF_SECS: i64 = 60;

/// How long `stop` waits for the master to exit.
const STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Liveness polling interval during `stop`.
const STOP_POLL: Duration = Duration::from_millis(500);

static DRAIN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigusr1(_: libc::c_int) {
    DRAIN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Errors that take the master down.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("fork failed: {0}")]
    Fork(#[source] nix::Error),

    #[error("signal handler installation failed: {0}")]
    Signal(#[source] nix::Error),

    #[error("failed to record master pid: {0}")]
    PidFile(#[from] std::io::Error),
}

/// Filesystem layout for one supervisor instance.
///
/// Everything lives under a single runtime directory:
/// `<runtime>/master.pid` and `<runtime>/logs/process.log`. Relative paths
/// are resolved against the working directory at construction time, before
/// daemonization moves the master to `/`.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    runtime_dir: PathBuf,
}

impl SupervisorConfig {
    pub fn new(runtime_dir: impl Into<PathBuf>) -> Self {
        let dir: PathBuf = runtime_dir.into();
        let runtime_dir = if dir.is_absolute() {
            dir
        } else {
            std::env::current_dir().map(|cwd| cwd.join(&dir)).unwrap_or(dir)
        };
        Self { runtime_dir }
    }

    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    pub fn pid_path(&self) -> PathBuf {
        self.runtime_dir.join("master.pid")
    }

    pub fn log_path(&self) -> PathBuf {
        self.runtime_dir.join("logs").join("process.log")
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::new("/tmp/quevisor")
    }
}

/// The supervisor: registered topics plus the master's runtime state.
pub struct Supervisor {
    config: SupervisorConfig,
    jobs: HashMap<String, Job>,
    logger: Logger,
    pidfile: PidFile,
    alarm_hook: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    draining: bool,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let logger = Logger::new(config.log_path());
        let pidfile = PidFile::new(config.pid_path());
        Self {
            config,
            jobs: HashMap::new(),
            logger,
            pidfile,
            alarm_hook: None,
            draining: false,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Registers a topic. An empty topic is silently ignored; registering an
    /// existing topic replaces the previous descriptor. Numeric fields are
    /// clamped to their documented ranges here.
    pub fn register(&mut self, mut job: Job) {
        if job.topic().is_empty() {
            return;
        }
        job.normalize();
        self.jobs.insert(job.topic().to_string(), job);
    }

    /// Installs an advisory callback invoked by the master whenever a worker
    /// exits non-zero, after the corresponding ERROR log line. Intended for
    /// paging/alerting taps; it runs in the master and must not block.
    pub fn with_alarm_hook(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.alarm_hook = Some(Arc::new(hook));
        self
    }

    pub fn job(&self, topic: &str) -> Option<&Job> {
        self.jobs.get(topic)
    }

    /// `start`: become the daemonized master.
    ///
    /// Idempotent against a live master (prints a notice and returns
    /// success). On return from this function the calling process is the
    /// master and has finished draining; the shell-facing parent exited
    /// inside daemonization.
    pub fn start(&mut self) -> Result<(), SupervisorError> {
        let live = self.pidfile.read_live_master();
        if live != 0 {
            println!("process is already running, pid={}", live);
            return Ok(());
        }
        if let Err(err) = daemon::daemonize() {
            self.logger.error(&format!("daemonize failed: {:#}", err));
            std::process::exit(1);
        }
        self.run_master()
    }

    /// Runs the master in the foreground, skipping daemonization. Useful for
    /// debugging a handler under a terminal and for harness-driven tests;
    /// everything else matches [`Supervisor::start`].
    pub fn run_foreground(&mut self) -> Result<(), SupervisorError> {
        let live = self.pidfile.read_live_master();
        if live != 0 {
            println!("process is already running, pid={}", live);
            return Ok(());
        }
        self.run_master()
    }

    /// `stop`: ask the live master to drain and wait for it to exit.
    ///
    /// Returns `true` when no master remains (including the idempotent
    /// nothing-to-do case), `false` when the master failed to exit in time.
    pub fn stop(&self) -> bool {
        let live = self.pidfile.read_live_master();
        if live == 0 {
            println!("process is not running");
            return true;
        }
        if let Err(err) = self.pidfile.write_master(STOP_DIRECTIVE) {
            eprintln!("stop failed: could not write pid file: {}", err);
            return false;
        }
        let deadline = Instant::now() + STOP_TIMEOUT;
        while Instant::now() < deadline {
            if kill(Pid::from_raw(live as i32), None).is_err() {
                println!("process stopped, pid={}", live);
                return true;
            }
            std::thread::sleep(STOP_POLL);
        }
        eprintln!(
            "stop failed: process {} still running after {}s",
            live,
            STOP_TIMEOUT.as_secs()
        );
        false
    }

    /// `status`: report the live master, if any.
    pub fn status(&self) {
        match self.pidfile.read_live_master() {
            0 => println!("process is not running"),
            pid => println!("process is running, pid={}", pid),
        }
    }

    fn run_master(&mut self) -> Result<(), SupervisorError> {
        proctitle::set_title("quevisor: master");
        let pid = std::process::id();
        self.pidfile.write_master(pid)?;
        self.logger.info(&format!("master started, pid={}", pid));

        DRAIN_REQUESTED.store(false, Ordering::SeqCst);
        let action = SigAction::new(
            SigHandler::Handler(on_sigusr1),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        unsafe { sigaction(Signal::SIGUSR1, &action) }.map_err(SupervisorError::Signal)?;

        self.spawn_baseline()?;
        let outcome = self.run_loop();
        self.logger.info("master exited");
        outcome
    }

    fn spawn_baseline(&mut self) -> Result<(), SupervisorError> {
        let topics: Vec<String> = self.jobs.keys().cloned().collect();
        for topic in topics {
            let count = self.jobs[&topic].static_worker_count();
            for _ in 0..count {
                self.fork_worker(&topic, false)?;
            }
        }
        Ok(())
    }

    fn run_loop(&mut self) -> Result<(), SupervisorError> {
        let mut last_housekeeping = Instant::now();
        loop {
            self.observe_drain_request();

            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, status)) => self.reap(pid, status)?,
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    // A killed worker is a failed worker.
                    self.logger.error(&format!(
                        "worker {} killed by signal {}",
                        pid.as_raw(),
                        signal
                    ));
                    self.reap(pid, 128 + signal as i32)?;
                }
                Ok(_) => {}
                Err(Errno::ECHILD) => {
                    if self.draining {
                        break;
                    }
                }
                Err(err) => {
                    self.logger.error(&format!("waitpid failed: {}", err));
                }
            }

            if !self.draining {
                if self.pidfile.read_live_master() != std::process::id() {
                    // The registry no longer names us: an external stop (or a
                    // usurping master) owns the runtime directory now. Checked
                    // every iteration so a `stop` lands well inside its
                    // 30-second deadline.
                    self.logger.info("pid file no longer ours, draining");
                    let _ = kill(Pid::this(), Signal::SIGUSR1);
                } else if last_housekeeping.elapsed() >= AUTOSCALE_INTERVAL {
                    last_housekeeping = Instant::now();
                    self.autoscale()?;
                }
            }

            std::thread::sleep(poll_interval(self.draining));
        }
        Ok(())
    }

    /// Moves the drain flag set by the signal handler into the loop state,
    /// forwarding the request to every tracked worker exactly once.
    fn observe_drain_request(&mut self) {
        if self.draining || !DRAIN_REQUESTED.load(Ordering::SeqCst) {
            return;
        }
        self.draining = true;
        self.logger.info("drain requested, signalling workers");
        for job in self.jobs.values() {
            for pid in job.worker_pids() {
                let _ = kill(Pid::from_raw(pid), Signal::SIGUSR1);
            }
        }
    }

    fn reap(&mut self, pid: Pid, status: i32) -> Result<(), SupervisorError> {
        let raw = pid.as_raw();
        let topic = match self
            .jobs
            .iter()
            .find(|(_, job)| job.is_tracking(raw))
            .map(|(topic, _)| topic.clone())
        {
            Some(topic) => topic,
            None => {
                debug!(pid = raw, "reaped untracked child");
                return Ok(());
            }
        };

        let slot = match self.jobs.get_mut(&topic).and_then(|job| job.forget_worker(raw)) {
            Some(slot) => slot,
            None => return Ok(()),
        };

        if status != 0 {
            let message = format!(
                "worker {} for topic {} exited with status {}",
                raw, topic, status
            );
            self.logger.error(&message);
            if let Some(job) = self.jobs.get_mut(&topic) {
                job.apply_backoff(CRASH_BACKOFF_SECS);
            }
            if let Some(hook) = self.alarm_hook.clone() {
                hook(&message);
            }
        } else {
            self.logger.info(&format!(
                "worker {} for topic {} exited normally",
                raw, topic
            ));
        }

        if !self.draining && !slot.dynamic {
            self.fork_worker(&topic, false)?;
        }
        Ok(())
    }

    fn autoscale(&mut self) -> Result<(), SupervisorError> {
        let topics: Vec<String> = self.jobs.keys().cloned().collect();
        for topic in topics {
            let burst = {
                let job = match self.jobs.get_mut(&topic) {
                    Some(job) => job,
                    None => continue,
                };
                if !autoscale_gate(
                    job.health_queue_length(),
                    job.dynamic_worker_count(),
                    job.live_worker_count(),
                    job.static_worker_count(),
                ) {
                    continue;
                }
                let backlog = match job.backlog() {
                    Ok(backlog) => backlog,
                    Err(err) => {
                        self.logger
                            .error(&format!("backlog probe for topic {} failed: {}", topic, err));
                        continue;
                    }
                };
                // No open handle may survive into the forks below.
                job.disconnect_queue();
                backlog > job.health_queue_length()
            };

            if burst {
                let count = self.jobs[&topic].dynamic_worker_count();
                self.logger.info(&format!(
                    "backlog over threshold on topic {}, forking {} dynamic workers",
                    topic, count
                ));
                for _ in 0..count {
                    self.fork_worker(&topic, true)?;
                }
            }
        }
        Ok(())
    }

    fn fork_worker(&mut self, topic: &str, dynamic: bool) -> Result<(), SupervisorError> {
        let master = Pid::this();
        match unsafe { fork() }.map_err(SupervisorError::Fork)? {
            ForkResult::Parent { child } => {
                if let Some(job) = self.jobs.get_mut(topic) {
                    job.track_worker(child.as_raw(), dynamic);
                }
                debug!(topic, pid = child.as_raw(), dynamic, "forked worker");
                Ok(())
            }
            ForkResult::Child => {
                let status = match self.jobs.get_mut(topic) {
                    Some(job) => worker::run(job, master, &self.logger),
                    None => 1,
                };
                std::process::exit(status);
            }
        }
    }
}

fn poll_interval(draining: bool) -> Duration {
    if draining {
        POLL_DRAIN
    } else {
        POLL_IDLE
    }
}

/// The cheap half of the autoscale decision; the backlog comparison happens
/// only after these gates pass. Burst workers are admitted only while no
/// burst is already live, which `live <= baseline` approximates (a baseline
/// worker may just have exited; the race is bounded by the burst size).
fn autoscale_gate(health: u64, dynamic_count: u32, live_workers: usize, baseline: u32) -> bool {
    health > 0 && dynamic_count > 0 && live_workers <= baseline as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueKind;
    use tempfile::tempdir;

    fn noop_job(topic: &str) -> Job {
        Job::new(topic, QueueKind::Fifo, |_: &str| Ok(()))
    }

    fn test_supervisor() -> (Supervisor, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let supervisor = Supervisor::new(SupervisorConfig::new(dir.path()));
        (supervisor, dir)
    }

    #[test]
    fn config_paths() {
        let config = SupervisorConfig::new("/srv/app/runtime");
        assert_eq!(config.pid_path(), PathBuf::from("/srv/app/runtime/master.pid"));
        assert_eq!(
            config.log_path(),
            PathBuf::from("/srv/app/runtime/logs/process.log")
        );
    }

    #[test]
    fn relative_runtime_dir_is_resolved_early() {
        let config = SupervisorConfig::new("runtime");
        assert!(config.runtime_dir().is_absolute());
    }

    #[test]
    fn register_ignores_empty_topic() {
        let (mut supervisor, _dir) = test_supervisor();
        supervisor.register(noop_job(""));
        assert!(supervisor.job("").is_none());
    }

    #[test]
    fn register_clamps_and_overwrites() {
        let (mut supervisor, _dir) = test_supervisor();
        supervisor.register(noop_job("orders").with_static_workers(0));
        assert_eq!(supervisor.job("orders").unwrap().static_worker_count(), 1);

        supervisor.register(noop_job("orders").with_static_workers(9));
        assert_eq!(supervisor.job("orders").unwrap().static_worker_count(), 9);
    }

    #[test]
    fn autoscale_gate_truth_table() {
        // Disabled by zero health threshold.
        assert!(!autoscale_gate(0, 2, 1, 1));
        // Disabled by zero burst size.
        assert!(!autoscale_gate(10, 0, 1, 1));
        // Blocked while a burst is live (workers above baseline).
        assert!(!autoscale_gate(10, 2, 3, 1));
        // Admitted at or below baseline.
        assert!(autoscale_gate(10, 2, 1, 1));
        assert!(autoscale_gate(10, 2, 0, 1));
    }

    #[test]
    fn poll_interval_switches_on_drain() {
        assert_eq!(poll_interval(false), Duration::from_secs(1));
        assert_eq!(poll_interval(true), Duration::from_millis(100));
    }

    #[test]
    fn drain_flag_is_observed_once() {
        let (mut supervisor, _dir) = test_supervisor();
        supervisor.register(noop_job("orders"));
        assert!(!supervisor.draining);

        DRAIN_REQUESTED.store(true, Ordering::SeqCst);
        supervisor.observe_drain_request();
        assert!(supervisor.draining);

        // Already draining: a second pass must not reset anything.
        supervisor.observe_drain_request();
        assert!(supervisor.draining);
        DRAIN_REQUESTED.store(false, Ordering::SeqCst);
    }

    #[test]
    fn stop_without_master_is_idempotent() {
        let (supervisor, _dir) = test_supervisor();
        assert!(supervisor.stop());
    }

    #[test]
    fn status_without_master_reports_not_running() {
        let (supervisor, _dir) = test_supervisor();
        // Output goes to stdout; this exercises the no-master path.
        supervisor.status();
        assert_eq!(supervisor.pidfile.read_live_master(), 0);
    }
}
