//! Worker process body, entered immediately after fork.
//!
//! Each worker is a single-threaded consumption loop with three cooperative
//! exit triggers: the SIGUSR1 drain flag, the soft TTL and the soft message
//! cap. All three are checked between messages only; an in-flight handler
//! always runs to completion. The worker also exits when its parent is no
//! longer the master that forked it, which covers master crashes without
//! relying on signal delivery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{getppid, Pid};
use tracing::debug;

use crate::job::Job;
use crate::logger::Logger;
use crate::proctitle;

/// How long a single `pop` may wait; also the granularity at which the exit
/// triggers are observed.
const POP_TIMEOUT: Duration = Duration::from_secs(1);

/// Granularity of the back-off wait, so a drain request still cancels it.
const BACKOFF_SLICE: Duration = Duration::from_secs(1);

static EXIT_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigusr1(_: libc::c_int) {
    EXIT_REQUESTED.store(true, Ordering::SeqCst);
}

fn install_exit_handler() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_sigusr1),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGUSR1, &action) }.map(|_| ())
}

/// Runs the worker contract for `job` and returns the process exit status.
///
/// `master_pid` is the PID of the forking master, captured for the orphan
/// check. The caller (the forked child) must pass the returned status to
/// `std::process::exit` without unwinding further.
pub(crate) fn run(job: &mut Job, master_pid: Pid, logger: &Logger) -> i32 {
    proctitle::set_title(&format!("quevisor: worker {}", job.topic()));

    let started = Instant::now();
    let mut consumed: u64 = 0;

    // The flag and handler state inherited across fork belong to the master;
    // reset both before anything can observe them.
    EXIT_REQUESTED.store(false, Ordering::SeqCst);
    if let Err(err) = install_exit_handler() {
        logger.error(&format!(
            "worker for topic {} could not install signal handler: {}",
            job.topic(),
            err
        ));
        return 1;
    }

    // The queue handle in this address space is the master's. Drop it; our
    // own connection opens lazily on the first pop.
    job.disconnect_queue();

    // Crash back-off imposed by the master: wait it out before consuming,
    // in slices so a drain request still wins.
    while let Some(remaining) = job.backoff_remaining() {
        if EXIT_REQUESTED.load(Ordering::SeqCst) {
            return 0;
        }
        debug!(topic = %job.topic(), ?remaining, "back-off wait");
        std::thread::sleep(remaining.min(BACKOFF_SLICE));
    }

    logger.info(&format!("worker started for topic {}", job.topic()));

    loop {
        if getppid() != master_pid {
            logger.info(&format!(
                "worker for topic {} orphaned, exiting",
                job.topic()
            ));
            break;
        }
        if EXIT_REQUESTED.load(Ordering::SeqCst) {
            break;
        }
        if recycle_due(started.elapsed(), job.max_execute_secs(), consumed, job.max_consume_count()) {
            logger.info(&format!(
                "worker for topic {} recycling after {}s / {} messages",
                job.topic(),
                started.elapsed().as_secs(),
                consumed
            ));
            break;
        }

        match job.pop(POP_TIMEOUT) {
            Ok(Some(payload)) => {
                if let Err(err) = job.handle(&payload) {
                    logger.error(&format!(
                        "handler for topic {} failed: {:#}",
                        job.topic(),
                        err
                    ));
                    return 1;
                }
                consumed += 1;
            }
            Ok(None) => {}
            Err(err) => {
                logger.error(&format!("queue error on topic {}: {}", job.topic(), err));
                return 1;
            }
        }
    }

    0
}

/// Whether the time- or count-based recycling limit has been crossed.
fn recycle_due(elapsed: Duration, max_execute_secs: u64, consumed: u64, max_consume: u64) -> bool {
    if max_execute_secs > 0 && elapsed.as_secs() > max_execute_secs {
        return true;
    }
    if max_consume > 0 && consumed > max_consume {
        return true;
    }
    false
}
