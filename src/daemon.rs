//! Detaching the master from its controlling terminal.
//!
//! `start` runs in the invoking shell's process; [`daemonize`] turns that
//! process into the long-lived master by forking (the shell-facing parent
//! exits), starting a new session, moving to `/` and clearing the umask.
//! Stdin is pointed at `/dev/null`; stdout and stderr stay open so stray
//! diagnostics remain visible to whoever captured them.

use std::fs::File;
use std::os::unix::io::AsRawFd;

use anyhow::Context;
use nix::sys::stat::{umask, Mode};
use nix::unistd::{chdir, fork, setsid, ForkResult};

/// Whether the process was launched from an interactive command-line
/// context. The supervisor refuses to run anywhere else (web workers,
/// pipelines), where forking a process tree would outlive the host in
/// surprising ways.
pub(crate) fn launched_from_cli() -> bool {
    atty::is(atty::Stream::Stdin) && atty::is(atty::Stream::Stdout)
}

/// Detaches the current process. On return the caller is the session-leading
/// daemon child; the original foreground process has already exited.
pub(crate) fn daemonize() -> anyhow::Result<()> {
    match unsafe { fork() }.context("daemonize fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    setsid().context("setsid failed")?;
    chdir("/").context("chdir to / failed")?;
    umask(Mode::empty());

    let devnull = File::open("/dev/null").context("open /dev/null failed")?;
    // SAFETY: both descriptors are valid for the duration of the call.
    let rc = unsafe { libc::dup2(devnull.as_raw_fd(), libc::STDIN_FILENO) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error()).context("redirect stdin failed");
    }

    Ok(())
}
