//! Lifecycle command definitions and dispatch.

use crate::daemon;
use crate::supervisor::Supervisor;

/// One of the four supervisor lifecycle commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Daemonize and run the master (notice + success if already running).
    Start,
    /// Ask the live master to drain and wait for it to exit.
    Stop,
    /// Stop, then start; aborted when the stop fails.
    Restart,
    /// Report whether a master is running.
    Status,
}

impl Command {
    /// Parses a command token. Anything unrecognized maps to `None`, for
    /// which the dispatcher prints the usage line.
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "start" => Some(Command::Start),
            "stop" => Some(Command::Stop),
            "restart" => Some(Command::Restart),
            "status" => Some(Command::Status),
            _ => None,
        }
    }
}

/// The one-line usage notice printed for unknown or missing commands.
pub fn usage(program: &str) -> String {
    format!("command usage: {} [start|stop|restart|status]", program)
}

/// Dispatches `command` against `supervisor` and returns the process exit
/// code for the host binary.
///
/// Refuses to do anything when not launched from an interactive
/// command-line context: the supervisor forks a process tree, which only
/// makes sense under an operator's shell (or an init system allocating a
/// pty), never inside a request-serving host.
pub fn run(supervisor: &mut Supervisor, program: &str, command: Option<&str>) -> i32 {
    if !daemon::launched_from_cli() {
        eprintln!("quevisor can only be driven from a command-line terminal");
        return 1;
    }

    let command = match command.and_then(Command::parse) {
        Some(command) => command,
        None => {
            println!("{}", usage(program));
            return 0;
        }
    };

    match command {
        Command::Start => start(supervisor),
        Command::Stop => {
            if supervisor.stop() {
                0
            } else {
                1
            }
        }
        Command::Restart => {
            if !supervisor.stop() {
                eprintln!("restart aborted: stop failed");
                return 1;
            }
            start(supervisor)
        }
        Command::Status => {
            supervisor.status();
            0
        }
    }
}

fn start(supervisor: &mut Supervisor) -> i32 {
    match supervisor.start() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("start failed: {}", err);
            1
        }
    }
}
