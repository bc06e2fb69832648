//! quevisor: a forking supervisor for queue-consuming background workers.
//!
//! A master process maintains a configured baseline of worker processes per
//! topic, bursts extra short-lived workers when a topic's backlog crosses a
//! health threshold, and recycles workers on soft time/count limits so leaks
//! and stale connections heal themselves. Topics come in two shapes backed
//! by a Redis-like server: FIFO (immediate work, list semantics) and delay
//! (scheduled work, fires at-or-after an eligibility time).
//!
//! Lifecycle is driven through four commands (start, stop, restart,
//! status), where `start` daemonizes and `stop` is a cooperative handshake
//! through the PID file (writing `0` asks the master to drain).
//!
//! # Example
//!
//! ```no_run
//! use quevisor::{cli, Job, QueueConfig, QueueKind, Supervisor, SupervisorConfig};
//!
//! fn deliver_email(payload: &str) -> anyhow::Result<()> {
//!     println!("sending {payload}");
//!     Ok(())
//! }
//!
//! let mut supervisor = Supervisor::new(SupervisorConfig::new("/var/run/myapp"));
//! supervisor.register(
//!     Job::new("emails", QueueKind::Fifo, |payload: &str| deliver_email(payload))
//!         .with_static_workers(2)
//!         .with_dynamic_workers(4)
//!         .with_health_queue_length(100)
//!         .with_max_execute_secs(3600)
//!         .with_queue_config(QueueConfig::new("127.0.0.1", 6379)),
//! );
//!
//! let program: String = std::env::args().next().unwrap_or_default();
//! let command: Option<String> = std::env::args().nth(1);
//! std::process::exit(cli::run(&mut supervisor, &program, command.as_deref()));
//! ```
//!
//! Producers enqueue through the same descriptor without any supervisor
//! running: [`Job::deliver`] pushes immediate or scheduled work, and
//! [`Job::revoke_delay`] withdraws a scheduled payload before it fires.

pub mod cli;
mod daemon;
pub mod job;
pub mod logger;
pub mod pidfile;
mod proctitle;
pub mod queue;
pub mod supervisor;
mod worker;

pub use cli::Command;
pub use job::{Job, JobHandler};
pub use queue::{QueueConfig, QueueError, QueueKind};
pub use supervisor::{Supervisor, SupervisorConfig, SupervisorError};
