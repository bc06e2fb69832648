//! Command dispatcher for the supervisor binary.
//!
//! Translates the four lifecycle commands into supervisor actions. The host
//! binary owns real argument parsing and hands a single command token to
//! [`run`]; the idempotence notices, the usage line and the exit codes are
//! handled here.

mod commands;

pub use commands::{run, usage, Command};
