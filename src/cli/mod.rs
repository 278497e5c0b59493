//! Command-line interface for dispatchq.
//!
//! Provides diagnostic commands for the store connection, queue primitives
//! and distributed locks.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands, LockCommand, QueueCommand};
