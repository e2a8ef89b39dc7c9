//! Command-line interface for recon-queue.
//!
//! Provides commands for enqueueing scans, running workers, checking job
//! status, reconciling stuck jobs and managing the schema.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
