//! recon-queue: a job queue and supervised worker pool for reconnaissance scans.
//!
//! Scan requests are pushed onto a Redis list, claimed by workers, run by an
//! external executor under a wall-clock limit and recorded in PostgreSQL.

pub mod cli;
pub mod config;
pub mod error;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod storage;

// Re-export commonly used error types
pub use error::{AuthorizationError, JobFailure, ValidationError};
