//! Scan execution.
//!
//! # Architecture
//!
//! ```text
//! Worker → ScanExecutor ─┬─ ProcessSupervisor → scan executor process tree
//!                        └─ MockExecutor      → canned results
//! ```
//!
//! The worker owns the job's [`crate::scheduler::ProgressTracker`]; executors
//! only send [`crate::scheduler::ProgressEvent`]s over a channel.

pub mod executor;
pub mod supervisor;

pub use executor::{
    load_result_artifact, result_path, MockExecutor, MockOutcome, ScanExecutor, ScanOutput,
    ScanRequest,
};
pub use supervisor::{ProcessOutput, ProcessSupervisor, SupervisorError};
