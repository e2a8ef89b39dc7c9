//! Error types shared across the scan queue.
//!
//! Subsystem errors (`QueueError`, `StoreError`, `SupervisorError`, ...) live
//! next to the code that raises them. This module holds the cross-cutting
//! ones:
//! - Request validation before anything is written
//! - The scan authorization policy block
//! - Per-job failures, whose `Display` is what lands in `scans.error_message`

use std::borrow::Borrow;
use std::time::Duration;

use thiserror::Error;

/// Environment variable that must be set before any scan may run.
pub const AUTHORIZATION_ENV: &str = "ALLOW_SCANS";

/// Maximum number of stderr characters kept in an executor failure message.
pub const STDERR_EXCERPT_CHARS: usize = 2000;

/// A job request was rejected before any queue or store write.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Field '{field}' exceeds {max} characters")]
    FieldTooLong { field: &'static str, max: usize },
}

/// Scanning was attempted without the operator authorization flag.
///
/// Kept separate from other failures so operators can tell a policy block
/// from a fault.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("scan authorization flag {AUTHORIZATION_ENV} is not set")]
pub struct AuthorizationError;

/// Terminal failure of a single job.
#[derive(Debug, Error)]
pub enum JobFailure {
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    #[error("failed to start scan executor: {0}")]
    Spawn(String),

    #[error("Job timed out after {} seconds", display_secs(.0))]
    Timeout(Duration),

    #[error("Scan executor exited with code {code}: {stderr}")]
    ExecutorFailure { code: i32, stderr: String },

    #[error("scan executor error: {0}")]
    Executor(String),
}

impl JobFailure {
    /// Builds an executor failure, keeping only the tail of stderr.
    pub fn executor_failure(code: i32, stderr: &str) -> Self {
        Self::ExecutorFailure {
            code,
            stderr: stderr_excerpt(stderr),
        }
    }

    /// Short machine-readable kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            JobFailure::Authorization(_) => "authorization",
            JobFailure::Spawn(_) => "spawn",
            JobFailure::Timeout(_) => "timeout",
            JobFailure::ExecutorFailure { .. } => "executor_failure",
            JobFailure::Executor(_) => "executor",
        }
    }
}

/// Formats a duration as whole seconds, or with one decimal below a
/// whole second boundary (`1800`, `0.5`, `2.3`).
pub fn display_secs(duration: impl Borrow<Duration>) -> String {
    let duration = duration.borrow();
    if duration.subsec_millis() == 0 {
        duration.as_secs().to_string()
    } else {
        format!("{:.1}", duration.as_secs_f64())
    }
}

/// Returns the last [`STDERR_EXCERPT_CHARS`] characters of `stderr`, trimmed.
pub fn stderr_excerpt(stderr: &str) -> String {
    let trimmed = stderr.trim();
    let count = trimmed.chars().count();
    if count <= STDERR_EXCERPT_CHARS {
        return trimmed.to_string();
    }
    let tail: String = trimmed.chars().skip(count - STDERR_EXCERPT_CHARS).collect();
    format!("...{}", tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_mentions_timed_out() {
        let failure = JobFailure::Timeout(Duration::from_secs(1800));
        assert_eq!(failure.to_string(), "Job timed out after 1800 seconds");
        assert_eq!(failure.kind(), "timeout");
    }

    #[test]
    fn test_sub_second_timeout_is_not_zero() {
        let failure = JobFailure::Timeout(Duration::from_millis(500));
        assert_eq!(failure.to_string(), "Job timed out after 0.5 seconds");
        assert_eq!(display_secs(Duration::from_millis(2300)), "2.3");
    }

    #[test]
    fn test_spawn_message_has_single_prefix() {
        let failure = JobFailure::Spawn("No such file or directory (os error 2)".to_string());
        assert_eq!(
            failure.to_string(),
            "failed to start scan executor: No such file or directory (os error 2)"
        );
    }

    #[test]
    fn test_authorization_is_distinct() {
        let failure = JobFailure::from(AuthorizationError);
        assert!(failure.to_string().contains("ALLOW_SCANS"));
        assert_eq!(failure.kind(), "authorization");
    }

    #[test]
    fn test_stderr_excerpt_keeps_tail() {
        let long = format!("{}END", "x".repeat(5000));
        let excerpt = stderr_excerpt(&long);
        assert!(excerpt.starts_with("..."));
        assert!(excerpt.ends_with("END"));
        assert_eq!(excerpt.chars().count(), STDERR_EXCERPT_CHARS + 3);

        assert_eq!(stderr_excerpt("  short\n"), "short");
    }

    #[test]
    fn test_executor_failure_message() {
        let failure = JobFailure::executor_failure(2, "nmap: not found\n");
        assert_eq!(
            failure.to_string(),
            "Scan executor exited with code 2: nmap: not found"
        );
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::MissingField("target");
        assert_eq!(err.to_string(), "Missing required field: target");
    }
}
