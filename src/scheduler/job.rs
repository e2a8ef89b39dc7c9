//! Job definitions for the scheduler.
//!
//! This module defines the core job types used in the scheduling system:
//!
//! - `JobRequest`: What a producer asks for (`job_id`, `target`, `user_id`)
//! - `QueueEntry`: The JSON payload pushed onto the work queue
//! - `JobStatus`: The `queued -> running -> {done | error}` state machine
//! - `JobRecord`: A row of the authoritative `scans` table

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::scheduler::progress::ProgressRecord;

/// Maximum accepted length of a job identifier.
pub const MAX_JOB_ID_LEN: usize = 64;

/// Maximum accepted length of a scan target.
pub const MAX_TARGET_LEN: usize = 255;

/// Maximum accepted length of a user identifier.
pub const MAX_USER_ID_LEN: usize = 64;

/// Lifecycle status of a scan job.
///
/// Transitions are one-directional: `Queued -> Running -> Done` or
/// `Queued -> Running -> Error`. Terminal states never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in the work queue.
    Queued,
    /// Claimed by a worker; the executor is (or is about to be) running.
    Running,
    /// Executor exited successfully.
    Done,
    /// Executor failed, timed out, was refused, or the job went stale.
    Error,
}

impl JobStatus {
    /// Returns the lowercase wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        }
    }

    /// Returns whether no further transition is allowed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }

    /// Returns whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Done)
                | (JobStatus::Running, JobStatus::Error)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown status name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "done" | "completed" => Ok(JobStatus::Done),
            "error" | "failed" => Ok(JobStatus::Error),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// A request to scan `target` on behalf of `user_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    /// Caller-assigned identifier; not deduplicated.
    pub job_id: String,
    /// Domain or address to scan.
    pub target: String,
    /// Opaque owner identifier (consent tracking).
    pub user_id: String,
}

impl JobRequest {
    /// Creates a new request without validating it.
    pub fn new(
        job_id: impl Into<String>,
        target: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            target: target.into(),
            user_id: user_id.into(),
        }
    }

    /// Checks that every field is present and within bounds.
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_field("job_id", &self.job_id, MAX_JOB_ID_LEN)?;
        check_field("target", &self.target, MAX_TARGET_LEN)?;
        check_field("user_id", &self.user_id, MAX_USER_ID_LEN)?;
        Ok(())
    }

    /// Converts the request into a queue entry stamped with the current time.
    pub fn into_entry(self) -> QueueEntry {
        QueueEntry {
            job_id: self.job_id,
            target: self.target,
            user_id: self.user_id,
            enqueued_at: timestamp(Utc::now()),
            status: JobStatus::Queued,
        }
    }
}

fn check_field(name: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField(name));
    }
    if value.chars().count() > max {
        return Err(ValidationError::FieldTooLong { field: name, max });
    }
    Ok(())
}

/// Formats a timestamp the way queue payloads carry it (`...Z`).
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// The JSON object stored in the work queue list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: String,
    pub target: String,
    pub user_id: String,
    pub enqueued_at: String,
    pub status: JobStatus,
}

impl QueueEntry {
    /// Parses a raw queue payload.
    ///
    /// Fails for invalid JSON, missing fields, or blank required values.
    pub fn parse(raw: &str) -> Result<Self, MalformedEntry> {
        let entry: QueueEntry =
            serde_json::from_str(raw).map_err(|e| MalformedEntry(e.to_string()))?;
        JobRequest::new(&entry.job_id, &entry.target, &entry.user_id)
            .validate()
            .map_err(|e| MalformedEntry(e.to_string()))?;
        Ok(entry)
    }

    /// Serializes the entry for the queue.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A queue payload that could not be turned into a job.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed queue entry: {0}")]
pub struct MalformedEntry(pub String);

/// A row of the `scans` table.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub job_id: String,
    pub target: String,
    pub user_id: String,
    pub status: JobStatus,
    pub progress: Option<ProgressRecord>,
    pub results: Option<serde_json::Value>,
    pub result_ref: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Creates a fresh `queued` record for an entry.
    pub fn queued(entry: &QueueEntry, now: DateTime<Utc>) -> Self {
        Self {
            job_id: entry.job_id.clone(),
            target: entry.target.clone(),
            user_id: entry.user_id.clone(),
            status: JobStatus::Queued,
            progress: None,
            results: None,
            result_ref: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Done));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Error));

        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Done));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Error));
        assert!(!JobStatus::Done.can_transition_to(JobStatus::Error));
        assert!(!JobStatus::Error.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Queued));
    }

    #[test]
    fn test_status_display_and_parse() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Done,
            JobStatus::Error,
        ] {
            assert_eq!(status.to_string().parse::<JobStatus>(), Ok(status));
        }
        assert_eq!("completed".parse::<JobStatus>(), Ok(JobStatus::Done));
        assert!("paused".parse::<JobStatus>().is_err());
        assert!(JobStatus::Done.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn test_request_validation() {
        assert!(JobRequest::new("j1", "example.com", "u1").validate().is_ok());
        assert_eq!(
            JobRequest::new("", "example.com", "u1").validate(),
            Err(ValidationError::MissingField("job_id"))
        );
        assert_eq!(
            JobRequest::new("j1", "  ", "u1").validate(),
            Err(ValidationError::MissingField("target"))
        );
        assert_eq!(
            JobRequest::new("j1", "example.com", "").validate(),
            Err(ValidationError::MissingField("user_id"))
        );
        assert!(matches!(
            JobRequest::new("j1", "a".repeat(300), "u1").validate(),
            Err(ValidationError::FieldTooLong { field: "target", .. })
        ));
    }

    #[test]
    fn test_entry_payload_shape() {
        let entry = JobRequest::new("j1", "example.com", "u1").into_entry();
        assert_eq!(entry.status, JobStatus::Queued);
        assert!(entry.enqueued_at.ends_with('Z'));

        let json: serde_json::Value =
            serde_json::from_str(&entry.to_json().expect("serializes")).expect("valid json");
        assert_eq!(json["job_id"], "j1");
        assert_eq!(json["target"], "example.com");
        assert_eq!(json["user_id"], "u1");
        assert_eq!(json["status"], "queued");
        assert!(json["enqueued_at"].is_string());
    }

    #[test]
    fn test_parse_rejects_malformed_payloads() {
        assert!(QueueEntry::parse("not json").is_err());
        assert!(QueueEntry::parse(r#"{"job_id":"j1"}"#).is_err());
        assert!(QueueEntry::parse(
            r#"{"job_id":"","target":"t","user_id":"u","enqueued_at":"x","status":"queued"}"#
        )
        .is_err());

        let ok = QueueEntry::parse(
            r#"{"job_id":"j1","target":"example.com","user_id":"u1","enqueued_at":"2024-01-01T00:00:00Z","status":"queued"}"#,
        )
        .expect("valid entry");
        assert_eq!(ok.job_id, "j1");
    }
}
