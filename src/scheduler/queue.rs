//! Redis-backed work queue and job status cache.
//!
//! # Queue Structure
//!
//! - `{queue_name}`: a Redis list of JSON [`QueueEntry`] payloads. Producers
//!   `RPUSH`, workers `BLPOP`, so entries are consumed in FIFO order.
//! - `job:{job_id}`: a hash mirroring the job's status for fast polling,
//!   expiring seven days after its last write.
//!
//! The list holds only work not yet claimed. Once a worker pops an entry
//! it exists only in that worker's memory until the job store records it as
//! `running`; a crash in that window leaves the row `queued` and nothing
//! re-delivers the entry.
//!
//! The cache is advisory. The `scans` table in the job store is the source
//! of truth and cache writes are best-effort.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tracing::info;

use crate::config::QueueConfig;
use crate::retry::{with_backoff, RetryPolicy};

use super::job::{timestamp, JobStatus, QueueEntry};

/// Seconds a `job:{id}` hash lives after its last write (7 days).
pub const CACHE_TTL_SECS: i64 = 604_800;

/// Returns the cache key for a job.
pub fn cache_key(job_id: &str) -> String {
    format!("job:{}", job_id)
}

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize an entry.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// The backend refused the operation (used by in-memory queues).
    #[error("Queue unavailable: {0}")]
    Unavailable(String),
}

/// FIFO of raw queue payloads.
///
/// Payloads are passed through untouched so a malformed entry can be
/// logged verbatim by the consumer.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Appends a payload to the tail. Returns the queue length afterwards.
    async fn push(&self, payload: &str) -> Result<usize, QueueError>;

    /// Removes and returns the head, waiting up to `timeout` for one.
    async fn pop(&self, timeout: Duration) -> Result<Option<String>, QueueError>;

    /// Puts a payload back at the head, ahead of everything else.
    async fn requeue_front(&self, payload: &str) -> Result<(), QueueError>;

    /// Number of payloads waiting.
    async fn len(&self) -> Result<usize, QueueError>;
}

/// Short-lived status mirror keyed by job id.
#[async_trait]
pub trait StatusCache: Send + Sync {
    /// Writes the full entry with status `queued`.
    async fn record_enqueued(&self, entry: &QueueEntry) -> Result<(), QueueError>;

    /// Updates the status field and refreshes the expiry.
    async fn set_status(&self, job_id: &str, status: JobStatus) -> Result<(), QueueError>;

    /// Reads every cached field of a job, if present.
    async fn get_status(&self, job_id: &str)
        -> Result<Option<HashMap<String, String>>, QueueError>;
}

/// Fields written to the cache hash for a freshly enqueued job.
pub fn entry_fields(entry: &QueueEntry) -> Vec<(&'static str, String)> {
    vec![
        ("job_id", entry.job_id.clone()),
        ("target", entry.target.clone()),
        ("user_id", entry.user_id.clone()),
        ("status", entry.status.as_str().to_string()),
        ("enqueued_at", entry.enqueued_at.clone()),
    ]
}

/// Redis work queue and status cache.
///
/// `BLPOP` parks the connection it runs on, so each worker should own its
/// own `JobQueue` rather than share one.
pub struct JobQueue {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    /// Name of the main queue.
    queue_name: String,
}

impl JobQueue {
    /// Connects to Redis, retrying with backoff, and verifies with `PING`.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` once the retry policy is exhausted.
    pub async fn connect(config: &QueueConfig, retry: RetryPolicy) -> Result<Self, QueueError> {
        let url = config.redis_url();
        let url = url.as_str();
        let redis = with_backoff("redis connect", retry, || async move {
            let client = redis::Client::open(url)?;
            let mut conn = ConnectionManager::new(client).await?;
            redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
            Ok::<_, redis::RedisError>(conn)
        })
        .await
        .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        info!(
            host = %config.host,
            port = config.port,
            queue = %config.queue_name,
            "Connected to Redis"
        );
        Ok(Self::from_connection(redis, &config.queue_name))
    }

    /// Creates a JobQueue from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager, queue_name: &str) -> Self {
        Self {
            redis,
            queue_name: queue_name.to_string(),
        }
    }

    /// Returns the queue name.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }
}

#[async_trait]
impl WorkQueue for JobQueue {
    async fn push(&self, payload: &str) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.rpush(&self.queue_name, payload).await?;
        Ok(len)
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<String>, QueueError> {
        let mut conn = self.redis.clone();
        let timeout_secs = timeout.as_secs().max(1);

        let result: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(&self.queue_name)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        Ok(result.map(|(_, payload)| payload))
    }

    async fn requeue_front(&self, payload: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(&self.queue_name, payload).await?;
        Ok(())
    }

    async fn len(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(&self.queue_name).await?;
        Ok(len)
    }
}

#[async_trait]
impl StatusCache for JobQueue {
    async fn record_enqueued(&self, entry: &QueueEntry) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let key = cache_key(&entry.job_id);
        let fields = entry_fields(entry);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(&key, &fields)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(CACHE_TTL_SECS)
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }

    async fn set_status(&self, job_id: &str, status: JobStatus) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let key = cache_key(job_id);
        let fields = [
            ("status", status.as_str().to_string()),
            ("updated_at", timestamp(Utc::now())),
        ];

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(&key, &fields)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(CACHE_TTL_SECS)
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }

    async fn get_status(
        &self,
        job_id: &str,
    ) -> Result<Option<HashMap<String, String>>, QueueError> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, String> = conn.hgetall(cache_key(job_id)).await?;
        Ok(if fields.is_empty() { None } else { Some(fields) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::JobRequest;

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));

        let err = QueueError::Unavailable("injected".to_string());
        assert!(err.to_string().contains("injected"));
    }

    #[test]
    fn test_cache_key() {
        assert_eq!(cache_key("scan123"), "job:scan123");
    }

    #[test]
    fn test_entry_fields_start_queued() {
        let entry = JobRequest::new("j1", "example.com", "u1").into_entry();
        let fields: HashMap<_, _> = entry_fields(&entry).into_iter().collect();

        assert_eq!(fields["job_id"], "j1");
        assert_eq!(fields["target"], "example.com");
        assert_eq!(fields["user_id"], "u1");
        assert_eq!(fields["status"], "queued");
        assert_eq!(fields["enqueued_at"], entry.enqueued_at);
    }

    #[test]
    fn test_cache_ttl_is_seven_days() {
        assert_eq!(CACHE_TTL_SECS, 7 * 24 * 60 * 60);
    }
}
