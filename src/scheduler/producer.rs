//! Job producer.
//!
//! Validates a scan request and hands it to the work queue. The producer
//! also seeds the status cache and, when given a store, the `queued` row.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::ScanAuthorization;
use crate::error::{AuthorizationError, ValidationError};
use crate::storage::{JobStore, StoreError};

use super::job::JobRequest;
use super::queue::{QueueError, StatusCache, WorkQueue};

/// Errors returned by [`Producer::enqueue`].
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    #[error("Failed to enqueue job: {0}")]
    Queue(#[from] QueueError),

    #[error("Failed to record job: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to serialize job: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Publishes scan jobs.
pub struct Producer {
    queue: Arc<dyn WorkQueue>,
    cache: Arc<dyn StatusCache>,
    store: Option<Arc<dyn JobStore>>,
    authorization: ScanAuthorization,
}

impl Producer {
    /// Creates a producer writing to `queue` and mirroring into `cache`.
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        cache: Arc<dyn StatusCache>,
        authorization: ScanAuthorization,
    ) -> Self {
        Self {
            queue,
            cache,
            store: None,
            authorization,
        }
    }

    /// Also inserts a `queued` row into `store` before publishing.
    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Enqueues a scan and returns the queue depth right after the push.
    ///
    /// Nothing is written when validation or authorization fails. The cache
    /// mirror is best-effort; a failed cache write is logged only.
    pub async fn enqueue(
        &self,
        job_id: &str,
        target: &str,
        user_id: &str,
    ) -> Result<usize, EnqueueError> {
        let request = JobRequest::new(job_id, target, user_id);
        request.validate()?;
        self.authorization.check()?;

        let entry = request.into_entry();
        let payload = entry.to_json()?;

        if let Some(store) = &self.store {
            store.insert_queued(&entry).await?;
        }

        let position = self.queue.push(&payload).await?;

        if let Err(e) = self.cache.record_enqueued(&entry).await {
            warn!(job_id = %entry.job_id, error = %e, "Could not mirror job into status cache");
        }

        info!(
            job_id = %entry.job_id,
            target = %entry.target,
            position = position,
            "Job enqueued"
        );
        Ok(position)
    }
}
