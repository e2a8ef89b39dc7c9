//! PostgreSQL job store.
//!
//! This module defines the [`JobStore`] seam the scheduler writes through and
//! its PostgreSQL implementation on top of sqlx. The `scans` table is the
//! authoritative record of job state; every status transition is a single
//! guarded `UPDATE` so a terminal row can never move again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::info;

use crate::config::StoreConfig;
use crate::retry::{with_backoff, RetryPolicy};
use crate::scheduler::job::{JobRecord, JobStatus, QueueEntry};
use crate::scheduler::progress::ProgressRecord;

use super::migrations::{MigrationError, MigrationRunner};

/// Errors that can occur during job store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A row held a value the scheduler does not understand.
    #[error("Invalid row for job {job_id}: {reason}")]
    InvalidRow { job_id: String, reason: String },

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    /// The store refused the write (used by in-memory stores).
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Durable, authoritative job state.
///
/// Transition methods return `Ok(false)` when the row was not in the
/// required source state, so callers can detect a lost race without
/// treating it as a fault.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a `queued` row; an existing row with the same id is left untouched.
    async fn insert_queued(&self, entry: &QueueEntry) -> Result<(), StoreError>;

    /// `queued -> running`. Creates the row when the producer did not.
    async fn mark_running(
        &self,
        job_id: &str,
        target: &str,
        user_id: &str,
    ) -> Result<bool, StoreError>;

    /// `running -> done`, storing the result reference and artifact.
    async fn mark_done(
        &self,
        job_id: &str,
        result_ref: Option<&str>,
        results: Option<&serde_json::Value>,
    ) -> Result<bool, StoreError>;

    /// `running -> error` with a human-readable cause.
    async fn mark_error(&self, job_id: &str, message: &str) -> Result<bool, StoreError>;

    /// Writes the progress annotation of a running job and refreshes `updated_at`.
    async fn update_progress(
        &self,
        job_id: &str,
        record: &ProgressRecord,
    ) -> Result<(), StoreError>;

    /// Fetches a job row.
    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError>;

    /// Moves every `running` job last updated before `cutoff` to `error`.
    ///
    /// Returns the ids that were transitioned; each appears at most once.
    async fn fail_stale(
        &self,
        cutoff: DateTime<Utc>,
        message: &str,
    ) -> Result<Vec<String>, StoreError>;
}

/// PostgreSQL database client.
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connects to the database, retrying with backoff.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` once the retry policy is exhausted.
    pub async fn connect(config: &StoreConfig, retry: RetryPolicy) -> Result<Self, StoreError> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.database);

        let pool = with_backoff("postgres connect", retry, || {
            PgPoolOptions::new()
                .max_connections(config.max_connections)
                .min_connections(1)
                .acquire_timeout(std::time::Duration::from_secs(30))
                .connect_with(options.clone())
        })
        .await
        .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        info!(host = %config.host, database = %config.database, "Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs database migrations.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        let runner = MigrationRunner::new(self.pool.clone());
        runner.run_migrations().await?;
        Ok(())
    }

    /// Closes every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn record_from_row(row: &PgRow) -> Result<JobRecord, StoreError> {
    let job_id: String = row.try_get("job_id")?;
    let status_raw: String = row.try_get("status")?;
    let status: JobStatus = status_raw.parse().map_err(|e| StoreError::InvalidRow {
        job_id: job_id.clone(),
        reason: format!("{}", e),
    })?;

    let progress_json: Option<serde_json::Value> = row.try_get("progress_data")?;
    let progress = match progress_json {
        Some(value) => Some(serde_json::from_value::<ProgressRecord>(value)?),
        None => None,
    };

    Ok(JobRecord {
        job_id,
        target: row.try_get("target")?,
        user_id: row.try_get("user_id")?,
        status,
        progress,
        results: row.try_get("results")?,
        result_ref: row.try_get("result_ref")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

#[async_trait]
impl JobStore for Database {
    async fn insert_queued(&self, entry: &QueueEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO scans (job_id, target, user_id, status, created_at, updated_at)
            VALUES ($1, $2, $3, 'queued', NOW(), NOW())
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(&entry.job_id)
        .bind(&entry.target)
        .bind(&entry.user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_running(
        &self,
        job_id: &str,
        target: &str,
        user_id: &str,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO scans (job_id, target, user_id, status, created_at, updated_at)
            VALUES ($1, $2, $3, 'running', NOW(), NOW())
            ON CONFLICT (job_id) DO UPDATE SET
                status = 'running',
                updated_at = NOW()
            WHERE scans.status = 'queued'
            RETURNING job_id
            "#,
        )
        .bind(job_id)
        .bind(target)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn mark_done(
        &self,
        job_id: &str,
        result_ref: Option<&str>,
        results: Option<&serde_json::Value>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE scans
            SET status = 'done',
                result_ref = $2,
                results = $3,
                error_message = NULL,
                updated_at = NOW(),
                completed_at = NOW()
            WHERE job_id = $1 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(result_ref)
        .bind(results.cloned())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_error(&self, job_id: &str, message: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE scans
            SET status = 'error',
                error_message = $2,
                updated_at = NOW(),
                completed_at = NOW()
            WHERE job_id = $1 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_progress(
        &self,
        job_id: &str,
        record: &ProgressRecord,
    ) -> Result<(), StoreError> {
        let progress_json = serde_json::to_value(record)?;

        sqlx::query(
            r#"
            UPDATE scans
            SET progress_data = $2,
                updated_at = NOW()
            WHERE job_id = $1 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(progress_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT job_id, target, user_id, status, progress_data, results, result_ref,
                   error_message, created_at, updated_at, completed_at
            FROM scans
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn fail_stale(
        &self,
        cutoff: DateTime<Utc>,
        message: &str,
    ) -> Result<Vec<String>, StoreError> {
        // One statement: each stale row is matched and transitioned once.
        let rows = sqlx::query(
            r#"
            UPDATE scans
            SET status = 'error',
                error_message = $1,
                updated_at = NOW(),
                completed_at = NOW()
            WHERE status = 'running' AND updated_at < $2
            RETURNING job_id
            "#,
        )
        .bind(message)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut job_ids = Vec::with_capacity(rows.len());
        for row in rows {
            job_ids.push(row.try_get("job_id")?);
        }
        Ok(job_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::ConnectionFailed("connection refused".to_string());
        assert!(err.to_string().contains("connection refused"));

        let err = StoreError::InvalidRow {
            job_id: "j1".to_string(),
            reason: "unknown job status 'paused'".to_string(),
        };
        assert!(err.to_string().contains("j1"));
        assert!(err.to_string().contains("paused"));
    }
}
