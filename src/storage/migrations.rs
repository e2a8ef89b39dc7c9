//! Schema setup for the `scans` table.
//!
//! Every statement in [`super::schema`] is idempotent (`IF NOT EXISTS`), so
//! the whole schema is applied in one transaction on each run.

use sqlx::PgPool;
use thiserror::Error;

use super::schema::{self, tables};

/// Errors that can occur while applying the schema.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Database query failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A schema statement failed to execute.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

/// Applies and resets the job store schema.
pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    /// Creates a new migration runner.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies the schema and returns how many statements ran.
    pub async fn run_migrations(&self) -> Result<usize, MigrationError> {
        let statements = schema::all_schema_statements();
        let mut tx = self.pool.begin().await?;

        for (idx, statement) in statements.iter().enumerate() {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| MigrationError::MigrationFailed(format!("statement {}: {}", idx, e)))?;
        }

        tx.commit().await?;
        Ok(statements.len())
    }

    /// Drops the job table.
    ///
    /// **WARNING**: This will destroy all data! Use only in development/testing.
    pub async fn reset_database(&self) -> Result<(), MigrationError> {
        let statement = format!("DROP TABLE IF EXISTS {} CASCADE", tables::SCANS);
        sqlx::query(&statement)
            .execute(&self.pool)
            .await
            .map_err(|e| MigrationError::MigrationFailed(format!("Drop failed: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_error_display() {
        let err = MigrationError::MigrationFailed("statement 1: syntax error".to_string());
        assert_eq!(err.to_string(), "Migration failed: statement 1: syntax error");
    }
}
