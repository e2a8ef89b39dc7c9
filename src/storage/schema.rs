//! Database schema constants.
//!
//! This module contains the SQL schema for the PostgreSQL job store.

/// SQL schema for creating the scans table.
pub const CREATE_SCANS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS scans (
    id BIGSERIAL PRIMARY KEY,
    job_id VARCHAR(64) NOT NULL UNIQUE,
    target VARCHAR(255) NOT NULL,
    user_id VARCHAR(64) NOT NULL,
    status VARCHAR(16) NOT NULL DEFAULT 'queued'
        CHECK (status IN ('queued', 'running', 'done', 'error')),
    progress_data JSONB,
    results JSONB,
    result_ref TEXT,
    error_message TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    completed_at TIMESTAMPTZ
)
"#;

/// Index backing the reconciler's stale-job sweep.
pub const CREATE_STATUS_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_scans_status_updated_at ON scans(status, updated_at)
"#;

/// Index for per-user job listings.
pub const CREATE_USER_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_scans_user_id ON scans(user_id)
"#;

/// Returns all schema creation statements in the correct order.
///
/// Each entry is a single statement so it can run as a prepared query.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![CREATE_SCANS_TABLE, CREATE_STATUS_INDEX, CREATE_USER_INDEX]
}

/// Table names in the schema.
pub mod tables {
    /// Scan jobs table name.
    pub const SCANS: &str = "scans";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_schema_statements_order() {
        let statements = all_schema_statements();
        assert_eq!(statements.len(), 3);
        assert!(statements[0].contains("CREATE TABLE IF NOT EXISTS scans"));
        assert!(statements[1..].iter().all(|s| s.contains("CREATE INDEX")));
        assert!(statements.iter().all(|s| !s.trim().contains(';')));
    }

    #[test]
    fn test_scans_table_has_required_columns() {
        for column in [
            "job_id",
            "status",
            "progress_data",
            "results",
            "error_message",
            "created_at",
            "updated_at",
            "completed_at",
        ] {
            assert!(CREATE_SCANS_TABLE.contains(column), "missing {}", column);
        }
        assert!(CREATE_SCANS_TABLE.contains("UNIQUE"));
    }
}
