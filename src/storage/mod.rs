//! PostgreSQL persistent storage for scan jobs.
//!
//! # Overview
//!
//! The storage system consists of:
//! - **JobStore**: the trait the scheduler writes job state through
//! - **Database**: PostgreSQL implementation over the `scans` table
//! - **Migrations**: Schema management and versioning
//!
//! # Usage
//!
//! ```rust,ignore
//! use recon_queue::config::StoreConfig;
//! use recon_queue::retry::RetryPolicy;
//! use recon_queue::storage::{Database, JobStore};
//!
//! let db = Database::connect(&StoreConfig::default(), RetryPolicy::startup()).await?;
//! db.run_migrations().await?;
//!
//! if let Some(job) = db.get("scan123").await? {
//!     println!("{} is {}", job.job_id, job.status);
//! }
//! ```

pub mod database;
pub mod migrations;
pub mod schema;

// Re-export main types for convenience
pub use database::{Database, JobStore, StoreError};
pub use migrations::{MigrationError, MigrationRunner};
