//! Runtime configuration.
//!
//! Each group is a clap `Args` struct whose fields fall back to the
//! environment variables used by the existing deployment (`REDIS_HOST`,
//! `DB_HOST`, ...), so the same values work from a `.env` file, the
//! environment, or command-line overrides.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::error::{AuthorizationError, AUTHORIZATION_ENV};
use crate::retry::RetryPolicy;

/// Default Redis list holding queued scans.
pub const DEFAULT_QUEUE_NAME: &str = "scans:queue";

/// Default executor command; the target and `--job-id=<id>` are appended.
pub const DEFAULT_EXECUTOR_COMMAND: &str = "python3 ai_services/scan_worker.py";

/// Redis connection settings for the work queue and status cache.
#[derive(Debug, Clone, Args)]
pub struct QueueConfig {
    /// Redis server hostname.
    #[arg(id = "redis_host", long = "redis-host", env = "REDIS_HOST", default_value = "localhost")]
    pub host: String,

    /// Redis server port.
    #[arg(id = "redis_port", long = "redis-port", env = "REDIS_PORT", default_value_t = 6379)]
    pub port: u16,

    /// Redis database number.
    #[arg(id = "redis_db", long = "redis-db", env = "REDIS_DB", default_value_t = 0)]
    pub db: i64,

    /// Name of the Redis list used as the work queue.
    #[arg(long = "queue-name", env = "SCAN_QUEUE_NAME", default_value = DEFAULT_QUEUE_NAME)]
    pub queue_name: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            db: 0,
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
        }
    }
}

impl QueueConfig {
    /// Connection URL for the redis client.
    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }
}

/// PostgreSQL connection settings for the job store.
#[derive(Debug, Clone, Args)]
pub struct StoreConfig {
    /// Database hostname.
    #[arg(id = "db_host", long = "db-host", env = "DB_HOST", default_value = "localhost")]
    pub host: String,

    /// Database port.
    #[arg(id = "db_port", long = "db-port", env = "DB_PORT", default_value_t = 5432)]
    pub port: u16,

    /// Database user.
    #[arg(id = "db_user", long = "db-user", env = "DB_USER", default_value = "postgres")]
    pub user: String,

    /// Database password.
    #[arg(
        id = "db_pass",
        long = "db-pass",
        env = "DB_PASS",
        default_value = "",
        hide_env_values = true
    )]
    pub password: String,

    /// Database name.
    #[arg(id = "db_name", long = "db-name", env = "DB_NAME", default_value = "aegis_recon")]
    pub database: String,

    /// Maximum pooled connections.
    #[arg(long = "db-max-connections", default_value_t = 10)]
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            database: "aegis_recon".to_string(),
            max_connections: 10,
        }
    }
}

/// Command-line view of the worker settings.
#[derive(Debug, Clone, Args)]
pub struct WorkerArgs {
    /// Number of workers to run in this process.
    #[arg(short = 'w', long, env = "SCAN_WORKERS", default_value_t = 1)]
    pub workers: usize,

    /// Seconds a blocking pop waits before the loop re-checks shutdown.
    #[arg(long, env = "POLL_TIMEOUT_SECS", default_value_t = 5)]
    pub poll_timeout_secs: u64,

    /// Wall-clock limit for one scan, in seconds.
    #[arg(long, env = "SCAN_TIMEOUT_SECS", default_value_t = 1800)]
    pub scan_timeout_secs: u64,

    /// Seconds between stuck-job sweeps.
    #[arg(long, env = "RECONCILE_INTERVAL_SECS", default_value_t = 300)]
    pub reconcile_interval_secs: u64,

    /// A running job with no update for this many seconds is failed.
    #[arg(long, env = "STALE_AFTER_SECS", default_value_t = 1800)]
    pub stale_after_secs: u64,
}

impl WorkerArgs {
    /// Converts the arguments into a [`WorkerConfig`].
    pub fn into_config(self) -> WorkerConfig {
        WorkerConfig::default()
            .with_poll_timeout(Duration::from_secs(self.poll_timeout_secs))
            .with_job_timeout(Duration::from_secs(self.scan_timeout_secs))
            .with_reconcile_interval(Duration::from_secs(self.reconcile_interval_secs))
            .with_stale_after(Duration::from_secs(self.stale_after_secs))
    }
}

/// Configuration for a worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long a blocking pop waits for an entry.
    pub poll_timeout: Duration,
    /// Maximum time allowed for one scan.
    pub job_timeout: Duration,
    /// How often the reconciler runs.
    pub reconcile_interval: Duration,
    /// Staleness threshold for running jobs.
    pub stale_after: Duration,
    /// First delay after a queue error; doubled up to `max_error_backoff`.
    pub error_backoff: Duration,
    /// Upper bound for the queue error delay.
    pub max_error_backoff: Duration,
    /// Retry policy for status transitions in the job store.
    pub store_retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(5),
            job_timeout: Duration::from_secs(1800), // 30 minutes
            reconcile_interval: Duration::from_secs(300),
            stale_after: Duration::from_secs(1800),
            error_backoff: Duration::from_secs(5),
            max_error_backoff: Duration::from_secs(30),
            store_retry: RetryPolicy::store_write(),
        }
    }
}

impl WorkerConfig {
    /// Sets the blocking pop timeout.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Sets the per-scan timeout.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Sets the reconciliation interval.
    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    /// Sets the staleness threshold.
    pub fn with_stale_after(mut self, threshold: Duration) -> Self {
        self.stale_after = threshold;
        self
    }

    /// Sets the queue error backoff bounds.
    pub fn with_error_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.error_backoff = base;
        self.max_error_backoff = max;
        self
    }

    /// Sets the store retry policy.
    pub fn with_store_retry(mut self, policy: RetryPolicy) -> Self {
        self.store_retry = policy;
        self
    }
}

/// Scan executor settings.
#[derive(Debug, Clone, Args)]
pub struct ExecutorConfig {
    /// Executor command line; target and `--job-id=<id>` are appended.
    #[arg(long = "executor", env = "SCAN_EXECUTOR", default_value = DEFAULT_EXECUTOR_COMMAND)]
    pub command: String,

    /// Use the built-in mock executor instead of spawning the scan tools.
    #[arg(long)]
    pub mock: bool,

    /// Directory the mock executor writes result artifacts to.
    #[arg(long, env = "SCAN_RESULTS_DIR")]
    pub results_dir: Option<PathBuf>,
}

impl ExecutorConfig {
    /// Splits the command line into program and leading arguments.
    pub fn command_parts(&self) -> Option<(String, Vec<String>)> {
        let mut parts = self.command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some((program, parts.collect()))
    }

    /// Directory for result artifacts, defaulting to the system temp dir.
    pub fn results_dir(&self) -> PathBuf {
        self.results_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Operator authorization to run scans.
///
/// Granted only when `ALLOW_SCANS=1`. Producers refuse to enqueue and
/// workers refuse to spawn the executor without it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanAuthorization {
    granted: bool,
}

impl ScanAuthorization {
    /// Reads the authorization flag from the environment.
    pub fn from_env() -> Self {
        Self::from_value(std::env::var(AUTHORIZATION_ENV).ok().as_deref())
    }

    /// Interprets a raw flag value; only `1` grants authorization.
    pub fn from_value(value: Option<&str>) -> Self {
        Self {
            granted: value.map(str::trim) == Some("1"),
        }
    }

    /// Explicitly granted authorization.
    pub fn granted() -> Self {
        Self { granted: true }
    }

    /// Explicitly denied authorization.
    pub fn denied() -> Self {
        Self { granted: false }
    }

    /// Returns whether scans may run.
    pub fn is_granted(&self) -> bool {
        self.granted
    }

    /// Fails with [`AuthorizationError`] unless granted.
    pub fn check(&self) -> Result<(), AuthorizationError> {
        if self.granted {
            Ok(())
        } else {
            Err(AuthorizationError)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_config_url() {
        let config = QueueConfig {
            host: "redis.internal".to_string(),
            port: 6380,
            db: 2,
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
        };
        assert_eq!(config.redis_url(), "redis://redis.internal:6380/2");
        assert_eq!(QueueConfig::default().redis_url(), "redis://localhost:6379/0");
    }

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();

        assert_eq!(config.poll_timeout, Duration::from_secs(5));
        assert_eq!(config.job_timeout, Duration::from_secs(1800));
        assert_eq!(config.reconcile_interval, Duration::from_secs(300));
        assert_eq!(config.stale_after, Duration::from_secs(1800));
        assert_eq!(config.store_retry, RetryPolicy::store_write());
    }

    #[test]
    fn test_worker_args_into_config() {
        let args = WorkerArgs {
            workers: 2,
            poll_timeout_secs: 1,
            scan_timeout_secs: 60,
            reconcile_interval_secs: 10,
            stale_after_secs: 120,
        };
        let config = args.into_config();

        assert_eq!(config.poll_timeout, Duration::from_secs(1));
        assert_eq!(config.job_timeout, Duration::from_secs(60));
        assert_eq!(config.reconcile_interval, Duration::from_secs(10));
        assert_eq!(config.stale_after, Duration::from_secs(120));
    }

    #[test]
    fn test_executor_command_parts() {
        let config = ExecutorConfig {
            command: "python3  ai_services/scan_worker.py --quiet".to_string(),
            mock: false,
            results_dir: None,
        };
        let (program, args) = config.command_parts().expect("non-empty command");
        assert_eq!(program, "python3");
        assert_eq!(args, vec!["ai_services/scan_worker.py", "--quiet"]);

        let empty = ExecutorConfig {
            command: "   ".to_string(),
            mock: false,
            results_dir: None,
        };
        assert!(empty.command_parts().is_none());
    }

    #[test]
    fn test_scan_authorization() {
        assert!(ScanAuthorization::from_value(Some("1")).is_granted());
        assert!(ScanAuthorization::from_value(Some(" 1\n")).is_granted());
        assert!(!ScanAuthorization::from_value(Some("0")).is_granted());
        assert!(!ScanAuthorization::from_value(Some("yes")).is_granted());
        assert!(!ScanAuthorization::from_value(None).is_granted());

        assert!(ScanAuthorization::granted().check().is_ok());
        assert_eq!(ScanAuthorization::denied().check(), Err(AuthorizationError));
    }
}
