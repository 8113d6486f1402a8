use serde::Deserialize;
use std::time::Duration;

use crate::services::worker::WorkerSettings;
use crate::store::RecoveryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the job queue and progress channel
    pub redis_url: String,

    /// Directory for uploaded files when no R2 bucket is configured
    #[serde(default = "default_storage_dir")]
    pub storage_dir: String,

    /// R2 bucket name; enables R2 storage together with the other R2 settings
    pub r2_bucket: Option<String>,

    /// R2 endpoint URL
    pub r2_endpoint: Option<String>,

    /// R2 access key ID (S3-compatible)
    pub r2_access_key: Option<String>,

    /// R2 secret access key (S3-compatible)
    pub r2_secret_key: Option<String>,

    /// Largest accepted upload, in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,

    /// Rows processed between two checkpoints (and cancellation polls)
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u32,

    /// Attempts for a row hitting transient errors before it is recorded as failed
    #[serde(default = "default_row_retry_attempts")]
    pub row_retry_attempts: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// A processing job without a heartbeat for this long is considered abandoned
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    /// A pending job not picked up for this long is published again
    #[serde(default = "default_pending_requeue_after_secs")]
    pub pending_requeue_after_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Unacknowledged deliveries are redelivered after this long
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    /// Stable identity of a worker process; generated when unset
    pub worker_id: Option<String>,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Prometheus listener for the worker process (e.g., "0.0.0.0:9100")
    pub worker_metrics_addr: Option<String>,
}

/// R2 settings, present only when all four are configured.
#[derive(Debug, Clone, Copy)]
pub struct R2Settings<'a> {
    pub bucket: &'a str,
    pub endpoint: &'a str,
    pub access_key: &'a str,
    pub secret_key: &'a str,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_storage_dir() -> String {
    "./data/uploads".to_string()
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_checkpoint_interval() -> u32 {
    100
}

fn default_row_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_stale_after_secs() -> u64 {
    300
}

fn default_pending_requeue_after_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_visibility_timeout_secs() -> u64 {
    900
}

fn default_worker_concurrency() -> usize {
    1
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn r2(&self) -> Option<R2Settings<'_>> {
        Some(R2Settings {
            bucket: self.r2_bucket.as_deref()?,
            endpoint: self.r2_endpoint.as_deref()?,
            access_key: self.r2_access_key.as_deref()?,
            secret_key: self.r2_secret_key.as_deref()?,
        })
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            checkpoint_interval: self.checkpoint_interval.max(1),
            row_retry_attempts: self.row_retry_attempts.max(1),
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            stale_after: Duration::from_secs(self.stale_after_secs),
        }
    }

    pub fn recovery_policy(&self) -> RecoveryPolicy {
        RecoveryPolicy {
            pending_after: Duration::from_secs(self.pending_requeue_after_secs),
            stale_after: Duration::from_secs(self.stale_after_secs),
            batch_size: 100,
        }
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}
