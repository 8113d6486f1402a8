//! Persistence seams for import jobs and their row errors.
//!
//! The Postgres implementation lives in [`crate::db::store`]. Every mutating
//! call that belongs to a running job is guarded by ownership: the write only
//! lands while the job is `processing` and owned by the calling worker.

use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

use crate::models::import_error::{ImportError, NewImportError};
use crate::models::job::{Checkpoint, ImportJob, JobCounters, JobRef, NewImportJob};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt job record {job_id}: {reason}")]
    Corrupt { job_id: Uuid, reason: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether repeating the same call may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, StoreError::Corrupt { .. })
    }
}

/// Result of a guarded write against a job the caller believes it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Write applied; the caller still owns the job.
    Held,
    /// The job was cancelled out-of-band; stop processing.
    Cancelled,
    /// Another worker took the job over, or it is no longer processing.
    Lost,
}

/// Progress written at every checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub counters: JobCounters,
    pub checkpoint: Checkpoint,
}

/// Terminal outcome recorded by the owning worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed(ProgressUpdate),
    Failed { message: String },
}

/// Thresholds used when looking for jobs that need a fresh queue message.
#[derive(Debug, Clone, Copy)]
pub struct RecoveryPolicy {
    /// Pending jobs whose last publish is older than this are re-published.
    pub pending_after: Duration,
    /// Processing jobs whose heartbeat is older than this are considered abandoned.
    pub stale_after: Duration,
    pub batch_size: i64,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: NewImportJob) -> Result<ImportJob, StoreError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ImportJob>, StoreError>;

    async fn list_jobs(
        &self,
        workspace_id: Uuid,
        active_only: bool,
        limit: i64,
    ) -> Result<Vec<ImportJob>, StoreError>;

    /// Record that a queue message was published for the job.
    async fn mark_enqueued(&self, job_id: Uuid) -> Result<(), StoreError>;

    /// Take ownership of a job.
    ///
    /// Succeeds for `pending` jobs and for `processing` jobs that are either
    /// already owned by `worker_id` or whose heartbeat is missing or older
    /// than `stale_after`. Returns `None` when the job cannot be claimed.
    async fn claim_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        stale_after: Duration,
    ) -> Result<Option<ImportJob>, StoreError>;

    async fn set_total_rows(
        &self,
        job_id: Uuid,
        worker_id: &str,
        total_rows: i64,
    ) -> Result<Ownership, StoreError>;

    /// Persist counters and checkpoint, refreshing the heartbeat.
    ///
    /// Doubles as the cancellation poll: a cancelled job reports
    /// [`Ownership::Cancelled`] and is left untouched.
    async fn save_progress(
        &self,
        job_id: Uuid,
        worker_id: &str,
        update: &ProgressUpdate,
    ) -> Result<Ownership, StoreError>;

    async fn finish_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        outcome: &JobOutcome,
    ) -> Result<Ownership, StoreError>;

    /// Give up ownership without changing status, so another worker can resume.
    async fn release_job(&self, job_id: Uuid, worker_id: &str) -> Result<(), StoreError>;

    /// Cancel a `pending` or `processing` job. Returns the job as stored
    /// afterwards, or `None` if it does not exist.
    async fn cancel_job(&self, job_id: Uuid) -> Result<Option<ImportJob>, StoreError>;

    /// Jobs that need a new queue message. Returned jobs are stamped as
    /// enqueued so concurrent sweeps do not pick the same rows.
    async fn recoverable_jobs(&self, policy: &RecoveryPolicy) -> Result<Vec<JobRef>, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ErrorStore: Send + Sync {
    /// Insert a row error. A second write for the same `(job_id, row_number)`
    /// is ignored; returns whether a new record was created.
    async fn record_error(&self, error: &NewImportError) -> Result<bool, StoreError>;

    async fn list_errors(&self, job_id: Uuid) -> Result<Vec<ImportError>, StoreError>;
}
