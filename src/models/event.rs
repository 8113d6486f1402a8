use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{EntityType, ImportJob, JobCounters, JobStatus};

/// SSE event name for import progress.
pub const PROGRESS_EVENT: &str = "import.progress";

/// Progress notification fanned out to live subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: Uuid,
    pub workspace_id: Uuid,
    pub entity_type: EntityType,
    pub status: JobStatus,
    pub progress: u8,
    pub processed_rows: i64,
    pub total_rows: Option<i64>,
    pub success_count: i64,
    pub error_count: i64,
}

impl ProgressEvent {
    pub fn new(
        job: &ImportJob,
        status: JobStatus,
        total_rows: Option<i64>,
        counters: &JobCounters,
    ) -> Self {
        Self {
            job_id: job.id,
            workspace_id: job.workspace_id,
            entity_type: job.entity_type,
            status,
            progress: crate::models::job::progress_percent(
                status,
                total_rows,
                counters.processed_rows,
            ),
            processed_rows: counters.processed_rows,
            total_rows,
            success_count: counters.success_count,
            error_count: counters.error_count,
        }
    }

    /// Snapshot of a job as currently stored.
    pub fn snapshot(job: &ImportJob) -> Self {
        Self::new(job, job.status, job.total_rows, &job.counters)
    }
}
