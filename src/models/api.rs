use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::import_error::ImportError;
use crate::models::job::{EntityType, ImportJob, JobStatus};

/// Response after an upload has been accepted for background processing.
#[derive(Debug, Serialize, Deserialize)]
pub struct ImportAccepted {
    pub job_id: Uuid,
    pub status: JobStatus,
}

/// Current state of a job, as returned by `GET /import-jobs/{job_id}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: Uuid,
    pub workspace_id: Uuid,
    pub entity_type: EntityType,
    pub file_name: String,
    pub file_size: i64,
    pub status: JobStatus,
    pub total_rows: Option<i64>,
    pub processed_rows: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub progress: u8,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&ImportJob> for JobSnapshot {
    fn from(job: &ImportJob) -> Self {
        Self {
            job_id: job.id,
            workspace_id: job.workspace_id,
            entity_type: job.entity_type,
            file_name: job.file_name.clone(),
            file_size: job.file_size,
            status: job.status,
            total_rows: job.total_rows,
            processed_rows: job.counters.processed_rows,
            success_count: job.counters.success_count,
            error_count: job.counters.error_count,
            progress: job.progress(),
            error_message: job.error_message.clone(),
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

/// One entry of `GET /import-jobs/{job_id}/errors`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ImportErrorView {
    pub row_number: i64,
    pub field_name: Option<String>,
    pub error_message: String,
    pub row_data: serde_json::Value,
}

impl From<ImportError> for ImportErrorView {
    fn from(err: ImportError) -> Self {
        Self {
            row_number: err.row_number,
            field_name: err.field_name,
            error_message: err.error_message,
            row_data: err.row_data,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ImportErrorList {
    pub job_id: Uuid,
    pub errors: Vec<ImportErrorView>,
}

/// Query for `GET /workspaces/{workspace_id}/import-jobs`.
#[derive(Debug, Deserialize, Validate)]
pub struct ListJobsQuery {
    #[garde(range(min = 1, max = 200))]
    #[serde(default = "default_list_limit")]
    pub limit: i64,
}

fn default_list_limit() -> i64 {
    50
}

/// Query for `GET /workspaces/{workspace_id}/events`.
#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub job_id: Option<Uuid>,
}
