use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};
use uuid::Uuid;

/// Status of an import job.
///
/// `pending → processing → {completed | failed}`, with `cancelled` reachable
/// from either non-terminal state. Terminal states never change again.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }
}

/// Entity types that can be bulk-imported.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum EntityType {
    Item,
    Inventory,
    Location,
    Container,
    Category,
    Borrower,
}

/// Resume point embedded in the job row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Last row number durably processed (0 when nothing has been processed).
    pub row: i64,
    /// Absolute byte offset just past `row` in the uploaded file.
    pub offset: i64,
}

/// Row counters of a job. `processed == success + errors` at all times.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    pub processed_rows: i64,
    pub success_count: i64,
    pub error_count: i64,
}

impl JobCounters {
    pub fn record_success(&mut self) {
        self.processed_rows += 1;
        self.success_count += 1;
    }

    pub fn record_error(&mut self) {
        self.processed_rows += 1;
        self.error_count += 1;
    }

    /// True when every counter of `self` is at least the one in `earlier`.
    pub fn dominates(&self, earlier: &JobCounters) -> bool {
        self.processed_rows >= earlier.processed_rows
            && self.success_count >= earlier.success_count
            && self.error_count >= earlier.error_count
    }
}

/// A bulk import job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportJob {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub user_id: Option<Uuid>,
    pub entity_type: EntityType,
    pub file_name: String,
    pub file_size: i64,
    pub storage_key: String,
    pub status: JobStatus,
    pub total_rows: Option<i64>,
    pub counters: JobCounters,
    pub checkpoint: Checkpoint,
    pub worker_id: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ImportJob {
    /// Completion percentage (0–100).
    pub fn progress(&self) -> u8 {
        progress_percent(self.status, self.total_rows, self.counters.processed_rows)
    }

    pub fn job_ref(&self) -> JobRef {
        JobRef {
            job_id: self.id,
            workspace_id: self.workspace_id,
            entity_type: self.entity_type,
        }
    }
}

pub fn progress_percent(status: JobStatus, total_rows: Option<i64>, processed_rows: i64) -> u8 {
    match total_rows {
        None => 0,
        Some(0) if status == JobStatus::Completed => 100,
        Some(0) => 0,
        Some(total) => {
            let pct = processed_rows.max(0).saturating_mul(100) / total;
            pct.clamp(0, 100) as u8
        }
    }
}

/// Minimal reference to a job, as carried on the work queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRef {
    pub job_id: Uuid,
    pub workspace_id: Uuid,
    pub entity_type: EntityType,
}

/// Fields supplied when a job is first recorded.
#[derive(Debug, Clone)]
pub struct NewImportJob {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub user_id: Option<Uuid>,
    pub entity_type: EntityType,
    pub file_name: String,
    pub file_size: i64,
    pub storage_key: String,
}
