use async_trait::async_trait;
use uuid::Uuid;

use crate::services::mapper::EntityCommand;

/// Identity of the file row an entity is created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportRowRef {
    pub job_id: Uuid,
    pub workspace_id: Uuid,
    pub row_number: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// This exact row was already imported by an earlier attempt at the job.
    AlreadyImported,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CreateError {
    /// The entity clashes with data that did not come from this row.
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Rejected(String),

    /// Worth retrying; the row is not at fault.
    #[error("Temporary failure: {0}")]
    Transient(String),
}

impl CreateError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CreateError::Transient(_))
    }
}

/// Persists entities produced by row mappers.
///
/// Creation must be idempotent per [`ImportRowRef`]: replaying a row that
/// was already imported reports [`CreateOutcome::AlreadyImported`].
#[async_trait]
pub trait EntityCreator: Send + Sync {
    async fn create(
        &self,
        row: &ImportRowRef,
        command: &EntityCommand,
    ) -> Result<CreateOutcome, CreateError>;
}
