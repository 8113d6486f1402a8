use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::services::entities::{CreateError, CreateOutcome, EntityCreator, ImportRowRef};
use crate::services::mapper::EntityCommand;

const UNIQUE_VIOLATION: &str = "23505";
const JOB_ROW_CONSTRAINT: &str = "imported_entities_job_row";

/// Writes imported entities into the `imported_entities` table.
pub struct PgEntityCreator {
    pool: PgPool,
}

impl PgEntityCreator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn row_exists(&self, row: &ImportRowRef) -> Result<bool, CreateError> {
        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT 1::BIGINT FROM imported_entities WHERE job_id = $1 AND row_number = $2",
        )
        .bind(row.job_id)
        .bind(row.row_number)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CreateError::Transient(e.to_string()))?;
        Ok(existing.is_some())
    }
}

/// Why an insert into `imported_entities` failed.
#[derive(Debug, PartialEq, Eq)]
enum InsertFailure {
    /// A concurrent attempt at the same file row got there first.
    RowExists,
    /// Another unique key clashed; a concurrent attempt at this row can cause it too.
    Duplicate,
    Failed(CreateError),
}

fn classify_database(code: Option<&str>, constraint: Option<&str>, message: &str) -> InsertFailure {
    match code {
        Some(UNIQUE_VIOLATION) if constraint == Some(JOB_ROW_CONSTRAINT) => InsertFailure::RowExists,
        Some(UNIQUE_VIOLATION) => InsertFailure::Duplicate,
        // Remaining integrity constraint violations (class 23).
        Some(code) if code.starts_with("23") => {
            InsertFailure::Failed(CreateError::Rejected(message.to_string()))
        }
        _ => InsertFailure::Failed(CreateError::Transient(message.to_string())),
    }
}

fn classify(error: sqlx::Error) -> InsertFailure {
    match &error {
        sqlx::Error::Database(db) => {
            classify_database(db.code().as_deref(), db.constraint(), db.message())
        }
        _ => InsertFailure::Failed(CreateError::Transient(error.to_string())),
    }
}

#[async_trait]
impl EntityCreator for PgEntityCreator {
    async fn create(
        &self,
        row: &ImportRowRef,
        command: &EntityCommand,
    ) -> Result<CreateOutcome, CreateError> {
        let result = sqlx::query(
            r#"
            INSERT INTO imported_entities
                (id, workspace_id, entity_type, natural_key, job_id, row_number, payload)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (job_id, row_number) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(row.workspace_id)
        .bind(command.entity_type.as_ref())
        .bind(&command.natural_key)
        .bind(row.job_id)
        .bind(row.row_number)
        .bind(&command.payload)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => Ok(CreateOutcome::AlreadyImported),
            Ok(_) => Ok(CreateOutcome::Created),
            Err(e) => match classify(e) {
                InsertFailure::RowExists => Ok(CreateOutcome::AlreadyImported),
                // The violation is raised once the competing insert has committed,
                // so its row is visible here.
                InsertFailure::Duplicate => {
                    if self.row_exists(row).await? {
                        return Ok(CreateOutcome::AlreadyImported);
                    }
                    Err(CreateError::Conflict(format!(
                        "{} '{}' already exists",
                        command.entity_type, command.natural_key
                    )))
                }
                InsertFailure::Failed(e) => Err(e),
            },
        }
    }
}
