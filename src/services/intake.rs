use uuid::Uuid;

use crate::models::event::ProgressEvent;
use crate::models::job::{ImportJob, NewImportJob};
use crate::services::queue::{QueuedImport, WorkQueue};
use crate::services::storage::StorageError;
use crate::services::worker::ImportServices;
use crate::store::StoreError;

const MAX_FILE_NAME: usize = 200;

/// An uploaded file waiting to become an import job.
#[derive(Debug, Clone)]
pub struct ImportUpload {
    pub workspace_id: Uuid,
    pub user_id: Option<Uuid>,
    pub entity_type: String,
    pub file_name: String,
    pub data: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("Unsupported entity type: {0}")]
    UnsupportedEntityType(String),

    #[error("File is empty")]
    EmptyFile,

    #[error("File too large: {size} bytes (limit {limit} bytes)")]
    TooLarge { size: usize, limit: usize },

    #[error("Failed to store upload: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to record import job: {0}")]
    Store(#[from] StoreError),
}

/// Keep letters, digits, `.`, `-` and `_`; everything else becomes `_`.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_FILE_NAME)
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload.csv".to_string()
    } else {
        cleaned.to_string()
    }
}

pub fn storage_key(workspace_id: Uuid, job_id: Uuid, file_name: &str) -> String {
    format!(
        "imports/{}/{}/{}",
        workspace_id,
        job_id,
        sanitize_file_name(file_name)
    )
}

/// Store the file, record a `pending` job and publish it for the workers.
///
/// The job is durable once its row exists; a failed publish is logged and
/// left to the recovery sweep.
pub async fn submit_import(
    services: &ImportServices,
    queue: &dyn WorkQueue,
    max_bytes: usize,
    upload: ImportUpload,
) -> Result<ImportJob, IntakeError> {
    let entity_type = services
        .mappers
        .resolve(&upload.entity_type)
        .ok_or_else(|| IntakeError::UnsupportedEntityType(upload.entity_type.clone()))?;

    if upload.data.is_empty() {
        return Err(IntakeError::EmptyFile);
    }
    if upload.data.len() > max_bytes {
        return Err(IntakeError::TooLarge {
            size: upload.data.len(),
            limit: max_bytes,
        });
    }

    let job_id = Uuid::new_v4();
    let key = storage_key(upload.workspace_id, job_id, &upload.file_name);

    services.storage.put(&key, &upload.data, "text/csv").await?;

    let new_job = NewImportJob {
        id: job_id,
        workspace_id: upload.workspace_id,
        user_id: upload.user_id,
        entity_type,
        file_name: upload.file_name.clone(),
        file_size: upload.data.len() as i64,
        storage_key: key.clone(),
    };
    let job = match services.jobs.create_job(new_job).await {
        Ok(job) => job,
        Err(e) => {
            if let Err(cleanup) = services.storage.delete(&key).await {
                tracing::warn!(key = %key, error = %cleanup, "Failed to delete orphaned upload");
            }
            return Err(e.into());
        }
    };

    metrics::counter!("import_jobs_submitted_total").increment(1);
    tracing::info!(
        job_id = %job.id,
        workspace_id = %job.workspace_id,
        entity_type = %job.entity_type,
        file_size = job.file_size,
        "Import job created"
    );

    match queue.enqueue(&QueuedImport::new(job.job_ref())).await {
        Ok(()) => {
            if let Err(e) = services.jobs.mark_enqueued(job.id).await {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to stamp enqueue time");
            }
        }
        Err(e) => {
            tracing::error!(
                job_id = %job.id,
                error = %e,
                "Failed to enqueue import job, leaving it for the recovery sweep"
            );
        }
    }

    services.progress.publish(ProgressEvent::snapshot(&job)).await;
    Ok(job)
}
