use axum::extract::{Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use garde::Validate;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::ApiError;
use crate::models::api::{ImportAccepted, ImportErrorList, JobSnapshot, ListJobsQuery};
use crate::models::event::ProgressEvent;
use crate::models::job::JobStatus;
use crate::services::intake::{submit_import, ImportUpload};

const FILE_FIELD: &str = "file";
const USER_HEADER: &str = "x-user-id";

fn user_id(headers: &HeaderMap) -> Result<Option<Uuid>, ApiError> {
    let Some(value) = headers.get(USER_HEADER) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
        .map(Some)
        .ok_or_else(|| ApiError::BadRequest(format!("{} must be a UUID", USER_HEADER)))
}

/// POST /workspaces/{workspace_id}/import/{entity_type}: accept a CSV file
/// for background import.
pub async fn upload_import(
    State(state): State<AppState>,
    Path((workspace_id, entity_type)): Path<(Uuid, String)>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<ImportAccepted>), ApiError> {
    let user_id = user_id(&headers)?;

    if state.services.mappers.resolve(&entity_type).is_none() {
        return Err(ApiError::BadRequest(format!(
            "Unsupported entity type: {}",
            entity_type
        )));
    }

    let mut file: Option<(String, Vec<u8>)> = None;
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Invalid multipart body: {}", e)))?
    {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let file_name = field.file_name().unwrap_or("upload.csv").to_string();

        let mut data = Vec::new();
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| ApiError::BadRequest(format!("Invalid multipart body: {}", e)))?
        {
            if data.len() + chunk.len() > state.max_upload_bytes {
                return Err(ApiError::BadRequest(format!(
                    "File too large (limit {} bytes)",
                    state.max_upload_bytes
                )));
            }
            data.extend_from_slice(&chunk);
        }
        file = Some((file_name, data));
    }

    let (file_name, data) =
        file.ok_or_else(|| ApiError::BadRequest("Missing 'file' part".to_string()))?;

    let upload = ImportUpload {
        workspace_id,
        user_id,
        entity_type,
        file_name,
        data,
    };
    let job = submit_import(
        &state.services,
        state.queue.as_ref(),
        state.max_upload_bytes,
        upload,
    )
    .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ImportAccepted {
            job_id: job.id,
            status: job.status,
        }),
    ))
}

/// GET /import-jobs/{job_id}: job status and progress.
pub async fn get_import_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobSnapshot>, ApiError> {
    let job = state
        .services
        .jobs
        .get_job(job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Import job {} not found", job_id)))?;

    Ok(Json(JobSnapshot::from(&job)))
}

/// GET /import-jobs/{job_id}/errors: row errors in row order.
pub async fn list_import_errors(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<ImportErrorList>, ApiError> {
    if state.services.jobs.get_job(job_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("Import job {} not found", job_id)));
    }

    let errors = state.services.errors.list_errors(job_id).await?;
    Ok(Json(ImportErrorList {
        job_id,
        errors: errors.into_iter().map(Into::into).collect(),
    }))
}

/// POST /import-jobs/{job_id}/cancel: stop a pending or running job.
pub async fn cancel_import_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobSnapshot>, ApiError> {
    let not_found = || ApiError::NotFound(format!("Import job {} not found", job_id));
    let jobs = &state.services.jobs;

    let current = jobs.get_job(job_id).await?.ok_or_else(not_found)?;
    if current.status.is_terminal() {
        return Err(ApiError::Conflict(format!(
            "Import job {} is already {}",
            job_id, current.status
        )));
    }

    let job = jobs.cancel_job(job_id).await?.ok_or_else(not_found)?;
    if job.status != JobStatus::Cancelled {
        // Finished between the read and the update.
        return Err(ApiError::Conflict(format!(
            "Import job {} is already {}",
            job_id, job.status
        )));
    }

    metrics::counter!("import_jobs_cancelled_total").increment(1);
    tracing::info!(job_id = %job.id, workspace_id = %job.workspace_id, "Import job cancelled");
    state
        .services
        .progress
        .publish(ProgressEvent::snapshot(&job))
        .await;

    Ok(Json(JobSnapshot::from(&job)))
}

/// GET /workspaces/{workspace_id}/import-jobs: most recent jobs first.
pub async fn list_import_jobs(
    State(state): State<AppState>,
    Path(workspace_id): Path<Uuid>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<JobSnapshot>>, ApiError> {
    query
        .validate()
        .map_err(|e| ApiError::BadRequest(format!("Invalid query: {}", e)))?;

    let jobs = state
        .services
        .jobs
        .list_jobs(workspace_id, false, query.limit)
        .await?;
    Ok(Json(jobs.iter().map(JobSnapshot::from).collect()))
}
