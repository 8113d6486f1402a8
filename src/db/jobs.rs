use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::models::job::{
    Checkpoint, EntityType, ImportJob, JobCounters, JobRef, JobStatus, NewImportJob,
};
use crate::store::{JobOutcome, Ownership, ProgressUpdate, RecoveryPolicy, StoreError};

const JOB_COLUMNS: &str = "id, workspace_id, user_id, entity_type, file_name, file_size, \
    storage_key, status, total_rows, processed_rows, success_count, error_count, \
    checkpoint_row, checkpoint_offset, worker_id, heartbeat_at, enqueued_at, error_message, \
    created_at, started_at, completed_at";

fn parse_column<T: FromStr>(job_id: Uuid, column: &str, value: &str) -> Result<T, StoreError> {
    value.parse().map_err(|_| StoreError::Corrupt {
        job_id,
        reason: format!("unexpected {} '{}'", column, value),
    })
}

fn job_from_row(r: &PgRow) -> Result<ImportJob, StoreError> {
    let id: Uuid = r.try_get("id")?;
    let status: String = r.try_get("status")?;
    let entity_type: String = r.try_get("entity_type")?;

    Ok(ImportJob {
        id,
        workspace_id: r.try_get("workspace_id")?,
        user_id: r.try_get("user_id")?,
        entity_type: parse_column::<EntityType>(id, "entity_type", &entity_type)?,
        file_name: r.try_get("file_name")?,
        file_size: r.try_get("file_size")?,
        storage_key: r.try_get("storage_key")?,
        status: parse_column::<JobStatus>(id, "status", &status)?,
        total_rows: r.try_get("total_rows")?,
        counters: JobCounters {
            processed_rows: r.try_get("processed_rows")?,
            success_count: r.try_get("success_count")?,
            error_count: r.try_get("error_count")?,
        },
        checkpoint: Checkpoint {
            row: r.try_get("checkpoint_row")?,
            offset: r.try_get("checkpoint_offset")?,
        },
        worker_id: r.try_get("worker_id")?,
        heartbeat_at: r.try_get("heartbeat_at")?,
        enqueued_at: r.try_get("enqueued_at")?,
        error_message: r.try_get("error_message")?,
        created_at: r.try_get("created_at")?,
        started_at: r.try_get("started_at")?,
        completed_at: r.try_get("completed_at")?,
    })
}

/// Insert a new job in `pending`.
pub async fn create_job(pool: &PgPool, job: &NewImportJob) -> Result<ImportJob, StoreError> {
    let sql = format!(
        r#"
        INSERT INTO import_jobs
            (id, workspace_id, user_id, entity_type, file_name, file_size, storage_key, status)
        VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending')
        RETURNING {JOB_COLUMNS}
        "#
    );

    let row = sqlx::query(&sql)
        .bind(job.id)
        .bind(job.workspace_id)
        .bind(job.user_id)
        .bind(job.entity_type.as_ref())
        .bind(&job.file_name)
        .bind(job.file_size)
        .bind(&job.storage_key)
        .fetch_one(pool)
        .await?;

    job_from_row(&row)
}

/// Get a job by ID
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<ImportJob>, StoreError> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM import_jobs WHERE id = $1");
    let row = sqlx::query(&sql).bind(job_id).fetch_optional(pool).await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Most recent jobs of a workspace, newest first.
pub async fn list_jobs(
    pool: &PgPool,
    workspace_id: Uuid,
    active_only: bool,
    limit: i64,
) -> Result<Vec<ImportJob>, StoreError> {
    let sql = format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM import_jobs
        WHERE workspace_id = $1
          AND ($2 = FALSE OR status IN ('pending', 'processing'))
        ORDER BY created_at DESC
        LIMIT $3
        "#
    );

    let rows = sqlx::query(&sql)
        .bind(workspace_id)
        .bind(active_only)
        .bind(limit)
        .fetch_all(pool)
        .await?;

    rows.iter().map(job_from_row).collect()
}

pub async fn mark_enqueued(pool: &PgPool, job_id: Uuid) -> Result<(), StoreError> {
    sqlx::query("UPDATE import_jobs SET enqueued_at = NOW() WHERE id = $1")
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Claim a job for `worker_id`. See [`crate::store::JobStore::claim_job`].
pub async fn claim_job(
    pool: &PgPool,
    job_id: Uuid,
    worker_id: &str,
    stale_after: Duration,
) -> Result<Option<ImportJob>, StoreError> {
    let sql = format!(
        r#"
        UPDATE import_jobs
        SET status = 'processing',
            worker_id = $2,
            heartbeat_at = NOW(),
            started_at = COALESCE(started_at, NOW())
        WHERE id = $1
          AND (
                status = 'pending'
             OR (status = 'processing'
                 AND (worker_id = $2
                      OR heartbeat_at IS NULL
                      OR heartbeat_at < NOW() - make_interval(secs => $3)))
          )
        RETURNING {JOB_COLUMNS}
        "#
    );

    let row = sqlx::query(&sql)
        .bind(job_id)
        .bind(worker_id)
        .bind(stale_after.as_secs_f64())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Work out why a guarded update matched no row.
async fn ownership_after_miss(pool: &PgPool, job_id: Uuid) -> Result<Ownership, StoreError> {
    let status: Option<String> = sqlx::query_scalar("SELECT status FROM import_jobs WHERE id = $1")
        .bind(job_id)
        .fetch_optional(pool)
        .await?;

    Ok(match status.as_deref() {
        Some("cancelled") => Ownership::Cancelled,
        _ => Ownership::Lost,
    })
}

pub async fn set_total_rows(
    pool: &PgPool,
    job_id: Uuid,
    worker_id: &str,
    total_rows: i64,
) -> Result<Ownership, StoreError> {
    let updated = sqlx::query(
        r#"
        UPDATE import_jobs
        SET total_rows = $3,
            heartbeat_at = NOW()
        WHERE id = $1 AND status = 'processing' AND worker_id = $2
          AND processed_rows <= $3
        "#,
    )
    .bind(job_id)
    .bind(worker_id)
    .bind(total_rows)
    .execute(pool)
    .await?;

    if updated.rows_affected() == 1 {
        Ok(Ownership::Held)
    } else {
        ownership_after_miss(pool, job_id).await
    }
}

/// Persist counters and checkpoint. Counters never move backwards.
pub async fn save_progress(
    pool: &PgPool,
    job_id: Uuid,
    worker_id: &str,
    update: &ProgressUpdate,
) -> Result<Ownership, StoreError> {
    let updated = sqlx::query(
        r#"
        UPDATE import_jobs
        SET processed_rows = $3,
            success_count = $4,
            error_count = $5,
            checkpoint_row = $6,
            checkpoint_offset = $7,
            heartbeat_at = NOW()
        WHERE id = $1 AND status = 'processing' AND worker_id = $2
          AND processed_rows <= $3 AND success_count <= $4 AND error_count <= $5
          AND checkpoint_row <= $6
        "#,
    )
    .bind(job_id)
    .bind(worker_id)
    .bind(update.counters.processed_rows)
    .bind(update.counters.success_count)
    .bind(update.counters.error_count)
    .bind(update.checkpoint.row)
    .bind(update.checkpoint.offset)
    .execute(pool)
    .await?;

    if updated.rows_affected() == 1 {
        Ok(Ownership::Held)
    } else {
        ownership_after_miss(pool, job_id).await
    }
}

/// Move an owned job into `completed` or `failed`.
pub async fn finish_job(
    pool: &PgPool,
    job_id: Uuid,
    worker_id: &str,
    outcome: &JobOutcome,
) -> Result<Ownership, StoreError> {
    let updated = match outcome {
        JobOutcome::Completed(update) => {
            sqlx::query(
                r#"
                UPDATE import_jobs
                SET status = 'completed',
                    processed_rows = $3,
                    success_count = $4,
                    error_count = $5,
                    checkpoint_row = $6,
                    checkpoint_offset = $7,
                    total_rows = COALESCE(total_rows, $3),
                    heartbeat_at = NOW(),
                    completed_at = NOW()
                WHERE id = $1 AND status = 'processing' AND worker_id = $2
                  AND processed_rows <= $3
                "#,
            )
            .bind(job_id)
            .bind(worker_id)
            .bind(update.counters.processed_rows)
            .bind(update.counters.success_count)
            .bind(update.counters.error_count)
            .bind(update.checkpoint.row)
            .bind(update.checkpoint.offset)
            .execute(pool)
            .await?
        }
        JobOutcome::Failed { message } => {
            sqlx::query(
                r#"
                UPDATE import_jobs
                SET status = 'failed',
                    error_message = $3,
                    completed_at = NOW()
                WHERE id = $1 AND status = 'processing' AND worker_id = $2
                "#,
            )
            .bind(job_id)
            .bind(worker_id)
            .bind(message)
            .execute(pool)
            .await?
        }
    };

    if updated.rows_affected() == 1 {
        Ok(Ownership::Held)
    } else {
        ownership_after_miss(pool, job_id).await
    }
}

pub async fn release_job(pool: &PgPool, job_id: Uuid, worker_id: &str) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE import_jobs
        SET worker_id = NULL,
            heartbeat_at = NULL
        WHERE id = $1 AND status = 'processing' AND worker_id = $2
        "#,
    )
    .bind(job_id)
    .bind(worker_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn cancel_job(pool: &PgPool, job_id: Uuid) -> Result<Option<ImportJob>, StoreError> {
    let sql = format!(
        r#"
        UPDATE import_jobs
        SET status = 'cancelled',
            completed_at = NOW()
        WHERE id = $1 AND status IN ('pending', 'processing')
        RETURNING {JOB_COLUMNS}
        "#
    );

    match sqlx::query(&sql).bind(job_id).fetch_optional(pool).await? {
        Some(row) => job_from_row(&row).map(Some),
        None => get_job(pool, job_id).await,
    }
}

/// Select and stamp jobs that need a new queue message.
pub async fn recoverable_jobs(
    pool: &PgPool,
    policy: &RecoveryPolicy,
) -> Result<Vec<JobRef>, StoreError> {
    let rows = sqlx::query(
        r#"
        UPDATE import_jobs
        SET enqueued_at = NOW()
        WHERE id IN (
            SELECT id
            FROM import_jobs
            WHERE (status = 'pending'
                   AND (enqueued_at IS NULL
                        OR enqueued_at < NOW() - make_interval(secs => $1)))
               OR (status = 'processing'
                   AND (heartbeat_at IS NULL
                        OR heartbeat_at < NOW() - make_interval(secs => $2))
                   AND (enqueued_at IS NULL
                        OR enqueued_at < NOW() - make_interval(secs => $2)))
            ORDER BY created_at ASC
            LIMIT $3
            FOR UPDATE SKIP LOCKED
        )
        RETURNING id, workspace_id, entity_type
        "#,
    )
    .bind(policy.pending_after.as_secs_f64())
    .bind(policy.stale_after.as_secs_f64())
    .bind(policy.batch_size)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|r| -> Result<JobRef, StoreError> {
            let job_id: Uuid = r.try_get("id")?;
            let entity_type: String = r.try_get("entity_type")?;
            Ok(JobRef {
                job_id,
                workspace_id: r.try_get("workspace_id")?,
                entity_type: parse_column(job_id, "entity_type", &entity_type)?,
            })
        })
        .collect()
}
