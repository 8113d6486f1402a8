use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::import_error::{ImportError, NewImportError};

/// Insert a row error; a repeat for the same `(job_id, row_number)` is a no-op.
pub async fn insert_error(pool: &PgPool, error: &NewImportError) -> Result<bool, sqlx::Error> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO import_errors (id, job_id, row_number, field_name, error_message, row_data)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (job_id, row_number) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(error.job_id)
    .bind(error.row_number)
    .bind(error.field_name.as_deref())
    .bind(&error.error_message)
    .bind(&error.row_data)
    .execute(pool)
    .await?;

    Ok(inserted.rows_affected() == 1)
}

/// All errors of a job in file order.
pub async fn list_errors(pool: &PgPool, job_id: Uuid) -> Result<Vec<ImportError>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT id, job_id, row_number, field_name, error_message, row_data, created_at
        FROM import_errors
        WHERE job_id = $1
        ORDER BY row_number ASC
        "#,
    )
    .bind(job_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|r| {
            Ok(ImportError {
                id: r.try_get("id")?,
                job_id: r.try_get("job_id")?,
                row_number: r.try_get("row_number")?,
                field_name: r.try_get("field_name")?,
                error_message: r.try_get("error_message")?,
                row_data: r.try_get("row_data")?,
                created_at: r.try_get("created_at")?,
            })
        })
        .collect()
}
