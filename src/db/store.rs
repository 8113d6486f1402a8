use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use crate::db::{import_errors, jobs};
use crate::models::import_error::{ImportError, NewImportError};
use crate::models::job::{ImportJob, JobRef, NewImportJob};
use crate::store::{
    ErrorStore, JobOutcome, JobStore, Ownership, ProgressUpdate, RecoveryPolicy, StoreError,
};

/// Postgres-backed [`JobStore`] and [`ErrorStore`].
#[derive(Clone)]
pub struct PgImportStore {
    pool: PgPool,
}

impl PgImportStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgImportStore {
    async fn create_job(&self, job: NewImportJob) -> Result<ImportJob, StoreError> {
        jobs::create_job(&self.pool, &job).await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ImportJob>, StoreError> {
        jobs::get_job(&self.pool, job_id).await
    }

    async fn list_jobs(
        &self,
        workspace_id: Uuid,
        active_only: bool,
        limit: i64,
    ) -> Result<Vec<ImportJob>, StoreError> {
        jobs::list_jobs(&self.pool, workspace_id, active_only, limit).await
    }

    async fn mark_enqueued(&self, job_id: Uuid) -> Result<(), StoreError> {
        jobs::mark_enqueued(&self.pool, job_id).await
    }

    async fn claim_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        stale_after: Duration,
    ) -> Result<Option<ImportJob>, StoreError> {
        jobs::claim_job(&self.pool, job_id, worker_id, stale_after).await
    }

    async fn set_total_rows(
        &self,
        job_id: Uuid,
        worker_id: &str,
        total_rows: i64,
    ) -> Result<Ownership, StoreError> {
        jobs::set_total_rows(&self.pool, job_id, worker_id, total_rows).await
    }

    async fn save_progress(
        &self,
        job_id: Uuid,
        worker_id: &str,
        update: &ProgressUpdate,
    ) -> Result<Ownership, StoreError> {
        jobs::save_progress(&self.pool, job_id, worker_id, update).await
    }

    async fn finish_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        outcome: &JobOutcome,
    ) -> Result<Ownership, StoreError> {
        jobs::finish_job(&self.pool, job_id, worker_id, outcome).await
    }

    async fn release_job(&self, job_id: Uuid, worker_id: &str) -> Result<(), StoreError> {
        jobs::release_job(&self.pool, job_id, worker_id).await
    }

    async fn cancel_job(&self, job_id: Uuid) -> Result<Option<ImportJob>, StoreError> {
        jobs::cancel_job(&self.pool, job_id).await
    }

    async fn recoverable_jobs(&self, policy: &RecoveryPolicy) -> Result<Vec<JobRef>, StoreError> {
        jobs::recoverable_jobs(&self.pool, policy).await
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ErrorStore for PgImportStore {
    async fn record_error(&self, error: &NewImportError) -> Result<bool, StoreError> {
        Ok(import_errors::insert_error(&self.pool, error).await?)
    }

    async fn list_errors(&self, job_id: Uuid) -> Result<Vec<ImportError>, StoreError> {
        Ok(import_errors::list_errors(&self.pool, job_id).await?)
    }
}
