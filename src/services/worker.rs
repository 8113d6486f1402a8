//! Import worker.
//!
//! A worker takes job references off the [`WorkQueue`], claims the job in the
//! [`JobStore`], and streams the stored file through the entity's mapper,
//! checkpointing every `checkpoint_interval` rows. Checkpoints are the only
//! points where the worker talks to the job row while processing: each one
//! persists counters and resume position, refreshes the heartbeat, and
//! learns whether the job was cancelled or taken over.
//!
//! Database failures are not job failures. Row error and checkpoint writes
//! are retried with the row backoff; when the store stays unreachable the
//! worker gives up, returns the delivery to the queue, and the job resumes
//! from the last checkpoint.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::models::event::ProgressEvent;
use crate::models::import_error::NewImportError;
use crate::models::job::{Checkpoint, ImportJob, JobCounters, JobStatus};
use crate::services::entities::{CreateError, CreateOutcome, EntityCreator, ImportRowRef};
use crate::services::mapper::{missing_columns, EntityCommand, MapperRegistry, RowMapper, TenantContext};
use crate::services::parser::{count_rows, open_import_file, FileError, ParsedRow};
use crate::services::progress::ProgressPublisher;
use crate::services::queue::{Delivery, QueueError, WorkQueue};
use crate::services::storage::BlobStore;
use crate::store::{ErrorStore, JobOutcome, JobStore, Ownership, ProgressUpdate, StoreError};

const ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    /// Rows between two checkpoints.
    pub checkpoint_interval: u32,
    /// Attempts per row when entity creation fails transiently.
    pub row_retry_attempts: u32,
    /// Base delay between attempts; attempt `n` waits `n * retry_backoff`.
    pub retry_backoff: Duration,
    /// Heartbeat age after which a processing job may be adopted.
    pub stale_after: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            checkpoint_interval: 100,
            row_retry_attempts: 3,
            retry_backoff: Duration::from_millis(200),
            stale_after: Duration::from_secs(300),
        }
    }
}

/// Collaborators shared by the API and the workers.
#[derive(Clone)]
pub struct ImportServices {
    pub jobs: Arc<dyn JobStore>,
    pub errors: Arc<dyn ErrorStore>,
    pub storage: Arc<dyn BlobStore>,
    pub creator: Arc<dyn EntityCreator>,
    pub mappers: Arc<MapperRegistry>,
    pub progress: Arc<dyn ProgressPublisher>,
}

/// How handling a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRun {
    Completed,
    Failed(String),
    Cancelled,
    /// Stopped for shutdown; ownership released for another worker.
    Released,
    /// Another worker owns the job now.
    Lost,
    Skipped(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// In-memory view of a running job.
struct RunState {
    total_rows: Option<i64>,
    counters: JobCounters,
    /// Counters as of the last durable write.
    saved: JobCounters,
    started: Instant,
}

pub struct ImportWorker {
    worker_id: String,
    services: ImportServices,
    settings: WorkerSettings,
    shutdown: watch::Receiver<bool>,
}

impl ImportWorker {
    pub fn new(
        worker_id: impl Into<String>,
        services: ImportServices,
        settings: WorkerSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            services,
            settings,
            shutdown,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Consume deliveries until shutdown is signalled.
    pub async fn run(&self, queue: &dyn WorkQueue, poll: Duration) {
        tracing::info!(worker_id = %self.worker_id, "Import consumer started");

        while !self.shutting_down() {
            match queue.dequeue(poll).await {
                Ok(Some(delivery)) => {
                    if let Err(e) = self.handle_delivery(queue, delivery).await {
                        tracing::error!(error = %e, "Error handling delivery, will retry");
                        tokio::time::sleep(ERROR_BACKOFF).await;
                    }
                }
                Ok(None) => {
                    tracing::trace!("No jobs available");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to dequeue");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }

        tracing::info!(worker_id = %self.worker_id, "Import consumer stopped");
    }

    /// Run the job behind one delivery and settle the delivery.
    ///
    /// On a store error the job is released if the store allows it and the
    /// delivery goes back on the queue.
    pub async fn handle_delivery(
        &self,
        queue: &dyn WorkQueue,
        delivery: Delivery,
    ) -> Result<JobRun, WorkerError> {
        let job_id = delivery.job.job_id;
        let run = match self.run_job(job_id).await {
            Ok(run) => run,
            Err(e) => {
                self.return_delivery(queue, &delivery).await;
                return Err(e.into());
            }
        };

        match &run {
            JobRun::Released => queue.nack(&delivery).await?,
            JobRun::Skipped(reason) => {
                tracing::info!(job_id = %job_id, reason = %reason, "Discarding delivery");
                queue.ack(&delivery).await?;
            }
            _ => queue.ack(&delivery).await?,
        }
        Ok(run)
    }

    async fn return_delivery(&self, queue: &dyn WorkQueue, delivery: &Delivery) {
        let job_id = delivery.job.job_id;
        if let Err(e) = self.services.jobs.release_job(job_id, &self.worker_id).await {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to release job");
        }
        if let Err(e) = queue.nack(delivery).await {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to return delivery to the queue");
        }
    }

    pub async fn run_job(&self, job_id: uuid::Uuid) -> Result<JobRun, StoreError> {
        let jobs = &self.services.jobs;

        let Some(job) = jobs.get_job(job_id).await? else {
            return Ok(JobRun::Skipped("job not found"));
        };
        if job.status.is_terminal() {
            return Ok(JobRun::Skipped("job already finished"));
        }

        let Some(job) = jobs
            .claim_job(job_id, &self.worker_id, self.settings.stale_after)
            .await?
        else {
            return Ok(JobRun::Skipped("job owned by a live worker"));
        };

        tracing::info!(
            job_id = %job.id,
            workspace_id = %job.workspace_id,
            entity_type = %job.entity_type,
            resume_row = job.checkpoint.row,
            "Processing import job"
        );

        let mut state = RunState {
            total_rows: job.total_rows,
            counters: job.counters,
            saved: job.counters,
            started: Instant::now(),
        };
        self.publish(&job, JobStatus::Processing, &state, &state.counters)
            .await;

        let run = self.process(&job, &mut state).await?;

        match &run {
            JobRun::Completed => {
                metrics::counter!("import_jobs_completed_total").increment(1);
                metrics::histogram!("import_job_duration_seconds")
                    .record(state.started.elapsed().as_secs_f64());
                tracing::info!(
                    job_id = %job.id,
                    processed_rows = state.counters.processed_rows,
                    success_count = state.counters.success_count,
                    error_count = state.counters.error_count,
                    "Import job completed"
                );
            }
            JobRun::Failed(message) => {
                metrics::counter!("import_jobs_failed_total").increment(1);
                metrics::histogram!("import_job_duration_seconds")
                    .record(state.started.elapsed().as_secs_f64());
                tracing::warn!(job_id = %job.id, error = %message, "Import job failed");
            }
            JobRun::Cancelled => {
                tracing::info!(
                    job_id = %job.id,
                    processed_rows = state.saved.processed_rows,
                    "Import job cancelled, stopping"
                );
            }
            JobRun::Released => {
                tracing::info!(
                    job_id = %job.id,
                    processed_rows = state.saved.processed_rows,
                    "Released import job for shutdown"
                );
            }
            JobRun::Lost => {
                tracing::warn!(job_id = %job.id, "Import job taken over by another worker");
            }
            JobRun::Skipped(_) => {}
        }

        Ok(run)
    }

    async fn process(&self, job: &ImportJob, state: &mut RunState) -> Result<JobRun, StoreError> {
        let Some(mapper) = self.services.mappers.get(job.entity_type) else {
            let message = format!("No importer for entity type '{}'", job.entity_type);
            return self.fail(job, state, message).await;
        };

        if state.total_rows.is_none() {
            let total = match self.count_file(&job.storage_key).await {
                Ok(total) => total,
                Err(e) => return self.fail(job, state, e.to_string()).await,
            };
            match self
                .services
                .jobs
                .set_total_rows(job.id, &self.worker_id, total)
                .await?
            {
                Ownership::Held => state.total_rows = Some(total),
                Ownership::Cancelled => return Ok(JobRun::Cancelled),
                Ownership::Lost => return Ok(JobRun::Lost),
            }
            tracing::debug!(job_id = %job.id, total_rows = total, "Counted rows");
        }

        let mut rows = match open_import_file(
            self.services.storage.as_ref(),
            &job.storage_key,
            job.checkpoint,
        )
        .await
        {
            Ok(rows) => rows,
            Err(e) => return self.fail(job, state, e.to_string()).await,
        };

        let missing = missing_columns(mapper.as_ref(), rows.columns());
        if !missing.is_empty() {
            let listed: Vec<String> = missing.iter().map(|m| m.to_string()).collect();
            let message = format!("Missing required columns: {}", listed.join(", "));
            return self.fail(job, state, message).await;
        }

        let tenant = TenantContext {
            workspace_id: job.workspace_id,
            user_id: job.user_id,
        };
        let interval = self.settings.checkpoint_interval.max(1);
        let mut since_checkpoint = 0;

        loop {
            let parsed = match rows.next_row().await {
                Ok(Some(parsed)) => parsed,
                Ok(None) => break,
                Err(e) => return self.fail(job, state, e.to_string()).await,
            };
            self.process_row(job, mapper.as_ref(), &tenant, parsed, &mut state.counters)
                .await?;

            since_checkpoint += 1;
            if since_checkpoint < interval {
                continue;
            }
            since_checkpoint = 0;

            let update = ProgressUpdate {
                counters: state.counters,
                checkpoint: Checkpoint {
                    row: rows.next_row_number() - 1,
                    offset: rows.offset() as i64,
                },
            };
            let saved = self
                .store_with_retry(job.id, "save checkpoint", || {
                    self.services
                        .jobs
                        .save_progress(job.id, &self.worker_id, &update)
                })
                .await?;
            match saved {
                Ownership::Held => {
                    state.saved = state.counters;
                    self.publish(job, JobStatus::Processing, state, &state.saved)
                        .await;
                }
                Ownership::Cancelled => return Ok(JobRun::Cancelled),
                Ownership::Lost => return Ok(JobRun::Lost),
            }

            if self.shutting_down() {
                self.services
                    .jobs
                    .release_job(job.id, &self.worker_id)
                    .await?;
                return Ok(JobRun::Released);
            }
        }

        let update = ProgressUpdate {
            counters: state.counters,
            checkpoint: Checkpoint {
                row: rows.next_row_number() - 1,
                offset: rows.offset() as i64,
            },
        };
        match self
            .services
            .jobs
            .finish_job(job.id, &self.worker_id, &JobOutcome::Completed(update))
            .await?
        {
            Ownership::Held => {
                state.saved = state.counters;
                if state.total_rows.is_none() {
                    state.total_rows = Some(state.counters.processed_rows);
                }
                self.publish(job, JobStatus::Completed, state, &state.saved)
                    .await;
                Ok(JobRun::Completed)
            }
            Ownership::Cancelled => Ok(JobRun::Cancelled),
            Ownership::Lost => Ok(JobRun::Lost),
        }
    }

    async fn count_file(&self, key: &str) -> Result<i64, FileError> {
        let input = self.services.storage.open(key, 0).await?;
        count_rows(input).await
    }

    async fn process_row(
        &self,
        job: &ImportJob,
        mapper: &dyn RowMapper,
        tenant: &TenantContext,
        parsed: ParsedRow,
        counters: &mut JobCounters,
    ) -> Result<(), StoreError> {
        metrics::counter!("import_rows_processed_total").increment(1);

        let row = match parsed {
            ParsedRow::Valid(row) => row,
            ParsedRow::Malformed(bad) => {
                let error = NewImportError {
                    job_id: job.id,
                    row_number: bad.number,
                    field_name: None,
                    error_message: bad.message,
                    row_data: bad.row_data,
                };
                return self.record_row_error(error, counters).await;
            }
        };

        let command = match mapper.map(&row, tenant) {
            Ok(command) => command,
            Err(e) => {
                let error = NewImportError {
                    job_id: job.id,
                    row_number: row.number(),
                    field_name: e.field_name,
                    error_message: e.message,
                    row_data: row.snapshot(),
                };
                return self.record_row_error(error, counters).await;
            }
        };

        let target = ImportRowRef {
            job_id: job.id,
            workspace_id: job.workspace_id,
            row_number: row.number(),
        };
        match self.create_with_retry(&target, &command).await {
            Ok(outcome) => {
                if outcome == CreateOutcome::AlreadyImported {
                    tracing::debug!(job_id = %job.id, row_number = row.number(), "Row already imported");
                }
                counters.record_success();
                Ok(())
            }
            Err(e) => {
                let error = NewImportError {
                    job_id: job.id,
                    row_number: row.number(),
                    field_name: None,
                    error_message: e.to_string(),
                    row_data: row.snapshot(),
                };
                self.record_row_error(error, counters).await
            }
        }
    }

    async fn create_with_retry(
        &self,
        target: &ImportRowRef,
        command: &EntityCommand,
    ) -> Result<CreateOutcome, CreateError> {
        let mut attempt = 1;
        loop {
            match self.services.creator.create(target, command).await {
                Err(e) if e.is_transient() && attempt < self.settings.row_retry_attempts => {
                    tracing::warn!(
                        job_id = %target.job_id,
                        row_number = target.row_number,
                        attempt,
                        error = %e,
                        "Transient error creating entity, retrying"
                    );
                    tokio::time::sleep(self.settings.retry_backoff * attempt).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Repeat a store write with the row backoff while it fails transiently.
    async fn store_with_retry<T, F, Fut>(
        &self,
        job_id: uuid::Uuid,
        action: &'static str,
        mut write: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 1;
        loop {
            match write().await {
                Err(e) if e.is_transient() && attempt < self.settings.row_retry_attempts => {
                    tracing::warn!(
                        job_id = %job_id,
                        attempt,
                        error = %e,
                        "Failed to {}, retrying",
                        action
                    );
                    tokio::time::sleep(self.settings.retry_backoff * attempt).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn record_row_error(
        &self,
        error: NewImportError,
        counters: &mut JobCounters,
    ) -> Result<(), StoreError> {
        let inserted = self
            .store_with_retry(error.job_id, "record row error", || {
                self.services.errors.record_error(&error)
            })
            .await?;
        tracing::debug!(
            job_id = %error.job_id,
            row_number = error.row_number,
            field = ?error.field_name,
            replayed = !inserted,
            "Row rejected: {}",
            error.error_message
        );
        counters.record_error();
        metrics::counter!("import_row_errors_total").increment(1);
        Ok(())
    }

    async fn fail(
        &self,
        job: &ImportJob,
        state: &RunState,
        message: String,
    ) -> Result<JobRun, StoreError> {
        let outcome = JobOutcome::Failed {
            message: message.clone(),
        };
        match self
            .services
            .jobs
            .finish_job(job.id, &self.worker_id, &outcome)
            .await?
        {
            Ownership::Held => {
                self.publish(job, JobStatus::Failed, state, &state.saved)
                    .await;
                Ok(JobRun::Failed(message))
            }
            Ownership::Cancelled => Ok(JobRun::Cancelled),
            Ownership::Lost => Ok(JobRun::Lost),
        }
    }

    async fn publish(
        &self,
        job: &ImportJob,
        status: JobStatus,
        state: &RunState,
        counters: &JobCounters,
    ) {
        let event = ProgressEvent::new(job, status, state.total_rows, counters);
        self.services.progress.publish(event).await;
    }
}
