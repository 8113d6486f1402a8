//! In-memory implementations of the import seams, for tests that run
//! without PostgreSQL, Redis or object storage.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use stock_import::models::event::ProgressEvent;
use stock_import::models::import_error::{ImportError, NewImportError};
use stock_import::models::job::{
    Checkpoint, ImportJob, JobCounters, JobRef, JobStatus, NewImportJob,
};
use stock_import::services::entities::{CreateError, CreateOutcome, EntityCreator, ImportRowRef};
use stock_import::services::intake::{submit_import, ImportUpload};
use stock_import::services::mapper::{EntityCommand, MapperRegistry};
use stock_import::services::progress::ProgressPublisher;
use stock_import::services::queue::{Delivery, QueueError, QueuedImport, WorkQueue};
use stock_import::services::storage::{BlobReader, BlobStore, StorageError};
use stock_import::services::worker::{ImportServices, ImportWorker, WorkerSettings};
use stock_import::store::{
    ErrorStore, JobOutcome, JobStore, Ownership, ProgressUpdate, RecoveryPolicy, StoreError,
};

// ── Job store ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, ImportJob>>,
    /// Successful checkpoint writes allowed before the store starts failing.
    saves_before_outage: Mutex<Option<usize>>,
    saves: AtomicUsize,
    /// Checkpoint writes still to fail before saves go through again.
    failing_saves: AtomicUsize,
}

impl MemoryJobStore {
    pub fn job(&self, job_id: Uuid) -> ImportJob {
        self.jobs.lock().unwrap()[&job_id].clone()
    }

    /// Let `saves` more checkpoint writes through, then fail every write.
    pub fn outage_after_saves(&self, saves: usize) {
        *self.saves_before_outage.lock().unwrap() = Some(self.saves.load(Ordering::SeqCst) + saves);
    }

    /// Fail the next `count` checkpoint writes.
    pub fn fail_next_saves(&self, count: usize) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }

    pub fn end_outage(&self) {
        *self.saves_before_outage.lock().unwrap() = None;
    }

    pub fn insert(&self, job: ImportJob) {
        self.jobs.lock().unwrap().insert(job.id, job);
    }

    pub fn update(&self, job_id: Uuid, f: impl FnOnce(&mut ImportJob)) {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.get_mut(&job_id) {
            f(job);
        }
    }

    fn in_outage(&self) -> bool {
        match *self.saves_before_outage.lock().unwrap() {
            Some(limit) => self.saves.load(Ordering::SeqCst) >= limit,
            None => false,
        }
    }
}

/// Consume one injected failure, if any are left.
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// `None` when `worker_id` owns the running job.
fn lost_ownership(job: &ImportJob, worker_id: &str) -> Option<Ownership> {
    if job.status == JobStatus::Cancelled {
        return Some(Ownership::Cancelled);
    }
    if job.status != JobStatus::Processing || job.worker_id.as_deref() != Some(worker_id) {
        return Some(Ownership::Lost);
    }
    None
}

fn stale(job: &ImportJob, stale_after: Duration) -> bool {
    match job.heartbeat_at {
        None => true,
        Some(at) => {
            let age = Utc::now() - at;
            age.to_std().map(|age| age >= stale_after).unwrap_or(false)
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, job: NewImportJob) -> Result<ImportJob, StoreError> {
        let record = ImportJob {
            id: job.id,
            workspace_id: job.workspace_id,
            user_id: job.user_id,
            entity_type: job.entity_type,
            file_name: job.file_name,
            file_size: job.file_size,
            storage_key: job.storage_key,
            status: JobStatus::Pending,
            total_rows: None,
            counters: JobCounters::default(),
            checkpoint: Checkpoint::default(),
            worker_id: None,
            heartbeat_at: None,
            enqueued_at: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        self.insert(record.clone());
        Ok(record)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ImportJob>, StoreError> {
        Ok(self.jobs.lock().unwrap().get(&job_id).cloned())
    }

    async fn list_jobs(
        &self,
        workspace_id: Uuid,
        active_only: bool,
        limit: i64,
    ) -> Result<Vec<ImportJob>, StoreError> {
        let mut jobs: Vec<ImportJob> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| j.workspace_id == workspace_id)
            .filter(|j| !active_only || !j.status.is_terminal())
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn mark_enqueued(&self, job_id: Uuid) -> Result<(), StoreError> {
        self.update(job_id, |job| job.enqueued_at = Some(Utc::now()));
        Ok(())
    }

    async fn claim_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        stale_after: Duration,
    ) -> Result<Option<ImportJob>, StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        let claimable = match job.status {
            JobStatus::Pending => true,
            JobStatus::Processing => {
                job.worker_id.as_deref() == Some(worker_id) || stale(job, stale_after)
            }
            _ => false,
        };
        if !claimable {
            return Ok(None);
        }
        job.status = JobStatus::Processing;
        job.worker_id = Some(worker_id.to_string());
        job.heartbeat_at = Some(Utc::now());
        job.started_at.get_or_insert_with(Utc::now);
        Ok(Some(job.clone()))
    }

    async fn set_total_rows(
        &self,
        job_id: Uuid,
        worker_id: &str,
        total_rows: i64,
    ) -> Result<Ownership, StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(&job_id)
            .ok_or_else(|| StoreError::Unavailable("no such job".into()))?;
        if let Some(lost) = lost_ownership(job, worker_id) {
            return Ok(lost);
        }
        job.total_rows = Some(total_rows);
        job.heartbeat_at = Some(Utc::now());
        Ok(Ownership::Held)
    }

    async fn save_progress(
        &self,
        job_id: Uuid,
        worker_id: &str,
        update: &ProgressUpdate,
    ) -> Result<Ownership, StoreError> {
        if self.in_outage() || take_failure(&self.failing_saves) {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(&job_id)
            .ok_or_else(|| StoreError::Unavailable("no such job".into()))?;
        if let Some(lost) = lost_ownership(job, worker_id) {
            return Ok(lost);
        }
        assert!(
            update.counters.dominates(&job.counters),
            "counters moved backwards: {:?} -> {:?}",
            job.counters,
            update.counters
        );
        job.counters = update.counters;
        job.checkpoint = update.checkpoint;
        job.heartbeat_at = Some(Utc::now());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(Ownership::Held)
    }

    async fn finish_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        outcome: &JobOutcome,
    ) -> Result<Ownership, StoreError> {
        if self.in_outage() {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(&job_id)
            .ok_or_else(|| StoreError::Unavailable("no such job".into()))?;
        if let Some(lost) = lost_ownership(job, worker_id) {
            return Ok(lost);
        }
        match outcome {
            JobOutcome::Completed(update) => {
                job.status = JobStatus::Completed;
                job.counters = update.counters;
                job.checkpoint = update.checkpoint;
                job.total_rows.get_or_insert(update.counters.processed_rows);
            }
            JobOutcome::Failed { message } => {
                job.status = JobStatus::Failed;
                job.error_message = Some(message.clone());
            }
        }
        job.completed_at = Some(Utc::now());
        Ok(Ownership::Held)
    }

    async fn release_job(&self, job_id: Uuid, worker_id: &str) -> Result<(), StoreError> {
        if self.in_outage() {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        self.update(job_id, |job| {
            if job.status == JobStatus::Processing && job.worker_id.as_deref() == Some(worker_id) {
                job.worker_id = None;
                job.heartbeat_at = None;
            }
        });
        Ok(())
    }

    async fn cancel_job(&self, job_id: Uuid) -> Result<Option<ImportJob>, StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if !job.status.is_terminal() {
            job.status = JobStatus::Cancelled;
            job.completed_at = Some(Utc::now());
        }
        Ok(Some(job.clone()))
    }

    async fn recoverable_jobs(&self, policy: &RecoveryPolicy) -> Result<Vec<JobRef>, StoreError> {
        let now = Utc::now();
        let older_than = |at: Option<chrono::DateTime<Utc>>, window: Duration| match at {
            None => true,
            Some(at) => (now - at).to_std().map(|age| age >= window).unwrap_or(false),
        };

        let mut jobs = self.jobs.lock().unwrap();
        let mut due: Vec<&mut ImportJob> = jobs
            .values_mut()
            .filter(|job| match job.status {
                JobStatus::Pending => older_than(job.enqueued_at, policy.pending_after),
                JobStatus::Processing => {
                    older_than(job.heartbeat_at, policy.stale_after)
                        && older_than(job.enqueued_at, policy.stale_after)
                }
                _ => false,
            })
            .collect();
        due.sort_by_key(|job| job.created_at);
        due.truncate(policy.batch_size as usize);

        Ok(due
            .into_iter()
            .map(|job| {
                job.enqueued_at = Some(now);
                job.job_ref()
            })
            .collect())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

// ── Error store ─────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryErrorStore {
    errors: Mutex<BTreeMap<(Uuid, i64), ImportError>>,
    failing_records: AtomicUsize,
    pub record_calls: AtomicUsize,
}

impl MemoryErrorStore {
    /// Fail the next `count` error writes.
    pub fn fail_next_records(&self, count: usize) {
        self.failing_records.store(count, Ordering::SeqCst);
    }

    pub fn errors_for(&self, job_id: Uuid) -> Vec<ImportError> {
        self.errors
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ErrorStore for MemoryErrorStore {
    async fn record_error(&self, error: &NewImportError) -> Result<bool, StoreError> {
        self.record_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failing_records) {
            return Err(StoreError::Unavailable("connection reset".into()));
        }
        let mut errors = self.errors.lock().unwrap();
        let key = (error.job_id, error.row_number);
        if errors.contains_key(&key) {
            return Ok(false);
        }
        errors.insert(
            key,
            ImportError {
                id: Uuid::new_v4(),
                job_id: error.job_id,
                row_number: error.row_number,
                field_name: error.field_name.clone(),
                error_message: error.error_message.clone(),
                row_data: error.row_data.clone(),
                created_at: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn list_errors(&self, job_id: Uuid) -> Result<Vec<ImportError>, StoreError> {
        Ok(self.errors_for(job_id))
    }
}

// ── Blob store ──────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    pub fail_puts: AtomicBool,
}

impl MemoryBlobStore {
    pub fn keys(&self) -> Vec<String> {
        self.blobs.lock().unwrap().keys().cloned().collect()
    }

    pub fn remove(&self, key: &str) {
        self.blobs.lock().unwrap().remove(key);
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, data: &[u8], _content_type: &str) -> Result<(), StorageError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StorageError::Status {
                key: key.to_string(),
                code: 503,
            });
        }
        self.blobs
            .lock()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn open(&self, key: &str, offset: u64) -> Result<BlobReader, StorageError> {
        let blobs = self.blobs.lock().unwrap();
        let data = blobs
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        let start = (offset as usize).min(data.len());
        Ok(Box::new(std::io::Cursor::new(data[start..].to_vec())))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.remove(key);
        Ok(())
    }
}

// ── Entity creator ──────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryEntityCreator {
    by_row: Mutex<HashMap<(Uuid, i64), String>>,
    keys: Mutex<HashSet<(Uuid, String, String)>>,
    /// Remaining transient failures per row number.
    flaky_rows: Mutex<HashMap<i64, u32>>,
    pub calls: AtomicUsize,
    /// Cancels the job through this store when the given row is created.
    cancel_at: Mutex<Option<(Arc<MemoryJobStore>, i64)>>,
}

impl MemoryEntityCreator {
    pub fn created(&self) -> usize {
        self.by_row.lock().unwrap().len()
    }

    pub fn created_for(&self, job_id: Uuid) -> Vec<(i64, String)> {
        let mut rows: Vec<(i64, String)> = self
            .by_row
            .lock()
            .unwrap()
            .iter()
            .filter(|((job, _), _)| *job == job_id)
            .map(|((_, row), key)| (*row, key.clone()))
            .collect();
        rows.sort();
        rows
    }

    pub fn fail_transiently(&self, row_number: i64, times: u32) {
        self.flaky_rows.lock().unwrap().insert(row_number, times);
    }

    pub fn cancel_job_at_row(&self, store: Arc<MemoryJobStore>, row_number: i64) {
        *self.cancel_at.lock().unwrap() = Some((store, row_number));
    }
}

#[async_trait]
impl EntityCreator for MemoryEntityCreator {
    async fn create(
        &self,
        row: &ImportRowRef,
        command: &EntityCommand,
    ) -> Result<CreateOutcome, CreateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(remaining) = self.flaky_rows.lock().unwrap().get_mut(&row.row_number) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(CreateError::Transient("deadlock detected".into()));
            }
        }

        let row_key = (row.job_id, row.row_number);
        if self.by_row.lock().unwrap().contains_key(&row_key) {
            return Ok(CreateOutcome::AlreadyImported);
        }

        // Let a concurrent attempt at the same row run between check and write.
        tokio::task::yield_now().await;

        {
            let mut by_row = self.by_row.lock().unwrap();
            if by_row.contains_key(&row_key) {
                return Ok(CreateOutcome::AlreadyImported);
            }
            let identity = (
                row.workspace_id,
                command.entity_type.to_string(),
                command.natural_key.clone(),
            );
            if !self.keys.lock().unwrap().insert(identity) {
                return Err(CreateError::Conflict(format!(
                    "{} '{}' already exists",
                    command.entity_type, command.natural_key
                )));
            }
            by_row.insert(row_key, command.natural_key.clone());
        }

        let cancel = self.cancel_at.lock().unwrap().clone();
        if let Some((store, at)) = cancel {
            if at == row.row_number {
                store.cancel_job(row.job_id).await.unwrap();
            }
        }
        Ok(CreateOutcome::Created)
    }
}

// ── Queue ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryQueue {
    ready: Mutex<VecDeque<QueuedImport>>,
    in_flight: Mutex<HashMap<String, QueuedImport>>,
    pub fail_enqueue: AtomicBool,
    pub acked: AtomicUsize,
    pub nacked: AtomicUsize,
}

impl MemoryQueue {
    pub fn ready_len(&self) -> usize {
        self.ready.lock().unwrap().len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    pub async fn next(&self) -> Delivery {
        self.dequeue(Duration::ZERO)
            .await
            .unwrap()
            .expect("queue is empty")
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(&self, job: &QueuedImport) -> Result<(), QueueError> {
        if self.fail_enqueue.load(Ordering::SeqCst) {
            return Err(QueueError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection refused",
            ))));
        }
        self.ready.lock().unwrap().push_back(job.clone());
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let next = self.ready.lock().unwrap().pop_front();
        let Some(job) = next else {
            tokio::time::sleep(wait).await;
            return Ok(None);
        };
        let receipt = job.delivery_id.to_string();
        self.in_flight
            .lock()
            .unwrap()
            .insert(receipt.clone(), job.clone());
        Ok(Some(Delivery { job, receipt }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.in_flight.lock().unwrap().remove(&delivery.receipt);
        self.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        if let Some(job) = self.in_flight.lock().unwrap().remove(&delivery.receipt) {
            self.ready.lock().unwrap().push_front(job);
        }
        self.nacked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Treats every in-flight delivery as expired.
    async fn requeue_expired(&self) -> Result<u64, QueueError> {
        let expired: Vec<QueuedImport> = self
            .in_flight
            .lock()
            .unwrap()
            .drain()
            .map(|(_, job)| job)
            .collect();
        let moved = expired.len() as u64;
        self.ready.lock().unwrap().extend(expired);
        Ok(moved)
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok(self.ready_len() as u64)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

// ── Progress ────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingPublisher {
    pub fn events_for(&self, job_id: Uuid) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ProgressPublisher for RecordingPublisher {
    async fn publish(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

// ── Harness ─────────────────────────────────────────────────────────

pub struct Harness {
    pub jobs: Arc<MemoryJobStore>,
    pub errors: Arc<MemoryErrorStore>,
    pub blobs: Arc<MemoryBlobStore>,
    pub creator: Arc<MemoryEntityCreator>,
    pub events: Arc<RecordingPublisher>,
    pub queue: Arc<MemoryQueue>,
    pub services: ImportServices,
    pub workspace_id: Uuid,
}

impl Harness {
    pub fn new() -> Self {
        let jobs = Arc::new(MemoryJobStore::default());
        let errors = Arc::new(MemoryErrorStore::default());
        let blobs = Arc::new(MemoryBlobStore::default());
        let creator = Arc::new(MemoryEntityCreator::default());
        let events = Arc::new(RecordingPublisher::default());
        let services = ImportServices {
            jobs: jobs.clone(),
            errors: errors.clone(),
            storage: blobs.clone(),
            creator: creator.clone(),
            mappers: Arc::new(MapperRegistry::with_defaults()),
            progress: events.clone(),
        };
        Self {
            jobs,
            errors,
            blobs,
            creator,
            events,
            queue: Arc::new(MemoryQueue::default()),
            services,
            workspace_id: Uuid::new_v4(),
        }
    }

    pub fn settings(checkpoint_interval: u32) -> WorkerSettings {
        WorkerSettings {
            checkpoint_interval,
            row_retry_attempts: 3,
            retry_backoff: Duration::from_millis(1),
            stale_after: Duration::from_secs(300),
        }
    }

    /// A worker whose shutdown signal is controlled by the returned sender.
    pub fn worker(&self, id: &str, settings: WorkerSettings) -> (ImportWorker, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (
            ImportWorker::new(id, self.services.clone(), settings, rx),
            tx,
        )
    }

    pub async fn submit(&self, entity_type: &str, csv: impl AsRef<[u8]>) -> ImportJob {
        let upload = ImportUpload {
            workspace_id: self.workspace_id,
            user_id: None,
            entity_type: entity_type.to_string(),
            file_name: format!("{}.csv", entity_type),
            data: csv.as_ref().to_vec(),
        };
        submit_import(&self.services, self.queue.as_ref(), 1024 * 1024, upload)
            .await
            .expect("submit failed")
    }
}

/// CSV with a header and `rows` valid item rows (`SKU-0001`…).
pub fn item_csv(rows: usize) -> String {
    let mut csv = String::from("sku,name,min_stock_level\n");
    for n in 1..=rows {
        csv.push_str(&format!("SKU-{:04},Item {},{}\n", n, n, n % 5));
    }
    csv
}
