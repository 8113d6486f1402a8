use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::services::queue::{QueueError, QueuedImport, WorkQueue};
use crate::store::{JobStore, RecoveryPolicy, StoreError};

/// Periodically re-publishes jobs that lost their queue message or their worker.
pub struct RecoverySweeper {
    jobs: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    policy: RecoveryPolicy,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub redelivered: u64,
    pub republished: usize,
    pub queue_depth: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

impl RecoverySweeper {
    pub fn new(jobs: Arc<dyn JobStore>, queue: Arc<dyn WorkQueue>, policy: RecoveryPolicy) -> Self {
        Self {
            jobs,
            queue,
            policy,
        }
    }

    pub async fn sweep_once(&self) -> Result<SweepReport, SweepError> {
        let redelivered = self.queue.requeue_expired().await?;

        let stranded = self.jobs.recoverable_jobs(&self.policy).await?;
        let mut republished = 0;
        for job in &stranded {
            // A failed publish is retried on a later sweep once enqueued_at ages out.
            match self.queue.enqueue(&QueuedImport::new(*job)).await {
                Ok(()) => republished += 1,
                Err(e) => {
                    tracing::warn!(job_id = %job.job_id, error = %e, "Failed to republish job")
                }
            }
        }
        if republished > 0 {
            tracing::info!(count = republished, "Republished stranded import jobs");
        }

        let queue_depth = self.queue.depth().await?;
        metrics::gauge!("import_queue_depth").set(queue_depth as f64);

        Ok(SweepReport {
            redelivered,
            republished,
            queue_depth,
        })
    }

    /// Sweep every `interval` until shutdown is signalled.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.sweep_once().await {
                tracing::error!(error = %e, "Recovery sweep failed");
            }
        }
        tracing::info!("Recovery sweeper stopped");
    }
}
