use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::models::job::{EntityType, JobRef};

const QUEUE_KEY: &str = "stock_import:jobs";
const PROCESSING_KEY: &str = "stock_import:processing";
/// Sorted set of in-flight payloads scored by their redelivery deadline (unix seconds).
const INFLIGHT_KEY: &str = "stock_import:inflight";

/// Job reference serialized into Redis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedImport {
    /// Unique per publish, so two messages for one job stay distinguishable.
    pub delivery_id: Uuid,
    pub job_id: Uuid,
    pub workspace_id: Uuid,
    pub entity_type: EntityType,
}

impl QueuedImport {
    pub fn new(job: JobRef) -> Self {
        Self {
            delivery_id: Uuid::new_v4(),
            job_id: job.job_id,
            workspace_id: job.workspace_id,
            entity_type: job.entity_type,
        }
    }
}

/// A dequeued message. Must be acked or nacked; otherwise it is redelivered
/// once its visibility timeout expires.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: QueuedImport,
    pub receipt: String,
}

/// At-least-once work queue carrying job references.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, job: &QueuedImport) -> Result<(), QueueError>;

    /// Wait up to `wait` for the next message.
    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Acknowledge: the message is done with and never redelivered.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Hand the message back for immediate redelivery.
    async fn nack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Return expired in-flight messages to the queue. Returns how many moved.
    async fn requeue_expired(&self) -> Result<u64, QueueError>;

    async fn depth(&self) -> Result<u64, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

/// Redis-backed queue: a list, a processing list, and a deadline set.
pub struct RedisQueue {
    client: redis::Client,
    visibility_timeout: Duration,
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl RedisQueue {
    pub fn new(redis_url: &str, visibility_timeout: Duration) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            visibility_timeout,
        })
    }

    fn deadline(&self) -> i64 {
        unix_now() + self.visibility_timeout.as_secs() as i64
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }
}

#[async_trait]
impl WorkQueue for RedisQueue {
    async fn enqueue(&self, job: &QueuedImport) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(job)?;
        conn.lpush::<_, _, ()>(QUEUE_KEY, &payload).await?;
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.connection().await?;
        let payload: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(QUEUE_KEY)
            .arg(PROCESSING_KEY)
            .arg(wait.as_secs().max(1))
            .query_async(&mut conn)
            .await?;

        let Some(payload) = payload else {
            return Ok(None);
        };
        conn.zadd::<_, _, _, ()>(INFLIGHT_KEY, &payload, self.deadline())
            .await?;

        match serde_json::from_str::<QueuedImport>(&payload) {
            Ok(job) => Ok(Some(Delivery {
                job,
                receipt: payload,
            })),
            Err(e) => {
                // Unreadable messages are dropped rather than redelivered forever.
                tracing::error!(payload = %payload, error = %e, "Discarding malformed queue message");
                redis::pipe()
                    .atomic()
                    .lrem(PROCESSING_KEY, 1, &payload)
                    .zrem(INFLIGHT_KEY, &payload)
                    .query_async::<()>(&mut conn)
                    .await?;
                Ok(None)
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::pipe()
            .atomic()
            .lrem(PROCESSING_KEY, 1, &delivery.receipt)
            .zrem(INFLIGHT_KEY, &delivery.receipt)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::pipe()
            .atomic()
            .lrem(PROCESSING_KEY, 1, &delivery.receipt)
            .zrem(INFLIGHT_KEY, &delivery.receipt)
            .rpush(QUEUE_KEY, &delivery.receipt)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn requeue_expired(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;

        // A consumer that died between the pop and the ZADD leaves a payload
        // without a deadline; give it one so it eventually expires.
        let processing: Vec<String> = conn.lrange(PROCESSING_KEY, 0, -1).await?;
        for payload in &processing {
            let score: Option<f64> = conn.zscore(INFLIGHT_KEY, payload).await?;
            if score.is_none() {
                redis::cmd("ZADD")
                    .arg(INFLIGHT_KEY)
                    .arg("NX")
                    .arg(self.deadline())
                    .arg(payload)
                    .query_async::<()>(&mut conn)
                    .await?;
            }
        }

        let expired: Vec<String> = conn
            .zrangebyscore(INFLIGHT_KEY, "-inf", unix_now())
            .await?;

        let mut moved = 0;
        for payload in expired {
            // Whoever removes the deadline entry owns the redelivery.
            let owned: i64 = conn.zrem(INFLIGHT_KEY, &payload).await?;
            if owned == 0 {
                continue;
            }
            let removed: i64 = conn.lrem(PROCESSING_KEY, 1, &payload).await?;
            if removed > 0 {
                conn.lpush::<_, _, ()>(QUEUE_KEY, &payload).await?;
                moved += 1;
            }
        }

        if moved > 0 {
            tracing::warn!(count = moved, "Requeued expired deliveries");
        }
        Ok(moved)
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn.llen(QUEUE_KEY).await?;
        Ok(depth)
    }

    /// Check Redis connectivity (for health checks).
    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
