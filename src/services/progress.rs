//! Progress fan-out.
//!
//! Workers publish [`ProgressEvent`]s on a Redis channel. The API process
//! relays that channel into a [`ProgressHub`], an in-process broadcast
//! channel with one receiver per SSE subscriber. Publishing never blocks or
//! fails the caller: an event nobody is listening to is simply dropped.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use crate::models::event::ProgressEvent;

pub const PROGRESS_CHANNEL: &str = "stock_import:progress";

const HUB_CAPACITY: usize = 1024;
const PUBLISH_BUFFER: usize = 1024;
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);
const RELAY_RETRY_MIN: Duration = Duration::from_millis(500);
const RELAY_RETRY_MAX: Duration = Duration::from_secs(30);

/// Fire-and-forget sink for progress events.
#[async_trait]
pub trait ProgressPublisher: Send + Sync {
    async fn publish(&self, event: ProgressEvent);
}

/// In-process broadcast of progress events.
#[derive(Clone)]
pub struct ProgressHub {
    sender: broadcast::Sender<ProgressEvent>,
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new(HUB_CAPACITY)
    }
}

impl ProgressHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    pub fn send(&self, event: ProgressEvent) {
        // Err only means there are no subscribers right now.
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl ProgressPublisher for ProgressHub {
    async fn publish(&self, event: ProgressEvent) {
        self.send(event);
    }
}

/// Publishes events onto the Redis progress channel.
///
/// Events are handed to a background sender task over a bounded channel, so
/// a slow or unreachable Redis costs the caller nothing. When the buffer is
/// full the event is dropped; a later event carries newer counters anyway.
pub struct RedisProgressPublisher {
    sender: mpsc::Sender<ProgressEvent>,
}

impl RedisProgressPublisher {
    /// Must be called from within a Tokio runtime.
    pub fn new(redis_url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let (sender, receiver) = mpsc::channel(PUBLISH_BUFFER);
        tokio::spawn(run_sender(client, receiver));
        Ok(Self { sender })
    }
}

#[async_trait]
impl ProgressPublisher for RedisProgressPublisher {
    async fn publish(&self, event: ProgressEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                metrics::counter!("import_progress_events_dropped_total").increment(1);
                tracing::debug!(job_id = %event.job_id, "Progress buffer full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                tracing::warn!(job_id = %event.job_id, "Progress sender stopped, dropping event");
            }
        }
    }
}

/// Drain queued events onto Redis over one cached connection.
async fn run_sender(client: redis::Client, mut receiver: mpsc::Receiver<ProgressEvent>) {
    let mut connection = None;
    while let Some(event) = receiver.recv().await {
        if let Err(e) = send_event(&client, &mut connection, &event).await {
            tracing::warn!(job_id = %event.job_id, error = %e, "Failed to publish progress event");
        }
    }
}

/// A failed send drops the cached connection; the next event reconnects.
async fn send_event(
    client: &redis::Client,
    cached: &mut Option<MultiplexedConnection>,
    event: &ProgressEvent,
) -> Result<(), PublishError> {
    let payload = serde_json::to_string(event)?;
    let attempt = async {
        let mut conn = match cached.take() {
            Some(conn) => conn,
            None => client.get_multiplexed_async_connection().await?,
        };
        conn.publish::<_, _, ()>(PROGRESS_CHANNEL, payload).await?;
        Ok::<_, redis::RedisError>(conn)
    };
    let conn = tokio::time::timeout(PUBLISH_TIMEOUT, attempt)
        .await
        .map_err(|_| PublishError::Timeout)??;
    *cached = Some(conn);
    Ok(())
}

#[derive(Debug, thiserror::Error)]
enum PublishError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Timed out publishing to Redis")]
    Timeout,
}

/// Forward the Redis progress channel into `hub` until the process exits,
/// reconnecting with backoff when the subscription drops.
pub fn spawn_event_relay(
    redis_url: &str,
    hub: ProgressHub,
) -> Result<tokio::task::JoinHandle<()>, redis::RedisError> {
    let client = redis::Client::open(redis_url)?;

    Ok(tokio::spawn(async move {
        let mut backoff = RELAY_RETRY_MIN;
        loop {
            match relay(&client, &hub, &mut backoff).await {
                Ok(()) => tracing::warn!("Progress subscription closed, reconnecting"),
                Err(e) => tracing::error!(error = %e, "Progress relay failed, reconnecting"),
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RELAY_RETRY_MAX);
        }
    }))
}

async fn relay(
    client: &redis::Client,
    hub: &ProgressHub,
    backoff: &mut Duration,
) -> Result<(), redis::RedisError> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(PROGRESS_CHANNEL).await?;
    tracing::info!(channel = PROGRESS_CHANNEL, "Relaying progress events");
    *backoff = RELAY_RETRY_MIN;

    let mut messages = std::pin::pin!(pubsub.on_message());
    while let Some(msg) = messages.next().await {
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "Unreadable progress message");
                continue;
            }
        };
        match serde_json::from_str::<ProgressEvent>(&payload) {
            Ok(event) => hub.send(event),
            Err(e) => tracing::warn!(error = %e, "Malformed progress event"),
        }
    }
    Ok(())
}
