//! SSE progress stream.
//!
//! ```text
//! GET /workspaces/{workspace_id}/events
//! GET /workspaces/{workspace_id}/events?job_id=<uuid>
//! ```
//!
//! On connect the stream starts with one `import.progress` event per active
//! job of the workspace, then follows live updates.

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::ApiError;
use crate::models::api::EventsQuery;
use crate::models::event::{ProgressEvent, PROGRESS_EVENT};

const SNAPSHOT_LIMIT: i64 = 200;

fn to_sse_event(event: &ProgressEvent) -> Event {
    Event::default()
        .event(PROGRESS_EVENT)
        .id(format!("{}:{}", event.job_id, event.processed_rows))
        .json_data(event)
        .unwrap_or_else(|_| Event::default().comment("serialization error"))
}

fn wanted(event: &ProgressEvent, workspace_id: Uuid, job_id: Option<Uuid>) -> bool {
    event.workspace_id == workspace_id && job_id.map_or(true, |id| id == event.job_id)
}

pub async fn workspace_events(
    State(state): State<AppState>,
    Path(workspace_id): Path<Uuid>,
    Query(params): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    // Subscribe before reading the snapshot so nothing falls in between.
    let receiver = state.hub.subscribe();

    let active = state
        .services
        .jobs
        .list_jobs(workspace_id, true, SNAPSHOT_LIMIT)
        .await?;
    let initial: Vec<Result<Event, Infallible>> = active
        .iter()
        .map(ProgressEvent::snapshot)
        .filter(|event| wanted(event, workspace_id, params.job_id))
        .map(|event| Ok(to_sse_event(&event)))
        .collect();

    let job_filter = params.job_id;
    let live = stream::unfold(receiver, move |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if wanted(&event, workspace_id, job_filter) {
                        return Some((Ok(to_sse_event(&event)), rx));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(
                        workspace_id = %workspace_id,
                        lagged = n,
                        "SSE subscriber lagged, progress events dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Ok(Sse::new(stream::iter(initial).chain(live))
        .keep_alive(KeepAlive::default().interval(Duration::from_secs(15))))
}
