use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;

use crate::app_state::AppState;

pub mod events;
pub mod health;
pub mod imports;
pub mod metrics;

/// Room for multipart boundaries and part headers around the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Import API routes.
pub fn router(state: AppState) -> Router {
    let body_limit = state.max_upload_bytes + MULTIPART_OVERHEAD;

    Router::new()
        .route("/health", get(health::health_check))
        .route(
            "/workspaces/{workspace_id}/import/{entity_type}",
            post(imports::upload_import),
        )
        .route(
            "/workspaces/{workspace_id}/import-jobs",
            get(imports::list_import_jobs),
        )
        .route(
            "/workspaces/{workspace_id}/events",
            get(events::workspace_events),
        )
        .route("/import-jobs/{job_id}", get(imports::get_import_job))
        .route(
            "/import-jobs/{job_id}/errors",
            get(imports::list_import_errors),
        )
        .route(
            "/import-jobs/{job_id}/cancel",
            post(imports::cancel_import_job),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
