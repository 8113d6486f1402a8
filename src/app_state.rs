use std::sync::Arc;

use crate::services::progress::ProgressHub;
use crate::services::queue::WorkQueue;
use crate::services::worker::ImportServices;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub services: ImportServices,
    pub queue: Arc<dyn WorkQueue>,
    /// Local fan-out of progress events for SSE subscribers.
    pub hub: ProgressHub,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(
        services: ImportServices,
        queue: Arc<dyn WorkQueue>,
        hub: ProgressHub,
        max_upload_bytes: usize,
    ) -> Self {
        Self {
            services,
            queue,
            hub,
            max_upload_bytes,
        }
    }
}
