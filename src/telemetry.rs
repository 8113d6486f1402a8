use tracing_subscriber::EnvFilter;

/// JSON logs filtered by `RUST_LOG`, defaulting to `info`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();
}

/// Register descriptions for the import metrics.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "import_jobs_submitted_total",
        "Total import jobs accepted for processing"
    );
    metrics::describe_counter!(
        "import_jobs_completed_total",
        "Total import jobs that reached the end of their file"
    );
    metrics::describe_counter!(
        "import_jobs_failed_total",
        "Total import jobs that failed with a file-level error"
    );
    metrics::describe_counter!(
        "import_jobs_cancelled_total",
        "Total import jobs cancelled by a client"
    );
    metrics::describe_counter!(
        "import_rows_processed_total",
        "Total file rows handled by workers"
    );
    metrics::describe_counter!(
        "import_row_errors_total",
        "Total rows recorded as import errors"
    );
    metrics::describe_counter!(
        "import_progress_events_dropped_total",
        "Progress events dropped because the publish buffer was full"
    );
    metrics::describe_histogram!(
        "import_job_duration_seconds",
        "Time from claim to terminal state of an import job run"
    );
    metrics::describe_gauge!(
        "import_queue_depth",
        "Current number of import jobs waiting in the queue"
    );
}
