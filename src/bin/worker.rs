use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

use stock_import::config::AppConfig;
use stock_import::db::{self, PgEntityCreator, PgImportStore};
use stock_import::services::mapper::MapperRegistry;
use stock_import::services::progress::RedisProgressPublisher;
use stock_import::services::queue::{RedisQueue, WorkQueue};
use stock_import::services::recovery::RecoverySweeper;
use stock_import::services::storage;
use stock_import::services::worker::{ImportServices, ImportWorker};
use stock_import::telemetry;

/// How long one dequeue waits for a message before re-checking for shutdown.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() {
    telemetry::init_tracing();

    tracing::info!("Starting stock import worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    if let Some(addr) = &config.worker_metrics_addr {
        let addr: SocketAddr = addr.parse().expect("Invalid WORKER_METRICS_ADDR");
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .expect("Failed to install Prometheus exporter");
        telemetry::describe_metrics();
        tracing::info!(%addr, "Serving worker metrics");
    }

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    let blob_store = storage::from_config(&config).expect("Failed to initialize upload storage");
    let queue: Arc<dyn WorkQueue> = Arc::new(
        RedisQueue::new(&config.redis_url, config.visibility_timeout())
            .expect("Failed to initialize job queue"),
    );
    let publisher =
        RedisProgressPublisher::new(&config.redis_url).expect("Failed to initialize publisher");

    let store = Arc::new(PgImportStore::new(db_pool.clone()));
    let services = ImportServices {
        jobs: store.clone(),
        errors: store.clone(),
        storage: blob_store,
        creator: Arc::new(PgEntityCreator::new(db_pool)),
        mappers: Arc::new(MapperRegistry::with_defaults()),
        progress: Arc::new(publisher),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown requested, finishing at the next checkpoint");
        let _ = shutdown_tx.send(true);
    });

    let base_id = config
        .worker_id
        .clone()
        .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()));
    let settings = config.worker_settings();
    let concurrency = config.worker_concurrency.max(1);

    let mut tasks = JoinSet::new();
    for slot in 0..concurrency {
        // Each consumer owns jobs under its own identity.
        let worker = ImportWorker::new(
            format!("{}-{}", base_id, slot),
            services.clone(),
            settings,
            shutdown_rx.clone(),
        );
        let queue = queue.clone();
        tasks.spawn(async move { worker.run(queue.as_ref(), POLL_INTERVAL).await });
    }

    let sweeper = RecoverySweeper::new(store, queue.clone(), config.recovery_policy());
    let sweep_interval = config.sweep_interval();
    let sweep_shutdown = shutdown_rx.clone();
    tasks.spawn(async move { sweeper.run(sweep_interval, sweep_shutdown).await });

    tracing::info!(worker_id = %base_id, concurrency, "Worker ready");

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            tracing::error!(error = %e, "Worker task ended abnormally");
        }
    }

    tracing::info!("Worker stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
