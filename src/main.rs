use axum::routing::get;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use stock_import::app_state::AppState;
use stock_import::config::AppConfig;
use stock_import::db::{self, PgEntityCreator, PgImportStore};
use stock_import::routes;
use stock_import::services::mapper::MapperRegistry;
use stock_import::services::progress::{spawn_event_relay, ProgressHub, RedisProgressPublisher};
use stock_import::services::queue::RedisQueue;
use stock_import::services::storage;
use stock_import::services::worker::ImportServices;
use stock_import::telemetry;

#[tokio::main]
async fn main() {
    telemetry::init_tracing();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing stock-import API server");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    telemetry::describe_metrics();

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    let blob_store = storage::from_config(&config).expect("Failed to initialize upload storage");

    tracing::info!("Connecting to Redis job queue");
    let queue = RedisQueue::new(&config.redis_url, config.visibility_timeout())
        .expect("Failed to initialize job queue");
    let publisher =
        RedisProgressPublisher::new(&config.redis_url).expect("Failed to initialize publisher");

    let hub = ProgressHub::default();
    spawn_event_relay(&config.redis_url, hub.clone()).expect("Failed to start progress relay");

    let store = Arc::new(PgImportStore::new(db_pool.clone()));
    let services = ImportServices {
        jobs: store.clone(),
        errors: store,
        storage: blob_store,
        creator: Arc::new(PgEntityCreator::new(db_pool)),
        mappers: Arc::new(MapperRegistry::with_defaults()),
        progress: Arc::new(publisher),
    };
    let state = AppState::new(services, Arc::new(queue), hub, config.max_upload_bytes);

    let app = routes::router(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");
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
    tracing::info!("Shutdown signal received");
}
