//! lineloom — streaming line-oriented file ingest and durable job processing.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use lineloom::api::handlers::{get_job, healthz, process, root, upload, AppState};
use lineloom::catalog::Catalog;
use lineloom::config::{BackendConfig, Config};
use lineloom::jobs::JobQueue;
use lineloom::metadata::{MetadataStore, MongoMetadataStore};
use lineloom::storage::{FilesystemObjectStore, ObjectStore, S3ObjectStore};
use lineloom::worker::{Worker, WorkerConfig};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Loaded once, before the tokio runtime exists, so the runtime builder
    // below can size itself off it if a future tuning knob needs to.
    let config = Config::from_env();

    let mut runtime_builder = tokio::runtime::Builder::new_multi_thread();
    runtime_builder.enable_all();
    let runtime = runtime_builder.build()?;

    runtime.block_on(async_main(config))
}

async fn async_main(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lineloom=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    config
        .validate()
        .map_err(|e| -> Box<dyn std::error::Error> { e.into() })?;

    info!("Starting lineloom v{}", env!("CARGO_PKG_VERSION"));
    info!("  Listen address: {}", config.listen_addr);
    match &config.backend {
        BackendConfig::Filesystem { data_dir } => {
            info!("  Backend: filesystem ({:?})", data_dir);
        }
        BackendConfig::S3 { bucket, region, .. } => {
            info!("  Backend: S3 (bucket={}, region={})", bucket, region);
        }
    }
    info!("  Worker enabled: {}", config.enable_worker);

    let metadata: Arc<dyn MetadataStore> =
        Arc::new(MongoMetadataStore::connect(&config.mongodb_uri).await?);

    let store: Arc<dyn ObjectStore> = match &config.backend {
        BackendConfig::S3 { .. } => Arc::new(S3ObjectStore::new(&config.backend).await?),
        BackendConfig::Filesystem { data_dir } => {
            Arc::new(FilesystemObjectStore::new(data_dir.clone()).await?)
        }
    };

    let catalog = Catalog::new(metadata.clone());
    let jobs = Arc::new(JobQueue::new(
        metadata.clone(),
        config.job_lock_timeout,
        config.job_stale_threshold,
        config.max_job_attempts,
    ));

    let recovery = jobs.recover_stale().await?;
    info!(
        reset = recovery.reset,
        failed = recovery.failed,
        "stale job recovery complete"
    );

    if config.enable_worker {
        let worker = Worker::new(
            jobs.clone(),
            Arc::new(Catalog::new(metadata.clone())),
            store.clone(),
            metadata.clone(),
            WorkerConfig {
                batch_size: config.job_batch_size,
                write_pause: config.job_write_pause,
                poll_interval: config.worker_poll_interval,
                worker_id: config.worker_id.clone(),
            },
        );
        tokio::spawn(async move { worker.run().await });
        info!("  Worker started: {}", config.worker_id);
    }

    let state = Arc::new(AppState {
        store,
        catalog,
        jobs,
        metadata,
        allowed_file_types: config.allowed_file_types.clone(),
        max_file_size: config.max_file_size,
    });

    let app = Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/upload", post(upload))
        .route("/process/:file_id", post(process))
        .route("/jobs/:job_id", get(get_job))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!("lineloom listening on http://{}", config.listen_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            warn!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}
