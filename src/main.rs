use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use file_node::{
    api,
    auth::TokenVerifier,
    config::{Config, StorageBackend},
    files::{spawn_maintenance, HttpPeerClient},
    object_store as obj, AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    match log_format.to_lowercase().as_str() {
        "gcp" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_stackdriver::layer())
                .init();
        }
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_span_list(false),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    info!(version = env!("CARGO_PKG_VERSION"), "file-node starting");

    // Load configuration
    let config = Config::load()?;
    info!(
        node_id = %config.node.id,
        mode = %config.node.mode,
        capacity_bytes = config.node.capacity_bytes,
        "Loaded configuration"
    );

    // Initialize object store backend
    let object_store: Arc<dyn obj::ObjectStore> = match config.storage.backend {
        StorageBackend::Local => {
            let store = obj::LocalStore::new(&config.storage.local_storage_path)?;
            info!(
                "Using local storage backend at: {}",
                config.storage.local_storage_path
            );
            Arc::new(store)
        }
        StorageBackend::Gcs => {
            let bucket = config
                .storage
                .gcs_bucket
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("GCS_BUCKET is required for the gcs backend"))?;
            let store =
                obj::GcsStore::new(bucket, config.storage.gcs_credentials_file.as_deref()).await?;
            info!("Using GCS storage backend, bucket: {}", bucket);
            Arc::new(store)
        }
    };

    // Token verification against the registry's public key
    let public_key = config
        .auth
        .public_key_file
        .as_deref()
        .map(TokenVerifier::load_public_key)
        .transpose()?;
    let verifier = TokenVerifier::new(
        public_key,
        config.auth.required,
        config.auth.leeway_seconds,
    );
    if !verifier.is_required() {
        tracing::warn!("AUTH_REQUIRED=false, requests without a token act as an anonymous admin");
    }

    let peers = Arc::new(HttpPeerClient::new(config.transfer_timeout)?);

    // Open index and WAL, resolve anything a previous run left pending
    let (state, report) = AppState::open(config.clone(), object_store, peers, verifier).await?;
    if !report.is_clean() {
        tracing::error!(
            inconsistent = ?report.inconsistent,
            "Recovery quarantined files, node starts degraded"
        );
    }
    let state = Arc::new(state);

    // Start background tasks (retention sweeper, consistency scanner)
    let maintenance_handles = spawn_maintenance(
        Arc::clone(&state.files),
        config.maintenance.retention_sweep_interval,
        config.maintenance.consistency_scan_interval,
    );

    // Build and start the HTTP server
    let app = api::create_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&config.node.bind_address).await?;
    info!("Listening on: {}", config.node.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cleanup: abort background tasks
    info!("Shutting down background tasks");
    for handle in maintenance_handles {
        handle.abort();
    }

    info!("Shutdown complete");
    Ok(())
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
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining connections");
}
