//! Role Sync Service
//!
//! Receives admin roster update events over HTTP and reconciles identity
//! admin claims.
//!
//! # Startup
//!
//! 1. Initialize tracing
//! 2. Load configuration
//! 3. Initialize Prometheus metrics recorder
//! 4. Build the identity claims client
//! 5. Spawn the claim retry task
//! 6. Serve HTTP until SIGINT/SIGTERM, then cancel tasks and drain

use common::telemetry::init_tracing;
use role_sync::config::Config;
use role_sync::observability::metrics::init_metrics_recorder;
use role_sync::routes::{self, AppState};
use role_sync::services::claims_store::{ClaimsStore, HttpClaimsStore};
use role_sync::services::retry_queue::RetryQueue;
use role_sync::services::trigger::RosterTrigger;
use role_sync::tasks::start_claim_retry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {e}");
        e
    })?;

    init_tracing(&config.observability)?;

    info!(target: "role_sync.startup", "Starting Role Sync service");
    info!(
        target: "role_sync.startup",
        bind_address = %config.bind_address,
        roster_document_path = %config.roster_document_path,
        identity_api_url = %config.identity_api_url,
        signature_required = config.trigger_signing_secret.is_some(),
        max_concurrency = config.reconciler.max_concurrency,
        max_attempts = config.reconciler.max_attempts,
        "Configuration loaded successfully"
    );

    let metrics_handle = init_metrics_recorder().map_err(|e| {
        error!(target: "role_sync.startup", error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;

    let store: Arc<dyn ClaimsStore> = Arc::new(
        HttpClaimsStore::new(&config.identity_api_url, config.identity_api_token.clone())
            .map_err(|e| {
                error!(target: "role_sync.startup", error = %e, "Failed to build identity service client");
                e
            })?,
    );

    let retry_queue = Arc::new(RetryQueue::new());
    let trigger = Arc::new(RosterTrigger::new(
        Arc::clone(&store),
        config.roster_document_path.clone(),
        config.reconciler.clone(),
        Arc::clone(&retry_queue),
    ));

    let shutdown_token = CancellationToken::new();
    let retry_handle = tokio::spawn(start_claim_retry(
        Arc::clone(&store),
        Arc::clone(&retry_queue),
        config.reconciler.clone(),
        config.retry.clone(),
        shutdown_token.child_token(),
    ));

    let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(target: "role_sync.startup", error = %e, "Invalid bind address");
        e
    })?;
    let drain_seconds = config.drain_seconds;

    let state = Arc::new(AppState {
        config,
        trigger,
        retry_queue,
    });
    let app = routes::build_routes(state, metrics_handle);

    // Bind before serving to fail fast on bind errors
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(target: "role_sync.startup", %addr, "Role Sync listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(drain_seconds))
        .await?;

    shutdown_token.cancel();
    if let Err(e) = retry_handle.await {
        warn!(target: "role_sync.shutdown", error = %e, "Claim retry task ended abnormally");
    }

    info!(target: "role_sync.shutdown", "Role Sync shutdown complete");

    Ok(())
}

/// Returns once SIGINT or SIGTERM is received and the drain period has elapsed.
async fn shutdown_signal(drain_seconds: u64) {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!(target: "role_sync.shutdown", "Received SIGINT, starting graceful shutdown"),
            Err(e) => error!(target: "role_sync.shutdown", error = %e, "Failed to listen for SIGINT"),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!(target: "role_sync.shutdown", "Received SIGTERM, starting graceful shutdown");
            }
            Err(e) => {
                error!(target: "role_sync.shutdown", error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    if drain_seconds > 0 {
        warn!(target: "role_sync.shutdown", drain_seconds, "Draining connections");
        tokio::time::sleep(Duration::from_secs(drain_seconds)).await;
        info!(target: "role_sync.shutdown", "Drain period complete");
    } else {
        info!(target: "role_sync.shutdown", "Skipping drain period (ROLE_SYNC_DRAIN_SECONDS=0)");
    }
}
