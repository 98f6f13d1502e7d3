//! nave control plane
//!
//! Serves the `/infra` API: exit-node provisioning, the project quota pool
//! and the agent endpoints node agents poll.

use std::sync::Arc;

use anyhow::{Context, Result};
use nave_control_plane::{
    api, config,
    config::StoreBackend,
    db::Database,
    state::AppState,
    store::{MemoryStore, PgStore, Store},
};
use nave_gcp::{Endpoints, ResourceOrchestrator};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to NAVE_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting nave control plane");
    info!(listen_addr = %config.listen_addr, store = ?config.store, "Configuration loaded");

    let store: Arc<dyn Store> = match config.store {
        StoreBackend::Postgres => {
            let db = match Database::connect(&config.database).await {
                Ok(db) => {
                    info!("Database connection established");
                    db
                }
                Err(e) => {
                    error!(error = %e, "Failed to connect to database");
                    return Err(e.into());
                }
            };
            if config.dev_mode {
                info!("Running database migrations (dev mode)");
                if let Err(e) = db.run_migrations().await {
                    error!(error = %e, "Failed to run migrations");
                    return Err(e.into());
                }
            }
            Arc::new(PgStore::new(db))
        }
        StoreBackend::Memory => {
            warn!("Using the in-memory store; records are lost on exit");
            Arc::new(MemoryStore::new())
        }
    };

    let gcp = match &config.gcp.service_account_key_b64 {
        Some(key) => {
            let orchestrator = ResourceOrchestrator::from_service_account_b64(
                key,
                Endpoints::default(),
                config.gcp.defaults.clone(),
            )
            .context("invalid GCP_SA_KEY_B64")?;
            info!(
                project = %config.gcp.defaults.project_id,
                region = %config.gcp.defaults.region,
                service_account = ?orchestrator.client().service_account_email(),
                "Cloud credentials loaded"
            );
            Some(Arc::new(orchestrator))
        }
        None => {
            warn!("GCP_SA_KEY_B64 is not set; cloud endpoints will answer 503");
            None
        }
    };

    if config.operator_secret.is_none() {
        warn!("NAVE_OPERATOR_SECRET is not set; operator endpoints will answer 503");
    }

    let state = AppState::new(&config, store, gcp);
    let app = api::create_router(state);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    info!("Control plane shutdown complete");
    Ok(())
}
