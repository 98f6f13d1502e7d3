//! nave node agent
//!
//! Runs on each exit node and keeps its WireGuard interface matching the
//! configuration the control plane holds for this agent.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use nave_node_agent::config::Config;
use nave_node_agent::reconciler::Reconciler;
use nave_node_agent::wireguard::WgQuick;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("failed to load agent configuration")?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        api_base = %config.api_base,
        agent_id = ?config.agent_id.map(|id| id.to_string()),
        wg_config_path = %config.wg_config_path.display(),
        "Starting nave node agent"
    );

    let interface = Arc::new(WgQuick::new(&config.wg_config_path, &config.wg_interface));
    let reconciler = Reconciler::new(&config, interface).context("failed to build reconciler")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handle = tokio::spawn(reconciler.run(shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
            let _ = (&mut handle).await;
        }
        _ = &mut handle => {
            info!("Reconciler exited");
        }
    }

    info!("Node agent shutdown complete");
    Ok(())
}
