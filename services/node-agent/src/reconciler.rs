//! Reconciliation loop for converging the node's WireGuard interface.
//!
//! Each cycle:
//! - Registers with the control plane (first cycle, and until an id is known)
//! - Fetches the desired configuration
//! - Applies it when its content hash differs from the last applied hash
//! - Reports status back to the control plane
//!
//! Failures inside a cycle become an error status report; the loop itself
//! never exits on error.

use std::sync::Arc;
use std::time::Duration;

use nave_id::AgentId;
use nave_reconcile::ConfigHash;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::client::ControlPlaneClient;
use crate::config::Config;
use crate::error::AgentError;
use crate::wireguard::Interface;

/// Where the agent is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// No agent id known yet.
    Unregistered,
    /// Waiting for the next cycle.
    Idle,
    /// Writing config and cycling the interface.
    Applying,
}

/// What a single cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Registration failed and no agent id is known; nothing else ran.
    Unregistered,
    /// Desired config was empty or already applied.
    Unchanged,
    /// A new config was applied.
    Applied(ConfigHash),
    /// The cycle failed; an error status was reported.
    Failed(String),
}

/// Reconciler for the node's WireGuard interface.
pub struct Reconciler {
    client: ControlPlaneClient,
    interface: Arc<dyn Interface>,
    vm_name: Option<String>,
    public_ip: Option<String>,
    agent_id: Option<AgentId>,
    register_pending: bool,
    last_hash: Option<ConfigHash>,
    state: AgentState,
    poll_interval: Duration,
}

impl Reconciler {
    pub fn new(config: &Config, interface: Arc<dyn Interface>) -> Result<Self, AgentError> {
        Ok(Self {
            client: ControlPlaneClient::new(config)?,
            interface,
            vm_name: config.vm_name.clone(),
            public_ip: config.public_ip.clone(),
            agent_id: config.agent_id,
            register_pending: true,
            last_hash: None,
            state: if config.agent_id.is_some() {
                AgentState::Idle
            } else {
                AgentState::Unregistered
            },
            poll_interval: config.poll_interval,
        })
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn agent_id(&self) -> Option<AgentId> {
        self.agent_id
    }

    /// Hash of the configuration last brought up successfully.
    pub fn last_hash(&self) -> Option<&ConfigHash> {
        self.last_hash.as_ref()
    }

    /// Run the reconciliation loop until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            "Starting reconciliation loop"
        );

        loop {
            match self.run_once().await {
                CycleOutcome::Applied(hash) => info!(hash = %hash, "Applied WireGuard config"),
                CycleOutcome::Failed(e) => warn!(error = %e, "Reconciliation cycle failed"),
                CycleOutcome::Unregistered => warn!("Agent not registered yet, will retry"),
                CycleOutcome::Unchanged => debug!("Config unchanged"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Perform one register/fetch/apply/report cycle.
    pub async fn run_once(&mut self) -> CycleOutcome {
        if self.register_pending {
            self.register().await;
        }

        let Some(agent_id) = self.agent_id else {
            return CycleOutcome::Unregistered;
        };

        let (outcome, status) = match self.reconcile(&agent_id).await {
            Ok(applied) => {
                let status = json!({
                    "ts": now_secs(),
                    "wg_conf_hash": self.last_hash.as_ref().map(ConfigHash::as_str).unwrap_or(""),
                    "applied": applied.is_some(),
                });
                let outcome = match applied {
                    Some(hash) => CycleOutcome::Applied(hash),
                    None => CycleOutcome::Unchanged,
                };
                (outcome, status)
            }
            Err(e) => {
                let message = e.to_string();
                let status = json!({ "ts": now_secs(), "error": message });
                (CycleOutcome::Failed(message), status)
            }
        };

        if let Err(e) = self.client.report_status(&agent_id, &status).await {
            error!(agent_id = %agent_id, error = %e, "Failed to report status");
        }

        outcome
    }

    async fn register(&mut self) {
        match self
            .client
            .register(self.vm_name.as_deref(), self.public_ip.as_deref())
            .await
        {
            Ok(agent_id) => {
                if let Some(known) = self.agent_id.filter(|known| *known != agent_id) {
                    warn!(configured = %known, registered = %agent_id, "Agent id differs from configuration");
                }
                info!(agent_id = %agent_id, "Registered with control plane");
                self.agent_id = Some(agent_id);
                self.register_pending = false;
                if self.state == AgentState::Unregistered {
                    self.state = AgentState::Idle;
                }
            }
            Err(e) if self.agent_id.is_some() => {
                warn!(error = %e, "Registration failed, continuing with configured agent id");
                self.register_pending = false;
            }
            Err(e) => {
                warn!(error = %e, "Registration failed");
            }
        }
    }

    /// Returns the newly applied hash, or `None` when nothing changed.
    async fn reconcile(&mut self, agent_id: &AgentId) -> Result<Option<ConfigHash>, AgentError> {
        let desired = self.client.fetch_desired(agent_id).await?;

        let Some(hash) = ConfigHash::of(desired.wg_conf()) else {
            debug!("No desired config yet");
            return Ok(None);
        };
        if self.last_hash.as_ref() == Some(&hash) {
            return Ok(None);
        }

        self.state = AgentState::Applying;
        let result = self.interface.apply(desired.wg_conf()).await;
        self.state = AgentState::Idle;
        result?;

        self.last_hash = Some(hash.clone());
        Ok(Some(hash))
    }
}

/// Wall-clock seconds since the epoch, with sub-second precision.
fn now_secs() -> Value {
    json!(chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0)
}
