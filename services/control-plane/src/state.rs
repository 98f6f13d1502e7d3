//! Application state shared across request handlers.

use std::path::PathBuf;
use std::sync::Arc;

use nave_gcp::ResourceOrchestrator;

use crate::config::Config;
use crate::provisioning::{ProjectBootstrap, ProvisionError, ProvisionSettings, Provisioner};
use crate::store::Store;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    store: Arc<dyn Store>,
    gcp: Option<Arc<ResourceOrchestrator>>,
    provisioner: Provisioner,
    operator_secret: Option<String>,
    agent_binary: Option<PathBuf>,
    billing_account: Option<String>,
    folder_name: String,
}

impl AppState {
    pub fn new(
        config: &Config,
        store: Arc<dyn Store>,
        gcp: Option<Arc<ResourceOrchestrator>>,
    ) -> Self {
        let settings = ProvisionSettings::new(
            config.public_base_url.clone(),
            config.gcp.quota_metric.clone(),
        );
        let provisioner = Provisioner::new(store.clone(), gcp.clone(), settings);
        Self {
            inner: Arc::new(AppStateInner {
                store,
                gcp,
                provisioner,
                operator_secret: config.operator_secret.clone(),
                agent_binary: config.agent_binary.clone(),
                billing_account: config.gcp.billing_account.clone(),
                folder_name: config.gcp.folder_name.clone(),
            }),
        }
    }

    pub fn store(&self) -> &dyn Store {
        self.inner.store.as_ref()
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.inner.provisioner
    }

    /// The cloud orchestrator, or a configuration error when no credentials
    /// were supplied.
    pub fn gcp(&self) -> Result<&ResourceOrchestrator, ProvisionError> {
        self.inner.gcp.as_deref().ok_or_else(|| {
            ProvisionError::Configuration("cloud credentials are not configured".into())
        })
    }

    pub fn project_bootstrap(&self) -> Result<ProjectBootstrap, ProvisionError> {
        let gcp = self.inner.gcp.clone().ok_or_else(|| {
            ProvisionError::Configuration("cloud credentials are not configured".into())
        })?;
        ProjectBootstrap::new(
            self.inner.store.clone(),
            gcp,
            self.inner.billing_account.as_deref(),
            self.inner.folder_name.clone(),
        )
    }

    pub fn operator_secret(&self) -> Option<&str> {
        self.inner.operator_secret.as_deref()
    }

    pub fn agent_binary(&self) -> Option<&PathBuf> {
        self.inner.agent_binary.as_ref()
    }
}
