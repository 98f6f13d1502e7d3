//! Google Cloud access for the nave control plane.
//!
//! Two layers:
//!
//! - [`GcpClient`]: turns a [`TokenSource`] into authenticated JSON calls
//!   against the compute, resource-manager, billing and service-usage APIs,
//!   and waits on provider long-running operations with a bounded deadline.
//! - [`ResourceOrchestrator`]: idempotent, higher-level operations built on
//!   the client (firewall rules, static addresses, instances, service
//!   enablement, project bootstrap, quota reads).
//!
//! Construct one orchestrator per process and share it behind an `Arc`.

mod admin;
mod auth;
mod client;
mod compute;
mod config;
mod error;

pub use admin::{is_transient_enable_error, CORE_SERVICES, SERVICE_ENABLE_TIMEOUT};
pub use auth::{ServiceAccountTokenSource, StaticTokenSource, TokenSource, CLOUD_PLATFORM_SCOPE};
pub use client::{GcpClient, OperationScope};
pub use compute::{
    instance_public_ip, Address, AllowedRule, EnsureOutcome, FirewallRequest, InstanceRequest,
    Quota,
};
pub use config::{Endpoints, ResourceDefaults, ServiceAccountKey, ServiceEnableRetry};
pub use error::{GcpError, GcpResult};
pub use reqwest::Method;

/// Idempotent cloud resource operations scoped by [`ResourceDefaults`].
///
/// Operations are implemented in the `compute` and `admin` modules.
pub struct ResourceOrchestrator {
    client: GcpClient,
    defaults: ResourceDefaults,
    enable_retry: ServiceEnableRetry,
}

impl ResourceOrchestrator {
    /// Create an orchestrator over an existing client.
    pub fn new(client: GcpClient, defaults: ResourceDefaults) -> Self {
        Self {
            client,
            defaults,
            enable_retry: ServiceEnableRetry::default(),
        }
    }

    /// Create an orchestrator authenticated with service-account key material
    /// (a base64-encoded JSON key).
    pub fn from_service_account_b64(
        key_b64: &str,
        endpoints: Endpoints,
        defaults: ResourceDefaults,
    ) -> GcpResult<Self> {
        let key = ServiceAccountKey::from_base64(key_b64)?;
        let client = GcpClient::from_service_account(key, endpoints)?;
        Ok(Self::new(client, defaults))
    }

    /// Override the retry policy used by service enablement.
    pub fn with_enable_retry(mut self, retry: ServiceEnableRetry) -> Self {
        self.enable_retry = retry;
        self
    }

    /// The underlying API client.
    pub fn client(&self) -> &GcpClient {
        &self.client
    }

    /// Resource defaults, optionally re-targeted at another project.
    pub fn defaults(&self, project_id: Option<&str>) -> ResourceDefaults {
        match project_id {
            Some(project_id) => self.defaults.for_project(project_id),
            None => self.defaults.clone(),
        }
    }

    fn project<'a>(&'a self, project_id: Option<&'a str>) -> &'a str {
        project_id.unwrap_or(&self.defaults.project_id)
    }
}
