//! Exit-node provisioning.
//!
//! [`Provisioner::provision`] runs the end-to-end flow: validate, issue an
//! agent record, render the boot script, pick a project from the
//! [`ProjectQuotaPool`], ensure the WireGuard firewall rule, reserve the
//! address, create the instance, attach it to the record and mirror the
//! result onto the linked profile.
//!
//! Steps are not transactional. When a step fails, resources committed by
//! earlier steps stay in place and are logged for manual cleanup.

mod bootstrap;
pub mod names;
pub mod pool;
mod script;
mod workflow;

pub use bootstrap::{ProjectBootstrap, ProjectBootstrapOutcome, ProjectBootstrapRequest};
pub use names::{is_valid_name, validate_name, validate_project_ref, NAME_PATTERN};
pub use pool::{ProjectQuotaPool, QuotaSource};
pub use script::StartupScript;
pub use workflow::{
    issue_agent, ProvisionOutcome, ProvisionRequest, ProvisionSettings, Provisioner,
    MAX_DISK_SIZE_GB, MIN_DISK_SIZE_GB,
};

use nave_gcp::GcpError;
use thiserror::Error;

use crate::store::StoreError;

/// Cloud-facing steps that can fail independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStep {
    CheckQuota,
    EnsureFirewall,
    ReserveAddress,
    CreateInstance,
    EnsureFolder,
    CreateProject,
    BindBilling,
    EnableService,
    GrantRole,
}

impl ProvisionStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CheckQuota => "check_quota",
            Self::EnsureFirewall => "ensure_firewall_rule",
            Self::ReserveAddress => "reserve_address",
            Self::CreateInstance => "create_instance",
            Self::EnsureFolder => "ensure_folder",
            Self::CreateProject => "create_project",
            Self::BindBilling => "bind_billing",
            Self::EnableService => "enable_service",
            Self::GrantRole => "grant_role",
        }
    }
}

impl std::fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Configuration(String),

    #[error("no project in the pool has address quota left ({scanned} checked)")]
    ResourceExhausted { scanned: usize },

    #[error("{step} failed for {resource}: {source}")]
    Step {
        step: ProvisionStep,
        resource: String,
        #[source]
        source: GcpError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ProvisionError {
    /// Wrap a provider error with the step and resource it hit.
    pub fn step(step: ProvisionStep, resource: impl Into<String>) -> impl FnOnce(GcpError) -> Self {
        let resource = resource.into();
        move |source| Self::Step {
            step,
            resource,
            source,
        }
    }
}
