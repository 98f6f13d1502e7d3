//! Organization-managed project bootstrap.
//!
//! Creates a fresh project for the quota pool: folder, project, billing,
//! APIs, IAM, then pool registration. Like provisioning, a failed step
//! leaves earlier steps in place.

use std::sync::Arc;

use nave_gcp::{ResourceOrchestrator, SERVICE_ENABLE_TIMEOUT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::{validate_name, ProvisionError, ProvisionStep};
use crate::store::Store;

const COMPUTE_SERVICE: &str = "compute.googleapis.com";
const CONTROL_PLANE_ROLE: &str = "roles/editor";

/// Project ids are 6 to 30 characters.
const PROJECT_ID_MIN: usize = 6;
const PROJECT_ID_MAX: usize = 30;

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectBootstrapRequest {
    pub project_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectBootstrapOutcome {
    pub project_id: String,
    pub folder: Option<String>,
    pub project: Value,
}

pub struct ProjectBootstrap {
    store: Arc<dyn Store>,
    gcp: Arc<ResourceOrchestrator>,
    billing_account: String,
    folder_name: String,
}

impl ProjectBootstrap {
    pub fn new(
        store: Arc<dyn Store>,
        gcp: Arc<ResourceOrchestrator>,
        billing_account: Option<&str>,
        folder_name: impl Into<String>,
    ) -> Result<Self, ProvisionError> {
        let billing_account = billing_account
            .filter(|b| !b.trim().is_empty())
            .ok_or_else(|| {
                ProvisionError::Configuration("no billing account is configured".into())
            })?
            .to_string();
        Ok(Self {
            store,
            gcp,
            billing_account,
            folder_name: folder_name.into(),
        })
    }

    pub async fn run(
        &self,
        req: &ProjectBootstrapRequest,
    ) -> Result<ProjectBootstrapOutcome, ProvisionError> {
        validate_project(req)?;
        let project_id = req.project_id.as_str();
        let host_project = self.gcp.defaults(None).project_id;

        let folder = self
            .gcp
            .ensure_folder(&host_project, &self.folder_name)
            .await
            .map_err(ProvisionError::step(ProvisionStep::EnsureFolder, &self.folder_name))?;
        if folder.is_none() {
            warn!(host_project = %host_project, "host project has no parent; creating project without a folder");
        }

        let project = self
            .gcp
            .create_project(project_id, &req.display_name, folder.as_deref())
            .await
            .map_err(ProvisionError::step(ProvisionStep::CreateProject, project_id))?;

        self.gcp
            .set_billing(project_id, &self.billing_account)
            .await
            .map_err(ProvisionError::step(ProvisionStep::BindBilling, project_id))?;

        self.gcp
            .enable_core_services(project_id)
            .await
            .map_err(ProvisionError::step(ProvisionStep::EnableService, project_id))?;
        self.gcp
            .enable_service(project_id, COMPUTE_SERVICE, SERVICE_ENABLE_TIMEOUT)
            .await
            .map_err(ProvisionError::step(ProvisionStep::EnableService, COMPUTE_SERVICE))?;

        match self.gcp.client().service_account_email() {
            Some(email) => {
                let member = format!("serviceAccount:{email}");
                self.gcp
                    .add_project_iam_member(project_id, &member, CONTROL_PLANE_ROLE)
                    .await
                    .map_err(ProvisionError::step(ProvisionStep::GrantRole, project_id))?;
            }
            None => warn!(project = project_id, "credentials carry no service account email, skipping role grant"),
        }

        self.store
            .register_projects(&[project_id.to_string()])
            .await?;
        info!(project = project_id, ?folder, "project bootstrapped and added to the pool");

        Ok(ProjectBootstrapOutcome {
            project_id: project_id.to_string(),
            folder,
            project,
        })
    }
}

fn validate_project(req: &ProjectBootstrapRequest) -> Result<(), ProvisionError> {
    let len = req.project_id.len();
    if !(PROJECT_ID_MIN..=PROJECT_ID_MAX).contains(&len) {
        return Err(ProvisionError::Validation(format!(
            "project_id must be {PROJECT_ID_MIN} to {PROJECT_ID_MAX} characters"
        )));
    }
    validate_name("project_id", &req.project_id)?;
    if req.display_name.trim().is_empty() {
        return Err(ProvisionError::Validation(
            "display_name must not be empty".into(),
        ));
    }
    Ok(())
}
