//! Organization-managed project bootstrap: folders, projects, billing, IAM
//! and API enablement.

use std::time::Duration;

use nave_reconcile::{Backoff, Deadline};
use reqwest::Method;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::{GcpError, GcpResult};
use crate::ResourceOrchestrator;

const FOLDER_OP_TIMEOUT: Duration = Duration::from_secs(120);
const PROJECT_OP_TIMEOUT: Duration = Duration::from_secs(180);

/// Default budget for [`ResourceOrchestrator::enable_service`].
pub const SERVICE_ENABLE_TIMEOUT: Duration = Duration::from_secs(300);

/// APIs a bootstrapped project needs before folder, project and billing
/// calls work against it.
pub const CORE_SERVICES: [&str; 3] = [
    "cloudresourcemanager.googleapis.com",
    "cloudbilling.googleapis.com",
    "serviceusage.googleapis.com",
];

const TRANSIENT_MARKERS: [&str; 3] = ["SERVICE_DISABLED", "has not been used", "PERMISSION_DENIED"];

/// Whether a service-enable failure is worth retrying.
///
/// Freshly created projects answer with "service disabled", "has not been
/// used" or "permission denied" until IAM and API state propagate.
pub fn is_transient_enable_error(err: &GcpError) -> bool {
    match err {
        GcpError::Provider {
            api_status,
            reason,
            message,
            ..
        } => {
            let tagged = [api_status.as_deref(), reason.as_deref()]
                .into_iter()
                .flatten()
                .any(|tag| TRANSIENT_MARKERS.contains(&tag));
            tagged || TRANSIENT_MARKERS.iter().any(|m| message.contains(m))
        }
        _ => false,
    }
}

impl ResourceOrchestrator {
    fn crm_url(&self, path: &str) -> String {
        format!("{}/{path}", self.client.endpoints().resource_manager)
    }

    pub async fn get_project(&self, project_id: &str) -> GcpResult<Value> {
        self.client
            .get(&self.crm_url(&format!("projects/{project_id}")))
            .await
    }

    /// The project's parent resource (`organizations/…` or `folders/…`).
    pub async fn project_parent(&self, project_id: &str) -> GcpResult<Option<String>> {
        let project = self.get_project(project_id).await?;
        Ok(project
            .get("parent")
            .and_then(Value::as_str)
            .filter(|p| !p.is_empty())
            .map(str::to_string))
    }

    pub async fn list_folders(&self, parent: &str) -> GcpResult<Value> {
        self.client
            .request(Method::GET, &self.crm_url("folders"), &[("parent", parent)], None)
            .await
    }

    /// Folder resource name (`folders/…`) with this display name under
    /// `parent`, created if absent.
    pub async fn find_or_create_folder(&self, parent: &str, display_name: &str) -> GcpResult<String> {
        let listing = self.list_folders(parent).await?;
        let existing = listing
            .get("folders")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .find(|f| f.get("displayName").and_then(Value::as_str) == Some(display_name))
            .and_then(|f| f.get("name").and_then(Value::as_str));
        if let Some(name) = existing {
            return Ok(name.to_string());
        }

        let op = self
            .client
            .post(
                &self.crm_url("folders"),
                &json!({ "displayName": display_name, "parent": parent }),
            )
            .await?;
        let done = self.wait_crm(&op, FOLDER_OP_TIMEOUT).await?;
        let name = done
            .get("response")
            .and_then(|r| r.get("name"))
            .and_then(Value::as_str)
            .ok_or_else(|| GcpError::Decode("folder operation returned no folder name".into()))?;
        info!(parent, folder = name, display_name, "created folder");
        Ok(name.to_string())
    }

    /// Create a project and wait for it; returns the created project.
    pub async fn create_project(
        &self,
        project_id: &str,
        display_name: &str,
        parent: Option<&str>,
    ) -> GcpResult<Value> {
        let mut body = json!({ "projectId": project_id, "displayName": display_name });
        if let Some(parent) = parent {
            body["parent"] = json!(parent);
        }
        let op = self.client.post(&self.crm_url("projects"), &body).await?;
        let done = self.wait_crm(&op, PROJECT_OP_TIMEOUT).await?;
        info!(project = project_id, ?parent, "created project");
        Ok(done.get("response").cloned().unwrap_or_else(|| json!({})))
    }

    /// Bind a billing account (`XXXXXX-XXXXXX-XXXXXX`) to a project.
    pub async fn set_billing(&self, project_id: &str, billing_account: &str) -> GcpResult<()> {
        let url = format!(
            "{}/projects/{project_id}/billingInfo",
            self.client.endpoints().billing
        );
        let body = json!({
            "billingAccountName": format!("billingAccounts/{billing_account}"),
            "billingEnabled": true,
        });
        self.client
            .request(Method::PUT, &url, &[], Some(&body))
            .await?;
        info!(project = project_id, "bound billing account");
        Ok(())
    }

    pub async fn get_iam_policy(&self, project_id: &str) -> GcpResult<Value> {
        self.client
            .request(
                Method::POST,
                &self.crm_url(&format!("projects/{project_id}:getIamPolicy")),
                &[],
                None,
            )
            .await
    }

    pub async fn set_iam_policy(&self, project_id: &str, policy: &Value) -> GcpResult<()> {
        self.client
            .post(
                &self.crm_url(&format!("projects/{project_id}:setIamPolicy")),
                &json!({ "policy": policy }),
            )
            .await?;
        Ok(())
    }

    /// Grant `role` to `member`, merging into an existing binding.
    pub async fn add_project_iam_member(
        &self,
        project_id: &str,
        member: &str,
        role: &str,
    ) -> GcpResult<()> {
        let mut policy = self.get_iam_policy(project_id).await?;
        merge_iam_member(&mut policy, member, role);
        self.set_iam_policy(project_id, &policy).await?;
        info!(project = project_id, member, role, "granted IAM role");
        Ok(())
    }

    /// Enable an API on a project.
    ///
    /// Transient failures (see [`is_transient_enable_error`]) are retried
    /// with exponential backoff until `timeout` elapses, then the call fails
    /// with [`GcpError::Timeout`]. Any other failure is returned at once.
    pub async fn enable_service(
        &self,
        project_id: &str,
        service: &str,
        timeout: Duration,
    ) -> GcpResult<()> {
        let deadline = Deadline::after(timeout);
        let mut backoff = Backoff::new(self.enable_retry.initial_delay, self.enable_retry.max_delay);

        loop {
            match self.try_enable_service(project_id, service, &deadline).await {
                Ok(()) => {
                    info!(project = project_id, service, "service enabled");
                    return Ok(());
                }
                Err(err) if is_transient_enable_error(&err) => {
                    if deadline.is_expired() {
                        warn!(project = project_id, service, error = %err, "service enable gave up");
                        return Err(GcpError::Timeout {
                            what: format!("enabling {service} on {project_id}"),
                            budget: deadline.budget(),
                        });
                    }
                    let remaining = deadline.budget().saturating_sub(deadline.elapsed());
                    let delay = backoff.next_delay().min(remaining);
                    debug!(project = project_id, service, ?delay, error = %err, "service enable not ready, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_enable_service(
        &self,
        project_id: &str,
        service: &str,
        deadline: &Deadline,
    ) -> GcpResult<()> {
        let base = &self.client.endpoints().service_usage;
        let url = format!("{base}/projects/{project_id}/services/{service}:enable");
        let op = self.client.request(Method::POST, &url, &[], None).await?;

        if op.get("done").and_then(Value::as_bool) == Some(true) {
            return Ok(());
        }
        match op.get("name").and_then(Value::as_str) {
            None => Ok(()),
            Some(name) if name.ends_with("DONE_OPERATION") => Ok(()),
            Some(name) => {
                let remaining = deadline.budget().saturating_sub(deadline.elapsed());
                self.client.wait_done(base, name, remaining).await?;
                Ok(())
            }
        }
    }

    /// Enable [`CORE_SERVICES`] one after the other.
    pub async fn enable_core_services(&self, project_id: &str) -> GcpResult<()> {
        for service in CORE_SERVICES {
            self.enable_service(project_id, service, SERVICE_ENABLE_TIMEOUT)
                .await?;
        }
        Ok(())
    }

    /// Find or create the folder `display_name` next to `project_id`.
    ///
    /// Returns `None` when the project has no parent to create it under.
    pub async fn ensure_folder(
        &self,
        project_id: &str,
        display_name: &str,
    ) -> GcpResult<Option<String>> {
        match self.project_parent(project_id).await? {
            Some(parent) => Ok(Some(
                self.find_or_create_folder(&parent, display_name).await?,
            )),
            None => Ok(None),
        }
    }

    async fn wait_crm(&self, op: &Value, timeout: Duration) -> GcpResult<Value> {
        if op.get("done").and_then(Value::as_bool) == Some(true) {
            return Ok(op.clone());
        }
        let name = op
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| GcpError::Decode(format!("operation without a name: {op}")))?;
        let base = self.client.endpoints().resource_manager.clone();
        self.client.wait_done(&base, name, timeout).await
    }
}

fn merge_iam_member(policy: &mut Value, member: &str, role: &str) {
    if !policy.get("bindings").is_some_and(Value::is_array) {
        policy["bindings"] = json!([]);
    }
    let Some(bindings) = policy.get_mut("bindings").and_then(Value::as_array_mut) else {
        return;
    };

    let existing = bindings
        .iter_mut()
        .find(|b| b.get("role").and_then(Value::as_str) == Some(role));
    match existing {
        Some(binding) => {
            let mut members: Vec<String> = binding
                .get("members")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(|m| m.as_str().map(str::to_string))
                .collect();
            if !members.iter().any(|m| m == member) {
                members.push(member.to_string());
                members.sort();
                members.dedup();
                binding["members"] = json!(members);
            }
        }
        None => bindings.push(json!({ "role": role, "members": [member] })),
    }
}
