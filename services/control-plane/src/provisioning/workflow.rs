use std::sync::Arc;

use chrono::Utc;
use nave_gcp::{
    instance_public_ip, AllowedRule, FirewallRequest, InstanceRequest, ResourceOrchestrator,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{validate_name, ProjectQuotaPool, ProvisionError, ProvisionStep, StartupScript};
use crate::model::{AgentRecord, InstanceAttachment};
use crate::store::{Store, StoreError};
use crate::tokens::{generate_agent_token, hash_token};
use nave_id::AgentId;

pub const MIN_DISK_SIZE_GB: u32 = 10;
pub const MAX_DISK_SIZE_GB: u32 = 200;

/// Knobs shared by every provisioning run.
#[derive(Debug, Clone)]
pub struct ProvisionSettings {
    /// Base URL nodes use to reach the control plane.
    pub public_base_url: String,
    pub quota_metric: String,
    pub firewall_name: String,
    /// Network tag carried by exit nodes and targeted by the firewall rule.
    pub network_tag: String,
}

impl ProvisionSettings {
    pub fn new(public_base_url: impl Into<String>, quota_metric: impl Into<String>) -> Self {
        Self {
            public_base_url: public_base_url.into(),
            quota_metric: quota_metric.into(),
            firewall_name: "nave-wireguard".to_string(),
            network_tag: "nave-exit".to_string(),
        }
    }
}

fn default_create_ip() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvisionRequest {
    pub name: String,
    #[serde(default)]
    pub profile_id: Option<i64>,
    /// Defaults to `<name>-ip`.
    #[serde(default)]
    pub address_name: Option<String>,
    #[serde(default = "default_create_ip")]
    pub create_ip: bool,
    #[serde(default)]
    pub machine_type: Option<String>,
    #[serde(default)]
    pub disk_size_gb: Option<u32>,
    #[serde(default)]
    pub preemptible: bool,
}

impl ProvisionRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            profile_id: None,
            address_name: None,
            create_ip: true,
            machine_type: None,
            disk_size_gb: None,
            preemptible: false,
        }
    }

    fn resolved_address_name(&self) -> String {
        self.address_name
            .clone()
            .unwrap_or_else(|| format!("{}-ip", self.name))
    }

    /// The address the instance binds to. Without `create_ip` only an
    /// explicitly named, pre-existing address is used.
    fn bound_address(&self) -> Option<String> {
        if self.create_ip {
            Some(self.resolved_address_name())
        } else {
            self.address_name.clone()
        }
    }

    fn validate(&self) -> Result<u32, ProvisionError> {
        validate_name("name", &self.name)?;
        if let Some(address) = self.bound_address() {
            validate_name("address_name", &address)?;
        }
        if let Some(machine_type) = &self.machine_type {
            if machine_type.trim().is_empty() {
                return Err(ProvisionError::Validation(
                    "machine_type must not be empty".into(),
                ));
            }
        }
        let disk = self.disk_size_gb.unwrap_or(MIN_DISK_SIZE_GB);
        if !(MIN_DISK_SIZE_GB..=MAX_DISK_SIZE_GB).contains(&disk) {
            return Err(ProvisionError::Validation(format!(
                "disk_size_gb must be between {MIN_DISK_SIZE_GB} and {MAX_DISK_SIZE_GB}, got {disk}"
            )));
        }
        Ok(disk)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvisionOutcome {
    pub agent_id: AgentId,
    /// Plaintext bootstrap token. Only ever returned here.
    pub token: String,
    pub vm_name: String,
    pub address_name: Option<String>,
    pub project_id: String,
    pub public_ip: Option<String>,
    pub instance: Value,
}

/// Create a bare agent record with a fresh token.
///
/// Returns the record and the plaintext token; only the hash is stored.
pub async fn issue_agent(
    store: &dyn Store,
    profile_id: Option<i64>,
    name: Option<String>,
) -> Result<(AgentRecord, String), StoreError> {
    let token = generate_agent_token();
    let record = AgentRecord::bootstrap(hash_token(&token), profile_id, name);
    store.create_agent(&record).await?;
    info!(agent_id = %record.id, ?profile_id, "issued agent record");
    Ok((record, token))
}

pub struct Provisioner {
    store: Arc<dyn Store>,
    gcp: Option<Arc<ResourceOrchestrator>>,
    settings: ProvisionSettings,
}

impl Provisioner {
    pub fn new(
        store: Arc<dyn Store>,
        gcp: Option<Arc<ResourceOrchestrator>>,
        settings: ProvisionSettings,
    ) -> Self {
        Self {
            store,
            gcp,
            settings,
        }
    }

    pub fn settings(&self) -> &ProvisionSettings {
        &self.settings
    }

    pub fn orchestrator(&self) -> Result<&Arc<ResourceOrchestrator>, ProvisionError> {
        self.gcp.as_ref().ok_or_else(|| {
            ProvisionError::Configuration("cloud credentials are not configured".into())
        })
    }

    /// Provision one exit node end to end.
    pub async fn provision(&self, req: &ProvisionRequest) -> Result<ProvisionOutcome, ProvisionError> {
        let disk_size_gb = req.validate()?;
        let gcp = self.orchestrator()?.clone();

        let (record, token) =
            issue_agent(self.store.as_ref(), req.profile_id, Some(req.name.clone())).await?;

        let mut committed = vec![format!("agent_record {}", record.id)];
        let result = self
            .provision_resources(gcp, req, disk_size_gb, &record, &token, &mut committed)
            .await;

        if let Err(e) = &result {
            warn!(
                agent_id = %record.id,
                vm_name = %req.name,
                ?committed,
                error = %e,
                "provisioning aborted; committed resources were left in place"
            );
        }
        result
    }

    async fn provision_resources(
        &self,
        gcp: Arc<ResourceOrchestrator>,
        req: &ProvisionRequest,
        disk_size_gb: u32,
        record: &AgentRecord,
        token: &str,
        committed: &mut Vec<String>,
    ) -> Result<ProvisionOutcome, ProvisionError> {
        let script = StartupScript {
            api_base: &self.settings.public_base_url,
            agent_id: &record.id,
            agent_token: token,
            vm_name: &req.name,
        }
        .render();

        let pool = ProjectQuotaPool::new(
            self.store.clone(),
            gcp.clone(),
            self.settings.quota_metric.clone(),
        );
        let project_id = pool.select().await?;
        info!(agent_id = %record.id, project = %project_id, "selected project");

        let rule = FirewallRequest::new(&self.settings.firewall_name)
            .target_tags(&[self.settings.network_tag.as_str()])
            .allow(AllowedRule::wireguard())
            .description("WireGuard ingress for exit nodes");
        gcp.ensure_firewall_rule(&rule, Some(&project_id))
            .await
            .map_err(ProvisionError::step(
                ProvisionStep::EnsureFirewall,
                &self.settings.firewall_name,
            ))?;

        let address_name = req.bound_address();
        if req.create_ip {
            let name = req.resolved_address_name();
            let description = format!("exit node {}", req.name);
            gcp.reserve_address(&name, None, Some(&description), Some(&project_id))
                .await
                .map_err(ProvisionError::step(ProvisionStep::ReserveAddress, &name))?;
            committed.push(format!("address {project_id}/{name}"));
        }

        let instance_request = InstanceRequest {
            name: req.name.clone(),
            zone: None,
            machine_type: req.machine_type.clone(),
            address_name: address_name.clone(),
            startup_script: Some(script),
            tags: vec![self.settings.network_tag.clone()],
            disk_size_gb: Some(disk_size_gb),
            preemptible: req.preemptible,
        };
        let instance = gcp
            .create_instance(&instance_request, Some(&project_id))
            .await
            .map_err(ProvisionError::step(ProvisionStep::CreateInstance, &req.name))?;
        committed.push(format!("instance {project_id}/{}", req.name));

        let public_ip = instance_public_ip(&instance);
        if public_ip.is_none() {
            warn!(agent_id = %record.id, vm_name = %req.name, "instance has no public IP yet");
        }

        let zone = gcp.defaults(Some(&project_id)).zone;
        let attachment = InstanceAttachment {
            vm_name: req.name.clone(),
            address_name: address_name.clone(),
            public_ip: public_ip.clone(),
            project_id: Some(project_id.clone()),
            zone: Some(zone.clone()),
            instance: instance.clone(),
        };
        self.store
            .update_agent(
                &record.id,
                Box::new(move |r: &mut AgentRecord| r.attach_instance(attachment)),
            )
            .await?;

        if let Some(profile_id) = req.profile_id {
            let network = json!({
                "agent_id": record.id,
                "vm_name": req.name,
                "address_name": address_name,
                "public_ip": public_ip,
                "project_id": project_id,
                "zone": zone,
                "updated_at": Utc::now(),
            });
            self.mirror_profile(profile_id, &network).await;
        }

        info!(
            agent_id = %record.id,
            vm_name = %req.name,
            project = %project_id,
            ip = ?public_ip,
            "exit node provisioned"
        );

        Ok(ProvisionOutcome {
            agent_id: record.id,
            token: token.to_string(),
            vm_name: req.name.clone(),
            address_name,
            project_id,
            public_ip,
            instance,
        })
    }

    /// Best effort: a missing profile or a store hiccup is only logged.
    async fn mirror_profile(&self, profile_id: i64, network: &Value) {
        match self.store.set_profile_network(profile_id, network).await {
            Ok(true) => {}
            Ok(false) => warn!(profile_id, "profile not found, network summary not mirrored"),
            Err(e) => warn!(profile_id, error = %e, "failed to mirror network summary"),
        }
    }
}
