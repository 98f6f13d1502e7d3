//! Compute resources: addresses, instances, firewall rules, quotas.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::auth::CLOUD_PLATFORM_SCOPE;
use crate::client::OperationScope;
use crate::error::{GcpError, GcpResult};
use crate::ResourceOrchestrator;

const REGION_OP_TIMEOUT: Duration = Duration::from_secs(120);
const ZONE_OP_TIMEOUT: Duration = Duration::from_secs(180);
const GLOBAL_OP_TIMEOUT: Duration = Duration::from_secs(120);

const BOOT_IMAGE: &str = "projects/debian-cloud/global/images/family/debian-12";
const DEFAULT_DISK_SIZE_GB: u32 = 10;
const STARTUP_SCRIPT_KEY: &str = "startup-script";

/// A reserved static IP.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Address {
    pub name: String,
    pub region: String,
    /// Allocated IP, absent while the reservation is still pending.
    pub address: Option<String>,
    pub raw: Value,
}

impl Address {
    fn from_value(region: &str, raw: Value) -> Self {
        Self {
            name: raw
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            region: region.to_string(),
            address: raw
                .get("address")
                .and_then(Value::as_str)
                .map(str::to_string),
            raw,
        }
    }
}

/// One allowed protocol/ports pair of a firewall rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedRule {
    #[serde(rename = "IPProtocol")]
    pub ip_protocol: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
}

impl AllowedRule {
    pub fn new(ip_protocol: &str, ports: &[&str]) -> Self {
        Self {
            ip_protocol: ip_protocol.to_string(),
            ports: ports.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// WireGuard's default listen port.
    pub fn wireguard() -> Self {
        Self::new("udp", &["51820"])
    }
}

/// An ingress firewall rule to create.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FirewallRequest {
    pub name: String,
    /// Network path; the defaults' network when unset.
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub target_tags: Vec<String>,
    /// Allowed traffic; UDP 51820 when empty.
    #[serde(default)]
    pub allowed: Vec<AllowedRule>,
    #[serde(default)]
    pub description: Option<String>,
}

impl FirewallRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            network: None,
            target_tags: Vec::new(),
            allowed: Vec::new(),
            description: None,
        }
    }

    pub fn target_tags(mut self, tags: &[&str]) -> Self {
        self.target_tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn allow(mut self, rule: AllowedRule) -> Self {
        self.allowed.push(rule);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Whether an ensure call created the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created,
    AlreadyExists,
}

/// A VM to create.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct InstanceRequest {
    pub name: String,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub machine_type: Option<String>,
    /// Static address to bind as the external NAT IP.
    #[serde(default)]
    pub address_name: Option<String>,
    #[serde(default)]
    pub startup_script: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub disk_size_gb: Option<u32>,
    #[serde(default)]
    pub preemptible: bool,
}

impl InstanceRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Usage and limit of one regional quota metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quota {
    pub usage: f64,
    pub limit: f64,
}

impl Quota {
    pub fn has_headroom(&self) -> bool {
        self.usage < self.limit
    }
}

/// External IP of the instance's first access config, if allocated.
pub fn instance_public_ip(instance: &Value) -> Option<String> {
    instance
        .get("networkInterfaces")?
        .get(0)?
        .get("accessConfigs")?
        .get(0)?
        .get("natIP")?
        .as_str()
        .map(str::to_string)
}

fn operation_name(op: &Value) -> GcpResult<&str> {
    op.get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| GcpError::Decode(format!("operation without a name: {op}")))
}

impl ResourceOrchestrator {
    pub async fn get_address(
        &self,
        name: &str,
        region: Option<&str>,
        project_id: Option<&str>,
    ) -> GcpResult<Address> {
        let project = self.project(project_id);
        let region = region.unwrap_or(&self.defaults.region);
        let url = self
            .client
            .compute_url(project, &format!("regions/{region}/addresses/{name}"));
        Ok(Address::from_value(region, self.client.get(&url).await?))
    }

    /// Reserve an external static address and wait for it.
    ///
    /// Does not look the name up first; callers avoid duplicate names.
    pub async fn reserve_address(
        &self,
        name: &str,
        region: Option<&str>,
        description: Option<&str>,
        project_id: Option<&str>,
    ) -> GcpResult<Address> {
        let project = self.project(project_id);
        let region = region.unwrap_or(&self.defaults.region);
        let url = self
            .client
            .compute_url(project, &format!("regions/{region}/addresses"));

        let mut body = json!({ "name": name, "addressType": "EXTERNAL" });
        if let Some(description) = description {
            body["description"] = json!(description);
        }

        let op = self.client.post(&url, &body).await?;
        self.client
            .wait_operation(
                project,
                &OperationScope::Region(region.to_string()),
                operation_name(&op)?,
                REGION_OP_TIMEOUT,
            )
            .await?;

        let address = self.get_address(name, Some(region), Some(project)).await?;
        info!(project, region, address = name, ip = ?address.address, "reserved static address");
        Ok(address)
    }

    pub async fn get_instance(
        &self,
        name: &str,
        zone: Option<&str>,
        project_id: Option<&str>,
    ) -> GcpResult<Value> {
        let project = self.project(project_id);
        let zone = zone.unwrap_or(&self.defaults.zone);
        let url = self
            .client
            .compute_url(project, &format!("zones/{zone}/instances/{name}"));
        self.client.get(&url).await
    }

    /// Create a VM and wait for it; returns the instance descriptor.
    ///
    /// The instance may forward packets and gets a one-to-one NAT access
    /// config, bound to `address_name`'s IP when given.
    pub async fn create_instance(
        &self,
        request: &InstanceRequest,
        project_id: Option<&str>,
    ) -> GcpResult<Value> {
        let project = self.project(project_id);
        let zone = request.zone.as_deref().unwrap_or(&self.defaults.zone);
        let machine_type = request
            .machine_type
            .as_deref()
            .unwrap_or(&self.defaults.machine_type);

        let mut access_config = json!({ "name": "External NAT", "type": "ONE_TO_ONE_NAT" });
        if let Some(address_name) = &request.address_name {
            let address = self
                .get_address(address_name, None, Some(project))
                .await?
                .address
                .ok_or_else(|| {
                    GcpError::NotFound(format!("static address {address_name} has no IP"))
                })?;
            access_config["natIP"] = json!(address);
        }

        let mut instance = json!({
            "name": request.name,
            "machineType": format!("zones/{zone}/machineTypes/{machine_type}"),
            "canIpForward": true,
            "networkInterfaces": [{
                "network": self.defaults.network,
                "subnetwork": self.defaults.subnetwork,
                "accessConfigs": [access_config],
            }],
            "disks": [{
                "boot": true,
                "autoDelete": true,
                "initializeParams": {
                    "sourceImage": BOOT_IMAGE,
                    "diskSizeGb": request.disk_size_gb.unwrap_or(DEFAULT_DISK_SIZE_GB),
                },
            }],
        });

        if !request.tags.is_empty() {
            instance["tags"] = json!({ "items": request.tags });
        }
        if let Some(script) = &request.startup_script {
            instance["metadata"] = json!({
                "items": [{ "key": STARTUP_SCRIPT_KEY, "value": script }],
            });
        }
        if request.preemptible {
            instance["scheduling"] = json!({
                "preemptible": true,
                "automaticRestart": false,
                "onHostMaintenance": "TERMINATE",
            });
        }
        if !self.defaults.instance_service_account.is_empty() {
            instance["serviceAccounts"] = json!([{
                "email": self.defaults.instance_service_account,
                "scopes": [CLOUD_PLATFORM_SCOPE],
            }]);
        }

        let url = self
            .client
            .compute_url(project, &format!("zones/{zone}/instances"));
        let op = self.client.post(&url, &instance).await?;
        self.client
            .wait_operation(
                project,
                &OperationScope::Zone(zone.to_string()),
                operation_name(&op)?,
                ZONE_OP_TIMEOUT,
            )
            .await?;

        info!(project, zone, instance = %request.name, machine_type, "created instance");
        self.get_instance(&request.name, Some(zone), Some(project))
            .await
    }

    /// Replace the instance's `startup-script` metadata item, keeping the
    /// other items.
    pub async fn set_startup_script(
        &self,
        project_id: Option<&str>,
        zone: Option<&str>,
        instance_name: &str,
        startup_script: &str,
    ) -> GcpResult<Value> {
        let project = self.project(project_id);
        let zone = zone.unwrap_or(&self.defaults.zone);
        let instance = self
            .get_instance(instance_name, Some(zone), Some(project))
            .await?;

        let metadata = instance.get("metadata").cloned().unwrap_or(Value::Null);
        let mut items: Vec<Value> = metadata
            .get("items")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter(|i| i.get("key").and_then(Value::as_str) != Some(STARTUP_SCRIPT_KEY))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        items.push(json!({ "key": STARTUP_SCRIPT_KEY, "value": startup_script }));

        let body = json!({
            "fingerprint": metadata.get("fingerprint").cloned().unwrap_or(Value::Null),
            "items": items,
        });
        let url = self.client.compute_url(
            project,
            &format!("zones/{zone}/instances/{instance_name}/setMetadata"),
        );
        let op = self.client.post(&url, &body).await?;
        self.client
            .wait_operation(
                project,
                &OperationScope::Zone(zone.to_string()),
                operation_name(&op)?,
                ZONE_OP_TIMEOUT,
            )
            .await?;

        self.get_instance(instance_name, Some(zone), Some(project))
            .await
    }

    pub async fn get_firewall(&self, name: &str, project_id: Option<&str>) -> GcpResult<Value> {
        let project = self.project(project_id);
        let url = self
            .client
            .compute_url(project, &format!("global/firewalls/{name}"));
        self.client.get(&url).await
    }

    /// Create an ingress rule (priority 1000) and wait for it.
    pub async fn create_firewall_rule(
        &self,
        request: &FirewallRequest,
        project_id: Option<&str>,
    ) -> GcpResult<Value> {
        let project = self.project(project_id);
        let allowed = if request.allowed.is_empty() {
            vec![AllowedRule::wireguard()]
        } else {
            request.allowed.clone()
        };

        let mut body = json!({
            "name": request.name,
            "network": request.network.as_deref().unwrap_or(&self.defaults.network),
            "direction": "INGRESS",
            "priority": 1000,
            "allowed": allowed,
        });
        if !request.target_tags.is_empty() {
            body["targetTags"] = json!(request.target_tags);
        }
        if let Some(description) = &request.description {
            body["description"] = json!(description);
        }

        let url = self.client.compute_url(project, "global/firewalls");
        let op = self.client.post(&url, &body).await?;
        self.client
            .wait_operation(
                project,
                &OperationScope::Global,
                operation_name(&op)?,
                GLOBAL_OP_TIMEOUT,
            )
            .await?;

        info!(project, firewall = %request.name, "created firewall rule");
        self.get_firewall(&request.name, Some(project)).await
    }

    /// Create the rule unless one with the same name already exists.
    ///
    /// Existing rules are left untouched even if their settings differ.
    pub async fn ensure_firewall_rule(
        &self,
        request: &FirewallRequest,
        project_id: Option<&str>,
    ) -> GcpResult<EnsureOutcome> {
        match self.get_firewall(&request.name, project_id).await {
            Ok(_) => Ok(EnsureOutcome::AlreadyExists),
            Err(err) if err.is_not_found() => {
                self.create_firewall_rule(request, project_id).await?;
                Ok(EnsureOutcome::Created)
            }
            Err(err) => Err(err),
        }
    }

    /// Every quota metric reported for a region.
    pub async fn region_quotas(
        &self,
        region: Option<&str>,
        project_id: Option<&str>,
    ) -> GcpResult<BTreeMap<String, Quota>> {
        let project = self.project(project_id);
        let region = region.unwrap_or(&self.defaults.region);
        let url = self
            .client
            .compute_url(project, &format!("regions/{region}"));
        let region_data = self.client.get(&url).await?;

        let quotas = region_data
            .get("quotas")
            .and_then(Value::as_array)
            .map(|quotas| {
                quotas
                    .iter()
                    .filter_map(|q| {
                        let metric = q.get("metric")?.as_str()?;
                        let quota = Quota {
                            usage: q.get("usage").and_then(Value::as_f64).unwrap_or(0.0),
                            limit: q.get("limit").and_then(Value::as_f64).unwrap_or(0.0),
                        };
                        Some((metric.to_string(), quota))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(quotas)
    }

    /// One quota metric for a region; `None` when the provider does not
    /// report it.
    pub async fn region_quota(
        &self,
        metric: &str,
        region: Option<&str>,
        project_id: Option<&str>,
    ) -> GcpResult<Option<Quota>> {
        Ok(self
            .region_quotas(region, project_id)
            .await?
            .remove(metric))
    }
}
