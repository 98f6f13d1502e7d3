//! Control plane API client for the node agent.
//!
//! Every call carries the bootstrap token in `X-Agent-Token`; the control
//! plane only lets it touch this agent's own record.

use std::time::Duration;

use nave_id::AgentId;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::AgentError;

pub const AGENT_TOKEN_HEADER: &str = "X-Agent-Token";

const REGISTER_TIMEOUT: Duration = Duration::from_secs(15);
const DESIRED_TIMEOUT: Duration = Duration::from_secs(15);
const STATUS_TIMEOUT: Duration = Duration::from_secs(10);

/// Control plane API client.
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    vm_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    public_ip: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    agent_id: AgentId,
}

/// Desired configuration as served to the agent.
#[derive(Debug, Clone, Deserialize)]
pub struct DesiredConfig {
    pub agent_id: AgentId,
    #[serde(default)]
    pub desired_json: Value,
}

impl DesiredConfig {
    /// The WireGuard config text; empty when none has been set.
    pub fn wg_conf(&self) -> &str {
        self.desired_json
            .get("wg_conf")
            .and_then(Value::as_str)
            .unwrap_or("")
    }
}

#[derive(Debug, Serialize)]
struct StatusRequest<'a> {
    status_json: &'a Value,
}

impl ControlPlaneClient {
    pub fn new(config: &Config) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("nave-node-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: config.api_base.clone(),
            token: config.agent_token.clone(),
        })
    }

    /// Announce this node. Returns the agent id the token belongs to.
    pub async fn register(
        &self,
        vm_name: Option<&str>,
        public_ip: Option<&str>,
    ) -> Result<AgentId, AgentError> {
        let url = format!("{}/infra/agents/register", self.base_url);
        debug!(url = %url, "Registering agent");

        let response = self
            .client
            .post(&url)
            .header(AGENT_TOKEN_HEADER, &self.token)
            .json(&RegisterRequest { vm_name, public_ip })
            .timeout(REGISTER_TIMEOUT)
            .send()
            .await?;

        let body: RegisterResponse = Self::parse(response, "register").await?;
        Ok(body.agent_id)
    }

    /// Fetch the desired configuration for `agent_id`.
    pub async fn fetch_desired(&self, agent_id: &AgentId) -> Result<DesiredConfig, AgentError> {
        let url = format!("{}/infra/agents/{}/desired", self.base_url, agent_id);
        debug!(url = %url, "Fetching desired config");

        let response = self
            .client
            .get(&url)
            .header(AGENT_TOKEN_HEADER, &self.token)
            .timeout(DESIRED_TIMEOUT)
            .send()
            .await?;

        Self::parse(response, "fetch desired config").await
    }

    /// Report a status document for `agent_id`.
    pub async fn report_status(&self, agent_id: &AgentId, status: &Value) -> Result<(), AgentError> {
        let url = format!("{}/infra/agents/{}/status", self.base_url, agent_id);

        let response = self
            .client
            .post(&url)
            .header(AGENT_TOKEN_HEADER, &self.token)
            .json(&StatusRequest { status_json: status })
            .timeout(STATUS_TIMEOUT)
            .send()
            .await?;

        let _: Value = Self::parse(response, "report status").await?;
        Ok(())
    }

    async fn parse<T: DeserializeOwned>(
        response: reqwest::Response,
        call: &'static str,
    ) -> Result<T, AgentError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, call, "Control plane call failed");
            return Err(AgentError::http(status.as_u16(), &body));
        }
        Ok(response.json().await?)
    }
}
