//! Authenticated JSON calls and long-running operation waits.

use std::sync::Arc;
use std::time::Duration;

use nave_reconcile::{Deadline, DEFAULT_OPERATION_POLL_INTERVAL};
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, warn};

use crate::auth::{ServiceAccountTokenSource, TokenSource};
use crate::config::{Endpoints, ServiceAccountKey};
use crate::error::{truncate, GcpError, GcpResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

fn build_http_client() -> GcpResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .user_agent(concat!("nave-gcp/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| GcpError::Configuration(format!("failed to build HTTP client: {e}")))
}

/// Where a compute operation lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationScope {
    Global,
    Region(String),
    Zone(String),
}

impl OperationScope {
    fn path(&self, name: &str) -> String {
        match self {
            Self::Global => format!("global/operations/{name}"),
            Self::Region(region) => format!("regions/{region}/operations/{name}"),
            Self::Zone(zone) => format!("zones/{zone}/operations/{name}"),
        }
    }
}

/// Thin authenticated client over the provider's REST APIs.
#[derive(Clone)]
pub struct GcpClient {
    http: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
    endpoints: Endpoints,
    poll_interval: Duration,
}

impl GcpClient {
    /// Build a client that authenticates through `tokens`.
    pub fn new(tokens: Arc<dyn TokenSource>, endpoints: Endpoints) -> GcpResult<Self> {
        Ok(Self {
            http: build_http_client()?,
            tokens,
            endpoints,
            poll_interval: DEFAULT_OPERATION_POLL_INTERVAL,
        })
    }

    /// Build a client that exchanges service-account assertions for tokens,
    /// honouring the endpoints' token URI override.
    pub fn from_service_account(key: ServiceAccountKey, endpoints: Endpoints) -> GcpResult<Self> {
        let http = build_http_client()?;
        let mut source = ServiceAccountTokenSource::new(key, http);
        if let Some(token_uri) = &endpoints.token_uri {
            source = source.with_token_uri(token_uri.clone());
        }
        Self::new(Arc::new(source), endpoints)
    }

    /// Change how often operations are polled.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// A valid bearer token, refreshed transparently when needed.
    pub async fn access_token(&self) -> GcpResult<String> {
        self.tokens.access_token().await
    }

    /// Identity of the credential, when the token source knows it.
    pub fn service_account_email(&self) -> Option<&str> {
        self.tokens.service_account_email()
    }

    /// `{compute}/projects/{project}/{path}`.
    pub fn compute_url(&self, project: &str, path: &str) -> String {
        format!("{}/projects/{project}/{path}", self.endpoints.compute)
    }

    /// Authenticated JSON call.
    ///
    /// Any status >= 400 becomes [`GcpError::Provider`]. An empty response
    /// body decodes to an empty object.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        params: &[(&str, &str)],
        body: Option<&Value>,
    ) -> GcpResult<Value> {
        let token = self.access_token().await?;
        let mut request = self
            .http
            .request(method.clone(), url)
            .bearer_auth(token)
            .query(params);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        debug!(%method, url, status = status.as_u16(), "provider call");

        if status.as_u16() >= 400 {
            return Err(GcpError::from_response(status.as_u16(), &text));
        }
        if text.trim().is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        serde_json::from_str(&text)
            .map_err(|e| GcpError::Decode(format!("{method} {url}: {e}: {}", truncate(&text))))
    }

    pub async fn get(&self, url: &str) -> GcpResult<Value> {
        self.request(Method::GET, url, &[], None).await
    }

    pub async fn post(&self, url: &str, body: &Value) -> GcpResult<Value> {
        self.request(Method::POST, url, &[], Some(body)).await
    }

    /// Wait for a compute operation to reach `DONE`.
    ///
    /// Polls every poll interval. A finished operation carrying an `error`
    /// payload fails with [`GcpError::Operation`]; running past `timeout`
    /// fails with [`GcpError::Timeout`]. Nothing is cancelled on timeout.
    pub async fn wait_operation(
        &self,
        project: &str,
        scope: &OperationScope,
        name: &str,
        timeout: Duration,
    ) -> GcpResult<Value> {
        let url = self.compute_url(project, &scope.path(name));
        let deadline = Deadline::after(timeout);
        loop {
            let op = self.get(&url).await?;
            if op.get("status").and_then(Value::as_str) == Some("DONE") {
                check_operation_error(name, &op)?;
                return Ok(op);
            }
            self.pause(name, &deadline).await?;
        }
    }

    /// Wait for a resource-manager or service-usage operation (`done: true`).
    ///
    /// `name` is the operation's resource name, resolved against `base`.
    pub async fn wait_done(&self, base: &str, name: &str, timeout: Duration) -> GcpResult<Value> {
        let url = format!("{}/{}", base.trim_end_matches('/'), name);
        let deadline = Deadline::after(timeout);
        loop {
            let op = self.get(&url).await?;
            if op.get("done").and_then(Value::as_bool).unwrap_or(false) {
                check_operation_error(name, &op)?;
                return Ok(op);
            }
            self.pause(name, &deadline).await?;
        }
    }

    async fn pause(&self, name: &str, deadline: &Deadline) -> GcpResult<()> {
        if deadline.is_expired() {
            warn!(operation = name, budget = ?deadline.budget(), "operation wait timed out");
            return Err(GcpError::Timeout {
                what: format!("operation {name}"),
                budget: deadline.budget(),
            });
        }
        tokio::time::sleep(self.poll_interval).await;
        Ok(())
    }
}

fn check_operation_error(name: &str, op: &Value) -> GcpResult<()> {
    let Some(error) = op.get("error").filter(|e| !e.is_null()) else {
        return Ok(());
    };

    // Compute reports `{"errors": [{"code", "message"}]}`, the v1/v3 APIs a
    // google.rpc.Status with a top-level `message`.
    let messages: Vec<&str> = error
        .get("errors")
        .and_then(Value::as_array)
        .map(|errors| {
            errors
                .iter()
                .filter_map(|e| e.get("message").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();

    let detail = if !messages.is_empty() {
        messages.join("; ")
    } else if let Some(message) = error.get("message").and_then(Value::as_str) {
        message.to_string()
    } else {
        error.to_string()
    };

    Err(GcpError::Operation {
        operation: name.to_string(),
        detail: truncate(&detail),
    })
}
