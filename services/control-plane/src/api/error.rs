use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use nave_gcp::GcpError;
use serde::Serialize;

use crate::provisioning::ProvisionError;
use crate::store::StoreError;

/// Seconds a client should wait before retrying when the pool is exhausted.
const EXHAUSTED_RETRY_AFTER_SECONDS: u32 = 60;

#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub code: String,
    pub request_id: String,
    pub retryable: bool,
    pub retry_after_seconds: u32,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://nave.dev/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            instance: None,
            code,
            request_id: "unknown".to_string(),
            retryable: false,
            retry_after_seconds: 0,
        }
    }

    fn set_request_id(&mut self, request_id: impl Into<String>) {
        let request_id = request_id.into();
        self.request_id = request_id.clone();
        if self.instance.is_none() {
            self.instance = Some(request_id);
        }
    }

    fn set_retryable(&mut self, retryable: bool) {
        self.retryable = retryable;
    }

    fn set_retry_after_seconds(&mut self, seconds: u32) {
        self.retry_after_seconds = seconds;
        if seconds > 0 {
            self.retryable = true;
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn with_status(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn unauthorized(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::UNAUTHORIZED, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    pub fn bad_gateway(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_GATEWAY, code, message)
    }

    pub fn service_unavailable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::SERVICE_UNAVAILABLE, code, message)
    }

    pub fn gateway_timeout(code: impl Into<String>, message: impl Into<String>) -> Self {
        let mut error = Self::with_status(StatusCode::GATEWAY_TIMEOUT, code, message);
        error.problem.set_retryable(true);
        error
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.problem.set_request_id(request_id);
        self
    }

    pub fn with_retry_after_seconds(mut self, seconds: u32) -> Self {
        self.problem.set_retry_after_seconds(seconds);
        self
    }

    /// Map a provider error, prefixing the detail with `context`.
    fn from_gcp(err: &GcpError, context: Option<String>) -> Self {
        let detail = match context {
            Some(context) => format!("{context}: {err}"),
            None => err.to_string(),
        };
        match err {
            GcpError::Configuration(_) => Self::service_unavailable("not_configured", detail),
            GcpError::NotFound(_) => Self::not_found("not_found", detail),
            GcpError::Provider { status: 404, .. } => Self::not_found("not_found", detail),
            GcpError::Timeout { .. } => Self::gateway_timeout("provider_timeout", detail),
            GcpError::Provider { .. }
            | GcpError::Operation { .. }
            | GcpError::Transport(_)
            | GcpError::Decode(_) => Self::bad_gateway("provider_error", detail),
        }
    }
}

impl From<GcpError> for ApiError {
    fn from(err: GcpError) -> Self {
        Self::from_gcp(&err, None)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AgentNotFound(id) => {
                Self::not_found("agent_not_found", format!("agent {id} not found"))
            }
            other => {
                tracing::error!(error = %other, "store operation failed");
                Self::internal("internal_error", "store operation failed")
            }
        }
    }
}

impl From<ProvisionError> for ApiError {
    fn from(err: ProvisionError) -> Self {
        match err {
            ProvisionError::Validation(message) => Self::bad_request("invalid_request", message),
            ProvisionError::NotFound(message) => Self::not_found("not_found", message),
            ProvisionError::Configuration(message) => {
                Self::service_unavailable("not_configured", message)
            }
            err @ ProvisionError::ResourceExhausted { .. } => {
                Self::service_unavailable("resource_exhausted", err.to_string())
                    .with_retry_after_seconds(EXHAUSTED_RETRY_AFTER_SECONDS)
            }
            ProvisionError::Step {
                step,
                resource,
                source,
            } => Self::from_gcp(&source, Some(format!("{step} failed for {resource}"))),
            ProvisionError::Store(err) => err.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}
