//! Error types for provider calls.

use std::time::Duration;

use thiserror::Error;

/// Provider messages carried in errors are cut to this many characters.
pub const MAX_PROVIDER_MESSAGE_CHARS: usize = 512;

/// Result alias for provider operations.
pub type GcpResult<T> = Result<T, GcpError>;

/// Errors returned by the cloud client and orchestrator.
#[derive(Debug, Error)]
pub enum GcpError {
    /// Service-account key material is missing or malformed, or the client
    /// could not be built.
    #[error("cloud configuration error: {0}")]
    Configuration(String),

    /// The provider answered with HTTP status >= 400.
    #[error("provider returned HTTP {status}: {message}")]
    Provider {
        status: u16,
        /// Canonical status string from the error payload (`PERMISSION_DENIED`, ...).
        api_status: Option<String>,
        /// First `reason` found in the error details (`SERVICE_DISABLED`, ...).
        reason: Option<String>,
        /// Provider message, truncated.
        message: String,
    },

    /// A long-running operation completed with an error payload.
    #[error("operation {operation} failed: {detail}")]
    Operation { operation: String, detail: String },

    /// A bounded wait ran past its budget.
    #[error("timed out after {budget:?} waiting for {what}")]
    Timeout { what: String, budget: Duration },

    /// A resource the operation depends on does not exist or lacks a value.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request never produced an HTTP response.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The provider response could not be decoded.
    #[error("failed to decode provider response: {0}")]
    Decode(String),
}

impl GcpError {
    /// Build a provider error from an HTTP status and raw response body.
    ///
    /// Google APIs answer with `{"error": {"code", "message", "status",
    /// "details": [{"reason": ...}]}}`; when the body has that shape the
    /// structured fields are extracted, otherwise the raw body is used.
    pub fn from_response(status: u16, body: &str) -> Self {
        let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
        let error = parsed.as_ref().and_then(|v| v.get("error"));

        let api_status = error
            .and_then(|e| e.get("status"))
            .and_then(|s| s.as_str())
            .map(str::to_string);

        let reason = error
            .and_then(|e| e.get("details"))
            .and_then(|d| d.as_array())
            .and_then(|details| {
                details
                    .iter()
                    .find_map(|d| d.get("reason").and_then(|r| r.as_str()))
            })
            .map(str::to_string);

        let message = error
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
            .unwrap_or(body);

        Self::Provider {
            status,
            api_status,
            reason,
            message: truncate(message),
        }
    }

    /// HTTP status of a provider error.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Provider { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True for a provider 404.
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

/// Truncate a provider message on a character boundary.
pub(crate) fn truncate(message: &str) -> String {
    if message.chars().count() <= MAX_PROVIDER_MESSAGE_CHARS {
        return message.to_string();
    }
    let mut out: String = message.chars().take(MAX_PROVIDER_MESSAGE_CHARS).collect();
    out.push_str("...");
    out
}
