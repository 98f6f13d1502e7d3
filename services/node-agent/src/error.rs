//! Node agent errors.

use thiserror::Error;

/// Control-plane response bodies carried in errors are cut to this length.
const MAX_BODY_CHARS: usize = 512;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Missing or malformed settings. Fatal at start.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("control plane returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("request to control plane failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to apply WireGuard config: {0}")]
    Apply(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AgentError {
    pub(crate) fn http(status: u16, body: &str) -> Self {
        let body = if body.chars().count() > MAX_BODY_CHARS {
            let cut: String = body.chars().take(MAX_BODY_CHARS).collect();
            format!("{cut}...")
        } else {
            body.to_string()
        };
        Self::Http { status, body }
    }
}
