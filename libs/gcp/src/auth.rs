//! Bearer-token sources.
//!
//! The service-account flow signs an RS256 JWT assertion with the key's
//! private key and exchanges it at the token endpoint for a short-lived
//! access token. Tokens are cached and refreshed a minute before expiry.

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::ServiceAccountKey;
use crate::error::{truncate, GcpError, GcpResult};

/// OAuth scope requested for every call.
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
const EXPIRY_BUFFER_SECS: i64 = 60;

/// Something that hands out valid bearer tokens.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// A token valid for at least the next request.
    async fn access_token(&self) -> GcpResult<String>;

    /// Identity the tokens are issued for, if known.
    fn service_account_email(&self) -> Option<&str> {
        None
    }
}

/// A fixed, pre-issued token.
#[derive(Debug, Clone)]
pub struct StaticTokenSource {
    token: String,
    email: Option<String>,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            email: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn access_token(&self) -> GcpResult<String> {
        Ok(self.token.clone())
    }

    fn service_account_email(&self) -> Option<&str> {
        self.email.as_deref()
    }
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    exp: i64,
    iat: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: i64,
}

impl CachedToken {
    fn is_fresh(&self, now: i64) -> bool {
        now < self.expires_at - EXPIRY_BUFFER_SECS
    }
}

/// Service-account JWT bearer exchange with an in-memory cache.
pub struct ServiceAccountTokenSource {
    key: ServiceAccountKey,
    token_uri: String,
    http: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl ServiceAccountTokenSource {
    pub fn new(key: ServiceAccountKey, http: reqwest::Client) -> Self {
        let token_uri = key.token_uri.clone();
        Self {
            key,
            token_uri,
            http,
            cached: Mutex::new(None),
        }
    }

    /// Exchange assertions at a different token endpoint.
    pub fn with_token_uri(mut self, token_uri: impl Into<String>) -> Self {
        self.token_uri = token_uri.into();
        self
    }

    fn assertion(&self, now: i64) -> GcpResult<String> {
        let claims = Claims {
            iss: &self.key.client_email,
            scope: CLOUD_PLATFORM_SCOPE,
            aud: &self.token_uri,
            exp: now + ASSERTION_LIFETIME_SECS,
            iat: now,
        };
        let header = Header {
            alg: Algorithm::RS256,
            kid: self.key.private_key_id.clone(),
            ..Default::default()
        };
        let signing_key = EncodingKey::from_rsa_pem(self.key.pem().as_bytes()).map_err(|e| {
            GcpError::Configuration(format!("service-account private key is unusable: {e}"))
        })?;
        encode(&header, &claims, &signing_key)
            .map_err(|e| GcpError::Configuration(format!("failed to sign token assertion: {e}")))
    }

    async fn exchange(&self, now: i64) -> GcpResult<CachedToken> {
        let assertion = self.assertion(now)?;
        let response = self
            .http
            .post(&self.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", &assertion)])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(GcpError::Provider {
                status: status.as_u16(),
                api_status: None,
                reason: None,
                message: truncate(&body),
            });
        }

        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| GcpError::Decode(format!("token response: {e}")))?;
        let expires_in = parsed.expires_in.unwrap_or(ASSERTION_LIFETIME_SECS);
        debug!(email = %self.key.client_email, expires_in, "exchanged service-account token");

        Ok(CachedToken {
            token: parsed.access_token,
            expires_at: now + expires_in,
        })
    }
}

#[async_trait]
impl TokenSource for ServiceAccountTokenSource {
    async fn access_token(&self) -> GcpResult<String> {
        let mut cached = self.cached.lock().await;
        let now = Utc::now().timestamp();
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh(now)) {
            return Ok(token.token.clone());
        }
        let token = self.exchange(now).await?;
        let value = token.token.clone();
        *cached = Some(token);
        Ok(value)
    }

    fn service_account_email(&self) -> Option<&str> {
        Some(&self.key.client_email)
    }
}
