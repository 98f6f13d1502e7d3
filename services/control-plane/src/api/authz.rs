//! Authentication extractors.
//!
//! Two disjoint credentials share one store: operator session tokens
//! (HS256 JWTs issued by the surrounding application) authorize admin
//! endpoints, and each agent's bootstrap token authorizes only that agent's
//! own endpoints.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use nave_id::AgentId;
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::api::request_context::{header_string, REQUEST_ID_HEADER};
use crate::model::AgentRecord;
use crate::state::AppState;
use crate::tokens::hash_token;

pub const AGENT_TOKEN_HEADER: &str = "x-agent-token";

/// Claims we read from operator session tokens.
#[derive(Debug, Clone, Deserialize)]
pub struct OperatorClaims {
    pub sub: String,
    pub exp: u64,
}

/// An authenticated operator.
#[derive(Debug, Clone)]
pub struct Operator {
    pub subject: String,
}

/// The agent record owning the presented bootstrap token.
#[derive(Debug, Clone)]
pub struct AgentCaller {
    pub record: AgentRecord,
}

impl AgentCaller {
    /// Agents may only act on their own record. Returns the caller's id when
    /// `agent_id` names it.
    pub fn require_self(&self, agent_id: &str, request_id: &str) -> Result<AgentId, ApiError> {
        if self.record.id.to_string() != agent_id {
            tracing::warn!(
                caller = %self.record.id,
                target = %agent_id,
                request_id = %request_id,
                "agent token presented for another agent"
            );
            return Err(invalid_agent_token(request_id));
        }
        Ok(self.record.id)
    }
}

fn request_id(parts: &Parts) -> String {
    header_string(&parts.headers, REQUEST_ID_HEADER).unwrap_or_else(|| "unknown".to_string())
}

fn invalid_agent_token(request_id: &str) -> ApiError {
    ApiError::unauthorized("invalid_agent_token", "Missing or invalid agent token")
        .with_request_id(request_id.to_string())
}

/// Verify an operator session token against the shared secret.
pub fn verify_operator_token(token: &str, secret: &str) -> Result<OperatorClaims, jsonwebtoken::errors::Error> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_required_spec_claims(&["exp", "sub"]);
    decode::<OperatorClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
}

impl FromRequestParts<AppState> for Operator {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let request_id = request_id(parts);

        let Some(secret) = state.operator_secret() else {
            return Err(ApiError::service_unavailable(
                "not_configured",
                "operator authentication is not configured",
            )
            .with_request_id(request_id));
        };

        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                ApiError::unauthorized(
                    "invalid_authorization",
                    "Authorization must be a Bearer token",
                )
                .with_request_id(request_id.clone())
            })?;

        let claims = verify_operator_token(token, secret).map_err(|e| {
            tracing::warn!(error = %e, request_id = %request_id, "rejected operator token");
            ApiError::unauthorized("invalid_token", "Invalid or expired session token")
                .with_request_id(request_id.clone())
        })?;

        Ok(Self {
            subject: claims.sub,
        })
    }
}

impl FromRequestParts<AppState> for AgentCaller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let request_id = request_id(parts);
        let token = header_string(&parts.headers, AGENT_TOKEN_HEADER)
            .ok_or_else(|| invalid_agent_token(&request_id))?;

        let record = state
            .store()
            .find_agent_by_token_hash(&hash_token(&token))
            .await
            .map_err(|e| ApiError::from(e).with_request_id(request_id.clone()))?
            .ok_or_else(|| invalid_agent_token(&request_id))?;

        Ok(Self { record })
    }
}
