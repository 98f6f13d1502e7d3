//! Agent record endpoints.
//!
//! Registration, desired config and status reporting are called by the
//! node agent with its bootstrap token. Bootstrap, desired-config updates
//! and the full record view are operator calls.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use nave_id::AgentId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::authz::{AgentCaller, Operator};
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::model::{AgentLifecycle, AgentRecord};
use crate::provisioning::{issue_agent, validate_name};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/agents/bootstrap", post(bootstrap_agent))
        .route("/agents/register", post(register_agent))
        .route("/agents/{agent_id}", get(get_agent))
        .route("/agents/{agent_id}/desired", get(get_desired).post(set_desired))
        .route("/agents/{agent_id}/status", get(get_status).post(report_status))
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct BootstrapAgentRequest {
    #[serde(default)]
    pub profile_id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BootstrapAgentResponse {
    pub agent_id: AgentId,
    /// Plaintext bootstrap token, shown once.
    pub token: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct RegisterAgentRequest {
    #[serde(default)]
    pub vm_name: Option<String>,
    #[serde(default)]
    pub public_ip: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterAgentResponse {
    pub agent_id: AgentId,
}

#[derive(Debug, Deserialize)]
pub struct SetDesiredRequest {
    pub wg_conf: String,
}

#[derive(Debug, Serialize)]
pub struct DesiredResponse {
    pub agent_id: AgentId,
    pub desired_json: Value,
}

#[derive(Debug, Deserialize)]
pub struct ReportStatusRequest {
    pub status_json: Value,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub agent_id: AgentId,
    pub vm_name: Option<String>,
    pub public_ip: Option<String>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub status_json: Value,
}

/// Operator view of a record, lifecycle included.
#[derive(Debug, Serialize)]
pub struct AgentResponse {
    pub agent_id: AgentId,
    pub profile_id: Option<i64>,
    pub name: Option<String>,
    pub vm_name: Option<String>,
    pub public_ip: Option<String>,
    pub desired_json: Value,
    pub lifecycle: AgentLifecycle,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<AgentRecord> for AgentResponse {
    fn from(record: AgentRecord) -> Self {
        Self {
            agent_id: record.id,
            profile_id: record.profile_id,
            vm_name: record.vm_name().map(str::to_string),
            public_ip: record.public_ip().map(str::to_string),
            name: record.name,
            desired_json: record.desired,
            lifecycle: record.lifecycle,
            last_seen_at: record.last_seen_at,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// Path ids that do not parse cannot belong to any agent.
fn parse_agent_id(raw: &str, request_id: &str) -> Result<AgentId, ApiError> {
    AgentId::parse(raw).map_err(|_| {
        ApiError::not_found("agent_not_found", format!("agent {raw} not found"))
            .with_request_id(request_id.to_string())
    })
}

fn store_error(request_id: &str) -> impl FnOnce(crate::store::StoreError) -> ApiError + '_ {
    move |e| {
        tracing::error!(error = %e, request_id = %request_id, "agent store call failed");
        ApiError::from(e).with_request_id(request_id.to_string())
    }
}

// =============================================================================
// Operator handlers
// =============================================================================

async fn bootstrap_agent(
    State(state): State<AppState>,
    ctx: RequestContext,
    operator: Operator,
    body: Option<Json<BootstrapAgentRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id;
    let req = body.map(|Json(req)| req).unwrap_or_default();

    if let Some(name) = &req.name {
        validate_name("name", name)
            .map_err(|e| ApiError::from(e).with_request_id(request_id.clone()))?;
    }

    let (record, token) = issue_agent(state.store(), req.profile_id, req.name)
        .await
        .map_err(store_error(&request_id))?;

    tracing::info!(
        agent_id = %record.id,
        operator = %operator.subject,
        request_id = %request_id,
        "bootstrapped agent"
    );

    Ok((
        StatusCode::CREATED,
        Json(BootstrapAgentResponse {
            agent_id: record.id,
            token,
        }),
    ))
}

async fn get_agent(
    State(state): State<AppState>,
    ctx: RequestContext,
    _operator: Operator,
    Path(agent_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id;
    let agent_id = parse_agent_id(&agent_id, &request_id)?;

    let record = state
        .store()
        .get_agent(&agent_id)
        .await
        .map_err(store_error(&request_id))?
        .ok_or_else(|| {
            ApiError::not_found("agent_not_found", format!("agent {agent_id} not found"))
                .with_request_id(request_id.clone())
        })?;

    Ok(Json(AgentResponse::from(record)))
}

async fn set_desired(
    State(state): State<AppState>,
    ctx: RequestContext,
    operator: Operator,
    Path(agent_id): Path<String>,
    Json(req): Json<SetDesiredRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id;
    let agent_id = parse_agent_id(&agent_id, &request_id)?;

    let wg_conf = req.wg_conf;
    let record = state
        .store()
        .update_agent(
            &agent_id,
            Box::new(move |r: &mut AgentRecord| r.set_desired_wg_conf(&wg_conf)),
        )
        .await
        .map_err(store_error(&request_id))?;

    tracing::info!(
        agent_id = %agent_id,
        operator = %operator.subject,
        request_id = %request_id,
        hash = ?record.desired_hash().map(|h| h.as_str().to_string()),
        "desired config updated"
    );

    Ok(Json(DesiredResponse {
        agent_id: record.id,
        desired_json: record.desired,
    }))
}

// =============================================================================
// Agent handlers
// =============================================================================

async fn register_agent(
    State(state): State<AppState>,
    ctx: RequestContext,
    caller: AgentCaller,
    body: Option<Json<RegisterAgentRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id;
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let agent_id = caller.record.id;

    let (vm_name, public_ip) = (req.vm_name.clone(), req.public_ip.clone());
    state
        .store()
        .update_agent(
            &agent_id,
            Box::new(move |r: &mut AgentRecord| r.register(vm_name, public_ip)),
        )
        .await
        .map_err(store_error(&request_id))?;

    tracing::info!(
        agent_id = %agent_id,
        vm_name = ?req.vm_name,
        public_ip = ?req.public_ip,
        "agent registered"
    );

    Ok(Json(RegisterAgentResponse { agent_id }))
}

async fn get_desired(
    State(state): State<AppState>,
    ctx: RequestContext,
    caller: AgentCaller,
    Path(agent_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id;
    let agent_id = caller.require_self(&agent_id, &request_id)?;

    // A poll counts as a sign of life even when no status follows.
    let record = state
        .store()
        .update_agent(
            &agent_id,
            Box::new(|r: &mut AgentRecord| r.touch(Utc::now())),
        )
        .await
        .map_err(store_error(&request_id))?;

    Ok(Json(DesiredResponse {
        agent_id,
        desired_json: record.desired,
    }))
}

async fn report_status(
    State(state): State<AppState>,
    ctx: RequestContext,
    caller: AgentCaller,
    Path(agent_id): Path<String>,
    Json(req): Json<ReportStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id;
    let agent_id = caller.require_self(&agent_id, &request_id)?;

    let record = state
        .store()
        .update_agent(
            &agent_id,
            Box::new(move |r: &mut AgentRecord| r.record_status(req.status_json)),
        )
        .await
        .map_err(store_error(&request_id))?;

    tracing::debug!(agent_id = %agent_id, state = record.lifecycle.name(), "status reported");

    Ok(Json(OkResponse { ok: true }))
}

async fn get_status(
    ctx: RequestContext,
    caller: AgentCaller,
    Path(agent_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let agent_id = caller.require_self(&agent_id, &ctx.request_id)?;
    let record = caller.record;
    Ok(Json(StatusResponse {
        agent_id,
        vm_name: record.vm_name().map(str::to_string),
        public_ip: record.public_ip().map(str::to_string),
        last_seen_at: record.last_seen_at,
        status_json: record.status_json(),
    }))
}
