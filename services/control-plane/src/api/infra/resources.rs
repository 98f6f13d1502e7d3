//! Direct cloud resource endpoints for operators.
//!
//! Thin wrappers over the orchestrator; the provisioning workflow is the
//! normal way to create exit nodes.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use nave_gcp::{GcpError, InstanceRequest};
use serde::Deserialize;

use crate::api::authz::Operator;
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::provisioning::{validate_name, ProvisionError, MAX_DISK_SIZE_GB, MIN_DISK_SIZE_GB};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/defaults", get(get_defaults))
        .route("/addresses", post(create_address))
        .route("/addresses/{name}", get(get_address))
        .route("/instances", post(create_instance))
        .route("/instances/{name}", get(get_instance))
        .route("/instances/{name}/startup-script", post(set_startup_script))
}

#[derive(Debug, Deserialize)]
pub struct CreateAddressRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateInstanceRequest {
    pub name: String,
    #[serde(default)]
    pub address_name: Option<String>,
    #[serde(default)]
    pub machine_type: Option<String>,
    #[serde(default)]
    pub startup_script: Option<String>,
    #[serde(default)]
    pub disk_size_gb: Option<u32>,
    #[serde(default)]
    pub preemptible: bool,
    #[serde(default)]
    pub project_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StartupScriptRequest {
    pub startup_script: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub zone: Option<String>,
}

fn invalid(request_id: &str) -> impl Fn(ProvisionError) -> ApiError + '_ {
    move |e| ApiError::from(e).with_request_id(request_id.to_string())
}

fn provider_failure<'a>(request_id: &'a str, what: &'a str) -> impl FnOnce(GcpError) -> ApiError + 'a {
    move |e| {
        tracing::error!(error = %e, request_id = %request_id, "{what} failed");
        ApiError::from(e).with_request_id(request_id.to_string())
    }
}

async fn get_defaults(
    State(state): State<AppState>,
    ctx: RequestContext,
    _operator: Operator,
) -> Result<impl IntoResponse, ApiError> {
    let gcp = state.gcp().map_err(invalid(&ctx.request_id))?;
    Ok(Json(gcp.defaults(None)))
}

async fn get_address(
    State(state): State<AppState>,
    ctx: RequestContext,
    _operator: Operator,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id;
    validate_name("name", &name).map_err(invalid(&request_id))?;
    let gcp = state.gcp().map_err(invalid(&request_id))?;

    let address = gcp
        .get_address(&name, None, None)
        .await
        .map_err(provider_failure(&request_id, "address lookup"))?;
    Ok(Json(address.raw))
}

async fn create_address(
    State(state): State<AppState>,
    ctx: RequestContext,
    operator: Operator,
    Json(req): Json<CreateAddressRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id;
    validate_name("name", &req.name).map_err(invalid(&request_id))?;
    let gcp = state.gcp().map_err(invalid(&request_id))?;

    let address = gcp
        .reserve_address(
            &req.name,
            None,
            req.description.as_deref(),
            req.project_id.as_deref(),
        )
        .await
        .map_err(provider_failure(&request_id, "address reservation"))?;

    tracing::info!(operator = %operator.subject, address = %req.name, ip = ?address.address, "address reserved");
    Ok((StatusCode::CREATED, Json(address.raw)))
}

async fn get_instance(
    State(state): State<AppState>,
    ctx: RequestContext,
    _operator: Operator,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id;
    validate_name("name", &name).map_err(invalid(&request_id))?;
    let gcp = state.gcp().map_err(invalid(&request_id))?;

    let instance = gcp
        .get_instance(&name, None, None)
        .await
        .map_err(provider_failure(&request_id, "instance lookup"))?;
    Ok(Json(instance))
}

async fn create_instance(
    State(state): State<AppState>,
    ctx: RequestContext,
    operator: Operator,
    Json(req): Json<CreateInstanceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id;
    validate_name("name", &req.name).map_err(invalid(&request_id))?;
    if let Some(address_name) = &req.address_name {
        validate_name("address_name", address_name).map_err(invalid(&request_id))?;
    }
    if let Some(disk) = req.disk_size_gb {
        if !(MIN_DISK_SIZE_GB..=MAX_DISK_SIZE_GB).contains(&disk) {
            return Err(ApiError::bad_request(
                "invalid_request",
                format!("disk_size_gb must be between {MIN_DISK_SIZE_GB} and {MAX_DISK_SIZE_GB}"),
            )
            .with_request_id(request_id));
        }
    }
    let gcp = state.gcp().map_err(invalid(&request_id))?;

    let instance_request = InstanceRequest {
        name: req.name.clone(),
        zone: None,
        machine_type: req.machine_type,
        address_name: req.address_name,
        startup_script: req.startup_script,
        tags: Vec::new(),
        disk_size_gb: req.disk_size_gb,
        preemptible: req.preemptible,
    };
    let instance = gcp
        .create_instance(&instance_request, req.project_id.as_deref())
        .await
        .map_err(provider_failure(&request_id, "instance creation"))?;

    tracing::info!(operator = %operator.subject, instance = %req.name, "instance created");
    Ok((StatusCode::CREATED, Json(instance)))
}

async fn set_startup_script(
    State(state): State<AppState>,
    ctx: RequestContext,
    operator: Operator,
    Path(name): Path<String>,
    Json(req): Json<StartupScriptRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id;
    validate_name("name", &name).map_err(invalid(&request_id))?;
    let gcp = state.gcp().map_err(invalid(&request_id))?;

    let instance = gcp
        .set_startup_script(
            req.project_id.as_deref(),
            req.zone.as_deref(),
            &name,
            &req.startup_script,
        )
        .await
        .map_err(provider_failure(&request_id, "startup script update"))?;

    tracing::info!(operator = %operator.subject, instance = %name, "startup script replaced");
    Ok(Json(instance))
}
