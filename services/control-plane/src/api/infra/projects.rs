//! Quota pool administration.

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::authz::Operator;
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::model::Project;
use crate::provisioning::{validate_project_ref, ProjectBootstrapRequest};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/projects", get(list_projects))
        .route("/projects/register", post(register_projects))
        .route("/projects/bootstrap", post(bootstrap_project))
}

#[derive(Debug, Deserialize)]
pub struct RegisterProjectsRequest {
    pub projects: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ProjectsResponse {
    pub items: Vec<Project>,
}

async fn list_projects(
    State(state): State<AppState>,
    ctx: RequestContext,
    _operator: Operator,
) -> Result<impl IntoResponse, ApiError> {
    let items = state.store().list_projects().await.map_err(|e| {
        tracing::error!(error = %e, request_id = %ctx.request_id, "failed to list projects");
        ApiError::from(e).with_request_id(ctx.request_id.clone())
    })?;
    Ok(Json(ProjectsResponse { items }))
}

async fn register_projects(
    State(state): State<AppState>,
    ctx: RequestContext,
    operator: Operator,
    Json(req): Json<RegisterProjectsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id;

    let projects: Vec<String> = req
        .projects
        .iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    if projects.is_empty() {
        return Err(ApiError::bad_request("invalid_request", "projects must not be empty")
            .with_request_id(request_id));
    }
    for project in &projects {
        validate_project_ref("projects", project)
            .map_err(|e| ApiError::from(e).with_request_id(request_id.clone()))?;
    }

    let items = state
        .store()
        .register_projects(&projects)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, request_id = %request_id, "failed to register projects");
            ApiError::from(e).with_request_id(request_id.clone())
        })?;

    tracing::info!(
        operator = %operator.subject,
        request_id = %request_id,
        registered = ?projects,
        pool_size = items.len(),
        "projects registered"
    );

    Ok(Json(ProjectsResponse { items }))
}

async fn bootstrap_project(
    State(state): State<AppState>,
    ctx: RequestContext,
    operator: Operator,
    Json(req): Json<ProjectBootstrapRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id;
    tracing::info!(
        operator = %operator.subject,
        request_id = %request_id,
        project = %req.project_id,
        "bootstrapping project"
    );

    let outcome = async { state.project_bootstrap()?.run(&req).await }
        .await
        .map_err(|e| {
            tracing::error!(error = %e, request_id = %request_id, project = %req.project_id, "project bootstrap failed");
            ApiError::from(e).with_request_id(request_id.clone())
        })?;

    Ok((StatusCode::CREATED, Json(outcome)))
}
