//! `POST /infra/provision`.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};

use crate::api::authz::Operator;
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::provisioning::ProvisionRequest;
use crate::state::AppState;

/// Provision an exit node end to end.
///
/// Blocks until the instance exists. The response carries the agent's
/// bootstrap token; it is not retrievable afterwards.
pub async fn provision(
    State(state): State<AppState>,
    ctx: RequestContext,
    operator: Operator,
    Json(req): Json<ProvisionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id;
    tracing::info!(
        request_id = %request_id,
        operator = %operator.subject,
        vm_name = %req.name,
        profile_id = ?req.profile_id,
        "provisioning exit node"
    );

    let outcome = state.provisioner().provision(&req).await.map_err(|e| {
        tracing::error!(error = %e, request_id = %request_id, vm_name = %req.name, "provisioning failed");
        ApiError::from(e).with_request_id(request_id.clone())
    })?;

    Ok((StatusCode::CREATED, Json(outcome)))
}
