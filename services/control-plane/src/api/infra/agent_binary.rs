//! `GET /infra/agent`: the node agent executable, fetched by nodes at boot.
//!
//! Unauthenticated; the binary carries no secrets. Nodes receive their
//! credentials through the environment file written by the startup script.

use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
};

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::state::AppState;

pub async fn download(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id;
    let Some(path) = state.agent_binary() else {
        return Err(ApiError::service_unavailable(
            "not_configured",
            "no agent binary is configured",
        )
        .with_request_id(request_id));
    };

    let bytes = tokio::fs::read(path).await.map_err(|e| {
        tracing::error!(error = %e, path = %path.display(), request_id = %request_id, "failed to read agent binary");
        ApiError::service_unavailable("agent_binary_unavailable", "agent binary could not be read")
            .with_request_id(request_id.clone())
    })?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"nave-node-agent\"",
            ),
        ],
        bytes,
    ))
}
