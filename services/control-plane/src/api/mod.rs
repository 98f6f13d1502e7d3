//! HTTP API handlers and routing.

pub mod authz;
pub mod error;
mod health;
mod infra;
pub mod request_context;

use axum::{
    http::{header, HeaderName, HeaderValue, Method, Request},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::state::AppState;

/// Stamps requests that arrive without an id with a fresh `req_` id.
#[derive(Clone, Copy, Default)]
struct MakeNaveRequestId;

impl MakeRequestId for MakeNaveRequestId {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&nave_id::RequestId::new().to_string())
            .ok()
            .map(RequestId::new)
    }
}

/// Create the main API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static(authz::AGENT_TOKEN_HEADER),
        ])
        .allow_origin(Any);

    let request_id_header = HeaderName::from_static(request_context::REQUEST_ID_HEADER);

    Router::new()
        // Health endpoints (no auth required)
        .merge(health::routes())
        .nest("/infra", infra::routes())
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(request_id_header.clone(), MakeNaveRequestId))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::new(request_id_header)),
        )
        .layer(cors)
        .with_state(state)
}
