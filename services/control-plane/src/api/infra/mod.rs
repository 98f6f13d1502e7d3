//! Exit-node infrastructure endpoints.
//!
//! Operator endpoints require a session token ([`Operator`]); agent
//! endpoints require the caller's own bootstrap token ([`AgentCaller`]).
//!
//! [`Operator`]: crate::api::authz::Operator
//! [`AgentCaller`]: crate::api::authz::AgentCaller

mod agent_binary;
mod agents;
mod projects;
mod provision;
mod resources;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/provision", post(provision::provision))
        .route("/agent", get(agent_binary::download))
        .merge(agents::routes())
        .merge(projects::routes())
        .merge(resources::routes())
}
