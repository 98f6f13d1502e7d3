//! Agent, project and profile persistence.
//!
//! The control plane is stateless per request; everything shared lives
//! behind [`Store`]. Two backends exist: [`PgStore`] for deployments and
//! [`MemoryStore`] for development and tests.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use nave_id::AgentId;
use serde_json::Value;
use thiserror::Error;

use crate::model::{AgentRecord, Project};

/// Record store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("agent {0} not found")]
    AgentNotFound(AgentId),

    #[error("token already issued to another agent")]
    DuplicateToken,

    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
}

/// In-place change applied to an agent record under the store's lock.
pub type AgentMutation = Box<dyn FnOnce(&mut AgentRecord) + Send>;

#[async_trait]
pub trait AgentStore: Send + Sync {
    /// Insert a new record. Fails with [`StoreError::DuplicateToken`] if the
    /// token hash is already taken.
    async fn create_agent(&self, record: &AgentRecord) -> Result<(), StoreError>;

    async fn get_agent(&self, id: &AgentId) -> Result<Option<AgentRecord>, StoreError>;

    /// Point lookup by token hash.
    async fn find_agent_by_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<AgentRecord>, StoreError>;

    /// Read-modify-write one record atomically; returns the updated record.
    async fn update_agent(
        &self,
        id: &AgentId,
        mutation: AgentMutation,
    ) -> Result<AgentRecord, StoreError>;
}

#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Add projects to the pool; already-registered ids are left as they are.
    /// Returns the whole pool.
    async fn register_projects(&self, project_ids: &[String]) -> Result<Vec<Project>, StoreError>;

    /// The pool in registration order.
    async fn list_projects(&self) -> Result<Vec<Project>, StoreError>;

    /// Persist the outcome of a live quota check.
    async fn record_quota_check(
        &self,
        project_id: &str,
        active: bool,
        usage: Option<f64>,
        limit: Option<f64>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Overwrite a profile's network summary. Returns `false` when the
    /// profile does not exist.
    async fn set_profile_network(&self, profile_id: i64, network: &Value)
        -> Result<bool, StoreError>;
}

/// Everything the control plane persists.
#[async_trait]
pub trait Store: AgentStore + ProjectStore + ProfileStore {
    async fn health_check(&self) -> Result<(), StoreError>;
}
