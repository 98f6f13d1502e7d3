//! Process-local store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use nave_id::AgentId;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{AgentMutation, AgentStore, ProfileStore, ProjectStore, Store, StoreError};
use crate::model::{AgentRecord, Project};

#[derive(Default)]
struct Inner {
    agents: HashMap<AgentId, AgentRecord>,
    projects: Vec<Project>,
    profiles: HashMap<i64, Option<Value>>,
}

/// Store kept in memory; contents are lost when the process exits.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty profile, standing in for the application that owns
    /// profiles.
    pub async fn insert_profile(&self, profile_id: i64) {
        self.inner.write().await.profiles.insert(profile_id, None);
    }

    pub async fn agent_count(&self) -> usize {
        self.inner.read().await.agents.len()
    }

    /// Current network summary of a profile.
    pub async fn profile_network(&self, profile_id: i64) -> Option<Value> {
        self.inner
            .read()
            .await
            .profiles
            .get(&profile_id)
            .cloned()
            .flatten()
    }
}

#[async_trait]
impl AgentStore for MemoryStore {
    async fn create_agent(&self, record: &AgentRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner
            .agents
            .values()
            .any(|a| a.token_hash == record.token_hash)
        {
            return Err(StoreError::DuplicateToken);
        }
        inner.agents.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_agent(&self, id: &AgentId) -> Result<Option<AgentRecord>, StoreError> {
        Ok(self.inner.read().await.agents.get(id).cloned())
    }

    async fn find_agent_by_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<AgentRecord>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .agents
            .values()
            .find(|a| a.token_hash == token_hash)
            .cloned())
    }

    async fn update_agent(
        &self,
        id: &AgentId,
        mutation: AgentMutation,
    ) -> Result<AgentRecord, StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .agents
            .get_mut(id)
            .ok_or(StoreError::AgentNotFound(*id))?;
        mutation(&mut *record);
        Ok(record.clone())
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn register_projects(&self, project_ids: &[String]) -> Result<Vec<Project>, StoreError> {
        let mut inner = self.inner.write().await;
        for project_id in project_ids {
            if inner.projects.iter().any(|p| &p.project_id == project_id) {
                continue;
            }
            inner.projects.push(Project {
                project_id: project_id.clone(),
                active: true,
                ip_usage: None,
                ip_limit: None,
                registered_at: Utc::now(),
                checked_at: None,
            });
        }
        Ok(inner.projects.clone())
    }

    async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        Ok(self.inner.read().await.projects.clone())
    }

    async fn record_quota_check(
        &self,
        project_id: &str,
        active: bool,
        usage: Option<f64>,
        limit: Option<f64>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(project) = inner
            .projects
            .iter_mut()
            .find(|p| p.project_id == project_id)
        {
            project.active = active;
            project.ip_usage = usage;
            project.ip_limit = limit;
            project.checked_at = Some(Utc::now());
        }
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for MemoryStore {
    async fn set_profile_network(
        &self,
        profile_id: i64,
        network: &Value,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        match inner.profiles.get_mut(&profile_id) {
            Some(slot) => {
                *slot = Some(network.clone());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
