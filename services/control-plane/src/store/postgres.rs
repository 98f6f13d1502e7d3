//! Postgres-backed store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nave_id::AgentId;
use serde_json::Value;
use sqlx::{postgres::PgRow, types::Json, Row};

use super::{AgentMutation, AgentStore, ProfileStore, ProjectStore, Store, StoreError};
use crate::db::Database;
use crate::model::{AgentLifecycle, AgentRecord, Project};

const AGENT_COLUMNS: &str = "id, token_hash, profile_id, name, desired_json, lifecycle, \
                             last_seen_at, created_at, updated_at";

struct AgentRow {
    id: String,
    token_hash: String,
    profile_id: Option<i64>,
    name: Option<String>,
    desired_json: Value,
    lifecycle: Value,
    last_seen_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for AgentRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            token_hash: row.try_get("token_hash")?,
            profile_id: row.try_get("profile_id")?,
            name: row.try_get("name")?,
            desired_json: row.try_get("desired_json")?,
            lifecycle: row.try_get("lifecycle")?,
            last_seen_at: row.try_get("last_seen_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<AgentRow> for AgentRecord {
    type Error = StoreError;

    fn try_from(row: AgentRow) -> Result<Self, Self::Error> {
        let id: AgentId = row
            .id
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("agent id {}: {e}", row.id)))?;
        let lifecycle: AgentLifecycle = serde_json::from_value(row.lifecycle)
            .map_err(|e| StoreError::Corrupt(format!("agent {id} lifecycle: {e}")))?;
        Ok(Self {
            id,
            token_hash: row.token_hash,
            profile_id: row.profile_id,
            name: row.name,
            desired: row.desired_json,
            lifecycle,
            last_seen_at: row.last_seen_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

struct ProjectRow {
    project_id: String,
    active: bool,
    ip_usage: Option<f64>,
    ip_limit: Option<f64>,
    registered_at: DateTime<Utc>,
    checked_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ProjectRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            project_id: row.try_get("project_id")?,
            active: row.try_get("active")?,
            ip_usage: row.try_get("ip_usage")?,
            ip_limit: row.try_get("ip_limit")?,
            registered_at: row.try_get("registered_at")?,
            checked_at: row.try_get("checked_at")?,
        })
    }
}

impl From<ProjectRow> for Project {
    fn from(row: ProjectRow) -> Self {
        Self {
            project_id: row.project_id,
            active: row.active,
            ip_usage: row.ip_usage,
            ip_limit: row.ip_limit,
            registered_at: row.registered_at,
            checked_at: row.checked_at,
        }
    }
}

/// Store over the control plane's Postgres database.
#[derive(Clone)]
pub struct PgStore {
    db: Database,
}

impl PgStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn fetch_agent(
        &self,
        filter: &str,
        value: &str,
    ) -> Result<Option<AgentRecord>, StoreError> {
        let row = sqlx::query_as::<_, AgentRow>(&format!(
            "SELECT {AGENT_COLUMNS} FROM nave_agents WHERE {filter} = $1"
        ))
        .bind(value)
        .fetch_optional(self.db.pool())
        .await?;
        row.map(AgentRecord::try_from).transpose()
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db_err| db_err.is_unique_violation())
}

#[async_trait]
impl AgentStore for PgStore {
    async fn create_agent(&self, record: &AgentRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO nave_agents (
                id, token_hash, profile_id, name, desired_json, lifecycle,
                last_seen_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.id.to_string())
        .bind(&record.token_hash)
        .bind(record.profile_id)
        .bind(&record.name)
        .bind(&record.desired)
        .bind(Json(&record.lifecycle))
        .bind(record.last_seen_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(self.db.pool())
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::DuplicateToken
            } else {
                StoreError::Query(e)
            }
        })?;
        Ok(())
    }

    async fn get_agent(&self, id: &AgentId) -> Result<Option<AgentRecord>, StoreError> {
        self.fetch_agent("id", &id.to_string()).await
    }

    async fn find_agent_by_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<AgentRecord>, StoreError> {
        self.fetch_agent("token_hash", token_hash).await
    }

    async fn update_agent(
        &self,
        id: &AgentId,
        mutation: AgentMutation,
    ) -> Result<AgentRecord, StoreError> {
        let mut tx = self.db.pool().begin().await?;

        let row = sqlx::query_as::<_, AgentRow>(&format!(
            "SELECT {AGENT_COLUMNS} FROM nave_agents WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.to_string())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::AgentNotFound(*id))?;

        let mut record = AgentRecord::try_from(row)?;
        mutation(&mut record);

        sqlx::query(
            r#"
            UPDATE nave_agents
            SET profile_id = $2,
                name = $3,
                desired_json = $4,
                lifecycle = $5,
                last_seen_at = $6,
                updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .bind(record.profile_id)
        .bind(&record.name)
        .bind(&record.desired)
        .bind(Json(&record.lifecycle))
        .bind(record.last_seen_at)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(record)
    }
}

#[async_trait]
impl ProjectStore for PgStore {
    async fn register_projects(&self, project_ids: &[String]) -> Result<Vec<Project>, StoreError> {
        let mut tx = self.db.pool().begin().await?;
        for project_id in project_ids {
            sqlx::query(
                "INSERT INTO nave_projects (project_id, active) VALUES ($1, TRUE) \
                 ON CONFLICT (project_id) DO NOTHING",
            )
            .bind(project_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        self.list_projects().await
    }

    async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        let rows = sqlx::query_as::<_, ProjectRow>(
            r#"
            SELECT project_id, active, ip_usage, ip_limit, registered_at, checked_at
            FROM nave_projects
            ORDER BY position ASC
            "#,
        )
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows.into_iter().map(Project::from).collect())
    }

    async fn record_quota_check(
        &self,
        project_id: &str,
        active: bool,
        usage: Option<f64>,
        limit: Option<f64>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE nave_projects
            SET active = $2, ip_usage = $3, ip_limit = $4, checked_at = now()
            WHERE project_id = $1
            "#,
        )
        .bind(project_id)
        .bind(active)
        .bind(usage)
        .bind(limit)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for PgStore {
    async fn set_profile_network(
        &self,
        profile_id: i64,
        network: &Value,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE nave_profiles SET network_json = $2, updated_at = now() WHERE id = $1",
        )
        .bind(profile_id)
        .bind(network)
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl Store for PgStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(self.db.health_check().await?)
    }
}
