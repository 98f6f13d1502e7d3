//! Project selection by live IP-address quota.
//!
//! Every scan walks the whole pool in registration order, persisting each
//! project's quota and active flag, and picks the first project with
//! headroom. Concurrent scans may pick the same project before the
//! provider's usage reflects either allocation; nothing here prevents that.

use std::sync::Arc;

use async_trait::async_trait;
use nave_gcp::{GcpResult, Quota, ResourceOrchestrator};
use tracing::{debug, info, warn};

use super::{ProvisionError, ProvisionStep};
use crate::store::Store;

/// Reads one regional quota metric for a project.
#[async_trait]
pub trait QuotaSource: Send + Sync {
    async fn quota(&self, project_id: &str, metric: &str) -> GcpResult<Option<Quota>>;
}

#[async_trait]
impl QuotaSource for ResourceOrchestrator {
    async fn quota(&self, project_id: &str, metric: &str) -> GcpResult<Option<Quota>> {
        self.region_quota(metric, None, Some(project_id)).await
    }
}

pub struct ProjectQuotaPool {
    store: Arc<dyn Store>,
    quotas: Arc<dyn QuotaSource>,
    metric: String,
}

impl ProjectQuotaPool {
    pub fn new(store: Arc<dyn Store>, quotas: Arc<dyn QuotaSource>, metric: impl Into<String>) -> Self {
        Self {
            store,
            quotas,
            metric: metric.into(),
        }
    }

    /// Pick a project with quota headroom.
    ///
    /// A project that does not report the metric counts as unlimited. A
    /// project whose quota cannot be read is skipped and keeps its flag.
    /// When no project could be read at all, the last provider error is
    /// returned instead of an exhausted pool.
    pub async fn select(&self) -> Result<String, ProvisionError> {
        let projects = self.store.list_projects().await?;
        let scanned = projects.len();
        let mut selected: Option<String> = None;
        let mut readable = 0usize;
        let mut last_failure: Option<ProvisionError> = None;

        for project in projects {
            let quota = match self.quotas.quota(&project.project_id, &self.metric).await {
                Ok(quota) => quota,
                Err(e) => {
                    warn!(project = %project.project_id, error = %e, "quota read failed, skipping project");
                    last_failure = Some(ProvisionError::step(ProvisionStep::CheckQuota, project.project_id.clone())(e));
                    continue;
                }
            };
            readable += 1;

            let has_headroom = quota.is_none_or(|q| q.has_headroom());
            self.store
                .record_quota_check(
                    &project.project_id,
                    has_headroom,
                    quota.map(|q| q.usage),
                    quota.map(|q| q.limit),
                )
                .await?;

            if !has_headroom {
                if project.active {
                    info!(project = %project.project_id, metric = %self.metric, "project out of quota, deactivated");
                }
                continue;
            }
            if !project.active {
                info!(project = %project.project_id, "project has quota again, reactivated");
            }
            debug!(project = %project.project_id, ?quota, "project has headroom");
            if selected.is_none() {
                selected = Some(project.project_id);
            }
        }

        match (selected, last_failure) {
            (Some(project_id), _) => Ok(project_id),
            (None, Some(failure)) if readable == 0 => Err(failure),
            (None, _) => Err(ProvisionError::ResourceExhausted { scanned }),
        }
    }
}
