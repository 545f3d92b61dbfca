//! Deployment record storage.
//!
//! Every CLI invocation is a separate process, so deployment and release
//! references must outlive it. [`FileStore`] keeps one JSON document per
//! deployment; [`MemoryStore`] is for tests and the `memory` platform.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{StoreConfig, StoreKind};
use crate::error::ControlResult;
use crate::types::{AppName, DeploymentId, DeploymentRecord, PersistedState};

/// Filter criteria for listing deployments.
#[derive(Debug, Clone, Default)]
pub struct DeploymentFilter {
    /// Filter by application.
    pub app: Option<AppName>,
    /// Filter by state.
    pub state: Option<PersistedState>,
    /// Maximum number of results.
    pub limit: Option<usize>,
    /// Offset for pagination.
    pub offset: Option<usize>,
}

impl DeploymentFilter {
    /// Create a new empty filter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            app: None,
            state: None,
            limit: None,
            offset: None,
        }
    }

    /// Filter by application.
    #[must_use]
    pub fn with_app(mut self, app: AppName) -> Self {
        self.app = Some(app);
        self
    }

    /// Filter by state.
    #[must_use]
    pub const fn with_state(mut self, state: PersistedState) -> Self {
        self.state = Some(state);
        self
    }

    /// Set maximum results.
    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set pagination offset.
    #[must_use]
    pub const fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Whether a record passes the app and state criteria.
    #[must_use]
    pub fn matches(&self, record: &DeploymentRecord) -> bool {
        if let Some(app) = &self.app {
            if &record.data.app != app {
                return false;
            }
        }
        if let Some(state) = self.state {
            if record.state != state {
                return false;
            }
        }
        true
    }

    /// Filter, order newest first, then paginate.
    fn apply(&self, records: impl IntoIterator<Item = DeploymentRecord>) -> Vec<DeploymentRecord> {
        let mut results: Vec<_> = records.into_iter().filter(|r| self.matches(r)).collect();
        results.sort_by(|a, b| {
            b.data
                .created_at
                .cmp(&a.data.created_at)
                .then_with(|| b.data.id.as_str().cmp(a.data.id.as_str()))
        });
        results
            .into_iter()
            .skip(self.offset.unwrap_or(0))
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

/// Backend for storing deployment records.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Insert a new deployment record.
    ///
    /// Returns an error if a deployment with the same ID already exists.
    async fn insert(&self, record: &DeploymentRecord) -> ControlResult<()>;

    /// Get a deployment by ID.
    ///
    /// Returns `None` if the deployment does not exist.
    async fn get(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>>;

    /// Replace a stored record, keyed by its ID.
    async fn update(&self, record: &DeploymentRecord) -> ControlResult<()>;

    /// Update a deployment's state.
    ///
    /// Also updates the `updated_at` timestamp and sets or clears the error message.
    async fn update_state(
        &self,
        id: &DeploymentId,
        state: PersistedState,
        error: Option<&str>,
    ) -> ControlResult<()>;

    /// List deployments matching the filter criteria, newest first.
    async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentRecord>>;

    /// The deployment of `app` currently receiving traffic.
    async fn get_released(&self, app: &AppName) -> ControlResult<Option<DeploymentRecord>> {
        let released = self
            .list(
                &DeploymentFilter::new()
                    .with_app(app.clone())
                    .with_state(PersistedState::Released)
                    .with_limit(1),
            )
            .await?;
        Ok(released.into_iter().next())
    }

    /// Delete a deployment record.
    async fn delete(&self, id: &DeploymentId) -> ControlResult<()>;
}

/// Open the store selected by configuration.
pub async fn open_store(config: &StoreConfig) -> ControlResult<Arc<dyn DeploymentStore>> {
    match config.kind {
        StoreKind::File => Ok(Arc::new(FileStore::open(&config.path).await?)),
        StoreKind::Memory => Ok(Arc::new(MemoryStore::new())),
    }
}


#[cfg(test)]
mod tests {
    use super::test_records::record;
    use super::*;

    #[test]
    fn filter_orders_newest_first_and_paginates() {
        let records = vec![record("web", 30), record("web", 10), record("api", 5), record("web", 20)];
        let filter = DeploymentFilter::new()
            .with_app(AppName::new("web"))
            .with_offset(1)
            .with_limit(1);

        let page = filter.apply(records.clone());
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].data.id, records[3].data.id);
    }

    #[test]
    fn filter_by_state() {
        let mut released = record("web", 1);
        released.state = PersistedState::Released;
        let filter = DeploymentFilter::new().with_state(PersistedState::Released);

        assert!(filter.matches(&released));
        assert!(!filter.matches(&record("web", 1)));
    }
}
