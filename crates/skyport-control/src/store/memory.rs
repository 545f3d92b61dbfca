//! In-memory deployment store.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{ControlError, ControlResult};
use crate::types::{DeploymentId, DeploymentRecord, PersistedState};

use super::{DeploymentFilter, DeploymentStore};

/// Deployment store held in process memory.
///
/// Records are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    deployments: RwLock<HashMap<String, DeploymentRecord>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn insert(&self, record: &DeploymentRecord) -> ControlResult<()> {
        let mut deployments = self
            .deployments
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        let key = record.data.id.as_str().to_owned();
        if deployments.contains_key(&key) {
            return Err(ControlError::Store(format!("deployment {key} already exists")));
        }

        deployments.insert(key, record.clone());
        Ok(())
    }

    async fn get(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>> {
        let deployments = self
            .deployments
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        Ok(deployments.get(id.as_str()).cloned())
    }

    async fn update(&self, record: &DeploymentRecord) -> ControlResult<()> {
        let mut deployments = self
            .deployments
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        let stored = deployments
            .get_mut(record.data.id.as_str())
            .ok_or_else(|| ControlError::DeploymentNotFound(record.data.id.to_string()))?;
        *stored = record.clone();
        Ok(())
    }

    async fn update_state(
        &self,
        id: &DeploymentId,
        state: PersistedState,
        error: Option<&str>,
    ) -> ControlResult<()> {
        let mut deployments = self
            .deployments
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        let record = deployments
            .get_mut(id.as_str())
            .ok_or_else(|| ControlError::DeploymentNotFound(id.to_string()))?;

        record.state = state;
        record.data.error = error.map(ToOwned::to_owned);
        record.data.updated_at = chrono::Utc::now();

        Ok(())
    }

    async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentRecord>> {
        let deployments = self
            .deployments
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        Ok(filter.apply(deployments.values().cloned()))
    }

    async fn delete(&self, id: &DeploymentId) -> ControlResult<()> {
        let mut deployments = self
            .deployments
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        if deployments.remove(id.as_str()).is_none() {
            return Err(ControlError::DeploymentNotFound(id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::test_records::record;
    use crate::types::AppName;

    #[tokio::test]
    async fn insert_and_get() {
        let store = MemoryStore::new();
        let record = record("web", 0);
        let id = record.data.id.clone();

        store.insert(&record).await.unwrap();

        let retrieved = store.get(&id).await.unwrap().unwrap();
        assert_eq!(retrieved.data.id, id);
        assert_eq!(retrieved.data.app.as_str(), "web");
        assert_eq!(retrieved.state, PersistedState::Pending);
    }

    #[tokio::test]
    async fn duplicate_insert_fails() {
        let store = MemoryStore::new();
        let record = record("web", 0);

        store.insert(&record).await.unwrap();
        assert!(matches!(
            store.insert(&record).await,
            Err(ControlError::Store(_))
        ));
    }

    #[tokio::test]
    async fn update_state_sets_and_clears_error() {
        let store = MemoryStore::new();
        let record = record("web", 0);
        let id = record.data.id.clone();
        store.insert(&record).await.unwrap();

        store
            .update_state(&id, PersistedState::Failed, Some("role not visible"))
            .await
            .unwrap();
        let retrieved = store.get(&id).await.unwrap().unwrap();
        assert_eq!(retrieved.state, PersistedState::Failed);
        assert_eq!(retrieved.data.error.as_deref(), Some("role not visible"));

        store
            .update_state(&id, PersistedState::Destroyed, None)
            .await
            .unwrap();
        let retrieved = store.get(&id).await.unwrap().unwrap();
        assert!(retrieved.data.error.is_none());
    }

    #[tokio::test]
    async fn update_missing_fails() {
        let store = MemoryStore::new();
        let result = store.update(&record("web", 0)).await;
        assert!(matches!(result, Err(ControlError::DeploymentNotFound(_))));
    }

    #[tokio::test]
    async fn released_lookup() {
        let store = MemoryStore::new();
        let older = record("web", 20);
        let mut released = record("web", 10);
        released.state = PersistedState::Released;
        store.insert(&older).await.unwrap();
        store.insert(&released).await.unwrap();

        let found = store
            .get_released(&AppName::new("web"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.data.id, released.data.id);
        assert!(store
            .get_released(&AppName::new("api"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn delete_removes_record() {
        let store = MemoryStore::new();
        let record = record("web", 0);
        let id = record.data.id.clone();
        store.insert(&record).await.unwrap();

        store.delete(&id).await.unwrap();
        assert!(store.get(&id).await.unwrap().is_none());
        assert!(store.delete(&id).await.is_err());
    }
}
