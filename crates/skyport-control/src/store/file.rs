//! JSON file deployment store.
//!
//! Each record lives in `<dir>/<id>.json`. Writes go to a temporary file
//! first and are renamed into place, so a reader never sees half a record.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{ControlError, ControlResult};
use crate::types::{DeploymentId, DeploymentRecord, PersistedState};

use super::{DeploymentFilter, DeploymentStore};

/// Deployment store backed by a directory of JSON files.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    writes: Mutex<()>,
}

impl FileStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub async fn open(dir: impl AsRef<Path>) -> ControlResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            ControlError::Store(format!("failed to create {}: {e}", dir.display()))
        })?;
        Ok(Self {
            dir,
            writes: Mutex::new(()),
        })
    }

    /// Directory holding the records.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a record. Ids that could name a file outside `dir` are rejected.
    fn record_path(&self, id: &DeploymentId) -> ControlResult<PathBuf> {
        let valid = !id.as_str().is_empty()
            && id
                .as_str()
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(ControlError::Store(format!(
                "invalid deployment id {:?}",
                id.as_str()
            )));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    async fn read(&self, path: &Path) -> ControlResult<Option<DeploymentRecord>> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ControlError::Store(format!(
                    "failed to read {}: {e}",
                    path.display()
                )))
            }
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| ControlError::Serialisation(format!("{}: {e}", path.display())))
    }

    async fn write(&self, record: &DeploymentRecord) -> ControlResult<()> {
        let content = serde_json::to_string_pretty(record)
            .map_err(|e| ControlError::Serialisation(e.to_string()))?;
        let path = self.record_path(&record.data.id)?;
        let tmp = path.with_extension("json.tmp");

        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| ControlError::Store(format!("failed to write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| ControlError::Store(format!("failed to write {}: {e}", path.display())))
    }
}

#[async_trait]
impl DeploymentStore for FileStore {
    async fn insert(&self, record: &DeploymentRecord) -> ControlResult<()> {
        let _guard = self.writes.lock().await;
        if self.read(&self.record_path(&record.data.id)?).await?.is_some() {
            return Err(ControlError::Store(format!(
                "deployment {} already exists",
                record.data.id
            )));
        }
        self.write(record).await
    }

    async fn get(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>> {
        self.read(&self.record_path(id)?).await
    }

    async fn update(&self, record: &DeploymentRecord) -> ControlResult<()> {
        let _guard = self.writes.lock().await;
        if self.read(&self.record_path(&record.data.id)?).await?.is_none() {
            return Err(ControlError::DeploymentNotFound(record.data.id.to_string()));
        }
        self.write(record).await
    }

    async fn update_state(
        &self,
        id: &DeploymentId,
        state: PersistedState,
        error: Option<&str>,
    ) -> ControlResult<()> {
        let _guard = self.writes.lock().await;
        let mut record = self
            .read(&self.record_path(id)?)
            .await?
            .ok_or_else(|| ControlError::DeploymentNotFound(id.to_string()))?;

        record.state = state;
        record.data.error = error.map(ToOwned::to_owned);
        record.data.updated_at = chrono::Utc::now();
        self.write(&record).await
    }

    async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentRecord>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(|e| {
            ControlError::Store(format!("failed to read {}: {e}", self.dir.display()))
        })?;

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ControlError::Store(format!("failed to read dir entry: {e}")))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read(&path).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable record"),
            }
        }

        Ok(filter.apply(records))
    }

    async fn delete(&self, id: &DeploymentId) -> ControlResult<()> {
        let _guard = self.writes.lock().await;
        match tokio::fs::remove_file(self.record_path(id)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ControlError::DeploymentNotFound(id.to_string()))
            }
            Err(e) => Err(ControlError::Store(format!("failed to delete {id}: {e}"))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::test_records::record;
    use crate::types::AppName;

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let record = record("web", 0);
        let id = record.data.id.clone();

        {
            let store = FileStore::open(dir.path()).await.unwrap();
            store.insert(&record).await.unwrap();
            store
                .update_state(&id, PersistedState::Deployed, None)
                .await
                .unwrap();
        }

        let reopened = FileStore::open(dir.path()).await.unwrap();
        let loaded = reopened.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.state, PersistedState::Deployed);
        assert_eq!(loaded.data.spec.image, "nginx:1.27");
        assert!(dir.path().join(format!("{id}.json")).exists());
    }

    #[tokio::test]
    async fn update_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let mut record = record("web", 0);
        store.insert(&record).await.unwrap();

        record.data.public_endpoint = Some("http://localhost:32768".to_owned());
        store.update(&record).await.unwrap();

        let loaded = store.get(&record.data.id).await.unwrap().unwrap();
        assert_eq!(
            loaded.data.public_endpoint.as_deref(),
            Some("http://localhost:32768")
        );
        assert!(store.insert(&record).await.is_err());
    }

    #[tokio::test]
    async fn list_skips_foreign_and_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        store.insert(&record("web", 20)).await.unwrap();
        store.insert(&record("web", 10)).await.unwrap();
        store.insert(&record("api", 5)).await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();
        std::fs::write(dir.path().join("broken.json"), "{").unwrap();

        let web = store
            .list(&DeploymentFilter::new().with_app(AppName::new("web")))
            .await
            .unwrap();
        assert_eq!(web.len(), 2);
        assert!(web[0].data.created_at > web[1].data.created_at);
    }

    #[tokio::test]
    async fn missing_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("nested/deployments"))
            .await
            .unwrap();
        let id = DeploymentId::new("nope");

        assert!(store.get(&id).await.unwrap().is_none());
        assert!(matches!(
            store.delete(&id).await,
            Err(ControlError::DeploymentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn ids_cannot_leave_the_store_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("deployments")).await.unwrap();
        std::fs::write(dir.path().join("outside.json"), "{}").unwrap();

        for id in ["../outside", "a/b", "..", ""] {
            let id = DeploymentId::new(id);
            assert!(
                matches!(store.get(&id).await, Err(ControlError::Store(_))),
                "{id:?}"
            );
            assert!(matches!(store.delete(&id).await, Err(ControlError::Store(_))));
        }
        assert!(dir.path().join("outside.json").exists());
    }
}
