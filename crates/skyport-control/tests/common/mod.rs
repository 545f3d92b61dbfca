//! Common test utilities for control integration tests.

#![allow(dead_code)]

pub mod fixtures;

use std::sync::Arc;

use skyport_control::backend::MemoryBackend;
use skyport_control::config::MemoryConfig;
use skyport_control::{ControlConfig, DeploymentManager, DeploymentStore, MemoryStore};
use tokio_util::sync::CancellationToken;

/// Deployment manager wired to an in-process backend and store.
pub struct TestControl {
    pub backend: Arc<MemoryBackend>,
    pub store: Arc<dyn DeploymentStore>,
    pub config: ControlConfig,
    pub manager: DeploymentManager,
    pub cancel: CancellationToken,
}

impl TestControl {
    /// Creates a control plane with fast intervals and default backend delays.
    pub fn new() -> Self {
        Self::with_memory(MemoryConfig::default())
    }

    /// Creates a control plane whose backend converges after the given delays.
    pub fn with_memory(memory: MemoryConfig) -> Self {
        Self::with_store(memory, Arc::new(MemoryStore::new()))
    }

    /// Creates a control plane on an existing store.
    pub fn with_store(memory: MemoryConfig, store: Arc<dyn DeploymentStore>) -> Self {
        let mut config = fixtures::fast_config();
        config.memory = memory.clone();
        Self::from_parts(Arc::new(MemoryBackend::new(memory)), store, config)
    }

    /// Creates a control plane from explicit parts.
    pub fn from_parts(
        backend: Arc<MemoryBackend>,
        store: Arc<dyn DeploymentStore>,
        config: ControlConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let manager = DeploymentManager::new(
            store.clone(),
            backend.clone(),
            &config,
            cancel.clone(),
        );
        Self {
            backend,
            store,
            config,
            manager,
            cancel,
        }
    }

    /// A second manager sharing this one's backend and store, as a later
    /// invocation of the CLI would.
    pub fn reopen(&self) -> DeploymentManager {
        DeploymentManager::new(
            self.store.clone(),
            self.backend.clone(),
            &self.config,
            CancellationToken::new(),
        )
    }
}

impl Default for TestControl {
    fn default() -> Self {
        Self::new()
    }
}
