//! Control-plane installation.
//!
//! The Skyport server is itself a workload. Installers place it on a
//! backend, upgrade it in place and remove it again. They are looked up by
//! platform name in an [`InstallerRegistry`], which maps each name to a
//! constructor function.

mod platform;

pub use platform::PlatformInstaller;

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{ControlConfig, Platform};
use crate::error::{ControlError, ControlResult};
use crate::provisioner::ProvisionOutcome;
use crate::teardown::TeardownReport;
use crate::types::ResourceRefs;

/// A control-plane server placed on a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installation {
    /// Platform the server runs on.
    pub platform: &'static str,
    /// Service name.
    pub service: String,
    /// Endpoint the server answers on, if the backend published one.
    pub endpoint: Option<String>,
    /// Everything created or attached.
    pub resources: ResourceRefs,
    /// What provisioning did to the service.
    pub outcome: ProvisionOutcome,
}

/// Installs, upgrades and uninstalls the server on one platform.
#[async_trait]
pub trait Installer: Send + Sync {
    /// Platform name.
    fn platform(&self) -> &'static str;

    /// Place the server and everything it needs.
    async fn install(&self) -> ControlResult<Installation>;

    /// Bring an existing installation in line with configuration.
    async fn upgrade(&self) -> ControlResult<Installation>;

    /// Remove the server and its supporting resources.
    async fn uninstall(&self) -> ControlResult<TeardownReport>;
}

/// Constructor registered for a platform name.
pub type InstallerFactory =
    fn(&ControlConfig, CancellationToken) -> ControlResult<Box<dyn Installer>>;

/// Platform name to installer constructor.
#[derive(Debug, Clone, Default)]
pub struct InstallerRegistry {
    factories: BTreeMap<&'static str, InstallerFactory>,
}

impl InstallerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in platform.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Platform::Docker.as_str(), |config, cancel| {
            PlatformInstaller::for_platform(Platform::Docker, config, cancel)
        });
        registry.register(Platform::Nomad.as_str(), |config, cancel| {
            PlatformInstaller::for_platform(Platform::Nomad, config, cancel)
        });
        registry.register(Platform::Kubernetes.as_str(), |config, cancel| {
            PlatformInstaller::for_platform(Platform::Kubernetes, config, cancel)
        });
        registry.register(Platform::Memory.as_str(), |config, cancel| {
            PlatformInstaller::for_platform(Platform::Memory, config, cancel)
        });
        registry
    }

    /// Register a constructor, returning the one it replaces.
    pub fn register(
        &mut self,
        name: &'static str,
        factory: InstallerFactory,
    ) -> Option<InstallerFactory> {
        self.factories.insert(name, factory)
    }

    /// Registered platform names, sorted.
    #[must_use]
    pub fn platforms(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    /// Construct the installer for `name`.
    pub fn resolve(
        &self,
        name: &str,
        config: &ControlConfig,
        cancel: CancellationToken,
    ) -> ControlResult<Box<dyn Installer>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| ControlError::UnknownPlatform(name.to_owned()))?;
        factory(config, cancel)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn builtin_platforms() {
        assert_eq!(
            InstallerRegistry::builtin().platforms(),
            vec!["docker", "kubernetes", "memory", "nomad"]
        );
    }

    #[test]
    fn resolve_known_and_unknown() {
        let registry = InstallerRegistry::builtin();
        let config = ControlConfig::default();

        let installer = registry
            .resolve("memory", &config, CancellationToken::new())
            .unwrap();
        assert_eq!(installer.platform(), "memory");

        assert!(matches!(
            registry.resolve("lambda", &config, CancellationToken::new()),
            Err(ControlError::UnknownPlatform(name)) if name == "lambda"
        ));
    }

    #[test]
    fn register_replaces() {
        fn refuse(_: &ControlConfig, _: CancellationToken) -> ControlResult<Box<dyn Installer>> {
            Err(ControlError::unsupported("custom", "install"))
        }

        let mut registry = InstallerRegistry::builtin();
        assert!(registry.register("memory", refuse).is_some());
        assert!(registry.register("custom", refuse).is_none());
        assert!(registry
            .resolve("custom", &ControlConfig::default(), CancellationToken::new())
            .is_err());
    }
}
