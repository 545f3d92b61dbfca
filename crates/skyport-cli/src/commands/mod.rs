//! Subcommand implementations.

pub mod deploy;
pub mod inspect;
pub mod install;

use anyhow::Context as _;
use skyport_control::store::open_store;
use skyport_control::{create_backend, ControlConfig, DeploymentManager};
use tokio_util::sync::CancellationToken;

/// What every subcommand runs with.
pub struct Context {
    pub config: ControlConfig,
    pub cancel: CancellationToken,
    pub json: bool,
}

impl Context {
    pub fn new(config: ControlConfig, cancel: CancellationToken, json: bool) -> Self {
        Self {
            config,
            cancel,
            json,
        }
    }

    /// Deployment manager on the configured store and backend.
    pub async fn manager(&self) -> anyhow::Result<DeploymentManager> {
        let store = open_store(&self.config.store).await.with_context(|| {
            format!(
                "opening deployment store at {}",
                self.config.store.path.display()
            )
        })?;
        let adapter = create_backend(&self.config)
            .with_context(|| format!("connecting to {}", self.config.platform))?;
        Ok(DeploymentManager::new(
            store,
            adapter,
            &self.config,
            self.cancel.clone(),
        ))
    }

    /// Print `value` as pretty JSON.
    pub fn print_json<T: serde::Serialize>(&self, value: &T) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}
