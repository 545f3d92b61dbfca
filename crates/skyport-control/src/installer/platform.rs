//! Installer that runs the server as an ordinary service on any backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backend::{create_backend_for, BackendAdapter};
use crate::config::{ControlConfig, InstallConfig, Platform};
use crate::deployment::{DeployOutcome, DeployPipeline, EnvironmentNames};
use crate::error::{ControlError, ControlResult};
use crate::lifecycle::{execute, Lifecycle, Phase, StepReporter, TracingReporter};
use crate::poller::{OperationPoller, PollSettings, Probe};
use crate::provisioner::Provisioner;
use crate::retry::RetryPolicy;
use crate::teardown::{Teardown, TeardownReport};
use crate::types::{ResourceRefs, ServiceSpec};

use super::{Installation, Installer};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Places the server through the backend's own service primitives.
pub struct PlatformInstaller {
    adapter: Arc<dyn BackendAdapter>,
    install: InstallConfig,
    cluster: String,
    listener_port: u16,
    provisioner: Provisioner,
    poller: OperationPoller,
}

impl PlatformInstaller {
    /// Create an installer for an existing adapter.
    pub fn new(
        adapter: Arc<dyn BackendAdapter>,
        config: &ControlConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            adapter,
            install: config.install.clone(),
            cluster: config.cluster.clone(),
            listener_port: config.release.listener_port,
            provisioner: Provisioner::new(RetryPolicy::from_config(&config.retry), cancel.clone()),
            poller: OperationPoller::new(PollSettings::from_config(&config.poll), cancel),
        }
    }

    /// Build the adapter for `platform` and wrap it.
    pub fn for_platform(
        platform: Platform,
        config: &ControlConfig,
        cancel: CancellationToken,
    ) -> ControlResult<Box<dyn Installer>> {
        let adapter = create_backend_for(platform, config)?;
        Ok(Box::new(Self::new(adapter, config, cancel)))
    }

    fn spec(&self) -> ServiceSpec {
        ServiceSpec::new(&self.install.name, &self.install.image, self.install.port)
            .with_size(self.install.cpu, self.install.memory_mb)
    }

    fn names(&self) -> EnvironmentNames {
        EnvironmentNames::for_app(&self.cluster, &self.install.name, self.install.storage)
    }

    async fn place(&self, verb: &str) -> ControlResult<Installation> {
        let label = format!("{verb} {} on {}", self.install.name, self.adapter.name());
        let pipeline = DeployPipeline::new(
            self.adapter.as_ref(),
            &self.provisioner,
            &self.poller,
            self.spec(),
            self.names(),
        )
        .without_target_group()
        .with_label(label.clone());

        let mut lifecycle = InstallLifecycle {
            pipeline,
            readiness: self.poller.with_settings(PollSettings::new(
                self.poller.settings().interval,
                self.install.endpoint_timeout(),
            )),
            health_path: self.install.health_path.as_deref(),
        };
        let outcome = execute(&mut lifecycle, &TracingReporter::new(label)).await?;

        Ok(Installation {
            platform: self.adapter.name(),
            service: self.install.name.clone(),
            endpoint: outcome.public_endpoint,
            resources: outcome.resources,
            outcome: outcome.outcome,
        })
    }
}

#[async_trait]
impl Installer for PlatformInstaller {
    fn platform(&self) -> &'static str {
        self.adapter.name()
    }

    async fn install(&self) -> ControlResult<Installation> {
        let installation = self.place("install").await?;
        info!(
            platform = installation.platform,
            service = %installation.service,
            outcome = installation.outcome.as_str(),
            "control plane installed"
        );
        Ok(installation)
    }

    async fn upgrade(&self) -> ControlResult<Installation> {
        if self.adapter.find_service(&self.install.name).await?.is_none() {
            return Err(ControlError::fatal(format!(
                "{} is not installed on {}",
                self.install.name,
                self.adapter.name()
            )));
        }
        let installation = self.place("upgrade").await?;
        info!(
            platform = installation.platform,
            service = %installation.service,
            outcome = installation.outcome.as_str(),
            "control plane upgraded"
        );
        Ok(installation)
    }

    async fn uninstall(&self) -> ControlResult<TeardownReport> {
        let label = format!("uninstall {} from {}", self.install.name, self.adapter.name());
        let mut lifecycle = UninstallLifecycle {
            installer: self,
            refs: ResourceRefs::default(),
        };
        execute(&mut lifecycle, &TracingReporter::new(label)).await
    }
}

/// Deploy the server, then wait for its health path to answer.
struct InstallLifecycle<'a> {
    pipeline: DeployPipeline<'a>,
    readiness: OperationPoller,
    health_path: Option<&'a str>,
}

#[async_trait]
impl Lifecycle for InstallLifecycle<'_> {
    type Output = DeployOutcome;

    fn name(&self) -> String {
        self.pipeline.name()
    }

    async fn init(&mut self, reporter: &dyn StepReporter) -> ControlResult<()> {
        self.pipeline.init(reporter).await
    }

    async fn run(&mut self, reporter: &dyn StepReporter) -> ControlResult<DeployOutcome> {
        let outcome = self.pipeline.run(reporter).await?;

        match (&outcome.public_endpoint, self.health_path) {
            (Some(endpoint), Some(path)) => {
                reporter.step(Phase::Run, &format!("waiting for {endpoint}{path}"));
                wait_for_endpoint(&self.readiness, endpoint, path).await?;
                reporter.step(Phase::Run, "server is answering");
            }
            (None, Some(_)) => {
                reporter.warn(Phase::Run, "no endpoint published, skipping readiness check");
            }
            (_, None) => {}
        }
        Ok(outcome)
    }
}

/// Poll `endpoint` + `path` until it answers 2xx.
async fn wait_for_endpoint(
    poller: &OperationPoller,
    endpoint: &str,
    path: &str,
) -> ControlResult<()> {
    let client = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build()?;
    let url = format!("{}{path}", endpoint.trim_end_matches('/'));
    let client = &client;
    let target = url.as_str();

    poller
        .wait_until(&format!("{url} ready"), move || async move {
            Ok(match client.get(target).send().await {
                Ok(response) if response.status().is_success() => Probe::Done,
                Ok(response) => Probe::Pending(response.status().to_string()),
                Err(e) => Probe::Pending(e.to_string()),
            })
        })
        .await
}

/// Find what an installation left on the backend, then tear it down.
struct UninstallLifecycle<'a> {
    installer: &'a PlatformInstaller,
    refs: ResourceRefs,
}

#[async_trait]
impl Lifecycle for UninstallLifecycle<'_> {
    type Output = TeardownReport;

    fn name(&self) -> String {
        format!("uninstall {}", self.installer.install.name)
    }

    async fn init(&mut self, reporter: &dyn StepReporter) -> ControlResult<()> {
        let adapter = self.installer.adapter.as_ref();
        let service = &self.installer.install.name;

        if adapter.find_service(service).await?.is_some() {
            self.refs.service = Some(service.clone());
        } else {
            reporter.warn(Phase::Init, &format!("service {service} not found"));
        }

        let Some(support) = adapter.supporting() else {
            return Ok(());
        };
        let names = self.installer.names();
        self.refs.cluster = support.find_cluster(&names.cluster).await?;
        self.refs.log_group = Some(names.log_group);
        self.refs.security_group = support.find_security_group(&names.security_group).await?;
        if let Some(fs_name) = &names.file_system {
            self.refs.file_system = support.find_file_system(fs_name).await?;
        }
        reporter.step(Phase::Init, &format!("found {:?}", self.refs));
        Ok(())
    }

    async fn run(&mut self, _reporter: &dyn StepReporter) -> ControlResult<TeardownReport> {
        let installer = self.installer;
        Teardown::new(
            installer.adapter.as_ref(),
            &installer.provisioner,
            &installer.poller,
            installer.listener_port,
        )
        .destroy(&self.refs)
        .await
    }
}
