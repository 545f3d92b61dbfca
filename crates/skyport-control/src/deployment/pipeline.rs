//! The deploy lifecycle: prepare the environment, then run the service.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::backend::{BackendAdapter, SupportingResources, TargetHealth};
use crate::error::{ControlError, ControlResult};
use crate::lifecycle::{Lifecycle, Phase, StepReporter};
use crate::poller::{OperationPoller, Probe};
use crate::provisioner::{ProvisionOutcome, Provisioner, ServiceResource};
use crate::types::{OperationHandle, Placement, ResourceRefs, ServiceSpec};

/// Names of the supporting resources a workload is placed into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentNames {
    /// Cluster name.
    pub cluster: String,
    /// Execution role name.
    pub execution_role: String,
    /// Log group name.
    pub log_group: String,
    /// Security group name.
    pub security_group: String,
    /// File system name, when the workload needs shared storage.
    pub file_system: Option<String>,
}

impl EnvironmentNames {
    /// Names shared by every deployment of `app` in `cluster`.
    #[must_use]
    pub fn for_app(cluster: &str, app: &str, storage: bool) -> Self {
        Self {
            cluster: cluster.to_owned(),
            execution_role: format!("{app}-execution"),
            log_group: format!("/skyport/{app}"),
            security_group: format!("{app}-sg"),
            file_system: storage.then(|| format!("{app}-data")),
        }
    }
}

/// What a successful deploy produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployOutcome {
    /// Everything created or attached.
    pub resources: ResourceRefs,
    /// Last operation issued; empty when the service was already in line.
    pub operation: OperationHandle,
    /// Endpoint the service answers on, if the backend published one.
    pub public_endpoint: Option<String>,
    /// What provisioning did to the service.
    pub outcome: ProvisionOutcome,
}

/// Deploys one service.
///
/// Init prepares the supporting resources when the backend has them. Run
/// provisions the service, waits for its operation, and registers it in a
/// target group when the backend load balances. References are collected as
/// they are created so a failure still reports what exists.
pub struct DeployPipeline<'a> {
    adapter: &'a dyn BackendAdapter,
    provisioner: &'a Provisioner,
    poller: &'a OperationPoller,
    label: String,
    spec: ServiceSpec,
    names: EnvironmentNames,
    register_target: bool,
    placement: Placement,
    resources: ResourceRefs,
}

impl<'a> DeployPipeline<'a> {
    /// Create a pipeline for `spec`.
    #[must_use]
    pub fn new(
        adapter: &'a dyn BackendAdapter,
        provisioner: &'a Provisioner,
        poller: &'a OperationPoller,
        spec: ServiceSpec,
        names: EnvironmentNames,
    ) -> Self {
        Self {
            adapter,
            provisioner,
            poller,
            label: format!("deploy {}", spec.name),
            spec,
            names,
            register_target: true,
            placement: Placement::default(),
            resources: ResourceRefs::default(),
        }
    }

    /// Override the name used in errors and logs.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Skip target group registration even when the backend load balances.
    #[must_use]
    pub const fn without_target_group(mut self) -> Self {
        self.register_target = false;
        self
    }

    /// References collected so far.
    #[must_use]
    pub const fn resources(&self) -> &ResourceRefs {
        &self.resources
    }

    /// Target group name for a service.
    #[must_use]
    pub fn target_group_name(service: &str) -> String {
        format!("{service}-tg")
    }

    async fn prepare(
        &mut self,
        support: &dyn SupportingResources,
        reporter: &dyn StepReporter,
    ) -> ControlResult<()> {
        let provisioner = self.provisioner;
        let adapter = self.adapter;
        let classify = |e: &ControlError| adapter.classify_error(e);
        let names = &self.names;

        let cluster = provisioner
            .mutate("ensure cluster", classify, || {
                support.ensure_cluster(&names.cluster)
            })
            .await?;
        reporter.step(Phase::Init, &format!("cluster {cluster} ready"));
        self.placement.cluster = Some(cluster.clone());
        self.resources.cluster = Some(cluster);

        let role = provisioner
            .mutate("ensure execution role", classify, || {
                support.ensure_execution_role(&names.execution_role)
            })
            .await?;
        reporter.step(Phase::Init, &format!("execution role {role} ready"));
        self.placement.execution_role = Some(role);

        let log_group = provisioner
            .mutate("ensure log group", classify, || {
                support.ensure_log_group(&names.log_group)
            })
            .await?;
        self.placement.log_group = Some(log_group.clone());
        self.resources.log_group = Some(log_group);

        let port = self.spec.port;
        let security_group = provisioner
            .mutate("ensure security group", classify, || {
                support.ensure_security_group(&names.security_group, port)
            })
            .await?;
        reporter.step(
            Phase::Init,
            &format!("security group {security_group} admits port {port}"),
        );
        self.placement.security_group = Some(security_group.clone());
        self.resources.security_group = Some(security_group);

        if let Some(fs_name) = &names.file_system {
            let file_system = provisioner
                .mutate("ensure file system", classify, || {
                    support.ensure_file_system(fs_name)
                })
                .await?;
            reporter.step(Phase::Init, &format!("file system {file_system} ready"));
            self.placement.file_system = Some(file_system.clone());
            self.resources.file_system = Some(file_system);
        }

        Ok(())
    }

    async fn attach_target_group(&mut self, reporter: &dyn StepReporter) -> ControlResult<()> {
        let adapter = self.adapter;
        let Some(lb) = adapter.load_balancing() else {
            return Ok(());
        };
        let classify = |e: &ControlError| adapter.classify_error(e);
        let service = self.spec.name.as_str();
        let port = self.spec.port;
        let tg_name = Self::target_group_name(service);

        let target_group = self
            .provisioner
            .mutate("create target group", classify, || {
                lb.create_or_find_target_group(&tg_name, port)
            })
            .await?;
        self.resources.target_group = Some(target_group.clone());

        let tg = target_group.as_str();
        self.provisioner
            .mutate("register targets", classify, || lb.register_targets(tg, service))
            .await?;
        reporter.step(Phase::Run, &format!("registered {service} in {tg}"));

        self.poller
            .wait_until(&format!("targets of {tg} healthy"), move || async move {
                let health = lb.describe_target_health(tg).await?;
                Ok(summarise_health(&health))
            })
            .await?;
        info!(target_group = tg, "targets healthy");
        Ok(())
    }
}

fn summarise_health(health: &[TargetHealth]) -> Probe {
    if health.is_empty() {
        return Probe::Pending("no targets registered".to_owned());
    }
    let healthy = health
        .iter()
        .filter(|h| matches!(h, TargetHealth::Healthy))
        .count();
    if healthy == health.len() {
        Probe::Done
    } else {
        Probe::Pending(format!("{healthy} of {} targets healthy", health.len()))
    }
}

#[async_trait]
impl Lifecycle for DeployPipeline<'_> {
    type Output = DeployOutcome;

    fn name(&self) -> String {
        self.label.clone()
    }

    async fn init(&mut self, reporter: &dyn StepReporter) -> ControlResult<()> {
        let adapter = self.adapter;
        let Some(support) = adapter.supporting() else {
            debug!(backend = adapter.name(), "no supporting resources to prepare");
            return Ok(());
        };
        self.prepare(support, reporter).await
    }

    async fn run(&mut self, reporter: &dyn StepReporter) -> ControlResult<DeployOutcome> {
        let provisioned = {
            let resource = ServiceResource::new(self.adapter, &self.spec, &self.placement);
            self.provisioner.provision(&resource).await?
        };
        self.resources.service = Some(self.spec.name.clone());
        reporter.step(
            Phase::Run,
            &format!(
                "service {} {}, waiting on operation {}",
                self.spec.name,
                provisioned.outcome.as_str(),
                provisioned.operation
            ),
        );

        self.poller
            .await_operation(self.adapter, &provisioned.operation)
            .await?;

        let observed = self.adapter.find_service(&self.spec.name).await?;
        if let Some(state) = &observed {
            self.resources.task_definition.clone_from(&state.task_definition);
        }

        if self.register_target {
            self.attach_target_group(reporter).await?;
        }

        let public_endpoint = match &observed {
            Some(state) => self.adapter.service_endpoint(state).await?,
            None => None,
        };
        if let Some(endpoint) = &public_endpoint {
            reporter.step(Phase::Run, &format!("service answers on {endpoint}"));
        }

        Ok(DeployOutcome {
            resources: self.resources.clone(),
            operation: provisioned.operation,
            public_endpoint,
            outcome: provisioned.outcome,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::backend::{InjectedFailure, MemoryBackend};
    use crate::config::MemoryConfig;
    use crate::lifecycle::{execute, TracingReporter};
    use crate::poller::PollSettings;
    use crate::retry::RetryPolicy;

    fn harness() -> (Provisioner, OperationPoller) {
        let cancel = CancellationToken::new();
        (
            Provisioner::new(
                RetryPolicy::new(5, Duration::from_millis(100)),
                cancel.clone(),
            ),
            OperationPoller::new(
                PollSettings::new(Duration::from_secs(1), Duration::from_secs(60)),
                cancel,
            ),
        )
    }

    #[test]
    fn health_summary() {
        assert_eq!(
            summarise_health(&[]),
            Probe::Pending("no targets registered".to_owned())
        );
        assert_eq!(
            summarise_health(&[TargetHealth::Healthy, TargetHealth::Initial]),
            Probe::Pending("1 of 2 targets healthy".to_owned())
        );
        assert_eq!(summarise_health(&[TargetHealth::Healthy]), Probe::Done);
    }

    #[test]
    fn environment_names() {
        let names = EnvironmentNames::for_app("skyport", "web", false);
        assert_eq!(names.log_group, "/skyport/web");
        assert!(names.file_system.is_none());
        assert_eq!(
            EnvironmentNames::for_app("skyport", "web", true).file_system.as_deref(),
            Some("web-data")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deploys_into_prepared_environment() {
        let backend = MemoryBackend::new(MemoryConfig {
            health_polls: 2,
            ..MemoryConfig::default()
        });
        let (provisioner, poller) = harness();
        let mut pipeline = DeployPipeline::new(
            &backend,
            &provisioner,
            &poller,
            ServiceSpec::new("web-1", "nginx:1.27", 80),
            EnvironmentNames::for_app("skyport", "web", false),
        );

        let outcome = execute(&mut pipeline, &TracingReporter::new("test"))
            .await
            .unwrap();

        assert_eq!(outcome.outcome, ProvisionOutcome::Created);
        assert_eq!(outcome.resources.service.as_deref(), Some("web-1"));
        assert_eq!(outcome.resources.cluster.as_deref(), Some("cluster/skyport"));
        assert_eq!(
            outcome.resources.task_definition.as_deref(),
            Some("web-1:1")
        );
        assert!(outcome.resources.target_group.is_some());
        assert_eq!(
            backend.calls_of("describe_target_health").unwrap().len(),
            3
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failure_keeps_partial_references() {
        let backend = MemoryBackend::default();
        backend
            .inject("create_service", InjectedFailure::Fatal("access denied".to_owned()), 1)
            .unwrap();
        let (provisioner, poller) = harness();
        let mut pipeline = DeployPipeline::new(
            &backend,
            &provisioner,
            &poller,
            ServiceSpec::new("web-1", "nginx:1.27", 80),
            EnvironmentNames::for_app("skyport", "web", false),
        );

        let err = execute(&mut pipeline, &TracingReporter::new("test"))
            .await
            .unwrap_err();

        assert!(matches!(err, ControlError::Phase { phase: "run", .. }));
        assert!(pipeline.resources().service.is_none());
        assert!(pipeline.resources().security_group.is_some());
    }
}
