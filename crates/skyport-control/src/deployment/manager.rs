//! Deployment orchestration: deploy, release, destroy and retention.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backend::BackendAdapter;
use crate::config::{ControlConfig, ReleaseConfig};
use crate::cutover::TrafficCutover;
use crate::error::{ControlError, ControlResult};
use crate::lifecycle::{execute, TracingReporter};
use crate::poller::{OperationPoller, PollSettings};
use crate::provisioner::Provisioner;
use crate::retry::RetryPolicy;
use crate::state::{AnyDeployment, Deployment, Pending};
use crate::store::{DeploymentFilter, DeploymentStore};
use crate::teardown::{Teardown, TeardownReport};
use crate::types::{
    AppName, DeploymentData, DeploymentId, DeploymentRecord, PersistedState, ReleaseData,
    ResourceRefs, ServiceSpec, ServiceState, TrafficEntry,
};

use super::pipeline::{DeployPipeline, EnvironmentNames};

/// Request to deploy a new version of an application.
#[derive(Debug, Clone)]
pub struct DeploymentRequest {
    /// Application name.
    pub app: AppName,
    /// Desired workload. The name is replaced by a per-deployment service name.
    pub spec: ServiceSpec,
}

impl DeploymentRequest {
    /// Create a request.
    #[must_use]
    pub fn new(app: impl Into<String>, spec: ServiceSpec) -> Self {
        Self {
            app: AppName::new(app),
            spec,
        }
    }

    /// Create deployment data for this request.
    #[must_use]
    pub fn into_data(self, platform: &str, region: &str) -> DeploymentData {
        let mut data = DeploymentData::new(self.app, platform, region, self.spec);
        data.spec.name = format!("{}-{}", data.app, data.id.short());
        data
    }
}

/// A stored deployment together with what the backend currently reports.
#[derive(Debug, Clone)]
pub struct DeploymentStatus {
    /// Stored record.
    pub record: DeploymentRecord,
    /// The service as the backend sees it, if it still exists.
    pub live: Option<ServiceState>,
}

/// Result of a retention pass.
#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    /// Deployments kept.
    pub kept: Vec<DeploymentId>,
    /// Deployments destroyed.
    pub destroyed: Vec<DeploymentId>,
    /// Deployments whose teardown failed, with the error.
    pub failed: Vec<(DeploymentId, String)>,
}

/// Orchestrates deployment lifecycle operations.
pub struct DeploymentManager {
    store: Arc<dyn DeploymentStore>,
    adapter: Arc<dyn BackendAdapter>,
    region: String,
    release_config: ReleaseConfig,
    provisioner: Provisioner,
    poller: OperationPoller,
}

impl DeploymentManager {
    /// Create a deployment manager.
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        adapter: Arc<dyn BackendAdapter>,
        config: &ControlConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            adapter,
            region: config.cluster.clone(),
            release_config: config.release.clone(),
            provisioner: Provisioner::new(RetryPolicy::from_config(&config.retry), cancel.clone()),
            poller: OperationPoller::new(PollSettings::from_config(&config.poll), cancel),
        }
    }

    /// Backend in use.
    #[must_use]
    pub fn adapter(&self) -> &dyn BackendAdapter {
        self.adapter.as_ref()
    }

    /// Deploy a new version of an application.
    ///
    /// 1. Create deployment record in pending state
    /// 2. Prepare cluster, role, log group and security group
    /// 3. Provision the service and wait for its operation
    /// 4. Register it in a target group and wait for healthy targets
    /// 5. Mark the deployment as deployed
    ///
    /// On failure the record moves to failed and keeps whatever references
    /// were created, so `destroy` can clean them up.
    pub async fn deploy(&self, request: DeploymentRequest) -> ControlResult<DeploymentRecord> {
        let data = request.into_data(self.adapter.name(), &self.region);
        let deployment_id = data.id.clone();
        let app = data.app.clone();

        info!(
            deployment_id = %deployment_id,
            app = %app,
            service = %data.spec.name,
            image = %data.spec.image,
            "starting deployment"
        );

        let pending = Deployment::<Pending>::create(data);
        self.store
            .insert(&DeploymentRecord::new(pending.data().clone()))
            .await?;

        let names = EnvironmentNames::for_app(&self.region, app.as_str(), false);
        let mut pipeline = DeployPipeline::new(
            self.adapter.as_ref(),
            &self.provisioner,
            &self.poller,
            pending.data().spec.clone(),
            names,
        )
        .with_label(format!("deploy {deployment_id}"));
        let reporter = TracingReporter::new(format!("deploy {deployment_id}"));

        match execute(&mut pipeline, &reporter).await {
            Ok(outcome) => {
                let deployed =
                    pending.deployed(outcome.resources, outcome.operation, outcome.public_endpoint);
                let record = DeploymentRecord {
                    state: deployed.state(),
                    data: deployed.into_data(),
                };
                self.store.update(&record).await?;
                info!(deployment_id = %deployment_id, "deployment completed successfully");
                Ok(record)
            }
            Err(e) => {
                error!(deployment_id = %deployment_id, error = %e, "deployment failed");
                let failed = pending.fail(pipeline.resources().clone(), e.to_string());
                let record = DeploymentRecord {
                    state: failed.state(),
                    data: failed.into_data(),
                };
                self.store.update(&record).await?;
                Err(e)
            }
        }
    }

    /// Send all traffic of the application to this deployment.
    ///
    /// With load balancing the deployment's target group takes over the
    /// app's listener (or the app's load balancer, the configured one, or a
    /// new one), and the hostname is aliased when a DNS zone is
    /// configured. Without it the service's own endpoint becomes the URL.
    /// The previously released deployment steps back to deployed.
    pub async fn release(&self, id: &DeploymentId) -> ControlResult<ReleaseData> {
        let record = self.load(id).await?;
        let deployed = AnyDeployment::from_persisted(record.data, record.state).try_into_deployed()?;
        let app = deployed.data().app.clone();
        let previous = self
            .store
            .get_released(&app)
            .await?
            .filter(|r| &r.data.id != id);

        let release = match self.adapter.load_balancing() {
            Some(_) => self.cut_over(deployed.data(), previous.as_ref()).await?,
            None => self.direct_release(deployed.data()).await?,
        };

        if let Some(previous) = previous {
            let previous_id = previous.data.id.clone();
            let retired = AnyDeployment::from_persisted(previous.data, previous.state)
                .try_into_released()?
                .retire();
            self.store
                .update(&DeploymentRecord {
                    state: retired.state(),
                    data: retired.into_data(),
                })
                .await?;
            info!(deployment_id = %previous_id, "retired previous release");
        }

        let released = deployed.release(release.clone());
        self.store
            .update(&DeploymentRecord {
                state: released.state(),
                data: released.into_data(),
            })
            .await?;
        info!(deployment_id = %id, url = %release.url, "released");
        Ok(release)
    }

    async fn cut_over(
        &self,
        data: &DeploymentData,
        previous: Option<&DeploymentRecord>,
    ) -> ControlResult<ReleaseData> {
        let target_group = data.resources.target_group.as_deref().ok_or_else(|| {
            ControlError::fatal(format!("deployment {} has no target group", data.id))
        })?;

        let cutover = TrafficCutover::new(
            self.adapter.as_ref(),
            &self.provisioner,
            self.release_config.listener_port,
        )?;
        let entry = match self.entry_point(&cutover, &data.app, previous).await? {
            Some(entry) => Some(entry),
            None => self
                .release_config
                .load_balancer
                .clone()
                .map(TrafficEntry::LoadBalancer),
        };
        let result = cutover
            .cutover(entry.as_ref(), target_group, &format!("{}-lb", data.app))
            .await?;

        let host = match (&self.release_config.dns_zone, &self.release_config.hostname) {
            (Some(zone), Some(hostname)) => {
                let lb = cutover.load_balancer(&result.load_balancer).await?;
                cutover.ensure_dns(zone, hostname, &lb).await?;
                hostname.clone()
            }
            _ => result.dns_name.clone(),
        };

        Ok(ReleaseData {
            url: release_url(&host, self.release_config.listener_port),
            load_balancer: Some(result.load_balancer),
            listener: Some(result.listener),
            released_at: Utc::now(),
        })
    }

    /// Where the app's traffic currently enters.
    ///
    /// A live listener referenced by any remaining deployment wins, the
    /// released one first. Failing that, a load balancer any deployment of
    /// the app used is adopted, destroyed deployments included.
    async fn entry_point(
        &self,
        cutover: &TrafficCutover<'_>,
        app: &AppName,
        previous: Option<&DeploymentRecord>,
    ) -> ControlResult<Option<TrafficEntry>> {
        let history = self
            .store
            .list(&DeploymentFilter::new().with_app(app.clone()))
            .await?;
        let records: Vec<&DeploymentRecord> = previous.into_iter().chain(&history).collect();

        for record in records
            .iter()
            .filter(|r| r.state != PersistedState::Destroyed)
        {
            if let Some(listener) = &record.data.resources.listener {
                if cutover.listener(listener).await?.is_some() {
                    return Ok(Some(TrafficEntry::Listener(listener.clone())));
                }
            }
        }
        for record in &records {
            if let Some(lb) = &record.data.resources.load_balancer {
                if cutover.find_load_balancer(lb).await?.is_some() {
                    return Ok(Some(TrafficEntry::LoadBalancer(lb.clone())));
                }
            }
        }
        Ok(None)
    }

    async fn direct_release(&self, data: &DeploymentData) -> ControlResult<ReleaseData> {
        let endpoint = match &data.public_endpoint {
            Some(endpoint) => Some(endpoint.clone()),
            None => match self.adapter.find_service(&data.spec.name).await? {
                Some(state) => self.adapter.service_endpoint(&state).await?,
                None => None,
            },
        };
        let url = endpoint.ok_or_else(|| {
            ControlError::fatal(format!(
                "service {} has no public endpoint to release",
                data.spec.name
            ))
        })?;
        Ok(ReleaseData {
            url,
            load_balancer: None,
            listener: None,
            released_at: Utc::now(),
        })
    }

    /// Tear down everything a deployment created.
    ///
    /// Log group, security group and file system are shared by every
    /// deployment of the app and are only deleted with the last one.
    pub async fn destroy(&self, id: &DeploymentId) -> ControlResult<TeardownReport> {
        let record = self.load(id).await?;
        if record.state == PersistedState::Released {
            warn!(deployment_id = %id, "destroying the released deployment");
        }

        let refs = self.teardown_refs(&record).await?;
        let destroyed = match AnyDeployment::from_persisted(record.data, record.state) {
            AnyDeployment::Pending(d) => {
                let resources = d.data().resources.clone();
                d.fail(resources, "interrupted".to_owned()).destroy()
            }
            AnyDeployment::Deployed(d) => d.destroy(),
            AnyDeployment::Released(d) => d.destroy(),
            AnyDeployment::Failed(d) => d.destroy(),
            AnyDeployment::Destroyed(_) => {
                return Err(ControlError::InvalidStateTransition {
                    from: "destroyed",
                    to: "destroyed",
                })
            }
        };

        info!(deployment_id = %id, "destroying deployment");
        let teardown = Teardown::new(
            self.adapter.as_ref(),
            &self.provisioner,
            &self.poller,
            self.release_config.listener_port,
        );
        let report = match teardown.destroy(&refs).await {
            Ok(report) => report,
            Err(e) => {
                error!(deployment_id = %id, error = %e, "teardown failed");
                let record = self.load(id).await?;
                self.store
                    .update_state(id, record.state, Some(&e.to_string()))
                    .await?;
                return Err(e);
            }
        };

        let mut data = destroyed.into_data();
        data.error = (!report.is_clean()).then(|| report.failed.join("; "));
        self.store
            .update(&DeploymentRecord {
                data,
                state: PersistedState::Destroyed,
            })
            .await?;
        info!(
            deployment_id = %id,
            deleted = report.deleted.len(),
            absent = report.absent.len(),
            failed = report.failed.len(),
            "deployment destroyed"
        );
        Ok(report)
    }

    async fn teardown_refs(&self, record: &DeploymentRecord) -> ControlResult<ResourceRefs> {
        let mut refs = record.data.resources.clone();
        let others = self
            .store
            .list(&DeploymentFilter::new().with_app(record.data.app.clone()))
            .await?
            .into_iter()
            .filter(|r| r.data.id != record.data.id && r.state != PersistedState::Destroyed)
            .count();
        if others > 0 {
            info!(
                deployment_id = %record.data.id,
                others,
                "keeping resources shared with other deployments"
            );
            refs.log_group = None;
            refs.security_group = None;
            refs.file_system = None;
        }
        Ok(refs)
    }

    /// Stored record plus the live service state.
    pub async fn status(&self, id: &DeploymentId) -> ControlResult<DeploymentStatus> {
        let record = self.load(id).await?;
        let live = match (&record.data.resources.service, record.state) {
            (_, PersistedState::Destroyed) | (None, _) => None,
            (Some(service), _) => self.adapter.find_service(service).await?,
        };
        Ok(DeploymentStatus { record, live })
    }

    /// Get a deployment record.
    pub async fn get(&self, id: &DeploymentId) -> ControlResult<DeploymentRecord> {
        self.load(id).await
    }

    /// List deployments.
    pub async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentRecord>> {
        self.store.list(filter).await
    }

    /// Destroy all but the newest `keep` deployments of an application.
    ///
    /// The released deployment is never destroyed, even when it falls
    /// outside the newest `keep`.
    pub async fn prune(&self, app: &AppName, keep: usize) -> ControlResult<PruneReport> {
        let live: Vec<_> = self
            .store
            .list(&DeploymentFilter::new().with_app(app.clone()))
            .await?
            .into_iter()
            .filter(|r| r.state != PersistedState::Destroyed)
            .collect();

        let mut report = PruneReport::default();
        for (index, record) in live.into_iter().enumerate() {
            let id = record.data.id.clone();
            if index < keep || record.state == PersistedState::Released {
                report.kept.push(id);
                continue;
            }
            match self.destroy(&id).await {
                Ok(_) => report.destroyed.push(id),
                Err(e) => {
                    warn!(deployment_id = %id, error = %e, "prune could not destroy deployment");
                    report.failed.push((id, e.to_string()));
                }
            }
        }

        info!(
            app = %app,
            kept = report.kept.len(),
            destroyed = report.destroyed.len(),
            "pruned deployments"
        );
        Ok(report)
    }

    async fn load(&self, id: &DeploymentId) -> ControlResult<DeploymentRecord> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ControlError::DeploymentNotFound(id.to_string()))
    }
}

fn release_url(host: &str, port: u16) -> String {
    if port == 80 {
        format!("http://{host}")
    } else {
        format!("http://{host}:{port}")
    }
}
