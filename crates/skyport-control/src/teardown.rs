//! Dependency-ordered teardown of a deployment's backend resources.
//!
//! Order:
//!
//! 1. take the target group out of its listener, then delete the group;
//! 2. delete the service and wait until the backend no longer reports it;
//! 3. delete the cluster if no service is left in it;
//! 4. delete the log group, the security group (retrying while interfaces
//!    detach) and the file system (after every mount target is gone).
//!
//! A resource that is already gone counts as deleted. Other failures are
//! logged and teardown moves on, except a failed service deletion: nothing
//! the service depends on is touched and the error is returned.

use tracing::{info, warn};

use crate::backend::{BackendAdapter, SupportingResources};
use crate::cutover::TrafficCutover;
use crate::error::{ControlError, ControlResult};
use crate::poller::{OperationPoller, Probe};
use crate::provisioner::Provisioner;
use crate::types::ResourceRefs;

/// What teardown did, step by step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Resources deleted.
    pub deleted: Vec<String>,
    /// Resources that were already gone.
    pub absent: Vec<String>,
    /// Resources left in place on purpose.
    pub skipped: Vec<String>,
    /// Resources whose deletion failed, with the error.
    pub failed: Vec<String>,
}

impl TeardownReport {
    /// Whether every step succeeded or found nothing to do.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    fn settle(&mut self, step: String, result: ControlResult<()>) {
        match result {
            Ok(()) => {
                info!(step = %step, "deleted");
                self.deleted.push(step);
            }
            Err(e) if e.is_already_absent() => {
                info!(step = %step, "already gone");
                self.absent.push(step);
            }
            Err(e) => {
                warn!(step = %step, error = %e, "teardown step failed, continuing");
                self.failed.push(format!("{step}: {e}"));
            }
        }
    }

    fn skip(&mut self, step: String, reason: &str) {
        info!(step = %step, reason, "skipped");
        self.skipped.push(step);
    }
}

/// Deletes resources in dependency order.
pub struct Teardown<'a> {
    adapter: &'a dyn BackendAdapter,
    provisioner: &'a Provisioner,
    poller: &'a OperationPoller,
    listener_port: u16,
}

impl<'a> Teardown<'a> {
    /// Create a teardown runner.
    #[must_use]
    pub fn new(
        adapter: &'a dyn BackendAdapter,
        provisioner: &'a Provisioner,
        poller: &'a OperationPoller,
        listener_port: u16,
    ) -> Self {
        Self {
            adapter,
            provisioner,
            poller,
            listener_port,
        }
    }

    /// Delete everything `refs` names.
    pub async fn destroy(&self, refs: &ResourceRefs) -> ControlResult<TeardownReport> {
        let mut report = TeardownReport::default();

        if let Some(target_group) = &refs.target_group {
            self.detach_target_group(&mut report, refs.listener.as_deref(), target_group)
                .await;
        }

        let service_result = match &refs.service {
            Some(service) => self.delete_service(&mut report, service).await,
            None => Ok(()),
        };

        let supporting = self.adapter.supporting();
        if let Err(e) = service_result {
            for step in [
                refs.cluster.as_ref().map(|c| format!("cluster {c}")),
                refs.security_group.as_ref().map(|s| format!("security group {s}")),
                refs.file_system.as_ref().map(|f| format!("file system {f}")),
            ]
            .into_iter()
            .flatten()
            {
                report.skip(step, "service deletion failed");
            }
            if let (Some(support), Some(log_group)) = (supporting, &refs.log_group) {
                self.delete_log_group(&mut report, support, log_group).await;
            }
            return Err(e);
        }

        if let Some(support) = supporting {
            if let Some(cluster) = &refs.cluster {
                self.delete_cluster(&mut report, support, cluster).await;
            }
            if let Some(log_group) = &refs.log_group {
                self.delete_log_group(&mut report, support, log_group).await;
            }
            if let Some(security_group) = &refs.security_group {
                self.delete_security_group(&mut report, support, security_group)
                    .await;
            }
            if let Some(file_system) = &refs.file_system {
                self.delete_file_system(&mut report, support, file_system)
                    .await;
            }
        }

        info!(
            deleted = report.deleted.len(),
            absent = report.absent.len(),
            failed = report.failed.len(),
            "teardown finished"
        );
        Ok(report)
    }

    async fn detach_target_group(
        &self,
        report: &mut TeardownReport,
        listener: Option<&str>,
        target_group: &str,
    ) {
        let cutover = match TrafficCutover::new(self.adapter, self.provisioner, self.listener_port)
        {
            Ok(cutover) => cutover,
            Err(e) => {
                report.failed.push(format!("target group {target_group}: {e}"));
                return;
            }
        };

        if let Some(listener) = listener {
            let result = cutover
                .remove_target(listener, target_group)
                .await
                .map(|_| ());
            report.settle(format!("listener entry {listener}/{target_group}"), result);
        }

        let classify = |e: &ControlError| self.adapter.classify_error(e);
        let result = match self.adapter.load_balancing() {
            Some(lb) => {
                self.provisioner
                    .mutate("delete target group", classify, || {
                        lb.delete_target_group(target_group)
                    })
                    .await
            }
            None => Err(ControlError::unsupported(self.adapter.name(), "load balancing")),
        };
        report.settle(format!("target group {target_group}"), result);
    }

    async fn delete_service(&self, report: &mut TeardownReport, service: &str) -> ControlResult<()> {
        let step = format!("service {service}");
        let classify = |e: &ControlError| self.adapter.classify_error(e);

        let deleted = match self
            .provisioner
            .mutate("delete service", classify, || {
                self.adapter.delete_service(service)
            })
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_already_absent() => Err(e),
            Err(e) => {
                warn!(service, error = %e, "service deletion failed");
                report.failed.push(format!("{step}: {e}"));
                return Err(e);
            }
        };

        let adapter = self.adapter;
        let gone = self
            .poller
            .wait_until(&format!("{step} gone"), move || async move {
                Ok(match adapter.find_service(service).await? {
                    None => Probe::Done,
                    Some(state) if state.running => Probe::Pending("active".to_owned()),
                    Some(_) => Probe::Pending("draining".to_owned()),
                })
            })
            .await;

        match gone {
            Ok(()) => {
                report.settle(step, deleted);
                Ok(())
            }
            Err(e) => {
                warn!(service, error = %e, "service did not go away");
                report.failed.push(format!("{step}: {e}"));
                Err(e)
            }
        }
    }

    async fn delete_cluster(
        &self,
        report: &mut TeardownReport,
        support: &dyn SupportingResources,
        cluster: &str,
    ) {
        let step = format!("cluster {cluster}");
        match support.count_services(cluster).await {
            Ok(0) => {}
            Ok(n) => {
                report.skip(step, &format!("{n} service(s) still in cluster"));
                return;
            }
            Err(e) => {
                report.settle(step, Err(e));
                return;
            }
        }
        let classify = |e: &ControlError| self.adapter.classify_error(e);
        let result = self
            .provisioner
            .mutate("delete cluster", classify, || support.delete_cluster(cluster))
            .await;
        report.settle(step, result);
    }

    async fn delete_log_group(
        &self,
        report: &mut TeardownReport,
        support: &dyn SupportingResources,
        log_group: &str,
    ) {
        let classify = |e: &ControlError| self.adapter.classify_error(e);
        let result = self
            .provisioner
            .mutate("delete log group", classify, || support.delete_log_group(log_group))
            .await;
        report.settle(format!("log group {log_group}"), result);
    }

    async fn delete_security_group(
        &self,
        report: &mut TeardownReport,
        support: &dyn SupportingResources,
        security_group: &str,
    ) {
        let classify = |e: &ControlError| self.adapter.classify_error(e);
        let result = self
            .provisioner
            .mutate("delete security group", classify, || {
                support.delete_security_group(security_group)
            })
            .await;
        report.settle(format!("security group {security_group}"), result);
    }

    async fn delete_file_system(
        &self,
        report: &mut TeardownReport,
        support: &dyn SupportingResources,
        file_system: &str,
    ) {
        let step = format!("file system {file_system}");
        let result = self.remove_file_system(support, file_system).await;
        report.settle(step, result);
    }

    async fn remove_file_system(
        &self,
        support: &dyn SupportingResources,
        file_system: &str,
    ) -> ControlResult<()> {
        let classify = |e: &ControlError| self.adapter.classify_error(e);

        for target in support.list_mount_targets(file_system).await? {
            match self
                .provisioner
                .mutate("delete mount target", classify, || {
                    support.delete_mount_target(&target.id)
                })
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_already_absent() => {}
                Err(e) => return Err(e),
            }
        }

        self.poller
            .wait_until(
                &format!("mount targets of {file_system}"),
                move || async move {
                    match support.list_mount_targets(file_system).await {
                        Ok(targets) if targets.is_empty() => Ok(Probe::Done),
                        Ok(targets) => Ok(Probe::Pending(format!(
                            "{} mount target(s) remaining",
                            targets.len()
                        ))),
                        Err(e) if e.is_already_absent() => Ok(Probe::Done),
                        Err(e) => Err(e),
                    }
                },
            )
            .await?;

        self.provisioner
            .mutate("delete file system", classify, || {
                support.delete_file_system(file_system)
            })
            .await
    }
}
