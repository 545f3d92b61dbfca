//! Backend adapters.
//!
//! Each backend exposes the same small capability set: find, create, update
//! and delete a service, poll an operation handle, and classify errors. Load
//! balancing and supporting resources (clusters, log groups, security groups,
//! file systems) are optional capabilities; the engine skips the steps that
//! need them when an adapter does not provide them.

mod docker;
mod http;
mod kubernetes;
mod memory;
mod nomad;

pub use docker::DockerBackend;
pub use kubernetes::KubernetesBackend;
pub use memory::{
    validate_task_size, InjectedFailure, MemoryBackend, MemorySnapshot, TASK_SIZES,
};
pub use nomad::NomadBackend;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{ControlConfig, Platform};
use crate::error::{default_classification, ControlError, ControlResult, ErrorClass};
use crate::types::{
    OperationHandle, OperationStatus, Placement, ServiceSpec, ServiceState, TargetReference,
};

/// Source of operation status, polled by [`crate::poller::OperationPoller`].
#[async_trait]
pub trait OperationSource: Send + Sync {
    /// Query the status of an operation.
    ///
    /// Adapters without a direct lookup may scan a list endpoint instead.
    async fn poll_operation(&self, handle: &OperationHandle) -> ControlResult<OperationStatus>;

    /// Classify an error returned by this backend.
    fn classify_error(&self, err: &ControlError) -> ErrorClass {
        default_classification(err)
    }
}

/// A backend that can run application services.
#[async_trait]
pub trait BackendAdapter: OperationSource {
    /// Short platform name.
    fn name(&self) -> &'static str;

    /// Look up a service by name.
    async fn find_service(&self, name: &str) -> ControlResult<Option<ServiceState>>;

    /// Create a service. Returns its id and the operation to wait on.
    async fn create_service(
        &self,
        spec: &ServiceSpec,
        placement: &Placement,
    ) -> ControlResult<(String, OperationHandle)>;

    /// Bring an existing service in line with the desired `ServiceSpec`.
    async fn update_service(
        &self,
        existing: &ServiceState,
        spec: &ServiceSpec,
        placement: &Placement,
    ) -> ControlResult<OperationHandle>;

    /// Whether an existing service needs an update to match the desired `ServiceSpec`.
    fn is_drifted(&self, existing: &ServiceState, spec: &ServiceSpec) -> bool {
        existing.differs_from(spec)
    }

    /// Delete a service, stopping anything still running.
    ///
    /// Returns [`ControlError::AlreadyAbsent`] if it does not exist.
    async fn delete_service(&self, service: &str) -> ControlResult<()>;

    /// Endpoint the service itself answers on, once the backend has assigned one.
    async fn service_endpoint(&self, service: &ServiceState) -> ControlResult<Option<String>>;

    /// Load balancer capability.
    fn load_balancing(&self) -> Option<&dyn LoadBalancing> {
        None
    }

    /// Cluster, IAM, logging, networking and storage capability.
    fn supporting(&self) -> Option<&dyn SupportingResources> {
        None
    }
}

/// A load balancer as seen by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancerInfo {
    /// Load balancer reference.
    pub id: String,
    /// Public DNS name.
    pub dns_name: String,
}

/// A listener and its default forwarding table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerInfo {
    /// Listener reference.
    pub id: String,
    /// Load balancer the listener belongs to.
    pub load_balancer: String,
    /// Port the listener accepts traffic on.
    pub port: u16,
    /// Weighted targets of the default forward action.
    pub default_action: Vec<TargetReference>,
}

/// Health of one registered target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetHealth {
    /// Health checks have not passed yet.
    Initial,
    /// Passing health checks.
    Healthy,
    /// Failing health checks.
    Unhealthy,
    /// Being deregistered.
    Draining,
}

/// An existing DNS record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    /// Fully qualified name.
    pub name: String,
    /// Record type, for example `A` or `CNAME`.
    pub record_type: String,
    /// Value or alias target.
    pub target: String,
}

/// Weighted load balancing: load balancers, listeners, target groups and DNS.
#[async_trait]
pub trait LoadBalancing: Send + Sync {
    /// Create a load balancer.
    async fn create_load_balancer(&self, name: &str) -> ControlResult<LoadBalancerInfo>;

    /// Look up a load balancer.
    async fn describe_load_balancer(&self, id: &str) -> ControlResult<Option<LoadBalancerInfo>>;

    /// Find the listener on a load balancer port.
    async fn find_listener(
        &self,
        load_balancer: &str,
        port: u16,
    ) -> ControlResult<Option<ListenerInfo>>;

    /// Look up a listener.
    async fn describe_listener(&self, listener: &str) -> ControlResult<Option<ListenerInfo>>;

    /// Create a listener with the given default action.
    async fn create_listener(
        &self,
        load_balancer: &str,
        port: u16,
        default_action: &[TargetReference],
    ) -> ControlResult<ListenerInfo>;

    /// Replace a listener's default action.
    async fn modify_listener(
        &self,
        listener: &str,
        default_action: &[TargetReference],
    ) -> ControlResult<()>;

    /// Delete a listener.
    async fn delete_listener(&self, listener: &str) -> ControlResult<()>;

    /// Return the target group with this name, creating it if needed.
    async fn create_or_find_target_group(&self, name: &str, port: u16) -> ControlResult<String>;

    /// Register a service's tasks as targets of a target group.
    async fn register_targets(&self, target_group: &str, service: &str) -> ControlResult<()>;

    /// Health of every target in a target group.
    async fn describe_target_health(&self, target_group: &str)
        -> ControlResult<Vec<TargetHealth>>;

    /// Delete a target group.
    async fn delete_target_group(&self, target_group: &str) -> ControlResult<()>;

    /// Find a record in a DNS zone.
    async fn find_dns_record(&self, zone: &str, name: &str) -> ControlResult<Option<DnsRecord>>;

    /// Create an alias record pointing at a load balancer.
    async fn create_dns_alias(
        &self,
        zone: &str,
        name: &str,
        load_balancer: &LoadBalancerInfo,
    ) -> ControlResult<()>;
}

/// State of a file system mount target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountTargetState {
    /// Usable.
    Available,
    /// Being removed.
    Deleting,
}

/// A file system mount target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountTarget {
    /// Mount target reference.
    pub id: String,
    /// Current state.
    pub state: MountTargetState,
}

/// Supporting resources a managed backend needs around a service.
///
/// The `ensure_*` methods are find-or-create by name and return the
/// resource reference.
#[async_trait]
pub trait SupportingResources: Send + Sync {
    /// Cluster services are placed in.
    async fn ensure_cluster(&self, name: &str) -> ControlResult<String>;

    /// Find a cluster by name.
    async fn find_cluster(&self, name: &str) -> ControlResult<Option<String>>;

    /// Number of services still attached to a cluster.
    async fn count_services(&self, cluster: &str) -> ControlResult<usize>;

    /// Delete a cluster.
    async fn delete_cluster(&self, cluster: &str) -> ControlResult<()>;

    /// Role the workload executes as.
    async fn ensure_execution_role(&self, name: &str) -> ControlResult<String>;

    /// Log group receiving workload output.
    async fn ensure_log_group(&self, name: &str) -> ControlResult<String>;

    /// Delete a log group.
    async fn delete_log_group(&self, log_group: &str) -> ControlResult<()>;

    /// Security group admitting traffic on `port`.
    async fn ensure_security_group(&self, name: &str, port: u16) -> ControlResult<String>;

    /// Find a security group by name.
    async fn find_security_group(&self, name: &str) -> ControlResult<Option<String>>;

    /// Delete a security group. Rejected as retryable while interfaces are attached.
    async fn delete_security_group(&self, security_group: &str) -> ControlResult<()>;

    /// Shared file system with mount targets.
    async fn ensure_file_system(&self, name: &str) -> ControlResult<String>;

    /// Find a file system by name.
    async fn find_file_system(&self, name: &str) -> ControlResult<Option<String>>;

    /// Mount targets of a file system.
    async fn list_mount_targets(&self, file_system: &str) -> ControlResult<Vec<MountTarget>>;

    /// Delete a mount target.
    async fn delete_mount_target(&self, mount_target: &str) -> ControlResult<()>;

    /// Delete a file system. Rejected while mount targets exist.
    async fn delete_file_system(&self, file_system: &str) -> ControlResult<()>;
}

/// Create the backend adapter selected by configuration.
pub fn create_backend(config: &ControlConfig) -> ControlResult<Arc<dyn BackendAdapter>> {
    create_backend_for(config.platform, config)
}

/// Create the adapter for a specific platform.
pub fn create_backend_for(
    platform: Platform,
    config: &ControlConfig,
) -> ControlResult<Arc<dyn BackendAdapter>> {
    match platform {
        Platform::Docker => Ok(Arc::new(DockerBackend::new(&config.docker)?)),
        Platform::Nomad => Ok(Arc::new(NomadBackend::new(&config.nomad)?)),
        Platform::Kubernetes => Ok(Arc::new(KubernetesBackend::new(&config.kubernetes)?)),
        Platform::Memory => Ok(Arc::new(MemoryBackend::new(config.memory.clone()))),
    }
}
