//! In-process managed container service.
//!
//! Models a managed container platform with clusters, execution roles, log
//! groups, security groups, shared file systems, load balancers, listeners,
//! target groups and DNS. The eventual-consistency behaviour of such
//! platforms is reproduced deterministically: operations complete after a
//! number of polls, new roles are invisible to service creates for a number
//! of attempts, deleted services drain before disappearing, and security
//! groups refuse deletion while interfaces detach.
//!
//! Used as the `memory` platform and throughout the tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockWriteGuard};

use async_trait::async_trait;
use tracing::debug;

use crate::config::MemoryConfig;
use crate::error::{ControlError, ControlResult};
use crate::types::{
    OperationHandle, OperationStatus, Placement, ServiceSpec, ServiceState, TargetReference,
};

use super::{
    BackendAdapter, DnsRecord, ListenerInfo, LoadBalancerInfo, LoadBalancing, MountTarget,
    MountTargetState, OperationSource, SupportingResources, TargetHealth,
};

/// Valid CPU units and the memory sizes (MB) allowed with each.
pub static TASK_SIZES: &[(u32, &[u32])] = &[
    (256, &[512, 1024, 2048]),
    (512, &[1024, 2048, 3072, 4096]),
    (1024, &[2048, 3072, 4096, 5120, 6144, 7168, 8192]),
    (
        2048,
        &[
            4096, 5120, 6144, 7168, 8192, 9216, 10240, 11264, 12288, 13312, 14336, 15360, 16384,
        ],
    ),
    (
        4096,
        &[
            8192, 9216, 10240, 11264, 12288, 13312, 14336, 15360, 16384, 17408, 18432, 19456,
            20480, 21504, 22528, 23552, 24576, 25600, 26624, 27648, 28672, 29696, 30720,
        ],
    ),
];

/// Check a CPU/memory pair against [`TASK_SIZES`].
pub fn validate_task_size(cpu: u32, memory_mb: u32) -> ControlResult<()> {
    let Some((_, allowed)) = TASK_SIZES.iter().find(|(c, _)| *c == cpu) else {
        return Err(ControlError::InvalidSpec(format!(
            "cpu {cpu} is not a valid task size"
        )));
    };
    if allowed.contains(&memory_mb) {
        Ok(())
    } else {
        Err(ControlError::InvalidSpec(format!(
            "memory {memory_mb} MB is not valid with cpu {cpu}"
        )))
    }
}

/// A failure to return from the next calls of a given method.
#[derive(Debug, Clone)]
pub enum InjectedFailure {
    /// Rejected, retry later.
    Retryable(String),
    /// Rejected for good.
    Fatal(String),
    /// Something the backend does not classify.
    Unknown(String),
}

impl InjectedFailure {
    fn to_error(&self) -> ControlError {
        match self {
            Self::Retryable(msg) => ControlError::retryable(msg.clone()),
            Self::Fatal(msg) => ControlError::fatal(msg.clone()),
            Self::Unknown(msg) => ControlError::internal(msg.clone()),
        }
    }
}

#[derive(Debug, Clone)]
struct MemService {
    id: String,
    spec: ServiceSpec,
    placement: Placement,
    task_definition: String,
    /// Lookups left before a deleted service disappears.
    draining: Option<u32>,
}

impl MemService {
    fn observe(&self) -> ServiceState {
        ServiceState {
            id: self.id.clone(),
            name: self.spec.name.clone(),
            image: self.spec.image.clone(),
            port: self.spec.port,
            env: self.spec.env.clone(),
            replicas: self.spec.replicas,
            cpu: Some(self.spec.cpu),
            memory_mb: Some(self.spec.memory_mb),
            running: self.draining.is_none(),
            cluster: self.placement.cluster.clone(),
            task_definition: Some(self.task_definition.clone()),
        }
    }
}

#[derive(Debug, Clone)]
struct MemOperation {
    remaining: u32,
    failure: Option<String>,
}

#[derive(Debug, Clone)]
struct MemSecurityGroup {
    name: String,
    detach_remaining: u32,
}

#[derive(Debug, Clone)]
struct MemMountTarget {
    id: String,
    deleting: Option<u32>,
}

#[derive(Debug, Clone)]
struct MemFileSystem {
    name: String,
    mount_targets: Vec<MemMountTarget>,
}

#[derive(Debug, Clone)]
struct MemTargetGroup {
    name: String,
    targets: Vec<String>,
    health_remaining: u32,
}

#[derive(Debug, Default)]
struct MemoryState {
    seq: u64,
    services: BTreeMap<String, MemService>,
    revisions: HashMap<String, u32>,
    operations: HashMap<String, MemOperation>,
    next_operation_failure: Option<String>,
    clusters: BTreeMap<String, String>,
    roles: BTreeMap<String, String>,
    role_rejections: u32,
    log_groups: BTreeMap<String, String>,
    security_groups: BTreeMap<String, MemSecurityGroup>,
    file_systems: BTreeMap<String, MemFileSystem>,
    load_balancers: BTreeMap<String, LoadBalancerInfo>,
    listeners: BTreeMap<String, ListenerInfo>,
    target_groups: BTreeMap<String, MemTargetGroup>,
    dns: BTreeMap<(String, String), DnsRecord>,
    injected: HashMap<&'static str, (InjectedFailure, u32)>,
    calls: Vec<String>,
}

impl MemoryState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.seq += 1;
        format!("{prefix}-{:04}", self.seq)
    }

    fn record(&mut self, call: &'static str, arg: &str) -> ControlResult<()> {
        self.calls.push(format!("{call} {arg}"));
        if let Some((failure, times)) = self.injected.get_mut(call) {
            if *times > 0 {
                *times -= 1;
                let err = failure.to_error();
                if *times == 0 {
                    self.injected.remove(call);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn start_operation(&mut self, polls: u32) -> OperationHandle {
        let id = self.next_id("op");
        let failure = self.next_operation_failure.take();
        self.operations.insert(
            id.clone(),
            MemOperation {
                remaining: polls,
                failure,
            },
        );
        OperationHandle::new(id)
    }

    fn target_group_in_use(&self, target_group: &str) -> bool {
        self.listeners
            .values()
            .any(|l| l.default_action.iter().any(|t| t.id == target_group))
    }
}

/// Snapshot of the in-process backend, for assertions.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshot {
    /// Services by name, draining ones included.
    pub services: Vec<String>,
    /// Cluster names.
    pub clusters: Vec<String>,
    /// Log group names.
    pub log_groups: Vec<String>,
    /// Security group ids.
    pub security_groups: Vec<String>,
    /// File system ids.
    pub file_systems: Vec<String>,
    /// Load balancer ids.
    pub load_balancers: Vec<String>,
    /// Listeners.
    pub listeners: Vec<ListenerInfo>,
    /// Target group ids.
    pub target_groups: Vec<String>,
    /// DNS records.
    pub dns_records: Vec<DnsRecord>,
}

/// In-process managed container backend.
#[derive(Debug)]
pub struct MemoryBackend {
    config: MemoryConfig,
    state: RwLock<MemoryState>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

impl MemoryBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            state: RwLock::new(MemoryState::default()),
        }
    }

    fn state(&self) -> ControlResult<RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))
    }

    /// Fail the next `times` calls of `call` (a method name such as `create_service`).
    pub fn inject(&self, call: &'static str, failure: InjectedFailure, times: u32) -> ControlResult<()> {
        self.state()?.injected.insert(call, (failure, times));
        Ok(())
    }

    /// Make the next operation finish in the failed state with this status.
    pub fn fail_next_operation(&self, status: impl Into<String>) -> ControlResult<()> {
        self.state()?.next_operation_failure = Some(status.into());
        Ok(())
    }

    /// Every call made so far, as `"<method> <argument>"`.
    pub fn calls(&self) -> ControlResult<Vec<String>> {
        Ok(self.state()?.calls.clone())
    }

    /// Calls of one method, in order.
    pub fn calls_of(&self, call: &str) -> ControlResult<Vec<String>> {
        let prefix = format!("{call} ");
        Ok(self
            .state()?
            .calls
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .cloned()
            .collect())
    }

    /// Current contents.
    pub fn snapshot(&self) -> ControlResult<MemorySnapshot> {
        let state = self.state()?;
        Ok(MemorySnapshot {
            services: state.services.keys().cloned().collect(),
            clusters: state.clusters.keys().cloned().collect(),
            log_groups: state.log_groups.keys().cloned().collect(),
            security_groups: state.security_groups.keys().cloned().collect(),
            file_systems: state.file_systems.keys().cloned().collect(),
            load_balancers: state.load_balancers.keys().cloned().collect(),
            listeners: state.listeners.values().cloned().collect(),
            target_groups: state.target_groups.keys().cloned().collect(),
            dns_records: state.dns.values().cloned().collect(),
        })
    }
}

#[async_trait]
impl OperationSource for MemoryBackend {
    async fn poll_operation(&self, handle: &OperationHandle) -> ControlResult<OperationStatus> {
        let mut state = self.state()?;
        state.record("poll_operation", handle.as_str())?;
        let op = state
            .operations
            .get_mut(handle.as_str())
            .ok_or_else(|| ControlError::fatal(format!("operation {handle} not found")))?;

        if op.remaining > 0 {
            op.remaining -= 1;
            return Ok(OperationStatus::in_progress("IN_PROGRESS"));
        }
        Ok(match &op.failure {
            Some(status) => OperationStatus::failed(status.clone()),
            None => OperationStatus::succeeded("COMPLETED"),
        })
    }
}

#[async_trait]
impl BackendAdapter for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn find_service(&self, name: &str) -> ControlResult<Option<ServiceState>> {
        let mut state = self.state()?;
        state.record("find_service", name)?;

        let draining = match state.services.get(name) {
            None => return Ok(None),
            Some(service) => service.draining,
        };
        match draining {
            Some(0) => {
                state.services.remove(name);
                state.calls.push(format!("service_gone {name}"));
                Ok(None)
            }
            _ => Ok(state.services.get_mut(name).map(|service| {
                if let Some(left) = service.draining.as_mut() {
                    *left -= 1;
                }
                service.observe()
            })),
        }
    }

    async fn create_service(
        &self,
        spec: &ServiceSpec,
        placement: &Placement,
    ) -> ControlResult<(String, OperationHandle)> {
        validate_task_size(spec.cpu, spec.memory_mb)?;

        let mut state = self.state()?;
        state.record("create_service", &spec.name)?;

        if let Some(cluster) = &placement.cluster {
            if !state.clusters.values().any(|id| id == cluster) {
                return Err(ControlError::fatal(format!("cluster {cluster} not found")));
            }
        }
        if placement.execution_role.is_some() && state.role_rejections > 0 {
            state.role_rejections -= 1;
            return Err(ControlError::retryable(
                "execution role cannot be assumed by the service yet",
            ));
        }
        if let Some(existing) = state.services.get(&spec.name) {
            return Err(if existing.draining.is_some() {
                ControlError::retryable(format!("service {} is still draining", spec.name))
            } else {
                ControlError::fatal(format!("service {} already exists", spec.name))
            });
        }

        let id = state.next_id("svc");
        let revision = state.revisions.entry(spec.name.clone()).or_insert(0);
        *revision += 1;
        let task_definition = format!("{}:{}", spec.name, revision);
        state.services.insert(
            spec.name.clone(),
            MemService {
                id: id.clone(),
                spec: spec.clone(),
                placement: placement.clone(),
                task_definition,
                draining: None,
            },
        );
        let handle = state.start_operation(self.config.operation_polls);
        debug!(service = %spec.name, id = %id, handle = %handle, "service created");
        Ok((id, handle))
    }

    async fn update_service(
        &self,
        existing: &ServiceState,
        spec: &ServiceSpec,
        placement: &Placement,
    ) -> ControlResult<OperationHandle> {
        validate_task_size(spec.cpu, spec.memory_mb)?;

        let mut state = self.state()?;
        state.record("update_service", &existing.name)?;

        let revision = state.revisions.entry(spec.name.clone()).or_insert(0);
        *revision += 1;
        let task_definition = format!("{}:{}", spec.name, revision);

        let service = state
            .services
            .get_mut(&existing.name)
            .filter(|s| s.draining.is_none())
            .ok_or_else(|| ControlError::fatal(format!("service {} is not active", existing.name)))?;
        service.spec = spec.clone();
        service.placement = placement.clone();
        service.task_definition = task_definition;

        Ok(state.start_operation(self.config.operation_polls))
    }

    async fn delete_service(&self, service: &str) -> ControlResult<()> {
        let mut state = self.state()?;
        state.record("delete_service", service)?;

        let drain = self.config.drain_polls;
        match state.services.get_mut(service) {
            Some(s) if s.draining.is_none() => {
                s.draining = Some(drain);
                Ok(())
            }
            _ => Err(ControlError::already_absent(format!("service {service}"))),
        }
    }

    async fn service_endpoint(&self, _service: &ServiceState) -> ControlResult<Option<String>> {
        Ok(self.config.endpoint.clone())
    }

    fn load_balancing(&self) -> Option<&dyn LoadBalancing> {
        Some(self)
    }

    fn supporting(&self) -> Option<&dyn SupportingResources> {
        Some(self)
    }
}

#[async_trait]
impl LoadBalancing for MemoryBackend {
    async fn create_load_balancer(&self, name: &str) -> ControlResult<LoadBalancerInfo> {
        let mut state = self.state()?;
        state.record("create_load_balancer", name)?;
        let id = state.next_id("lb");
        let info = LoadBalancerInfo {
            dns_name: format!("{name}-{id}.lb.memory.local"),
            id: id.clone(),
        };
        state.load_balancers.insert(id, info.clone());
        Ok(info)
    }

    async fn describe_load_balancer(&self, id: &str) -> ControlResult<Option<LoadBalancerInfo>> {
        let mut state = self.state()?;
        state.record("describe_load_balancer", id)?;
        Ok(state.load_balancers.get(id).cloned())
    }

    async fn find_listener(
        &self,
        load_balancer: &str,
        port: u16,
    ) -> ControlResult<Option<ListenerInfo>> {
        let mut state = self.state()?;
        state.record("find_listener", load_balancer)?;
        Ok(state
            .listeners
            .values()
            .find(|l| l.load_balancer == load_balancer && l.port == port)
            .cloned())
    }

    async fn describe_listener(&self, listener: &str) -> ControlResult<Option<ListenerInfo>> {
        let mut state = self.state()?;
        state.record("describe_listener", listener)?;
        Ok(state.listeners.get(listener).cloned())
    }

    async fn create_listener(
        &self,
        load_balancer: &str,
        port: u16,
        default_action: &[TargetReference],
    ) -> ControlResult<ListenerInfo> {
        let mut state = self.state()?;
        state.record("create_listener", load_balancer)?;

        if !state.load_balancers.contains_key(load_balancer) {
            return Err(ControlError::fatal(format!(
                "load balancer {load_balancer} not found"
            )));
        }
        if state
            .listeners
            .values()
            .any(|l| l.load_balancer == load_balancer && l.port == port)
        {
            return Err(ControlError::fatal(format!(
                "duplicate listener on {load_balancer}:{port}"
            )));
        }
        if let Some(missing) = default_action
            .iter()
            .find(|t| !state.target_groups.contains_key(&t.id))
        {
            return Err(ControlError::fatal(format!(
                "target group {} not found",
                missing.id
            )));
        }

        let id = state.next_id("lst");
        let info = ListenerInfo {
            id: id.clone(),
            load_balancer: load_balancer.to_owned(),
            port,
            default_action: default_action.to_vec(),
        };
        state.listeners.insert(id, info.clone());
        Ok(info)
    }

    async fn modify_listener(
        &self,
        listener: &str,
        default_action: &[TargetReference],
    ) -> ControlResult<()> {
        let mut state = self.state()?;
        state.record("modify_listener", listener)?;

        if let Some(missing) = default_action
            .iter()
            .find(|t| !state.target_groups.contains_key(&t.id))
        {
            return Err(ControlError::fatal(format!(
                "target group {} not found",
                missing.id
            )));
        }
        let info = state
            .listeners
            .get_mut(listener)
            .ok_or_else(|| ControlError::already_absent(format!("listener {listener}")))?;
        info.default_action = default_action.to_vec();
        Ok(())
    }

    async fn delete_listener(&self, listener: &str) -> ControlResult<()> {
        let mut state = self.state()?;
        state.record("delete_listener", listener)?;
        state
            .listeners
            .remove(listener)
            .map(|_| ())
            .ok_or_else(|| ControlError::already_absent(format!("listener {listener}")))
    }

    async fn create_or_find_target_group(&self, name: &str, _port: u16) -> ControlResult<String> {
        let mut state = self.state()?;
        state.record("create_or_find_target_group", name)?;

        if let Some((id, _)) = state.target_groups.iter().find(|(_, tg)| tg.name == name) {
            return Ok(id.clone());
        }
        let id = state.next_id("tg");
        state.target_groups.insert(
            id.clone(),
            MemTargetGroup {
                name: name.to_owned(),
                targets: Vec::new(),
                health_remaining: 0,
            },
        );
        Ok(id)
    }

    async fn register_targets(&self, target_group: &str, service: &str) -> ControlResult<()> {
        let mut state = self.state()?;
        state.record("register_targets", target_group)?;

        if !state.services.contains_key(service) {
            return Err(ControlError::fatal(format!("service {service} not found")));
        }
        let health_polls = self.config.health_polls;
        let tg = state
            .target_groups
            .get_mut(target_group)
            .ok_or_else(|| ControlError::fatal(format!("target group {target_group} not found")))?;
        if !tg.targets.iter().any(|t| t == service) {
            tg.targets.push(service.to_owned());
        }
        tg.health_remaining = health_polls;
        Ok(())
    }

    async fn describe_target_health(
        &self,
        target_group: &str,
    ) -> ControlResult<Vec<TargetHealth>> {
        let mut state = self.state()?;
        state.record("describe_target_health", target_group)?;

        let tg = state
            .target_groups
            .get_mut(target_group)
            .ok_or_else(|| ControlError::fatal(format!("target group {target_group} not found")))?;
        let health = if tg.health_remaining > 0 {
            tg.health_remaining -= 1;
            TargetHealth::Initial
        } else {
            TargetHealth::Healthy
        };
        Ok(tg.targets.iter().map(|_| health).collect())
    }

    async fn delete_target_group(&self, target_group: &str) -> ControlResult<()> {
        let mut state = self.state()?;
        state.record("delete_target_group", target_group)?;

        if !state.target_groups.contains_key(target_group) {
            return Err(ControlError::already_absent(format!(
                "target group {target_group}"
            )));
        }
        if state.target_group_in_use(target_group) {
            return Err(ControlError::fatal(format!(
                "target group {target_group} is in use by a listener"
            )));
        }
        state.target_groups.remove(target_group);
        Ok(())
    }

    async fn find_dns_record(&self, zone: &str, name: &str) -> ControlResult<Option<DnsRecord>> {
        let mut state = self.state()?;
        state.record("find_dns_record", name)?;
        Ok(state
            .dns
            .get(&(zone.to_owned(), name.to_owned()))
            .cloned())
    }

    async fn create_dns_alias(
        &self,
        zone: &str,
        name: &str,
        load_balancer: &LoadBalancerInfo,
    ) -> ControlResult<()> {
        let mut state = self.state()?;
        state.record("create_dns_alias", name)?;

        let key = (zone.to_owned(), name.to_owned());
        if state.dns.contains_key(&key) {
            return Err(ControlError::fatal(format!("record {name} already exists")));
        }
        state.dns.insert(
            key,
            DnsRecord {
                name: name.to_owned(),
                record_type: "A".to_owned(),
                target: load_balancer.dns_name.clone(),
            },
        );
        Ok(())
    }
}

#[async_trait]
impl SupportingResources for MemoryBackend {
    async fn ensure_cluster(&self, name: &str) -> ControlResult<String> {
        let mut state = self.state()?;
        state.record("ensure_cluster", name)?;
        let id = format!("cluster/{name}");
        state.clusters.insert(name.to_owned(), id.clone());
        Ok(id)
    }

    async fn find_cluster(&self, name: &str) -> ControlResult<Option<String>> {
        let mut state = self.state()?;
        state.record("find_cluster", name)?;
        Ok(state.clusters.get(name).cloned())
    }

    async fn count_services(&self, cluster: &str) -> ControlResult<usize> {
        let mut state = self.state()?;
        state.record("count_services", cluster)?;
        Ok(state
            .services
            .values()
            .filter(|s| s.placement.cluster.as_deref() == Some(cluster))
            .count())
    }

    async fn delete_cluster(&self, cluster: &str) -> ControlResult<()> {
        let mut state = self.state()?;
        state.record("delete_cluster", cluster)?;

        let Some(name) = state
            .clusters
            .iter()
            .find(|(_, id)| id.as_str() == cluster)
            .map(|(name, _)| name.clone())
        else {
            return Err(ControlError::already_absent(format!("cluster {cluster}")));
        };
        if state
            .services
            .values()
            .any(|s| s.placement.cluster.as_deref() == Some(cluster))
        {
            return Err(ControlError::fatal(format!(
                "cluster {cluster} still contains services"
            )));
        }
        state.clusters.remove(&name);
        Ok(())
    }

    async fn ensure_execution_role(&self, name: &str) -> ControlResult<String> {
        let mut state = self.state()?;
        state.record("ensure_execution_role", name)?;
        if let Some(id) = state.roles.get(name) {
            return Ok(id.clone());
        }
        let id = format!("role/{name}");
        state.roles.insert(name.to_owned(), id.clone());
        state.role_rejections = self.config.role_visibility_attempts;
        Ok(id)
    }

    async fn ensure_log_group(&self, name: &str) -> ControlResult<String> {
        let mut state = self.state()?;
        state.record("ensure_log_group", name)?;
        state.log_groups.insert(name.to_owned(), name.to_owned());
        Ok(name.to_owned())
    }

    async fn delete_log_group(&self, log_group: &str) -> ControlResult<()> {
        let mut state = self.state()?;
        state.record("delete_log_group", log_group)?;
        state
            .log_groups
            .remove(log_group)
            .map(|_| ())
            .ok_or_else(|| ControlError::already_absent(format!("log group {log_group}")))
    }

    async fn ensure_security_group(&self, name: &str, _port: u16) -> ControlResult<String> {
        let mut state = self.state()?;
        state.record("ensure_security_group", name)?;
        if let Some((id, _)) = state.security_groups.iter().find(|(_, sg)| sg.name == name) {
            return Ok(id.clone());
        }
        let id = state.next_id("sg");
        state.security_groups.insert(
            id.clone(),
            MemSecurityGroup {
                name: name.to_owned(),
                detach_remaining: self.config.detach_attempts,
            },
        );
        Ok(id)
    }

    async fn find_security_group(&self, name: &str) -> ControlResult<Option<String>> {
        let mut state = self.state()?;
        state.record("find_security_group", name)?;
        Ok(state
            .security_groups
            .iter()
            .find(|(_, sg)| sg.name == name)
            .map(|(id, _)| id.clone()))
    }

    async fn delete_security_group(&self, security_group: &str) -> ControlResult<()> {
        let mut state = self.state()?;
        state.record("delete_security_group", security_group)?;

        if !state.security_groups.contains_key(security_group) {
            return Err(ControlError::already_absent(format!(
                "security group {security_group}"
            )));
        }
        if state
            .services
            .values()
            .any(|s| s.placement.security_group.as_deref() == Some(security_group))
        {
            return Err(ControlError::retryable(format!(
                "security group {security_group} has a dependent object"
            )));
        }
        if let Some(sg) = state.security_groups.get_mut(security_group) {
            if sg.detach_remaining > 0 {
                sg.detach_remaining -= 1;
                return Err(ControlError::retryable(format!(
                    "security group {security_group} has network interfaces attached"
                )));
            }
        }
        state.security_groups.remove(security_group);
        Ok(())
    }

    async fn ensure_file_system(&self, name: &str) -> ControlResult<String> {
        let mut state = self.state()?;
        state.record("ensure_file_system", name)?;
        if let Some((id, _)) = state.file_systems.iter().find(|(_, fs)| fs.name == name) {
            return Ok(id.clone());
        }
        let id = state.next_id("fs");
        let mount_targets = ["a", "b"]
            .iter()
            .map(|zone| MemMountTarget {
                id: format!("fsmt-{id}-{zone}"),
                deleting: None,
            })
            .collect();
        state.file_systems.insert(
            id.clone(),
            MemFileSystem {
                name: name.to_owned(),
                mount_targets,
            },
        );
        Ok(id)
    }

    async fn find_file_system(&self, name: &str) -> ControlResult<Option<String>> {
        let mut state = self.state()?;
        state.record("find_file_system", name)?;
        Ok(state
            .file_systems
            .iter()
            .find(|(_, fs)| fs.name == name)
            .map(|(id, _)| id.clone()))
    }

    async fn list_mount_targets(&self, file_system: &str) -> ControlResult<Vec<MountTarget>> {
        let mut state = self.state()?;
        state.record("list_mount_targets", file_system)?;

        let fs = state
            .file_systems
            .get_mut(file_system)
            .ok_or_else(|| ControlError::already_absent(format!("file system {file_system}")))?;

        fs.mount_targets.retain(|mt| mt.deleting != Some(0));
        Ok(fs
            .mount_targets
            .iter_mut()
            .map(|mt| {
                let mt_state = match mt.deleting.as_mut() {
                    Some(left) => {
                        *left -= 1;
                        MountTargetState::Deleting
                    }
                    None => MountTargetState::Available,
                };
                MountTarget {
                    id: mt.id.clone(),
                    state: mt_state,
                }
            })
            .collect())
    }

    async fn delete_mount_target(&self, mount_target: &str) -> ControlResult<()> {
        let mut state = self.state()?;
        state.record("delete_mount_target", mount_target)?;

        let polls = self.config.mount_target_polls;
        for fs in state.file_systems.values_mut() {
            if let Some(pos) = fs.mount_targets.iter().position(|mt| mt.id == mount_target) {
                if polls == 0 {
                    fs.mount_targets.remove(pos);
                } else if let Some(mt) = fs.mount_targets.get_mut(pos) {
                    mt.deleting.get_or_insert(polls);
                }
                return Ok(());
            }
        }
        Err(ControlError::already_absent(format!(
            "mount target {mount_target}"
        )))
    }

    async fn delete_file_system(&self, file_system: &str) -> ControlResult<()> {
        let mut state = self.state()?;
        state.record("delete_file_system", file_system)?;

        let fs = state
            .file_systems
            .get(file_system)
            .ok_or_else(|| ControlError::already_absent(format!("file system {file_system}")))?;
        if !fs.mount_targets.is_empty() {
            return Err(ControlError::fatal(format!(
                "file system {file_system} still has mount targets"
            )));
        }
        state.file_systems.remove(file_system);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn backend() -> MemoryBackend {
        MemoryBackend::new(MemoryConfig::default())
    }

    #[test]
    fn task_size_table() {
        assert!(validate_task_size(256, 512).is_ok());
        assert!(validate_task_size(4096, 30720).is_ok());
        assert!(matches!(
            validate_task_size(256, 4096),
            Err(ControlError::InvalidSpec(_))
        ));
        assert!(matches!(
            validate_task_size(300, 512),
            Err(ControlError::InvalidSpec(_))
        ));
    }

    #[tokio::test]
    async fn operation_completes_after_configured_polls() {
        let backend = backend();
        let spec = ServiceSpec::new("web", "nginx:1.27", 80);
        let (_, handle) = backend
            .create_service(&spec, &Placement::default())
            .await
            .unwrap();

        let first = backend.poll_operation(&handle).await.unwrap();
        let second = backend.poll_operation(&handle).await.unwrap();
        let third = backend.poll_operation(&handle).await.unwrap();
        assert_eq!(first.state, crate::types::OperationState::InProgress);
        assert_eq!(second.state, crate::types::OperationState::InProgress);
        assert_eq!(third.state, crate::types::OperationState::Succeeded);
    }

    #[tokio::test]
    async fn deleted_service_drains_before_disappearing() {
        let backend = backend();
        let spec = ServiceSpec::new("web", "nginx:1.27", 80);
        backend
            .create_service(&spec, &Placement::default())
            .await
            .unwrap();
        backend.delete_service("web").await.unwrap();

        let draining = backend.find_service("web").await.unwrap().unwrap();
        assert!(!draining.running);
        assert!(backend.find_service("web").await.unwrap().is_none());
        assert!(backend
            .delete_service("web")
            .await
            .unwrap_err()
            .is_already_absent());
    }

    #[tokio::test]
    async fn new_role_is_not_visible_immediately() {
        let backend = MemoryBackend::new(MemoryConfig {
            role_visibility_attempts: 2,
            ..MemoryConfig::default()
        });
        let role = backend.ensure_execution_role("exec").await.unwrap();
        let placement = Placement {
            execution_role: Some(role),
            ..Placement::default()
        };
        let spec = ServiceSpec::new("web", "nginx:1.27", 80);

        for _ in 0..2 {
            let err = backend.create_service(&spec, &placement).await.unwrap_err();
            assert!(matches!(err, ControlError::Retryable(_)));
        }
        assert!(backend.create_service(&spec, &placement).await.is_ok());
    }

    #[tokio::test]
    async fn cluster_with_services_cannot_be_deleted() {
        let backend = backend();
        let cluster = backend.ensure_cluster("apps").await.unwrap();
        let placement = Placement {
            cluster: Some(cluster.clone()),
            ..Placement::default()
        };
        backend
            .create_service(&ServiceSpec::new("web", "nginx:1.27", 80), &placement)
            .await
            .unwrap();

        assert_eq!(backend.count_services(&cluster).await.unwrap(), 1);
        assert!(matches!(
            backend.delete_cluster(&cluster).await,
            Err(ControlError::Fatal(_))
        ));
    }

    #[tokio::test]
    async fn file_system_requires_mount_targets_gone() {
        let backend = backend();
        let fs = backend.ensure_file_system("data").await.unwrap();
        let targets = backend.list_mount_targets(&fs).await.unwrap();
        assert_eq!(targets.len(), 2);

        for mt in &targets {
            backend.delete_mount_target(&mt.id).await.unwrap();
        }
        assert!(backend.delete_file_system(&fs).await.is_err());

        let deleting = backend.list_mount_targets(&fs).await.unwrap();
        assert!(deleting
            .iter()
            .all(|mt| mt.state == MountTargetState::Deleting));
        assert!(backend.list_mount_targets(&fs).await.unwrap().is_empty());
        backend.delete_file_system(&fs).await.unwrap();
    }

    #[tokio::test]
    async fn injected_failures_run_out() {
        let backend = backend();
        backend
            .inject(
                "ensure_log_group",
                InjectedFailure::Retryable("throttled".to_owned()),
                1,
            )
            .unwrap();

        assert!(backend.ensure_log_group("logs").await.is_err());
        assert!(backend.ensure_log_group("logs").await.is_ok());
        assert_eq!(backend.calls_of("ensure_log_group").unwrap().len(), 2);
    }
}
