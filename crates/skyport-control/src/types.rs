//! Core types for skyport-control.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentId(String);

impl DeploymentId {
    /// Create a new deployment ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new unique deployment ID using ULID.
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short suffix used when naming per-deployment backend resources.
    ///
    /// ULIDs share their timestamp prefix, so the random tail is used.
    #[must_use]
    pub fn short(&self) -> &str {
        let len = self.0.len();
        self.0.get(len.saturating_sub(8)..).unwrap_or(&self.0)
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for DeploymentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Name of an application; deployments of the same app share a listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppName(String);

impl AppName {
    /// Create a new application name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for AppName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Opaque handle for an asynchronous remote operation.
///
/// An empty handle means the mutating call changed nothing and there is
/// nothing to wait for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationHandle(String);

impl OperationHandle {
    /// Create a handle from a backend-issued token.
    #[must_use]
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// The empty handle.
    #[must_use]
    pub const fn none() -> Self {
        Self(String::new())
    }

    /// Whether no operation is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Get the handle as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("<none>")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// Remote view of an operation's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    /// Still running.
    InProgress,
    /// Finished successfully.
    Succeeded,
    /// Finished with a failure.
    Failed,
    /// The remote reported something the adapter does not recognise.
    Unknown,
}

/// Status returned by an adapter when polling an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationStatus {
    /// Derived state.
    pub state: OperationState,
    /// Raw status string from the remote.
    pub message: String,
}

impl OperationStatus {
    /// Operation still running.
    #[must_use]
    pub fn in_progress(message: impl Into<String>) -> Self {
        Self {
            state: OperationState::InProgress,
            message: message.into(),
        }
    }

    /// Operation finished successfully.
    #[must_use]
    pub fn succeeded(message: impl Into<String>) -> Self {
        Self {
            state: OperationState::Succeeded,
            message: message.into(),
        }
    }

    /// Operation failed.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            state: OperationState::Failed,
            message: message.into(),
        }
    }

    /// Unrecognised status.
    #[must_use]
    pub fn unknown(message: impl Into<String>) -> Self {
        Self {
            state: OperationState::Unknown,
            message: message.into(),
        }
    }
}

/// Desired state of an application workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Backend-visible service name.
    pub name: String,
    /// Container image reference.
    pub image: String,
    /// Port the workload listens on.
    pub port: u16,
    /// Environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// CPU units (1024 per vCPU).
    #[serde(default = "default_cpu")]
    pub cpu: u32,
    /// Memory limit in MB.
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
    /// Number of running instances.
    #[serde(default = "default_replicas")]
    pub replicas: u32,
}

const fn default_cpu() -> u32 {
    256
}

const fn default_memory_mb() -> u32 {
    512
}

const fn default_replicas() -> u32 {
    1
}

impl ServiceSpec {
    /// Create a spec with default sizing.
    #[must_use]
    pub fn new(name: impl Into<String>, image: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            port,
            env: BTreeMap::new(),
            cpu: default_cpu(),
            memory_mb: default_memory_mb(),
            replicas: default_replicas(),
        }
    }

    /// Add an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set CPU and memory.
    #[must_use]
    pub const fn with_size(mut self, cpu: u32, memory_mb: u32) -> Self {
        self.cpu = cpu;
        self.memory_mb = memory_mb;
        self
    }

    /// Set the replica count.
    #[must_use]
    pub const fn with_replicas(mut self, replicas: u32) -> Self {
        self.replicas = replicas;
        self
    }
}

/// A service as observed on the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceState {
    /// Backend identifier.
    pub id: String,
    /// Service name.
    pub name: String,
    /// Image currently configured.
    pub image: String,
    /// Port currently configured.
    pub port: u16,
    /// Environment currently configured.
    pub env: BTreeMap<String, String>,
    /// Desired replica count.
    pub replicas: u32,
    /// CPU units reserved, if the backend reports sizing.
    pub cpu: Option<u32>,
    /// Memory reserved in MB, if the backend reports sizing.
    pub memory_mb: Option<u32>,
    /// Whether the backend considers the service live (not stopped or draining).
    pub running: bool,
    /// Cluster the service runs in, where the backend has one.
    pub cluster: Option<String>,
    /// Task or function definition backing the service.
    pub task_definition: Option<String>,
}

impl ServiceState {
    /// Whether the observed service differs from the desired spec.
    #[must_use]
    pub fn differs_from(&self, spec: &ServiceSpec) -> bool {
        !self.running
            || self.image != spec.image
            || self.port != spec.port
            || self.replicas != spec.replicas
            || self.env != spec.env
            || self.cpu.is_some_and(|cpu| cpu != spec.cpu)
            || self.memory_mb.is_some_and(|mb| mb != spec.memory_mb)
    }
}

/// Environment a service is placed into, prepared during the init phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    /// Cluster reference.
    pub cluster: Option<String>,
    /// Execution role the workload runs as.
    pub execution_role: Option<String>,
    /// Log group receiving workload output.
    pub log_group: Option<String>,
    /// Security group guarding the workload.
    pub security_group: Option<String>,
    /// Shared file system mounted into the workload.
    pub file_system: Option<String>,
}

/// A target group and the share of listener traffic it receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetReference {
    /// Target group reference.
    pub id: String,
    /// Traffic weight, 0 to 100.
    pub weight: u8,
}

impl TargetReference {
    /// Maximum weight; a target at this weight takes all traffic.
    pub const FULL: u8 = 100;

    /// Create a reference, clamping the weight to 100.
    #[must_use]
    pub fn new(id: impl Into<String>, weight: u8) -> Self {
        Self {
            id: id.into(),
            weight: weight.min(Self::FULL),
        }
    }

    /// Create a reference receiving all traffic.
    #[must_use]
    pub fn full(id: impl Into<String>) -> Self {
        Self::new(id, Self::FULL)
    }

    /// Whether this reference receives any traffic.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.weight > 0
    }
}

impl fmt::Display for TargetReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.weight)
    }
}

/// Where a release attaches: an existing load balancer or an existing listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum TrafficEntry {
    /// A load balancer that may not have a listener yet.
    LoadBalancer(String),
    /// A listener whose default action will be rewritten.
    Listener(String),
}

/// References to everything a deployment created or attached to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRefs {
    /// Service name on the backend; lookups and deletes go by name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Task or function definition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_definition: Option<String>,
    /// Target group the service is registered in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_group: Option<String>,
    /// Load balancer fronting the target group.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<String>,
    /// Listener forwarding to the target group.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listener: Option<String>,
    /// Cluster the service runs in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    /// Log group.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_group: Option<String>,
    /// Security group.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_group: Option<String>,
    /// Shared file system.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_system: Option<String>,
}

impl ResourceRefs {
    /// Build references from a placement.
    #[must_use]
    pub fn from_placement(placement: &Placement) -> Self {
        Self {
            cluster: placement.cluster.clone(),
            log_group: placement.log_group.clone(),
            security_group: placement.security_group.clone(),
            file_system: placement.file_system.clone(),
            ..Self::default()
        }
    }

    /// Whether nothing is referenced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Result of releasing a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseData {
    /// Public URL serving the release.
    pub url: String,
    /// Load balancer the release is served from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<String>,
    /// Listener the release is served from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listener: Option<String>,
    /// When the release happened.
    pub released_at: DateTime<Utc>,
}

/// Common data shared across all deployment states.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentData {
    /// Unique deployment identifier.
    pub id: DeploymentId,
    /// Application this deployment belongs to.
    pub app: AppName,
    /// Backend platform the deployment was made on.
    pub platform: String,
    /// Region or cluster reference on the backend.
    pub region: String,
    /// Desired workload.
    pub spec: ServiceSpec,
    /// Backend resources owned or referenced by the deployment.
    #[serde(default)]
    pub resources: ResourceRefs,
    /// Last operation issued for this deployment.
    #[serde(default)]
    pub last_operation: OperationHandle,
    /// Endpoint reported by the backend for the service itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_endpoint: Option<String>,
    /// Release information once released.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release: Option<ReleaseData>,
    /// When the deployment was created.
    pub created_at: DateTime<Utc>,
    /// When the deployment was last updated.
    pub updated_at: DateTime<Utc>,
    /// Error message if the deployment failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeploymentData {
    /// Create new deployment data.
    #[must_use]
    pub fn new(
        app: AppName,
        platform: impl Into<String>,
        region: impl Into<String>,
        spec: ServiceSpec,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: DeploymentId::generate(),
            app,
            platform: platform.into(),
            region: region.into(),
            spec,
            resources: ResourceRefs::default(),
            last_operation: OperationHandle::none(),
            public_endpoint: None,
            release: None,
            created_at: now,
            updated_at: now,
            error: None,
        }
    }
}

/// Persisted state representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistedState {
    /// Deployment created, backend work not finished.
    Pending,
    /// Service is running on the backend.
    Deployed,
    /// Service receives public traffic.
    Released,
    /// Backend resources were torn down.
    Destroyed,
    /// Deployment failed.
    Failed,
}

impl PersistedState {
    /// Get the state name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Deployed => "deployed",
            Self::Released => "released",
            Self::Destroyed => "destroyed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for PersistedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PersistedState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "deployed" => Ok(Self::Deployed),
            "released" => Ok(Self::Released),
            "destroyed" => Ok(Self::Destroyed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown deployment state: {s}")),
        }
    }
}

/// A deployment record as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    /// The deployment data.
    #[serde(flatten)]
    pub data: DeploymentData,
    /// Current state.
    pub state: PersistedState,
}

impl DeploymentRecord {
    /// Create a new deployment record in the pending state.
    #[must_use]
    pub const fn new(data: DeploymentData) -> Self {
        Self {
            data,
            state: PersistedState::Pending,
        }
    }
}
