//! Configuration for skyport-control.

use std::path::PathBuf;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{ControlError, ControlResult};

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    /// Backend platform deployments go to.
    #[serde(default)]
    pub platform: Platform,

    /// Cluster or region reference used on the backend.
    #[serde(default = "default_cluster")]
    pub cluster: String,

    /// Retry behaviour for mutating calls.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Operation polling behaviour.
    #[serde(default)]
    pub poll: PollConfig,

    /// Release behaviour.
    #[serde(default)]
    pub release: ReleaseConfig,

    /// Deployment record storage.
    #[serde(default)]
    pub store: StoreConfig,

    /// Control-plane server workload.
    #[serde(default)]
    pub install: InstallConfig,

    /// Local container runtime backend.
    #[serde(default)]
    pub docker: DockerConfig,

    /// Nomad backend.
    #[serde(default)]
    pub nomad: NomadConfig,

    /// Kubernetes backend.
    #[serde(default)]
    pub kubernetes: KubernetesConfig,

    /// In-process managed container backend.
    #[serde(default)]
    pub memory: MemoryConfig,
}

impl ControlConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `skyport.toml` in the current directory (if present)
    /// 3. Environment variables with `SKYPORT_` prefix
    pub fn load() -> ControlResult<Self> {
        Figment::new()
            .merge(Toml::file("skyport.toml"))
            .merge(Env::prefixed("SKYPORT_").split("__"))
            .extract()
            .map_err(|e| ControlError::Config(e.to_string()))
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> ControlResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SKYPORT_").split("__"))
            .extract()
            .map_err(|e| ControlError::Config(e.to_string()))
    }
}

fn default_cluster() -> String {
    "skyport".to_owned()
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            platform: Platform::default(),
            cluster: default_cluster(),
            retry: RetryConfig::default(),
            poll: PollConfig::default(),
            release: ReleaseConfig::default(),
            store: StoreConfig::default(),
            install: InstallConfig::default(),
            docker: DockerConfig::default(),
            nomad: NomadConfig::default(),
            kubernetes: KubernetesConfig::default(),
            memory: MemoryConfig::default(),
        }
    }
}

/// Backend platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// Local Docker engine.
    #[default]
    Docker,
    /// HashiCorp Nomad.
    Nomad,
    /// Kubernetes.
    Kubernetes,
    /// In-process managed container service.
    Memory,
}

impl Platform {
    /// Get the platform name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Nomad => "nomad",
            Self::Kubernetes => "kubernetes",
            Self::Memory => "memory",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Platform {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "docker" => Ok(Self::Docker),
            "nomad" => Ok(Self::Nomad),
            "kubernetes" => Ok(Self::Kubernetes),
            "memory" => Ok(Self::Memory),
            other => Err(ControlError::UnknownPlatform(other.to_owned())),
        }
    }
}

/// Retry behaviour for mutating calls rejected by eventual consistency.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,

    /// Pause between attempts in milliseconds.
    #[serde(default = "default_retry_interval_ms")]
    pub interval_ms: u64,
}

const fn default_retry_attempts() -> u32 {
    30
}

const fn default_retry_interval_ms() -> u64 {
    2_000
}

impl RetryConfig {
    /// Pause between attempts.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_retry_attempts(),
            interval_ms: default_retry_interval_ms(),
        }
    }
}

/// Operation polling behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct PollConfig {
    /// Time between status queries in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,

    /// Overall deadline in seconds.
    #[serde(default = "default_poll_timeout_secs")]
    pub timeout_secs: u64,
}

const fn default_poll_interval_ms() -> u64 {
    5_000
}

const fn default_poll_timeout_secs() -> u64 {
    600 // 10 minutes
}

impl PollConfig {
    /// Time between status queries.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Overall deadline.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            timeout_secs: default_poll_timeout_secs(),
        }
    }
}

/// Release behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseConfig {
    /// Port the listener accepts traffic on.
    #[serde(default = "default_listener_port")]
    pub listener_port: u16,

    /// Existing load balancer to attach releases to.
    pub load_balancer: Option<String>,

    /// DNS zone for the release hostname.
    pub dns_zone: Option<String>,

    /// Hostname aliased to the load balancer.
    pub hostname: Option<String>,

    /// Number of deployments per app kept by `prune`.
    #[serde(default = "default_retain")]
    pub retain: usize,
}

const fn default_listener_port() -> u16 {
    80
}

const fn default_retain() -> usize {
    3
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            listener_port: default_listener_port(),
            load_balancer: None,
            dns_zone: None,
            hostname: None,
            retain: default_retain(),
        }
    }
}

/// Deployment record storage.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Storage backend.
    #[serde(default)]
    pub kind: StoreKind,

    /// Directory holding one JSON file per deployment.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".skyport/deployments")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            path: default_store_path(),
        }
    }
}

/// Type of deployment store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// JSON files on disk.
    #[default]
    File,
    /// Process memory, lost on exit.
    Memory,
}

/// Control-plane server workload.
#[derive(Debug, Clone, Deserialize)]
pub struct InstallConfig {
    /// Service name of the server.
    #[serde(default = "default_install_name")]
    pub name: String,

    /// Server image.
    #[serde(default = "default_install_image")]
    pub image: String,

    /// Port the server listens on.
    #[serde(default = "default_install_port")]
    pub port: u16,

    /// CPU units.
    #[serde(default = "default_install_cpu")]
    pub cpu: u32,

    /// Memory in MB.
    #[serde(default = "default_install_memory_mb")]
    pub memory_mb: u32,

    /// Provision a shared file system for server state.
    #[serde(default = "default_true")]
    pub storage: bool,

    /// HTTP path that answers 2xx once the server is ready. `None` skips the check.
    #[serde(default = "default_health_path")]
    pub health_path: Option<String>,

    /// How long to wait for the server endpoint, in seconds.
    #[serde(default = "default_endpoint_timeout_secs")]
    pub endpoint_timeout_secs: u64,
}

fn default_install_name() -> String {
    "skyport-server".to_owned()
}

fn default_install_image() -> String {
    "ghcr.io/skyport-dev/skyport-server:latest".to_owned()
}

const fn default_install_port() -> u16 {
    9701
}

const fn default_install_cpu() -> u32 {
    512
}

const fn default_install_memory_mb() -> u32 {
    1024
}

const fn default_true() -> bool {
    true
}

#[allow(clippy::unnecessary_wraps)]
fn default_health_path() -> Option<String> {
    Some("/health".to_owned())
}

const fn default_endpoint_timeout_secs() -> u64 {
    300
}

impl InstallConfig {
    /// Deadline for the endpoint readiness check.
    #[must_use]
    pub const fn endpoint_timeout(&self) -> Duration {
        Duration::from_secs(self.endpoint_timeout_secs)
    }
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            name: default_install_name(),
            image: default_install_image(),
            port: default_install_port(),
            cpu: default_install_cpu(),
            memory_mb: default_install_memory_mb(),
            storage: default_true(),
            health_path: default_health_path(),
            endpoint_timeout_secs: default_endpoint_timeout_secs(),
        }
    }
}

/// Local Docker engine.
#[derive(Debug, Clone, Deserialize)]
pub struct DockerConfig {
    /// Engine API base URL.
    #[serde(default = "default_docker_host")]
    pub host: String,

    /// Host name used in published endpoints.
    #[serde(default = "default_public_host")]
    pub public_host: String,

    /// Network containers join.
    pub network: Option<String>,
}

fn default_docker_host() -> String {
    "http://127.0.0.1:2375".to_owned()
}

fn default_public_host() -> String {
    "localhost".to_owned()
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            host: default_docker_host(),
            public_host: default_public_host(),
            network: None,
        }
    }
}

/// HashiCorp Nomad.
#[derive(Debug, Clone, Deserialize)]
pub struct NomadConfig {
    /// HTTP API address.
    #[serde(default = "default_nomad_address")]
    pub address: String,

    /// Datacenter jobs are placed in.
    #[serde(default = "default_datacenter")]
    pub datacenter: String,

    /// Namespace, if not the default one.
    pub namespace: Option<String>,

    /// ACL token.
    pub token: Option<String>,
}

fn default_nomad_address() -> String {
    "http://127.0.0.1:4646".to_owned()
}

fn default_datacenter() -> String {
    "dc1".to_owned()
}

impl Default for NomadConfig {
    fn default() -> Self {
        Self {
            address: default_nomad_address(),
            datacenter: default_datacenter(),
            namespace: None,
            token: None,
        }
    }
}

/// Kubernetes.
#[derive(Debug, Clone, Deserialize)]
pub struct KubernetesConfig {
    /// API server URL.
    #[serde(default = "default_api_server")]
    pub api_server: String,

    /// Namespace workloads are created in.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Bearer token.
    pub token: Option<String>,

    /// File holding the bearer token, read when `token` is unset.
    #[serde(default = "default_token_file")]
    pub token_file: PathBuf,

    /// Service type used to expose workloads.
    #[serde(default = "default_service_type")]
    pub service_type: String,

    /// Skip TLS verification of the API server.
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

fn default_api_server() -> String {
    "https://kubernetes.default.svc".to_owned()
}

fn default_namespace() -> String {
    "default".to_owned()
}

fn default_token_file() -> PathBuf {
    PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/token")
}

fn default_service_type() -> String {
    "LoadBalancer".to_owned()
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            api_server: default_api_server(),
            namespace: default_namespace(),
            token: None,
            token_file: default_token_file(),
            service_type: default_service_type(),
            accept_invalid_certs: false,
        }
    }
}

/// In-process managed container service.
///
/// The delays model how long the remote takes to converge. They count calls,
/// not wall-clock time, so behaviour is deterministic.
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryConfig {
    /// Polls before a create/update operation completes.
    #[serde(default = "default_operation_polls")]
    pub operation_polls: u32,

    /// Service creates rejected after a new execution role appears.
    #[serde(default)]
    pub role_visibility_attempts: u32,

    /// Lookups a deleted service stays visible while draining.
    #[serde(default = "default_drain_polls")]
    pub drain_polls: u32,

    /// Security group deletes rejected while interfaces detach.
    #[serde(default)]
    pub detach_attempts: u32,

    /// Lookups a deleted mount target stays in the deleting state.
    #[serde(default = "default_drain_polls")]
    pub mount_target_polls: u32,

    /// Lookups before a registered target reports healthy.
    #[serde(default)]
    pub health_polls: u32,

    /// Endpoint reported for every service. Unset means none is published.
    pub endpoint: Option<String>,
}

const fn default_operation_polls() -> u32 {
    2
}

const fn default_drain_polls() -> u32 {
    1
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            operation_polls: default_operation_polls(),
            role_visibility_attempts: 0,
            drain_polls: default_drain_polls(),
            detach_attempts: 0,
            mount_target_polls: default_drain_polls(),
            health_polls: 0,
            endpoint: None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ControlConfig::default();
        assert_eq!(config.platform, Platform::Docker);
        assert_eq!(config.retry.attempts, 30);
        assert_eq!(config.retry.interval(), Duration::from_secs(2));
        assert_eq!(config.poll.timeout(), Duration::from_secs(600));
        assert_eq!(config.release.listener_port, 80);
        assert_eq!(config.install.health_path.as_deref(), Some("/health"));
    }

    #[test]
    fn config_from_toml() {
        let toml = r#"
            platform = "nomad"
            cluster = "edge"

            [retry]
            attempts = 5
            interval_ms = 100

            [release]
            dns_zone = "Z123"
            hostname = "app.example.com"

            [nomad]
            address = "http://nomad.service:4646"
            namespace = "apps"
        "#;

        let config: ControlConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.platform, Platform::Nomad);
        assert_eq!(config.cluster, "edge");
        assert_eq!(config.retry.attempts, 5);
        assert_eq!(config.retry.interval(), Duration::from_millis(100));
        assert_eq!(config.release.hostname.as_deref(), Some("app.example.com"));
        assert_eq!(config.nomad.namespace.as_deref(), Some("apps"));
        assert_eq!(config.nomad.datacenter, "dc1");
    }

    #[test]
    fn platform_from_str() {
        assert_eq!("memory".parse::<Platform>().unwrap(), Platform::Memory);
        assert!(matches!(
            "ecs".parse::<Platform>(),
            Err(ControlError::UnknownPlatform(_))
        ));
    }
}
