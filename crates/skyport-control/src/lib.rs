//! Skyport Control
//!
//! Deploys, releases and tears down application workloads on container
//! schedulers, managed container services and a local container runtime,
//! and installs the Skyport server on those same backends.
//!
//! # Architecture
//!
//! Every operation is one-shot: do it, wait for it, return. The pieces are:
//!
//! - **Backend adapters**: one per platform, exposing find/create/update/delete
//!   of a service, operation polling and error classification. Load balancing
//!   and supporting resources are optional capabilities.
//! - **Provisioner**: find-or-create with fixed-interval retry of calls the
//!   backend rejects while a dependency is still becoming visible.
//! - **Operation poller**: turns an operation handle into a cancellable wait
//!   with a deadline. Every readiness wait uses the same loop.
//! - **Traffic cutover**: moves a listener's weighted forwarding set to a new
//!   target group and undoes it again during teardown.
//! - **Teardown**: deletes a deployment's resources in dependency order.
//! - **Lifecycle runner**: sequences Init, Run and Cleanup for deployments
//!   and control-plane installs.
//!
//! # State Machine
//!
//! Deployments follow a state machine enforced at compile time using the
//! typestate pattern:
//!
//! ```text
//! Pending ──▶ Deployed ◀──▶ Released
//!    │           │             │
//!    ▼           ▼             ▼
//!  Failed ──▶ Destroyed ◀──────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use skyport_control::backend::MemoryBackend;
//! use skyport_control::{ControlConfig, DeploymentManager, DeploymentRequest, MemoryStore};
//! use skyport_control::types::ServiceSpec;
//! use tokio_util::sync::CancellationToken;
//!
//! let manager = DeploymentManager::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(MemoryBackend::default()),
//!     &ControlConfig::default(),
//!     CancellationToken::new(),
//! );
//!
//! let record = manager
//!     .deploy(DeploymentRequest::new("web", ServiceSpec::new("web", "nginx:1.27", 80)))
//!     .await?;
//! let release = manager.release(&record.data.id).await?;
//! println!("serving at {}", release.url);
//! ```

#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

pub mod backend;
pub mod config;
pub mod cutover;
pub mod deployment;
pub mod error;
pub mod installer;
pub mod lifecycle;
pub mod poller;
pub mod provisioner;
pub mod retry;
pub mod state;
pub mod store;
pub mod teardown;
pub mod types;

// Re-export commonly used types at the crate root
pub use backend::{create_backend, BackendAdapter};
pub use config::{ControlConfig, Platform};
pub use deployment::{DeploymentManager, DeploymentRequest};
pub use error::{ControlError, ControlResult, ErrorClass};
pub use installer::{Installer, InstallerRegistry};
pub use lifecycle::{Lifecycle, Phase, StepReporter};
pub use state::{
    AnyDeployment, Deployed, Deployment, DeploymentState, Destroyed, Failed, Pending, Released,
};
pub use store::{DeploymentFilter, DeploymentStore, FileStore, MemoryStore};
pub use teardown::TeardownReport;
pub use types::{
    AppName, DeploymentData, DeploymentId, DeploymentRecord, OperationHandle, PersistedState,
    ServiceSpec,
};
