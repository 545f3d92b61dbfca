//! Application deployments.
//!
//! [`DeployPipeline`] is the lifecycle that places one service on a backend;
//! [`DeploymentManager`] drives it and records every state change so later
//! invocations can release or destroy what an earlier one deployed.

mod manager;
mod pipeline;

pub use manager::{DeploymentManager, DeploymentRequest, DeploymentStatus, PruneReport};
pub use pipeline::{DeployOutcome, DeployPipeline, EnvironmentNames};
