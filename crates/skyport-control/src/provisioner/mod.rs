//! Idempotent find-or-create provisioning.
//!
//! A [`Resource`] describes how to look one backend object up by name and how
//! to create or update it. The [`Provisioner`] runs that recipe: absent
//! means create, present and drifted means update, present and in line
//! means nothing happens and the returned operation handle is empty.
//! Mutating calls are wrapped in [`retry_fixed`]; lookups are not.

mod service;

pub use service::ServiceResource;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{default_classification, ControlError, ControlResult, ErrorClass};
use crate::retry::{retry_fixed, RetryPolicy};
use crate::types::OperationHandle;

/// A backend object that can be found by name and created or updated.
#[async_trait]
pub trait Resource: Send + Sync {
    /// What a lookup returns.
    type Observed: Send + Sync;

    /// Name used for lookups and log lines.
    fn name(&self) -> &str;

    /// Look the resource up.
    async fn find(&self) -> ControlResult<Option<Self::Observed>>;

    /// Create the resource, returning its id and the operation to wait on.
    async fn create(&self) -> ControlResult<(String, OperationHandle)>;

    /// Update an existing resource.
    async fn update(&self, existing: &Self::Observed) -> ControlResult<OperationHandle>;

    /// Identifier of an observed resource.
    fn id_of(&self, existing: &Self::Observed) -> String;

    /// Whether the observed resource needs an update.
    fn is_drifted(&self, existing: &Self::Observed) -> bool;

    /// Classify an error from this resource's backend.
    fn classify(&self, err: &ControlError) -> ErrorClass {
        default_classification(err)
    }
}

/// What provisioning did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// The resource did not exist.
    Created,
    /// The resource existed but had drifted.
    Updated,
    /// The resource existed and matched.
    Unchanged,
}

impl ProvisionOutcome {
    /// Get the outcome name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
        }
    }
}

/// Result of provisioning one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisioned {
    /// Backend identifier.
    pub resource_id: String,
    /// Operation to wait on; empty when nothing changed.
    pub operation: OperationHandle,
    /// What happened.
    pub outcome: ProvisionOutcome,
}

/// Runs find-or-create with retry.
#[derive(Debug, Clone)]
pub struct Provisioner {
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl Provisioner {
    /// Create a provisioner.
    #[must_use]
    pub const fn new(policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self { policy, cancel }
    }

    /// Retry policy used for mutating calls.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Bring a resource into existence and in line with its desired state.
    pub async fn provision<R>(&self, resource: &R) -> ControlResult<Provisioned>
    where
        R: Resource + ?Sized,
    {
        let name = resource.name();
        let classify = |err: &ControlError| resource.classify(err);

        match resource.find().await? {
            None => {
                info!(resource = name, "creating");
                let (resource_id, operation) = retry_fixed(
                    &self.policy,
                    &self.cancel,
                    &format!("create {name}"),
                    classify,
                    move || resource.create(),
                )
                .await?;
                Ok(Provisioned {
                    resource_id,
                    operation,
                    outcome: ProvisionOutcome::Created,
                })
            }
            Some(existing) if resource.is_drifted(&existing) => {
                let resource_id = resource.id_of(&existing);
                info!(resource = name, id = %resource_id, "updating drifted resource");
                let existing = &existing;
                let operation = retry_fixed(
                    &self.policy,
                    &self.cancel,
                    &format!("update {name}"),
                    classify,
                    move || resource.update(existing),
                )
                .await?;
                Ok(Provisioned {
                    resource_id,
                    operation,
                    outcome: ProvisionOutcome::Updated,
                })
            }
            Some(existing) => {
                let resource_id = resource.id_of(&existing);
                debug!(resource = name, id = %resource_id, "already up to date");
                Ok(Provisioned {
                    resource_id,
                    operation: OperationHandle::none(),
                    outcome: ProvisionOutcome::Unchanged,
                })
            }
        }
    }

    /// Run a single mutating call under the retry policy.
    pub async fn mutate<T, F, Fut, C>(&self, label: &str, classify: C, op: F) -> ControlResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = ControlResult<T>>,
        C: Fn(&ControlError) -> ErrorClass,
    {
        retry_fixed(&self.policy, &self.cancel, label, classify, op).await
    }
}
