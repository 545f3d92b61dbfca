//! Typestate pattern for the deployment state machine.
//!
//! Deployment states are encoded in the type system, so releasing a deployment
//! that never finished deploying, or destroying one twice, does not compile.
//!
//! ```text
//! Pending ──▶ Deployed ◀──▶ Released
//!    │           │             │
//!    ▼           ▼             ▼
//!  Failed ──▶ Destroyed ◀──────┘
//! ```
//!
//! `Released ──▶ Deployed` is the retire edge taken when a newer deployment
//! of the same app takes over the listener.

use std::marker::PhantomData;

use crate::error::{ControlError, ControlResult};
use crate::types::{
    DeploymentData, DeploymentId, OperationHandle, PersistedState, ReleaseData, ResourceRefs,
};

// =============================================================================
// State marker types (zero-sized)
// =============================================================================

/// Marker trait for deployment states.
pub trait DeploymentState: private::Sealed + Send + Sync {
    /// Get the persisted state representation.
    fn persisted() -> PersistedState;

    /// Get the state name for error messages.
    fn name() -> &'static str;
}

mod private {
    pub trait Sealed {}
}

/// Deployment created, backend work in progress.
#[derive(Debug, Clone, Copy)]
pub struct Pending;

/// Service is running on the backend.
#[derive(Debug, Clone, Copy)]
pub struct Deployed;

/// Service receives public traffic.
#[derive(Debug, Clone, Copy)]
pub struct Released;

/// Backend resources were torn down.
#[derive(Debug, Clone, Copy)]
pub struct Destroyed;

/// Deployment failed.
#[derive(Debug, Clone, Copy)]
pub struct Failed;

impl private::Sealed for Pending {}
impl private::Sealed for Deployed {}
impl private::Sealed for Released {}
impl private::Sealed for Destroyed {}
impl private::Sealed for Failed {}

macro_rules! impl_state {
    ($ty:ty, $persisted:expr, $name:literal) => {
        impl DeploymentState for $ty {
            fn persisted() -> PersistedState {
                $persisted
            }
            fn name() -> &'static str {
                $name
            }
        }
    };
}

impl_state!(Pending, PersistedState::Pending, "pending");
impl_state!(Deployed, PersistedState::Deployed, "deployed");
impl_state!(Released, PersistedState::Released, "released");
impl_state!(Destroyed, PersistedState::Destroyed, "destroyed");
impl_state!(Failed, PersistedState::Failed, "failed");

// =============================================================================
// Deployment struct parameterised by state
// =============================================================================

/// A deployment in a specific state.
#[derive(Debug)]
pub struct Deployment<S: DeploymentState> {
    data: DeploymentData,
    _state: PhantomData<S>,
}

impl<S: DeploymentState> Deployment<S> {
    /// Get a reference to the deployment data.
    #[must_use]
    pub const fn data(&self) -> &DeploymentData {
        &self.data
    }

    /// Get the deployment ID.
    #[must_use]
    pub const fn id(&self) -> &DeploymentId {
        &self.data.id
    }

    /// Get the current state as a persisted value.
    #[must_use]
    pub fn state(&self) -> PersistedState {
        S::persisted()
    }

    /// Get the state name.
    #[must_use]
    pub fn state_name(&self) -> &'static str {
        S::name()
    }

    /// Convert into the underlying data.
    #[must_use]
    pub fn into_data(self) -> DeploymentData {
        self.data
    }

    fn transition_with<T: DeploymentState>(
        mut self,
        f: impl FnOnce(&mut DeploymentData),
    ) -> Deployment<T> {
        f(&mut self.data);
        self.data.updated_at = chrono::Utc::now();
        Deployment {
            data: self.data,
            _state: PhantomData,
        }
    }
}

// =============================================================================
// State transitions
// =============================================================================

impl Deployment<Pending> {
    /// Create a new deployment in the pending state.
    #[must_use]
    pub const fn create(data: DeploymentData) -> Self {
        Self {
            data,
            _state: PhantomData,
        }
    }

    /// Record backend resources once the service is up.
    #[must_use]
    pub fn deployed(
        self,
        resources: ResourceRefs,
        operation: OperationHandle,
        public_endpoint: Option<String>,
    ) -> Deployment<Deployed> {
        self.transition_with(|data| {
            data.resources = resources;
            data.last_operation = operation;
            data.public_endpoint = public_endpoint;
        })
    }

    /// Transition to the failed state, keeping whatever was created so far.
    #[must_use]
    pub fn fail(self, resources: ResourceRefs, error: String) -> Deployment<Failed> {
        self.transition_with(|data| {
            data.resources = resources;
            data.error = Some(error);
        })
    }
}

impl Deployment<Deployed> {
    /// Transition to the released state.
    #[must_use]
    pub fn release(self, release: ReleaseData) -> Deployment<Released> {
        self.transition_with(|data| {
            if release.listener.is_some() {
                data.resources.listener.clone_from(&release.listener);
            }
            if release.load_balancer.is_some() {
                data.resources.load_balancer.clone_from(&release.load_balancer);
            }
            data.release = Some(release);
        })
    }

    /// Transition to the destroyed state.
    #[must_use]
    pub fn destroy(self) -> Deployment<Destroyed> {
        self.transition_with(|data| data.last_operation = OperationHandle::none())
    }
}

impl Deployment<Released> {
    /// Step back to deployed when another deployment takes the traffic.
    ///
    /// Listener and load balancer references are kept so teardown can still
    /// remove this deployment's target from the listener.
    #[must_use]
    pub fn retire(self) -> Deployment<Deployed> {
        self.transition_with(|data| data.release = None)
    }

    /// Transition to the destroyed state.
    #[must_use]
    pub fn destroy(self) -> Deployment<Destroyed> {
        self.transition_with(|data| {
            data.release = None;
            data.last_operation = OperationHandle::none();
        })
    }
}

impl Deployment<Failed> {
    /// Tear down what a failed deployment left behind.
    #[must_use]
    pub fn destroy(self) -> Deployment<Destroyed> {
        self.transition_with(|data| data.last_operation = OperationHandle::none())
    }
}

// =============================================================================
// Loading from persisted state
// =============================================================================

/// A type-erased deployment that can be in any state.
#[derive(Debug)]
pub enum AnyDeployment {
    /// Deployment in pending state.
    Pending(Deployment<Pending>),
    /// Deployment in deployed state.
    Deployed(Deployment<Deployed>),
    /// Deployment in released state.
    Released(Deployment<Released>),
    /// Deployment in destroyed state.
    Destroyed(Deployment<Destroyed>),
    /// Deployment in failed state.
    Failed(Deployment<Failed>),
}

impl AnyDeployment {
    /// Create an `AnyDeployment` from data and persisted state.
    #[must_use]
    pub const fn from_persisted(data: DeploymentData, state: PersistedState) -> Self {
        match state {
            PersistedState::Pending => Self::Pending(Deployment {
                data,
                _state: PhantomData,
            }),
            PersistedState::Deployed => Self::Deployed(Deployment {
                data,
                _state: PhantomData,
            }),
            PersistedState::Released => Self::Released(Deployment {
                data,
                _state: PhantomData,
            }),
            PersistedState::Destroyed => Self::Destroyed(Deployment {
                data,
                _state: PhantomData,
            }),
            PersistedState::Failed => Self::Failed(Deployment {
                data,
                _state: PhantomData,
            }),
        }
    }

    /// Get a reference to the deployment data.
    #[must_use]
    pub const fn data(&self) -> &DeploymentData {
        match self {
            Self::Pending(d) => d.data(),
            Self::Deployed(d) => d.data(),
            Self::Released(d) => d.data(),
            Self::Destroyed(d) => d.data(),
            Self::Failed(d) => d.data(),
        }
    }

    /// Get the deployment ID.
    #[must_use]
    pub const fn id(&self) -> &DeploymentId {
        &self.data().id
    }

    /// Get the current state.
    #[must_use]
    pub const fn state(&self) -> PersistedState {
        match self {
            Self::Pending(_) => PersistedState::Pending,
            Self::Deployed(_) => PersistedState::Deployed,
            Self::Released(_) => PersistedState::Released,
            Self::Destroyed(_) => PersistedState::Destroyed,
            Self::Failed(_) => PersistedState::Failed,
        }
    }

    /// Try to extract a deployed deployment.
    pub fn try_into_deployed(self) -> ControlResult<Deployment<Deployed>> {
        match self {
            Self::Deployed(d) => Ok(d),
            other => Err(ControlError::InvalidStateTransition {
                from: other.state().as_str(),
                to: "deployed",
            }),
        }
    }

    /// Try to extract a released deployment.
    pub fn try_into_released(self) -> ControlResult<Deployment<Released>> {
        match self {
            Self::Released(d) => Ok(d),
            other => Err(ControlError::InvalidStateTransition {
                from: other.state().as_str(),
                to: "released",
            }),
        }
    }

    /// Whether the deployment can no longer change.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Destroyed(_))
    }
}
