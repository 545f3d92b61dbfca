//! Error types for skyport-control.

use std::fmt;
use std::time::Duration;

/// Result type alias using [`ControlError`].
pub type ControlResult<T> = Result<T, ControlError>;

/// How a backend judges a failed call.
///
/// Adapters return this from `classify_error`; the retry and polling code
/// never looks at transport-level error types directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The remote rejected the call because something it depends on is not
    /// visible yet. Worth trying again after a short pause.
    Retryable,
    /// Authorisation, validation or unsupported feature. Never retried.
    Fatal,
    /// The adapter does not recognise the failure. Surfaced without retry.
    Unknown,
}

impl ErrorClass {
    /// Get the class name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Retryable => "retryable",
            Self::Fatal => "fatal",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur in the control plane.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// The remote rejected the call because a dependency is not yet visible.
    #[error("remote rejected request, retry later: {0}")]
    Retryable(String),

    /// Authorisation, validation or other non-recoverable remote failure.
    #[error("remote rejected request: {0}")]
    Fatal(String),

    /// The resource is already gone.
    #[error("resource already absent: {0}")]
    AlreadyAbsent(String),

    /// Non-success HTTP status from a backend API.
    #[error("remote API returned {status}: {message}")]
    Remote {
        /// HTTP status code.
        status: u16,
        /// Body or message returned by the remote.
        message: String,
    },

    /// Polling observed a terminal failure state.
    #[error("operation {handle} failed: {status}")]
    OperationFailed {
        /// Operation handle that failed.
        handle: String,
        /// Status string reported by the remote.
        status: String,
    },

    /// Waiting was abandoned because the deadline passed or the caller cancelled.
    #[error("stopped waiting for {target} after {elapsed:?} (last status: {last_status})")]
    Aborted {
        /// What was being waited on.
        target: String,
        /// Last status observed before giving up.
        last_status: String,
        /// Time spent waiting.
        elapsed: Duration,
    },

    /// The desired spec is invalid for the selected backend.
    #[error("invalid service spec: {0}")]
    InvalidSpec(String),

    /// The selected backend does not support the requested capability.
    #[error("unsupported by {backend}: {what}")]
    Unsupported {
        /// Backend name.
        backend: &'static str,
        /// Capability that was requested.
        what: String,
    },

    /// A lifecycle phase failed.
    #[error("{lifecycle} {phase} phase failed: {source}")]
    Phase {
        /// Lifecycle name.
        lifecycle: String,
        /// Phase that failed.
        phase: &'static str,
        /// Underlying error.
        #[source]
        source: Box<ControlError>,
    },

    /// Deployment not found.
    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    /// Invalid state transition attempted.
    #[error("invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: &'static str,
        /// Attempted target state.
        to: &'static str,
    },

    /// Unknown platform name.
    #[error("unknown platform: {0}")]
    UnknownPlatform(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Deployment store error.
    #[error("store error: {0}")]
    Store(String),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Create a retryable error.
    #[must_use]
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    /// Create a fatal error.
    #[must_use]
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Create an already-absent error.
    #[must_use]
    pub fn already_absent(msg: impl Into<String>) -> Self {
        Self::AlreadyAbsent(msg.into())
    }

    /// Create an unsupported-capability error.
    #[must_use]
    pub fn unsupported(backend: &'static str, what: impl Into<String>) -> Self {
        Self::Unsupported {
            backend,
            what: what.into(),
        }
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error reports that the resource no longer exists.
    #[must_use]
    pub const fn is_already_absent(&self) -> bool {
        matches!(self, Self::AlreadyAbsent(_))
    }

    /// Whether this error means we stopped waiting rather than saw a failure.
    #[must_use]
    pub const fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    /// Strip any lifecycle phase wrappers.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Phase { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Classification shared by every adapter for the backend-neutral variants.
///
/// Adapters override `classify_error` to add their own status codes and
/// fall back to this for everything else.
#[must_use]
pub fn default_classification(err: &ControlError) -> ErrorClass {
    match err {
        ControlError::Retryable(_) => ErrorClass::Retryable,
        ControlError::Http(e) if e.is_connect() || e.is_timeout() => ErrorClass::Retryable,
        ControlError::Remote { status, .. } if *status == 429 || *status >= 502 => {
            ErrorClass::Retryable
        }
        ControlError::Fatal(_)
        | ControlError::InvalidSpec(_)
        | ControlError::Unsupported { .. }
        | ControlError::Config(_)
        | ControlError::OperationFailed { .. } => ErrorClass::Fatal,
        ControlError::Remote { status, .. } if (400..500).contains(status) => ErrorClass::Fatal,
        _ => ErrorClass::Unknown,
    }
}
