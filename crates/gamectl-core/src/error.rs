//! Error taxonomy for the control plane.
//!
//! Synchronous operations return these directly; asynchronous failures
//! (crashes, restart exhaustion, per-target batch failures) surface through
//! events and record status fields instead, never through a caller-visible
//! `Err`.

use thiserror::Error;

/// Errors from single-instance supervisor operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Launch configuration is unset or points at missing files.
    #[error("invalid launch configuration for '{instance_id}': {reason}")]
    InvalidConfig {
        instance_id: String,
        reason: String,
    },

    /// A live process handle is already registered for the instance.
    #[error("instance '{0}' is already running")]
    AlreadyRunning(String),

    /// No live process handle, or status is not `running`.
    #[error("instance '{0}' is not running")]
    NotRunning(String),

    /// The OS refused to spawn the child process.
    #[error("failed to spawn process for '{instance_id}': {source}")]
    SpawnFailure {
        instance_id: String,
        #[source]
        source: std::io::Error,
    },

    /// Pipe or log sink I/O failed.
    #[error("i/o failure for '{instance_id}': {source}")]
    Io {
        instance_id: String,
        #[source]
        source: std::io::Error,
    },

    /// The instance ID is unknown to the store.
    #[error("instance '{0}' not found")]
    NotFound(String),
}

/// Errors from batch-operation submission and management.
#[derive(Debug, Error)]
pub enum BatchError {
    /// Bad batch input (empty target list, malformed operation kind).
    #[error("invalid batch request: {0}")]
    Validation(String),

    /// A target instance does not exist; no operation record was created.
    #[error("instance '{0}' not found")]
    TargetNotFound(String),

    /// The operation ID is unknown.
    #[error("batch operation '{0}' not found")]
    OperationNotFound(String),

    /// The operation is past the point where the request makes sense
    /// (e.g. cancelling a batch that already started).
    #[error("batch operation '{id}' is {state}; {reason}")]
    InvalidState {
        id: String,
        state: String,
        reason: String,
    },
}

/// Errors from the instance store port.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("instance '{0}' not found")]
    NotFound(String),

    #[error("store i/o failure: {0}")]
    Io(String),
}

impl From<StoreError> for SupervisorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::Io(msg) => Self::Io {
                instance_id: String::new(),
                source: std::io::Error::other(msg),
            },
        }
    }
}
