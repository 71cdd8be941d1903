use thiserror::Error;
use transport::TransportError;

/// Error kinds produced by an [`crate::ExecutionBackend`].
///
/// Propagation policy (matches the canonical behavior described for every
/// back-end): `Transport` and `ResourceNotReady` propagate upward unchanged
/// so the orchestrator loop can retry. `InstanceNotFound` during
/// `update_state` flips the task to `Terminated` with a remote-error signal
/// before it is raised. Every other unrecoverable variant sets the task's
/// state to `Unknown` before it is raised. Errors encountered during
/// `get_resource_status` are logged and leave `updated = false` on the
/// back-end rather than escaping as an `OrchestratorError`.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Malformed or missing required config key. Caught at construction,
    /// always fatal.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Credential exists but needs refresh; caller should re-issue.
    #[error("authentication recoverable: {0}")]
    AuthRecoverable(String),

    /// Credential mismatch or expired token; fatal for this task.
    #[error("authentication failed: {0}")]
    AuthUnrecoverable(String),

    /// Any communication failure with the remote front-end.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Native scheduler rejected the job.
    #[error("submit failed: {message}")]
    Submit { message: String, recoverable: bool },

    /// Cloud back-end has no live VM yet but is working on it.
    #[error("resource not ready, retry later")]
    ResourceNotReady,

    /// Cloud back-end is at its configured `vmPoolMaxSize`.
    #[error("capacity reached")]
    CapacityReached,

    /// Partial fetch failed on one output file; job may still complete.
    #[error("data staging error (recoverable): {0}")]
    DataStagingRecoverable(String),

    /// The VM or remote directory is gone; outputs are lost.
    #[error("data staging error (unrecoverable): {0}")]
    DataStagingUnrecoverable(String),

    /// A native status string has no mapping. Always a bug, never raised
    /// for an unmapped status that the dialect itself maps to `Unknown`.
    #[error("internal error: unrecognized native job status {0:?}")]
    UnknownJobState(String),

    /// A cloud VM referenced in the pool no longer exists on the provider.
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// An illegal state transition was attempted, or another internal
    /// invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Whether the caller should retry the operation (as opposed to giving
    /// up on the task).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::AuthRecoverable(_)
                | OrchestratorError::Transport(_)
                | OrchestratorError::ResourceNotReady
                | OrchestratorError::DataStagingRecoverable(_)
                | OrchestratorError::Submit {
                    recoverable: true,
                    ..
                }
        )
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Known-transient substrings in native scheduler rejection messages —
/// these classify a `Submit` failure as recoverable rather than fatal.
pub const TRANSIENT_SUBMIT_MARKERS: &[&str] = &["try later", "try again", "temporarily"];

pub fn classify_submit_failure(stderr: &str) -> OrchestratorError {
    let lower = stderr.to_ascii_lowercase();
    let recoverable = TRANSIENT_SUBMIT_MARKERS
        .iter()
        .any(|marker| lower.contains(marker));
    OrchestratorError::Submit {
        message: stderr.to_string(),
        recoverable,
    }
}
