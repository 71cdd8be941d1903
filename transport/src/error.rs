use thiserror::Error;

/// Errors raised by a [`crate::Transport`] implementation.
///
/// Mirrors the failure taxonomy of the native-command back-ends built on top
/// of this crate: connection/auth failures are recoverable at the caller's
/// discretion, while `Internal` indicates a bug in this crate (unexpected
/// native-tool output, an invariant violation).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {host}: {reason}")]
    ConnectionFailed { host: String, reason: String },

    #[error("authentication failed for {user}@{host}: {reason}")]
    AuthFailed {
        user: String,
        host: String,
        reason: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("remote command failed: {0}")]
    RemoteError(String),

    #[error("sftp error: {0}")]
    SftpError(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("internal transport error: {0}")]
    Internal(String),
}

impl TransportError {
    /// Classify a raw SSH/exec failure string into a specific variant.
    ///
    /// Native tools don't give us structured errors, so this is a
    /// best-effort substring classifier over stderr text. `user` is the
    /// identity the session was configured with, if any — OpenSSH falls
    /// back to the local account name when none is given, so `"unknown"`
    /// is reserved for genuinely missing information rather than used as a
    /// silent default.
    pub fn from_ssh(host: &str, user: Option<&str>, err: impl std::fmt::Display) -> Self {
        let msg = err.to_string();
        let lower = msg.to_ascii_lowercase();
        if lower.contains("permission denied") && lower.contains("publickey") {
            let reason = if lower.contains("agent") && lower.contains("no identities") {
                "agent has no identities loaded".to_string()
            } else if lower.contains("no such file") || lower.contains("no more authentication methods") {
                "no usable key or agent identity offered".to_string()
            } else {
                format!("key offered but rejected by the remote host: {msg}")
            };
            TransportError::AuthFailed {
                user: user.unwrap_or("unknown").to_string(),
                host: host.to_string(),
                reason,
            }
        } else if lower.contains("could not resolve hostname")
            || lower.contains("connection refused")
            || lower.contains("connection timed out")
            || lower.contains("no route to host")
        {
            TransportError::ConnectionFailed {
                host: host.to_string(),
                reason: msg,
            }
        } else {
            TransportError::RemoteError(msg)
        }
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_ssh_classifies_publickey_rejection_as_auth_failed() {
        let err = TransportError::from_ssh("host", Some("alice"), "Permission denied (publickey).");
        match err {
            TransportError::AuthFailed { user, reason, .. } => {
                assert_eq!(user, "alice");
                assert!(reason.contains("rejected"), "reason was {reason:?}");
            }
            other => panic!("expected AuthFailed, got {other:?}"),
        }
    }

    #[test]
    fn from_ssh_distinguishes_empty_agent_from_rejected_key() {
        let empty_agent = TransportError::from_ssh(
            "host",
            None,
            "Permission denied (publickey). The agent has no identities.",
        );
        let rejected_key = TransportError::from_ssh("host", None, "Permission denied (publickey).");
        match (empty_agent, rejected_key) {
            (
                TransportError::AuthFailed { reason: r1, user: u1, .. },
                TransportError::AuthFailed { reason: r2, .. },
            ) => {
                assert_ne!(r1, r2);
                assert_eq!(u1, "unknown");
            }
            other => panic!("expected two AuthFailed variants, got {other:?}"),
        }
    }

    #[test]
    fn from_ssh_classifies_dns_failure_as_connection_failed() {
        let err = TransportError::from_ssh(
            "host",
            None,
            "ssh: Could not resolve hostname host: Name or service not known",
        );
        assert!(matches!(err, TransportError::ConnectionFailed { .. }));
    }

    #[test]
    fn from_ssh_falls_back_to_remote_error() {
        let err = TransportError::from_ssh("host", None, "some unrecognised failure");
        assert!(matches!(err, TransportError::RemoteError(_)));
    }
}
