//! Uniform local/SSH transport used by the scheduler and cloud back-ends.
//!
//! A [`Transport`] gives a back-end `{connect, close, exec, list_dir,
//! make_dirs, put, get, open, remove, remove_tree, chmod, is_dir}` without
//! caring whether the remote side is the orchestrator's own process (
//! [`local::LocalTransport`]) or a host reached over a multiplexed SSH
//! session ([`ssh::SshTransport`]).
//!
//! Every method other than [`Transport::connect`] auto-connects if the
//! underlying session has dropped, and fails with [`TransportError`] on
//! connectivity failure rather than panicking.

pub mod error;
pub mod local;
pub mod ssh;

use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::time::SystemTime;

pub use error::{TransportError, TransportResult};

/// The kind of a directory entry returned by [`Transport::list_dir`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryKind {
    #[default]
    File,
    Dir,
    Symlink,
}

/// A single entry returned by [`Transport::list_dir`].
#[derive(Debug, Clone, Default)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: Option<u64>,
    pub modified: Option<SystemTime>,
    pub permissions: Option<u32>,
}

/// Metadata for a remote path returned by [`Transport::stat`].
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    pub kind: EntryKind,
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub permissions: Option<u32>,
}

/// Result of running a command via [`Transport::exec`].
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub stdout: Bytes,
    pub stderr: Bytes,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn stderr_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

/// Host-key verification policy for [`ssh::SshTransport::connect`].
///
/// `Ignore` exists for ephemeral cloud VMs whose host key changes on every
/// boot — it is never the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KnownHosts {
    #[default]
    AcceptNew,
    Strict,
    Ignore,
}

/// A uniform local/SSH command and file-transfer transport.
///
/// `connect` is idempotent: calling it on an already-connected transport is
/// a no-op, and calling any other method re-establishes a dropped session
/// automatically.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish (or re-establish) the underlying session.
    async fn connect(&self) -> TransportResult<()>;

    /// Tear down the underlying session. Idempotent.
    async fn close(&self) -> TransportResult<()>;

    /// Run `cmd` with `args` and return the captured stdout/stderr in full.
    ///
    /// Callers that need streaming output must use [`Transport::open`] on a
    /// file the command writes to instead.
    async fn exec(&self, cmd: &str, args: &[&str]) -> TransportResult<ExecResult>;

    /// List the entries of a remote directory.
    async fn list_dir(&self, path: &str) -> TransportResult<Vec<DirEntry>>;

    /// Create `path` and any missing intermediate directories.
    async fn make_dirs(&self, path: &str) -> TransportResult<()>;

    /// Upload `data` to `remote_path`, creating intermediate directories.
    ///
    /// When `executable` is true the uploaded file's executable bit is set,
    /// preserving the local executable bit on staged inputs.
    async fn put(&self, remote_path: &str, data: Bytes, executable: bool) -> TransportResult<()>;

    /// Download `remote_path` to `local_path`.
    ///
    /// When `ignore_missing` is true, a missing remote source is silently
    /// skipped instead of raising [`TransportError::NotFound`] — required
    /// for fetching partial output sets where not every declared output was
    /// actually produced.
    async fn get(
        &self,
        remote_path: &str,
        local_path: &Path,
        ignore_missing: bool,
    ) -> TransportResult<()>;

    /// Read up to `size` bytes of `remote_path` starting at `offset`.
    ///
    /// Used for tail-following partial output (`Peek` in the batch
    /// back-end); does not require the whole file to exist yet beyond
    /// `offset`.
    async fn open(&self, remote_path: &str, offset: u64, size: u64) -> TransportResult<Bytes>;

    /// Get metadata for a remote path.
    async fn stat(&self, path: &str) -> TransportResult<Metadata>;

    /// Remove a single remote file (or empty directory).
    async fn remove(&self, path: &str) -> TransportResult<()>;

    /// Remove a remote directory tree, even if non-empty.
    async fn remove_tree(&self, path: &str) -> TransportResult<()>;

    /// Change the permission bits of a remote path.
    async fn chmod(&self, path: &str, mode: u32) -> TransportResult<()>;

    /// Whether `path` exists and is a directory.
    async fn is_dir(&self, path: &str) -> TransportResult<bool>;

    /// Check whether the session is still alive; used before reusing a
    /// pooled transport. Implementations run a cheap no-op remote command.
    async fn check(&self) -> TransportResult<()>;

    /// A human-readable description of this transport, for logs/diagnostics.
    fn description(&self) -> String;
}

/// Shell-escape a string for safe embedding in `sh -c '…'` commands.
pub(crate) fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Parse GNU `stat`'s `%F` output into an [`EntryKind`].
pub(crate) fn parse_file_type(type_str: &str) -> EntryKind {
    let s = type_str.to_ascii_lowercase();
    if s.contains("directory") {
        EntryKind::Dir
    } else if s.contains("symbolic link") || s.contains("symlink") {
        EntryKind::Symlink
    } else {
        EntryKind::File
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_escape_wraps_in_single_quotes() {
        assert_eq!(shell_escape("plain"), "'plain'");
    }

    #[test]
    fn shell_escape_handles_embedded_quote() {
        assert_eq!(shell_escape("o'brien"), "'o'\\''brien'");
    }

    #[test]
    fn parse_file_type_recognises_directory() {
        assert_eq!(parse_file_type("directory"), EntryKind::Dir);
    }

    #[test]
    fn parse_file_type_recognises_symlink() {
        assert_eq!(parse_file_type("symbolic link"), EntryKind::Symlink);
    }

    #[test]
    fn parse_file_type_defaults_to_file() {
        assert_eq!(parse_file_type("regular file"), EntryKind::File);
    }

    #[test]
    fn exec_result_success_checks_exit_code() {
        let ok = ExecResult {
            stdout: Bytes::new(),
            stderr: Bytes::new(),
            exit_code: 0,
        };
        let failed = ExecResult {
            exit_code: 1,
            ..ok.clone()
        };
        assert!(ok.success());
        assert!(!failed.success());
    }
}
