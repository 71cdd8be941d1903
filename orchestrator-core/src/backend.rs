//! The polymorphic `ExecutionBackend` capability set:
//! `{submit, update_state, cancel, free, get_results, peek,
//! get_resource_status, validate_data, close}`.
//!
//! Concrete implementations never inherit from a shared stateful base —
//! the common immutable attributes live in [`BackendAttributes`], a
//! composition record each implementation embeds.

use async_trait::async_trait;
use std::path::Path;

use crate::error::OrchestratorResult;
use crate::task::Task;

/// Immutable attributes shared by every back-end, embedded by composition
/// rather than inherited from a base class.
#[derive(Debug, Clone)]
pub struct BackendAttributes {
    pub name: String,
    pub architecture: String,
    pub max_cores: u32,
    pub max_cores_per_job: u32,
    pub max_memory_per_core_mib: u64,
    pub max_wall_time_minutes: u32,
}

/// Dynamic attributes refreshed by [`ExecutionBackend::get_resource_status`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceStatus {
    pub free_slots: i64,
    pub user_run: u32,
    pub user_queued: u32,
    pub total_queued: u32,
    pub total_running: u32,
    /// Whether the last refresh succeeded.
    pub updated: bool,
}

/// A configured adapter for one concrete execution environment.
///
/// Public methods are synchronous-per-task: an implementation may use
/// internal parallelism (e.g. refreshing many VMs' statuses at once) but
/// must not allow two concurrent calls on the *same* task — that is
/// undefined behavior per the concurrency model.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn attributes(&self) -> &BackendAttributes;

    /// Current dynamic resource status, as of the last
    /// [`ExecutionBackend::get_resource_status`] call.
    fn resource_status(&self) -> ResourceStatus;

    /// Acquire a remote resource (possibly booting a VM), stage inputs,
    /// issue the native submit command, and record the native job handle
    /// on `task`.
    async fn submit(&self, task: &mut Task) -> OrchestratorResult<()>;

    /// Poll the back-end and advance `task`'s lifecycle state.
    async fn update_state(&self, task: &mut Task) -> OrchestratorResult<()>;

    /// Cancel `task`. An error meaning "job already finished" is treated as
    /// success.
    async fn cancel(&self, task: &mut Task) -> OrchestratorResult<()>;

    /// Release remote storage held for `task`. Errors are logged but do
    /// not fail the call.
    async fn free(&self, task: &mut Task);

    /// Stage `task`'s declared outputs down to local destinations.
    async fn get_results(
        &self,
        task: &Task,
        overwrite: bool,
        changed_only: bool,
    ) -> OrchestratorResult<()>;

    /// Read up to `size` bytes of `task`'s remote `relative_path` starting
    /// at `offset`, for tail-following partial output.
    async fn peek(
        &self,
        task: &Task,
        relative_path: &str,
        offset: u64,
        size: u64,
    ) -> OrchestratorResult<bytes::Bytes>;

    /// Refresh this back-end's [`ResourceStatus`] in place. Never returns
    /// an error that escapes to the caller: failures are logged and leave
    /// `updated = false`.
    async fn get_resource_status(&self);

    /// Whether `url` is an acceptable data source/sink for this back-end.
    fn validate_data(&self, url: &str) -> bool {
        url.starts_with("file:")
    }

    /// Release all resources held by this back-end (child back-ends,
    /// connections).
    async fn close(&self);
}

/// Local-filesystem `file:` URL validation shared by every batch back-end.
pub fn is_file_url(url: &str) -> bool {
    url.starts_with("file:")
}

/// Resolve a `file:` URL (or bare path) to a local filesystem path.
pub fn file_url_to_path(url: &str) -> &Path {
    Path::new(url.strip_prefix("file://").or_else(|| url.strip_prefix("file:")).unwrap_or(url))
}
