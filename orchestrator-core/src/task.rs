//! Task data model: the unit of work passed to an [`crate::ExecutionBackend`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use time::OffsetDateTime;

use crate::state::TaskState;

/// A (local source, remote relative path) input to stage before submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Input {
    pub local_source: PathBuf,
    pub remote_path: String,
}

/// A (remote relative path, local destination) output to fetch after
/// termination. `remote_path == "*"` means "the entire remote working
/// directory, recursively".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Output {
    pub remote_path: String,
    pub local_destination: PathBuf,
}

impl Output {
    pub fn is_wildcard(&self) -> bool {
        self.remote_path == "*"
    }
}

/// Hard resource limits the back-end must enforce on the remote side; also
/// used by the broker to filter candidate back-ends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Requested {
    pub cores: u32,
    pub memory_per_core_mib: u64,
    pub wall_time_minutes: u32,
}

/// A POSIX signal, a synthesized remote-error marker, or zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    None,
    Posix(i32),
    RemoteError,
}

/// `(signal, exit)` pair. Populated iff `State ∈ {Terminating, Terminated}`
/// and frozen from `Terminating` onward unless explicitly recomputed on
/// retry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReturnCode {
    pub signal: Signal,
    pub exit: i32,
}

impl ReturnCode {
    pub fn success() -> Self {
        Self {
            signal: Signal::None,
            exit: 0,
        }
    }

    pub fn synthesized_remote_error() -> Self {
        Self {
            signal: Signal::RemoteError,
            exit: -1,
        }
    }
}

/// One append-only entry in a task's [`Task::history`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub message: String,
}

/// Back-end-opaque data attached at submission time and consulted on every
/// subsequent call. Populated iff
/// `State ∈ {Submitted, Running, Stopped, Terminating, Terminated}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendHandle {
    /// The native scheduler's job ID.
    pub native_job_id: Option<String>,
    /// Absolute path of the remote working directory (SSH-mounted
    /// back-ends).
    pub remote_work_dir: Option<String>,
    /// The VM the job is bound to (cloud back-ends only).
    pub vm_id: Option<String>,
}

/// One unit of work: identity, requested resources, lifecycle state, exit
/// info, and the back-end handle populated once submitted.
///
/// Invariants upheld by [`crate::backend::ExecutionBackend`] implementations:
/// (a) once `state == Terminated`, no field except `history` ever changes;
/// (b) `handle` is populated iff `state` is in the submitted-or-later set;
/// (c) `return_code` is populated iff `state` is `Terminating` or
/// `Terminated`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub command: Vec<String>,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub stdout: String,
    pub stderr: String,
    pub join_stderr: bool,
    pub requested: Requested,
    /// A caller-supplied wrapper script to stage and invoke instead of the
    /// back-end's default stdout/stderr-redirecting wrapper. Whether a task
    /// needs one is an application concern, not the back-end's: a task
    /// whose `command` is already a self-contained executable script can
    /// leave this `None` and the back-end synthesizes a minimal one.
    pub wrapper_script: Option<Vec<u8>>,
    pub application_tag: Option<String>,
    pub state: TaskState,
    pub return_code: Option<ReturnCode>,
    pub history: Vec<HistoryEntry>,
    pub handle: Option<BackendHandle>,
}

impl Task {
    pub fn new(id: impl Into<String>, command: Vec<String>, requested: Requested) -> Self {
        let id = id.into();
        Self {
            stdout: format!("{id}.out"),
            stderr: format!("{id}.err"),
            join_stderr: false,
            command,
            inputs: Vec::new(),
            outputs: Vec::new(),
            requested,
            wrapper_script: None,
            application_tag: None,
            state: TaskState::New,
            return_code: None,
            history: Vec::new(),
            handle: None,
            id,
        }
    }

    /// Ship `script` as this task's wrapper instead of the back-end's
    /// default redirect-only wrapper, e.g. when `command` needs module
    /// loads or environment setup the default wrapper doesn't provide.
    pub fn with_wrapper_script(mut self, script: Vec<u8>) -> Self {
        self.wrapper_script = Some(script);
        self
    }

    pub fn push_history(&mut self, message: impl Into<String>) {
        self.history.push(HistoryEntry {
            at: OffsetDateTime::now_utc(),
            message: message.into(),
        });
    }

    pub fn handle_mut(&mut self) -> &mut BackendHandle {
        self.handle.get_or_insert_with(BackendHandle::default)
    }
}

/// Arbitrary name-value back-end configuration, per §6. Typed accessors
/// convert and validate on read so a malformed key fails at the call site
/// that needed it, naming the offending key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig(pub BTreeMap<String, String>);

impl BackendConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn require(&self, key: &str) -> Result<&str, crate::OrchestratorError> {
        self.0
            .get(key)
            .map(|s| s.as_str())
            .ok_or_else(|| crate::OrchestratorError::Configuration(format!("missing key {key:?}")))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|s| s.as_str())
    }

    pub fn require_u32(&self, key: &str) -> Result<u32, crate::OrchestratorError> {
        self.require(key)?.parse().map_err(|_| {
            crate::OrchestratorError::Configuration(format!("key {key:?} is not a valid integer"))
        })
    }

    pub fn require_f64(&self, key: &str) -> Result<f64, crate::OrchestratorError> {
        self.require(key)?.parse().map_err(|_| {
            crate::OrchestratorError::Configuration(format!("key {key:?} is not a valid number"))
        })
    }

    pub fn optional_u32(&self, key: &str, default: u32) -> Result<u32, crate::OrchestratorError> {
        match self.0.get(key) {
            None => Ok(default),
            Some(v) => v.parse().map_err(|_| {
                crate::OrchestratorError::Configuration(format!(
                    "key {key:?} is not a valid integer"
                ))
            }),
        }
    }

    /// Wall time is configured in hours; stored internally in minutes.
    pub fn wall_time_minutes(&self, key: &str) -> Result<u32, crate::OrchestratorError> {
        let hours = self.require_f64(key)?;
        Ok((hours * 60.0).round() as u32)
    }

    /// Memory is configured in GiB per core; stored internally in MiB.
    pub fn memory_per_core_mib(&self, key: &str) -> Result<u64, crate::OrchestratorError> {
        let gib = self.require_f64(key)?;
        Ok((gib * 1024.0).round() as u64)
    }
}
