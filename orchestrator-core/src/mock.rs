//! Test doubles driving the scenarios in §8 without a live scheduler or
//! cloud API.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use transport::{DirEntry, ExecResult, Metadata, Transport, TransportError, TransportResult};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::vmpool::{CloudProvider, VmHandle, VmStatus};

/// Plays back a canned `ExecResult` for a given `(cmd, args)` pair,
/// recording every call it serves so a test can assert on call order.
pub struct MockTransport {
    responses: Mutex<HashMap<String, ExecResult>>,
    /// Responses matched by substring rather than exact command text, for
    /// commands that embed a back-end-generated random tag the caller
    /// cannot predict (e.g. the submit command's work-dir path).
    prefix_responses: Mutex<Vec<(String, ExecResult)>>,
    calls: Mutex<Vec<String>>,
    files: Mutex<HashMap<String, Bytes>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            prefix_responses: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            files: Mutex::new(HashMap::new()),
        }
    }

    fn key(cmd: &str, args: &[&str]) -> String {
        format!("{cmd} {}", args.join(" "))
    }

    /// Register a canned response for the exact `sh -c "<command>"`
    /// invocation the batch back-end issues.
    pub fn on_shell(&self, command: &str, stdout: &str, stderr: &str, exit_code: i32) {
        let key = Self::key("sh", &["-c", command]);
        self.responses.lock().unwrap().insert(
            key,
            ExecResult {
                stdout: Bytes::from(stdout.to_string()),
                stderr: Bytes::from(stderr.to_string()),
                exit_code,
            },
        );
    }

    /// Register a canned response for any `sh -c "<command>"` invocation
    /// containing `substring`.
    pub fn on_shell_containing(&self, substring: &str, stdout: &str, stderr: &str, exit_code: i32) {
        self.prefix_responses.lock().unwrap().push((
            substring.to_string(),
            ExecResult {
                stdout: Bytes::from(stdout.to_string()),
                stderr: Bytes::from(stderr.to_string()),
                exit_code,
            },
        ));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Inspect a file previously written via `put`, for assertions on what
    /// a back-end actually staged.
    pub fn read_file(&self, remote_path: &str) -> Option<Bytes> {
        self.files.lock().unwrap().get(remote_path).cloned()
    }

    /// All `(path, contents)` pairs staged under `dir`, for asserting on a
    /// back-end's output without predicting a randomly-tagged filename.
    pub fn files_under(&self, dir: &str) -> Vec<(String, Bytes)> {
        let prefix = format!("{dir}/");
        self.files
            .lock()
            .unwrap()
            .iter()
            .filter(|(path, _)| path.starts_with(&prefix))
            .map(|(path, data)| (path.clone(), data.clone()))
            .collect()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> TransportResult<()> {
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        Ok(())
    }

    async fn exec(&self, cmd: &str, args: &[&str]) -> TransportResult<ExecResult> {
        let key = Self::key(cmd, args);
        self.calls.lock().unwrap().push(key.clone());
        if let Some(exact) = self.responses.lock().unwrap().get(&key).cloned() {
            return Ok(exact);
        }
        if let Some((_, resp)) = self
            .prefix_responses
            .lock()
            .unwrap()
            .iter()
            .find(|(substring, _)| key.contains(substring.as_str()))
        {
            return Ok(resp.clone());
        }
        Err(TransportError::RemoteError(format!("no canned response for {key:?}")))
    }

    async fn list_dir(&self, _path: &str) -> TransportResult<Vec<DirEntry>> {
        Ok(Vec::new())
    }

    async fn make_dirs(&self, _path: &str) -> TransportResult<()> {
        Ok(())
    }

    async fn put(&self, remote_path: &str, data: Bytes, _executable: bool) -> TransportResult<()> {
        self.files.lock().unwrap().insert(remote_path.to_string(), data);
        Ok(())
    }

    async fn get(&self, remote_path: &str, local_path: &Path, ignore_missing: bool) -> TransportResult<()> {
        let data = self.files.lock().unwrap().get(remote_path).cloned();
        match data {
            Some(bytes) => tokio::fs::write(local_path, &bytes)
                .await
                .map_err(|e| TransportError::Internal(e.to_string())),
            None if ignore_missing => Ok(()),
            None => Err(TransportError::NotFound(remote_path.to_string())),
        }
    }

    async fn open(&self, remote_path: &str, offset: u64, size: u64) -> TransportResult<Bytes> {
        let data = self
            .files
            .lock()
            .unwrap()
            .get(remote_path)
            .cloned()
            .ok_or_else(|| TransportError::NotFound(remote_path.to_string()))?;
        let start = (offset as usize).min(data.len());
        let end = (start + size as usize).min(data.len());
        Ok(data.slice(start..end))
    }

    async fn stat(&self, path: &str) -> TransportResult<Metadata> {
        let data = self
            .files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| TransportError::NotFound(path.to_string()))?;
        Ok(Metadata {
            kind: transport::EntryKind::File,
            size: data.len() as u64,
            modified: None,
            permissions: None,
        })
    }

    async fn remove(&self, path: &str) -> TransportResult<()> {
        self.files.lock().unwrap().remove(path);
        Ok(())
    }

    async fn remove_tree(&self, path: &str) -> TransportResult<()> {
        let mut files = self.files.lock().unwrap();
        let prefix = format!("{path}/");
        files.retain(|k, _| !k.starts_with(&prefix) && k != path);
        Ok(())
    }

    async fn chmod(&self, _path: &str, _mode: u32) -> TransportResult<()> {
        Ok(())
    }

    async fn is_dir(&self, _path: &str) -> TransportResult<bool> {
        Ok(true)
    }

    async fn check(&self) -> TransportResult<()> {
        Ok(())
    }

    fn description(&self) -> String {
        "mock".to_string()
    }
}

/// Per-operation error injection and call counting for [`CloudProvider`].
pub struct MockCloudProvider {
    instances: Mutex<HashMap<String, VmHandle>>,
    launch_error: Mutex<Option<String>>,
    keypair_error: Mutex<Option<String>>,
    next_id: Mutex<u64>,
    next_key_fingerprint: Mutex<Option<String>>,
    pub launch_calls: Mutex<u32>,
}

impl MockCloudProvider {
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            launch_error: Mutex::new(None),
            keypair_error: Mutex::new(None),
            next_id: Mutex::new(0),
            next_key_fingerprint: Mutex::new(None),
            launch_calls: Mutex::new(0),
        }
    }

    pub fn seed(&self, handle: VmHandle) {
        self.instances.lock().unwrap().insert(handle.id.clone(), handle);
    }

    pub fn set_status(&self, id: &str, status: VmStatus) {
        if let Some(h) = self.instances.lock().unwrap().get_mut(id) {
            h.status = status;
        }
    }

    pub fn forget(&self, id: &str) {
        self.instances.lock().unwrap().remove(id);
    }

    pub fn fail_next_launch(&self, message: impl Into<String>) {
        *self.launch_error.lock().unwrap() = Some(message.into());
    }

    pub fn fail_keypair(&self, message: impl Into<String>) {
        *self.keypair_error.lock().unwrap() = Some(message.into());
    }

    /// Make the next launched instance report `fingerprint` as its
    /// provider-side keypair fingerprint.
    pub fn set_next_key_fingerprint(&self, fingerprint: impl Into<String>) {
        *self.next_key_fingerprint.lock().unwrap() = Some(fingerprint.into());
    }
}

impl Default for MockCloudProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudProvider for MockCloudProvider {
    async fn describe_instance(&self, id: &str) -> OrchestratorResult<VmHandle> {
        self.instances
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestratorError::InstanceNotFound(id.to_string()))
    }

    async fn launch_instance(
        &self,
        image_id: &str,
        instance_type: &str,
        _user_data: Option<&str>,
    ) -> OrchestratorResult<VmHandle> {
        *self.launch_calls.lock().unwrap() += 1;
        if let Some(msg) = self.launch_error.lock().unwrap().take() {
            return Err(OrchestratorError::Transport(TransportError::Internal(msg)));
        }
        let mut next_id = self.next_id.lock().unwrap();
        *next_id += 1;
        let id = format!("vm-{next_id}");
        let handle = VmHandle {
            id: id.clone(),
            status: VmStatus::Pending,
            addresses: vec!["10.0.0.1".to_string()],
            preferred_ip: None,
            image_id: image_id.to_string(),
            instance_type: instance_type.to_string(),
            key_fingerprint: self.next_key_fingerprint.lock().unwrap().take(),
        };
        self.instances.lock().unwrap().insert(id, handle.clone());
        Ok(handle)
    }

    async fn terminate_instance(&self, id: &str) -> OrchestratorResult<()> {
        if let Some(h) = self.instances.lock().unwrap().get_mut(id) {
            h.status = VmStatus::Terminated;
        }
        Ok(())
    }

    async fn ensure_keypair(&self, _name: &str, _local_public_key_fingerprints: &[String]) -> OrchestratorResult<()> {
        if let Some(msg) = self.keypair_error.lock().unwrap().take() {
            return Err(OrchestratorError::AuthUnrecoverable(msg));
        }
        Ok(())
    }

    async fn ensure_security_group(&self, _name: &str, _rules: &[String]) -> OrchestratorResult<()> {
        Ok(())
    }
}
