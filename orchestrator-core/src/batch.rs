//! Generic dialect-driven batch back-end: submit/poll/cancel/stage for any
//! scheduler expressible as a [`Dialect`].

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use transport::Transport;

use crate::backend::{is_file_url, BackendAttributes, ExecutionBackend, ResourceStatus};
use crate::error::{classify_submit_failure, OrchestratorError, OrchestratorResult};
use crate::state::{transition, TaskState};
use crate::dialect::Dialect;
use crate::task::{Output, ReturnCode, Signal, Task};

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);
const DEFAULT_ACCOUNTING_DELAY: Duration = Duration::from_secs(15);

struct Cached {
    at: Instant,
}

/// A single concrete back-end type parametrized by a scheduler [`Dialect`],
/// implementing the full `ExecutionBackend` capability set on top of a
/// [`Transport`].
pub struct BatchBackend<D: Dialect> {
    attributes: BackendAttributes,
    dialect: D,
    transport: Arc<dyn Transport>,
    queue: Option<String>,
    jobs_root: String,
    cache_ttl: Duration,
    accounting_delay: Duration,
    resource_status: Mutex<ResourceStatus>,
    resource_status_fetched_at: Mutex<Option<Instant>>,
    /// Per-task cache of the last `update_state` result, keyed by task id,
    /// to avoid hammering the scheduler within `cache_ttl`.
    state_cache: Mutex<HashMap<String, Cached>>,
    /// Per-task first-accounting-miss timestamp, keyed by task id: used to
    /// implement the `accountingDelay` grace period before declaring a job
    /// permanently `Unknown`.
    accounting_first_miss: Mutex<HashMap<String, Instant>>,
}

impl<D: Dialect> BatchBackend<D> {
    pub fn new(
        attributes: BackendAttributes,
        dialect: D,
        transport: Arc<dyn Transport>,
        queue: Option<String>,
    ) -> Self {
        Self {
            attributes,
            dialect,
            transport,
            queue,
            jobs_root: ".orchestrator/jobs".to_string(),
            cache_ttl: DEFAULT_CACHE_TTL,
            accounting_delay: DEFAULT_ACCOUNTING_DELAY,
            resource_status: Mutex::new(ResourceStatus::default()),
            resource_status_fetched_at: Mutex::new(None),
            state_cache: Mutex::new(HashMap::new()),
            accounting_first_miss: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_jobs_root(mut self, root: impl Into<String>) -> Self {
        self.jobs_root = root.into();
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_accounting_delay(mut self, delay: Duration) -> Self {
        self.accounting_delay = delay;
        self
    }

    pub fn dialect(&self) -> &D {
        &self.dialect
    }

    fn random_tag() -> String {
        let mut rng = rand::thread_rng();
        (0..10)
            .map(|_| {
                let c = rng.gen_range(0..36);
                std::char::from_digit(c, 36).unwrap()
            })
            .collect()
    }

    async fn within_cache_ttl(&self, task_id: &str) -> bool {
        let cache = self.state_cache.lock().await;
        cache
            .get(task_id)
            .map(|c| c.at.elapsed() < self.cache_ttl)
            .unwrap_or(false)
    }

    async fn remember_update(&self, task_id: &str) {
        let mut cache = self.state_cache.lock().await;
        cache.insert(task_id.to_string(), Cached { at: Instant::now() });
    }
}

#[async_trait]
impl<D: Dialect> ExecutionBackend for BatchBackend<D> {
    fn attributes(&self) -> &BackendAttributes {
        &self.attributes
    }

    fn resource_status(&self) -> ResourceStatus {
        // Synchronous snapshot: safe because the core's concurrency model
        // guarantees single-tick access; try_lock never blocks here.
        self.resource_status
            .try_lock()
            .map(|g| *g)
            .unwrap_or_default()
    }

    async fn submit(&self, task: &mut Task) -> OrchestratorResult<()> {
        self.transport.connect().await?;

        let work_dir = format!("{}/{}-{}", self.jobs_root, task.id, Self::random_tag());
        self.transport.make_dirs(&work_dir).await?;

        for input in &task.inputs {
            let data = tokio::fs::read(&input.local_source).await.map_err(|e| {
                OrchestratorError::DataStagingUnrecoverable(format!(
                    "reading local input {:?}: {e}",
                    input.local_source
                ))
            })?;
            let executable = is_executable(&input.local_source).await;
            let remote_path = format!("{work_dir}/{}", input.remote_path);
            if let Some(parent) = std::path::Path::new(&remote_path).parent() {
                self.transport
                    .make_dirs(&parent.to_string_lossy())
                    .await?;
            }
            self.transport
                .put(&remote_path, Bytes::from(data), executable)
                .await?;
        }

        let wrapper_name = format!("{}.{}.sh", task.id, Self::random_tag());
        let script = task
            .wrapper_script
            .clone()
            .unwrap_or_else(|| build_wrapper_script(task));
        self.transport
            .put(&format!("{work_dir}/{wrapper_name}"), Bytes::from(script), true)
            .await?;

        let submit_cmd = self.dialect.submit_command(
            &work_dir,
            &wrapper_name,
            self.queue.as_deref(),
            task.requested.cores,
            task.requested.wall_time_minutes,
            task.requested.memory_per_core_mib,
        );

        let result = self.transport.exec("sh", &["-c", &submit_cmd]).await?;
        let stdout = result.stdout_str().into_owned();
        let stderr = result.stderr_str().into_owned();

        if !result.success() {
            transition(&mut task.state, TaskState::Unknown).ok();
            return Err(classify_submit_failure(&stderr));
        }

        let native_job_id = self.dialect.parse_submit(&stdout).ok_or_else(|| {
            OrchestratorError::Internal(format!(
                "could not parse native job id from submit output: {stdout:?}"
            ))
        })?;

        let handle = task.handle_mut();
        handle.native_job_id = Some(native_job_id);
        handle.remote_work_dir = Some(work_dir);
        task.push_history(format!("submit stdout:\n{stdout}\nstderr:\n{stderr}"));
        transition(&mut task.state, TaskState::Submitted)?;
        Ok(())
    }

    async fn update_state(&self, task: &mut Task) -> OrchestratorResult<()> {
        if self.within_cache_ttl(&task.id).await {
            return Ok(());
        }
        let native_job_id = task
            .handle
            .as_ref()
            .and_then(|h| h.native_job_id.clone())
            .ok_or_else(|| OrchestratorError::Internal("update_state on unsubmitted task".into()))?;
        let work_dir = task
            .handle
            .as_ref()
            .and_then(|h| h.remote_work_dir.clone())
            .unwrap_or_default();

        self.transport.connect().await?;
        let stat_cmd = self.dialect.stat_command(&native_job_id);
        let result = self.transport.exec("sh", &["-c", &stat_cmd]).await?;
        let stdout = result.stdout_str().into_owned();

        if let Some(mapped) = self.dialect.parse_stat(&stdout, &native_job_id) {
            self.remember_update(&task.id).await;
            let mut miss = self.accounting_first_miss.lock().await;
            miss.remove(&task.id);
            drop(miss);
            return transition(&mut task.state, mapped);
        }

        let acct_cmd = self.dialect.accounting_command(&native_job_id, &work_dir);
        let acct_result = self.transport.exec("sh", &["-c", &acct_cmd]).await?;
        let acct_stdout = acct_result.stdout_str().into_owned();
        let acct_stderr = acct_result.stderr_str().into_owned();

        if let Some(record) = self.dialect.parse_accounting(&acct_stdout, &acct_stderr) {
            self.remember_update(&task.id).await;
            let mut miss = self.accounting_first_miss.lock().await;
            miss.remove(&task.id);
            drop(miss);

            let overrun = exceeds_request(&record, &task.requested);
            task.return_code = Some(if overrun {
                ReturnCode::synthesized_remote_error()
            } else {
                ReturnCode {
                    signal: Signal::None,
                    exit: record.exit_status.unwrap_or(0),
                }
            });
            return transition(&mut task.state, TaskState::Terminating);
        }

        // Neither stat nor accounting has a record: start (or continue)
        // the accounting-delay grace period before declaring permanent
        // Unknown for this probe cycle.
        let mut miss = self.accounting_first_miss.lock().await;
        let first_seen = *miss.entry(task.id.clone()).or_insert_with(Instant::now);
        let elapsed = first_seen.elapsed();
        drop(miss);

        self.remember_update(&task.id).await;
        if elapsed >= self.accounting_delay {
            transition(&mut task.state, TaskState::Unknown)
        } else {
            Ok(())
        }
    }

    async fn cancel(&self, task: &mut Task) -> OrchestratorResult<()> {
        let native_job_id = task
            .handle
            .as_ref()
            .and_then(|h| h.native_job_id.clone())
            .ok_or_else(|| OrchestratorError::Internal("cancel on unsubmitted task".into()))?;
        self.transport.connect().await?;
        let cmd = self.dialect.cancel_command(&native_job_id);
        let result = self.transport.exec("sh", &["-c", &cmd]).await?;
        if !result.success() {
            let stderr = result.stderr_str();
            if !self.dialect.is_already_finished(&stderr) {
                return Err(OrchestratorError::Submit {
                    message: stderr.into_owned(),
                    recoverable: false,
                });
            }
        }
        transition(&mut task.state, TaskState::Terminated)
    }

    async fn free(&self, task: &mut Task) {
        if let Some(work_dir) = task.handle.as_ref().and_then(|h| h.remote_work_dir.clone()) {
            if let Err(e) = self.transport.remove_tree(&work_dir).await {
                tracing::warn!(task = %task.id, error = %e, "free: remove_tree failed");
            }
        }
    }

    async fn get_results(
        &self,
        task: &Task,
        overwrite: bool,
        changed_only: bool,
    ) -> OrchestratorResult<()> {
        let work_dir = task
            .handle
            .as_ref()
            .and_then(|h| h.remote_work_dir.clone())
            .ok_or_else(|| OrchestratorError::Internal("get_results on unsubmitted task".into()))?;

        let mut pairs: Vec<Output> = Vec::new();
        for output in &task.outputs {
            if output.is_wildcard() {
                let entries = self.transport.list_dir(&work_dir).await?;
                for entry in entries {
                    pairs.push(Output {
                        remote_path: format!("{work_dir}/{}", entry.name),
                        local_destination: output.local_destination.join(&entry.name),
                    });
                }
            } else {
                pairs.push(Output {
                    remote_path: format!("{work_dir}/{}", output.remote_path),
                    local_destination: output.local_destination.clone(),
                });
            }
        }

        for pair in pairs {
            if pair.local_destination.exists() {
                if !overwrite {
                    continue;
                }
                if changed_only && !self.remote_changed(&pair).await? {
                    continue;
                }
            }
            match self.transport.get(&pair.remote_path, &pair.local_destination, true).await {
                Ok(()) => {}
                Err(e) => {
                    return Err(OrchestratorError::DataStagingRecoverable(e.to_string()));
                }
            }
        }
        Ok(())
    }

    async fn peek(
        &self,
        task: &Task,
        relative_path: &str,
        offset: u64,
        size: u64,
    ) -> OrchestratorResult<Bytes> {
        let work_dir = task
            .handle
            .as_ref()
            .and_then(|h| h.remote_work_dir.clone())
            .ok_or_else(|| OrchestratorError::Internal("peek on unsubmitted task".into()))?;
        let remote_path = format!("{work_dir}/{relative_path}");
        Ok(self.transport.open(&remote_path, offset, size).await?)
    }

    async fn get_resource_status(&self) {
        {
            let fetched_at = self.resource_status_fetched_at.lock().await;
            if let Some(at) = *fetched_at {
                if at.elapsed() < self.cache_ttl {
                    return;
                }
            }
        }

        let cmd = self.dialect.listing_command(self.queue.as_deref());
        let outcome = async {
            self.transport.connect().await?;
            self.transport.exec("sh", &["-c", &cmd]).await
        }
        .await;

        let mut status = self.resource_status.lock().await;
        match outcome {
            Ok(result) if result.success() => {
                let listing = self.dialect.parse_listing(&result.stdout_str());
                let free_slots: i64 = listing.free_slots_per_host.values().sum();
                *status = ResourceStatus {
                    free_slots,
                    user_run: listing.own_running,
                    user_queued: listing.own_queued,
                    total_queued: listing.total_queued,
                    total_running: listing.total_running,
                    updated: true,
                };
            }
            Ok(result) => {
                tracing::warn!(
                    backend = %self.attributes.name,
                    stderr = %result.stderr_str(),
                    "get_resource_status: listing command failed"
                );
                status.updated = false;
            }
            Err(e) => {
                tracing::warn!(backend = %self.attributes.name, error = %e, "get_resource_status failed");
                status.updated = false;
            }
        }
        drop(status);
        *self.resource_status_fetched_at.lock().await = Some(Instant::now());
    }

    fn validate_data(&self, url: &str) -> bool {
        is_file_url(url)
    }

    async fn close(&self) {
        if let Err(e) = self.transport.close().await {
            tracing::warn!(backend = %self.attributes.name, error = %e, "close: transport close failed");
        }
    }
}

impl<D: Dialect> BatchBackend<D> {
    async fn remote_changed(&self, pair: &Output) -> OrchestratorResult<bool> {
        let remote_meta = self.transport.stat(&pair.remote_path).await?;
        let local_meta = tokio::fs::metadata(&pair.local_destination)
            .await
            .map_err(|e| OrchestratorError::DataStagingRecoverable(e.to_string()))?;
        if remote_meta.size != local_meta.len() {
            return Ok(true);
        }
        if let (Some(remote_mtime), Ok(local_mtime)) =
            (remote_meta.modified, local_meta.modified())
        {
            return Ok(remote_mtime > local_mtime);
        }
        Ok(false)
    }
}

fn exceeds_request(record: &crate::dialect::AccountingRecord, requested: &crate::task::Requested) -> bool {
    if let Some(wall) = record.wall_time_minutes {
        if wall > requested.wall_time_minutes as f64 {
            return true;
        }
    }
    if let Some(cpu) = record.cpu_time_minutes {
        if cpu > requested.wall_time_minutes as f64 * requested.cores as f64 {
            return true;
        }
    }
    if let Some(mem) = record.memory_used_mib {
        if mem > requested.memory_per_core_mib * requested.cores as u64 {
            return true;
        }
    }
    false
}

/// Default wrapper for tasks that don't ship their own: just run the
/// command with stdout/stderr redirected to the configured filenames.
fn build_wrapper_script(task: &Task) -> Vec<u8> {
    let mut script = String::from("#!/bin/sh\n");
    let redirect = if task.join_stderr {
        format!("> {} 2>&1", task.stdout)
    } else {
        format!("> {} 2> {}", task.stdout, task.stderr)
    };
    script.push_str(&format!("{} {redirect}\n", task.command.join(" ")));
    script.into_bytes()
}

async fn is_executable(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::metadata(path)
        .await
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
