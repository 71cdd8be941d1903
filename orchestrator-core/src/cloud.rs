//! Cloud back-end: layers a batch/shell back-end on top of a dynamically
//! managed pool of cloud VMs, per §4.5.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use tokio::sync::Mutex;

use crate::backend::{BackendAttributes, ExecutionBackend, ResourceStatus};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::keypair::fingerprints_match;
use crate::state::transition;
use crate::state::TaskState;
use crate::task::Task;
use crate::vmpool::{CloudProvider, VmPool, VmStatus};

/// Per-application-tag override of image/instance-type/user-data.
#[derive(Debug, Clone, Default)]
pub struct ApplicationOverride {
    pub image_id: Option<String>,
    pub instance_type: Option<String>,
    pub user_data: Option<String>,
}

/// Local keypair material used to verify a cloud-reported keypair before
/// trusting it.
pub struct LocalKeypair {
    pub openssh_fingerprint: String,
    pub aws_fingerprint: String,
}

pub struct CloudConfig {
    pub keypair_name: String,
    pub local_keypair: LocalKeypair,
    pub image_id: String,
    pub instance_type: String,
    pub user_data: Option<String>,
    pub security_group_name: Option<String>,
    pub security_group_rules: Vec<String>,
    pub vm_pool_max_size: Option<usize>,
    pub application_overrides: HashMap<String, ApplicationOverride>,
}

/// A factory the cloud back-end uses to stand up a fresh child batch
/// back-end against a newly booted VM's reachable address.
#[async_trait]
pub trait ChildBackendFactory: Send + Sync {
    async fn build(&self, address: &str) -> OrchestratorResult<Arc<dyn ExecutionBackend>>;
}

struct Child {
    backend: Arc<dyn ExecutionBackend>,
    /// Image/instance type the VM was booted with, used to match a task's
    /// resolved application tag against a compatible child.
    image_id: String,
    instance_type: String,
    task_count: usize,
}

pub struct CloudBackend {
    attributes: BackendAttributes,
    config: CloudConfig,
    provider: Arc<dyn CloudProvider>,
    child_factory: Arc<dyn ChildBackendFactory>,
    pool: Mutex<VmPool>,
    children: Mutex<HashMap<String, Child>>,
    resource_status: Mutex<ResourceStatus>,
}

impl CloudBackend {
    pub async fn open(
        attributes: BackendAttributes,
        config: CloudConfig,
        provider: Arc<dyn CloudProvider>,
        child_factory: Arc<dyn ChildBackendFactory>,
        pool_dir: impl Into<std::path::PathBuf>,
    ) -> OrchestratorResult<Self> {
        let pool = VmPool::open(pool_dir).await?;
        Ok(Self {
            attributes,
            config,
            provider,
            child_factory,
            pool: Mutex::new(pool),
            children: Mutex::new(HashMap::new()),
            resource_status: Mutex::new(ResourceStatus::default()),
        })
    }

    fn resolve_image_and_instance_type(&self, task: &Task) -> (String, String, Option<String>) {
        let ovr = task
            .application_tag
            .as_ref()
            .and_then(|tag| self.config.application_overrides.get(tag));
        (
            ovr.and_then(|o| o.image_id.clone())
                .unwrap_or_else(|| self.config.image_id.clone()),
            ovr.and_then(|o| o.instance_type.clone())
                .unwrap_or_else(|| self.config.instance_type.clone()),
            ovr.and_then(|o| o.user_data.clone())
                .or_else(|| self.config.user_data.clone()),
        )
    }

    /// Step 1 of the submission algorithm: refresh every child in
    /// parallel, drop VMs in the terminal-error set, drop children whose
    /// VM vanished.
    async fn refresh_pool(&self) {
        let child_backends: Vec<Arc<dyn ExecutionBackend>> = {
            let children = self.children.lock().await;
            children.values().map(|c| c.backend.clone()).collect()
        };
        join_all(child_backends.iter().map(|b| b.get_resource_status())).await;

        let mut pool = self.pool.lock().await;
        let mut children = self.children.lock().await;
        let ids: Vec<String> = pool.ids().cloned().collect();
        for id in ids {
            let handle = match pool.get(&id, self.provider.as_ref()).await {
                Ok(h) => h.clone(),
                Err(OrchestratorError::InstanceNotFound(_)) => {
                    children.remove(&id);
                    pool.remove(&id).await.ok();
                    continue;
                }
                Err(_) => continue,
            };
            if handle.status.is_terminal_error() {
                children.remove(&id);
                pool.remove(&id).await.ok();
                continue;
            }
            if handle.status == VmStatus::Running && !children.contains_key(&id) {
                // Try the preferred address first, then fall back through
                // the VM's other advertised addresses (secondary-IP
                // strategy); the first that a child back-end can be built
                // against is promoted and persisted.
                let mut ordered: Vec<String> = Vec::new();
                if let Some(preferred) = &handle.preferred_ip {
                    ordered.push(preferred.clone());
                }
                for addr in &handle.addresses {
                    if !ordered.contains(addr) {
                        ordered.push(addr.clone());
                    }
                }

                let mut built = None;
                for (i, address) in ordered.iter().enumerate() {
                    match self.child_factory.build(address).await {
                        Ok(backend) => {
                            if i > 0 || handle.preferred_ip.is_none() {
                                pool.set_preferred_ip(&id, address.clone()).await.ok();
                            }
                            built = Some(backend);
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(vm = %id, address = %address, error = %e, "refresh_pool: address unreachable, trying next");
                        }
                    }
                }

                if let Some(backend) = built {
                    children.insert(
                        id.clone(),
                        Child {
                            backend,
                            image_id: handle.image_id.clone(),
                            instance_type: handle.instance_type.clone(),
                            task_count: 0,
                        },
                    );
                }
            }
        }
    }

    async fn try_submit_on_existing_children(
        &self,
        task: &mut Task,
        image_id: &str,
        instance_type: &str,
    ) -> Option<OrchestratorResult<()>> {
        let candidates: Vec<(String, Arc<dyn ExecutionBackend>)> = {
            let children = self.children.lock().await;
            children
                .iter()
                .filter(|(_, c)| {
                    c.image_id == image_id
                        && c.instance_type == instance_type
                        && c.backend.resource_status().updated
                })
                .map(|(id, c)| (id.clone(), c.backend.clone()))
                .collect()
        };

        for (vm_id, backend) in candidates {
            if backend.submit(task).await.is_ok() {
                task.handle_mut().vm_id = Some(vm_id.clone());
                let mut children = self.children.lock().await;
                if let Some(c) = children.get_mut(&vm_id) {
                    c.task_count += 1;
                }
                return Some(Ok(()));
            }
        }
        None
    }

    async fn any_vm_pending(&self) -> bool {
        let mut pool = self.pool.lock().await;
        let ids: Vec<String> = pool.ids().cloned().collect();
        for id in ids {
            if let Ok(handle) = pool.get(&id, self.provider.as_ref()).await {
                if handle.status.is_pending() {
                    return true;
                }
            }
        }
        false
    }

    /// Step 5: verify the keypair, boot a new VM, register it.
    async fn boot_new_vm(&self, image_id: &str, instance_type: &str, user_data: Option<&str>) -> OrchestratorResult<()> {
        self.provider
            .ensure_keypair(
                &self.config.keypair_name,
                &[
                    self.config.local_keypair.openssh_fingerprint.clone(),
                    self.config.local_keypair.aws_fingerprint.clone(),
                ],
            )
            .await
            .map_err(|e| match e {
                OrchestratorError::AuthUnrecoverable(_) => e,
                other => OrchestratorError::AuthUnrecoverable(other.to_string()),
            })?;

        if let Some(group) = &self.config.security_group_name {
            self.provider
                .ensure_security_group(group, &self.config.security_group_rules)
                .await?;
        }

        let handle = self
            .provider
            .launch_instance(image_id, instance_type, user_data)
            .await?;

        if let Some(fingerprint) = &handle.key_fingerprint {
            if let Err(e) = verify_keypair(&self.config.local_keypair, fingerprint) {
                self.provider.terminate_instance(&handle.id).await.ok();
                return Err(e);
            }
        }

        let mut pool = self.pool.lock().await;
        pool.add(handle).await?;
        Ok(())
    }
}

#[async_trait]
impl ExecutionBackend for CloudBackend {
    fn attributes(&self) -> &BackendAttributes {
        &self.attributes
    }

    fn resource_status(&self) -> ResourceStatus {
        self.resource_status.try_lock().map(|g| *g).unwrap_or_default()
    }

    async fn submit(&self, task: &mut Task) -> OrchestratorResult<()> {
        self.refresh_pool().await;

        let (image_id, instance_type, user_data) = self.resolve_image_and_instance_type(task);

        if let Some(result) = self
            .try_submit_on_existing_children(task, &image_id, &instance_type)
            .await
        {
            return result;
        }

        if self.any_vm_pending().await {
            return Err(OrchestratorError::ResourceNotReady);
        }

        let pool_size = self.pool.lock().await.len();
        let at_capacity = match self.config.vm_pool_max_size {
            Some(max) => pool_size >= max,
            None => false,
        };

        if at_capacity {
            return Err(OrchestratorError::CapacityReached);
        }

        self.boot_new_vm(&image_id, &instance_type, user_data.as_deref())
            .await?;
        Err(OrchestratorError::ResourceNotReady)
    }

    async fn update_state(&self, task: &mut Task) -> OrchestratorResult<()> {
        let vm_id = task
            .handle
            .as_ref()
            .and_then(|h| h.vm_id.clone())
            .ok_or_else(|| OrchestratorError::Internal("update_state on unbound task".into()))?;

        let backend = {
            let children = self.children.lock().await;
            children.get(&vm_id).map(|c| c.backend.clone())
        };

        let backend = match backend {
            Some(b) => b,
            None => {
                // The VM vanished out-of-band: flip to Terminated with a
                // remote-error signal before raising, per §7.
                task.return_code = Some(crate::task::ReturnCode::synthesized_remote_error());
                transition(&mut task.state, TaskState::Terminated)?;
                return Err(OrchestratorError::InstanceNotFound(vm_id));
            }
        };

        backend.update_state(task).await
    }

    async fn cancel(&self, task: &mut Task) -> OrchestratorResult<()> {
        let vm_id = task
            .handle
            .as_ref()
            .and_then(|h| h.vm_id.clone())
            .ok_or_else(|| OrchestratorError::Internal("cancel on unbound task".into()))?;
        let backend = {
            let children = self.children.lock().await;
            children.get(&vm_id).map(|c| c.backend.clone())
        };
        match backend {
            Some(b) => b.cancel(task).await,
            None => transition(&mut task.state, TaskState::Terminated),
        }
    }

    async fn free(&self, task: &mut Task) {
        let vm_id = match task.handle.as_ref().and_then(|h| h.vm_id.clone()) {
            Some(v) => v,
            None => return,
        };
        let backend = {
            let children = self.children.lock().await;
            children.get(&vm_id).map(|c| c.backend.clone())
        };
        if let Some(backend) = backend {
            backend.free(task).await;
        }

        let mut children = self.children.lock().await;
        let remaining = children.get_mut(&vm_id).map(|c| {
            c.task_count = c.task_count.saturating_sub(1);
            c.task_count
        });
        if remaining == Some(0) {
            if let Some(child) = children.remove(&vm_id) {
                child.backend.close().await;
            }
            drop(children);
            if self.provider.terminate_instance(&vm_id).await.is_ok() {
                self.pool.lock().await.remove(&vm_id).await.ok();
            }
        }
    }

    async fn get_results(&self, task: &Task, overwrite: bool, changed_only: bool) -> OrchestratorResult<()> {
        let vm_id = task
            .handle
            .as_ref()
            .and_then(|h| h.vm_id.clone())
            .ok_or_else(|| OrchestratorError::Internal("get_results on unbound task".into()))?;
        let backend = {
            let children = self.children.lock().await;
            children.get(&vm_id).map(|c| c.backend.clone())
        };
        match backend {
            Some(b) => b.get_results(task, overwrite, changed_only).await,
            None => Err(OrchestratorError::DataStagingUnrecoverable(format!(
                "vm {vm_id} is gone"
            ))),
        }
    }

    async fn peek(&self, task: &Task, relative_path: &str, offset: u64, size: u64) -> OrchestratorResult<Bytes> {
        let vm_id = task
            .handle
            .as_ref()
            .and_then(|h| h.vm_id.clone())
            .ok_or_else(|| OrchestratorError::Internal("peek on unbound task".into()))?;
        let backend = {
            let children = self.children.lock().await;
            children.get(&vm_id).map(|c| c.backend.clone())
        };
        match backend {
            Some(b) => b.peek(task, relative_path, offset, size).await,
            None => Err(OrchestratorError::InstanceNotFound(vm_id)),
        }
    }

    async fn get_resource_status(&self) {
        self.refresh_pool().await;
        let children = self.children.lock().await;
        let mut status = ResourceStatus::default();
        let mut any_updated = false;
        for child in children.values() {
            let child_status = child.backend.resource_status();
            if child_status.updated {
                any_updated = true;
                status.free_slots += child_status.free_slots;
                status.user_run += child_status.user_run;
                status.user_queued += child_status.user_queued;
                status.total_queued += child_status.total_queued;
                status.total_running += child_status.total_running;
            }
        }
        status.updated = any_updated || children.is_empty();
        *self.resource_status.lock().await = status;
    }

    fn validate_data(&self, url: &str) -> bool {
        url.starts_with("file:") || url.starts_with("http:") || url.starts_with("https:")
    }

    async fn close(&self) {
        let mut children = self.children.lock().await;
        let drained: Vec<(String, Child)> = children.drain().collect();
        drop(children);
        for (vm_id, child) in drained {
            child.backend.close().await;
            if child.task_count == 0 {
                if self.provider.terminate_instance(&vm_id).await.is_ok() {
                    self.pool.lock().await.remove(&vm_id).await.ok();
                }
            } else {
                tracing::warn!(vm = %vm_id, tasks = child.task_count, "close: VM left running with outstanding tasks");
            }
        }
    }
}

/// Verify a cloud-reported keypair against the configured local keypair,
/// per the fingerprint check in §4.5. Returns an unrecoverable
/// authentication error on mismatch rather than booting a VM.
pub fn verify_keypair(local: &LocalKeypair, remote_fingerprint: &str) -> OrchestratorResult<()> {
    if fingerprints_match(
        remote_fingerprint,
        &local.openssh_fingerprint,
        &local.aws_fingerprint,
    ) {
        Ok(())
    } else {
        Err(OrchestratorError::AuthUnrecoverable(format!(
            "keypair fingerprint mismatch: remote reports {remote_fingerprint}, local key does not match"
        )))
    }
}
