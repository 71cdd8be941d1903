//! Persistable set of VM handles with a lazily-populated live-handle
//! cache, per §4.6.
//!
//! Backing store: `vmIDs` is the authoritative set, persisted as one
//! (possibly `preferred_ip`-holding) file per ID in a pool-specific
//! directory — crash-safe and inspectable with `ls`, and lets multiple
//! orchestrator processes see each other's registrations via plain
//! `readdir` rather than a shared pickle file.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::{OrchestratorError, OrchestratorResult};

/// Provider-assigned VM lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmStatus {
    Pending,
    Running,
    ShuttingDown,
    Stopped,
    Error,
    Terminated,
}

impl VmStatus {
    /// Terminal-error set per §4.5 step 1: VMs in this set are dropped
    /// from the pool and from the cloud back-end's child map.
    pub fn is_terminal_error(self) -> bool {
        matches!(self, VmStatus::Error | VmStatus::Terminated)
    }

    pub fn is_pending(self) -> bool {
        matches!(self, VmStatus::Pending)
    }
}

/// A small record of stable fields; the provider client type never leaks
/// beyond the pool.
#[derive(Debug, Clone)]
pub struct VmHandle {
    pub id: String,
    pub status: VmStatus,
    /// Advertised addresses, in provider-reported order; `preferred_ip`
    /// (persisted with the marker file) is promoted to the front once a
    /// connection on it has succeeded.
    pub addresses: Vec<String>,
    pub preferred_ip: Option<String>,
    pub image_id: String,
    pub instance_type: String,
    /// The keypair fingerprint the provider reports for this instance, if
    /// it exposes one at launch time (e.g. AWS's console MD5-of-DER
    /// fingerprint). `None` means the provider doesn't surface this and
    /// the cloud back-end cannot verify the key before trusting the VM.
    pub key_fingerprint: Option<String>,
}

impl VmHandle {
    pub fn preferred_or_first_address(&self) -> Option<&str> {
        self.preferred_ip
            .as_deref()
            .or_else(|| self.addresses.first().map(|s| s.as_str()))
    }
}

/// Describes a VM to the cloud provider; the four provider-specific verbs
/// the cloud back-end needs, kept separate from the pool's bookkeeping so
/// the pool itself stays provider-agnostic.
#[async_trait::async_trait]
pub trait CloudProvider: Send + Sync {
    async fn describe_instance(&self, id: &str) -> OrchestratorResult<VmHandle>;
    async fn launch_instance(
        &self,
        image_id: &str,
        instance_type: &str,
        user_data: Option<&str>,
    ) -> OrchestratorResult<VmHandle>;
    async fn terminate_instance(&self, id: &str) -> OrchestratorResult<()>;
    async fn ensure_keypair(&self, name: &str, local_public_key_fingerprints: &[String]) -> OrchestratorResult<()>;
    async fn ensure_security_group(&self, name: &str, rules: &[String]) -> OrchestratorResult<()>;
}

/// Dual set-like/map-like persistable container for VM handles.
pub struct VmPool {
    dir: PathBuf,
    ids: HashSet<String>,
    cache: HashMap<String, VmHandle>,
}

impl VmPool {
    /// Open (or create) the pool directory, loading the on-disk ID set.
    /// The live-handle cache always starts empty — it is reconstructible
    /// from the provider, never persisted itself.
    pub async fn open(dir: impl Into<PathBuf>) -> OrchestratorResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| OrchestratorError::Internal(format!("creating pool dir {dir:?}: {e}")))?;
        let ids = read_marker_ids(&dir).await?;
        Ok(Self {
            dir,
            ids,
            cache: HashMap::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.ids.iter()
    }

    /// Register `handle`, persisting a marker file holding its
    /// `preferred_ip` (if any). Adding an already-present ID is
    /// idempotent: the set's length does not change.
    pub async fn add(&mut self, handle: VmHandle) -> OrchestratorResult<()> {
        let marker = self.marker_path(&handle.id);
        let contents = handle.preferred_ip.clone().unwrap_or_default();
        tokio::fs::write(&marker, contents)
            .await
            .map_err(|e| OrchestratorError::Internal(format!("writing marker {marker:?}: {e}")))?;
        self.ids.insert(handle.id.clone());
        self.cache.insert(handle.id.clone(), handle);
        Ok(())
    }

    /// Deregister the VM with `id`. `remove` on an absent ID is a no-op.
    pub async fn remove(&mut self, id: &str) -> OrchestratorResult<()> {
        let marker = self.marker_path(id);
        match tokio::fs::remove_file(&marker).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(OrchestratorError::Internal(format!(
                    "removing marker {marker:?}: {e}"
                )))
            }
        }
        self.ids.remove(id);
        self.cache.remove(id);
        Ok(())
    }

    /// Map-like lookup: the live handle for `id`, populated lazily by
    /// calling `provider.describe_instance` on first access. A provider
    /// miss is promoted to [`OrchestratorError::InstanceNotFound`] — the VM
    /// was deleted out from under us, and the caller must drop it, a
    /// permanent error, never retried silently.
    pub async fn get(
        &mut self,
        id: &str,
        provider: &dyn CloudProvider,
    ) -> OrchestratorResult<&VmHandle> {
        if !self.ids.contains(id) {
            return Err(OrchestratorError::InstanceNotFound(id.to_string()));
        }
        if !self.cache.contains_key(id) {
            let handle = provider.describe_instance(id).await?;
            self.cache.insert(id.to_string(), handle);
        }
        Ok(self.cache.get(id).expect("just inserted"))
    }

    /// Update a cached handle's `preferred_ip`, persisting it to the
    /// marker file so it survives a process restart.
    pub async fn set_preferred_ip(&mut self, id: &str, ip: String) -> OrchestratorResult<()> {
        let marker = self.marker_path(id);
        tokio::fs::write(&marker, &ip)
            .await
            .map_err(|e| OrchestratorError::Internal(format!("writing marker {marker:?}: {e}")))?;
        if let Some(handle) = self.cache.get_mut(id) {
            handle.preferred_ip = Some(ip);
        }
        Ok(())
    }

    /// Reconcile with the on-disk set: IDs present on disk but missing
    /// from memory are added (another process may have registered them);
    /// IDs present in memory but missing from disk are removed.
    pub async fn update(&mut self, remove: bool) -> OrchestratorResult<()> {
        let on_disk = read_marker_ids(&self.dir).await?;
        let additions: Vec<String> = on_disk.difference(&self.ids).cloned().collect();
        for id in additions {
            self.ids.insert(id);
        }
        if remove {
            let missing: Vec<String> = self.ids.difference(&on_disk).cloned().collect();
            for id in missing {
                self.ids.remove(&id);
                self.cache.remove(&id);
            }
        }
        Ok(())
    }

    fn marker_path(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }
}

async fn read_marker_ids(dir: &Path) -> OrchestratorResult<HashSet<String>> {
    let mut ids = HashSet::new();
    let mut rd = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| OrchestratorError::Internal(format!("reading pool dir {dir:?}: {e}")))?;
    while let Some(entry) = rd
        .next_entry()
        .await
        .map_err(|e| OrchestratorError::Internal(format!("reading pool dir {dir:?}: {e}")))?
    {
        if let Some(name) = entry.file_name().to_str() {
            ids.insert(name.to_string());
        }
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: &str) -> VmHandle {
        VmHandle {
            id: id.to_string(),
            status: VmStatus::Pending,
            addresses: vec![],
            preferred_ip: None,
            image_id: "img".to_string(),
            instance_type: "small".to_string(),
            key_fingerprint: None,
        }
    }

    #[tokio::test]
    async fn add_then_remove_leaves_pool_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = VmPool::open(dir.path()).await.unwrap();
        pool.add(handle("vm-1")).await.unwrap();
        assert!(pool.contains("vm-1"));
        pool.remove("vm-1").await.unwrap();
        assert!(!pool.contains("vm-1"));
    }

    #[tokio::test]
    async fn add_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = VmPool::open(dir.path()).await.unwrap();
        pool.add(handle("vm-1")).await.unwrap();
        pool.add(handle("vm-1")).await.unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut p1 = VmPool::open(dir.path()).await.unwrap();
        p1.add(handle("vm-1")).await.unwrap();
        p1.add(handle("vm-2")).await.unwrap();

        let p2 = VmPool::open(dir.path()).await.unwrap();
        let mut ids1: Vec<&String> = p1.ids().collect();
        let mut ids2: Vec<&String> = p2.ids().collect();
        ids1.sort();
        ids2.sort();
        assert_eq!(ids1, ids2);
        assert!(p2.cache.is_empty());
    }

    #[tokio::test]
    async fn update_reconciles_with_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut p1 = VmPool::open(dir.path()).await.unwrap();
        p1.add(handle("vm-1")).await.unwrap();

        // Another process registers vm-2 directly on disk.
        tokio::fs::write(dir.path().join("vm-2"), "").await.unwrap();
        p1.update(false).await.unwrap();
        assert!(p1.contains("vm-2"));

        // Another process deregisters vm-1.
        tokio::fs::remove_file(dir.path().join("vm-1")).await.unwrap();
        p1.update(true).await.unwrap();
        assert!(!p1.contains("vm-1"));
    }
}
