//! Per-tool state and volume management.
//!
//! State is a key/value map namespaced by tool id and bounded by the tool's
//! resolved storage quota. Volumes are host directories bind-mounted into the
//! sandbox at `/data`. Writes made outside an execution wait for the tool's
//! turn, so they never interleave with a run's state mutations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use toolvault_state::{StateBatch, ToolId, ToolManifest, ToolStatus, ToolStore, ToolVolume};
use tracing::{debug, info};

use crate::error::{VaultError, VaultResult};
use crate::permissions::PermissionRegistry;
use crate::sandbox::{AdmissionScheduler, ToolTurn};

/// Where a tool's volume is mounted inside its sandbox.
pub const VOLUME_MOUNT_PATH: &str = "/data";

/// Deterministic volume name for a tool.
pub fn volume_name(tool_id: &ToolId) -> String {
    format!("toolvault-{tool_id}")
}

/// Host-side storage for tool volumes.
#[async_trait]
pub trait VolumeBackend: Send + Sync {
    /// Create (or reuse) the storage area and return its absolute host path.
    async fn create(&self, volume_name: &str, quota_mb: u64) -> VaultResult<PathBuf>;

    /// Destroy the storage area. Destroying a missing volume is not an error.
    async fn destroy(&self, volume_name: &str) -> VaultResult<()>;
}

/// One directory per volume under a common root.
pub struct FsVolumeBackend {
    root: PathBuf,
}

impl FsVolumeBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, volume_name: &str) -> VaultResult<PathBuf> {
        if volume_name.is_empty()
            || volume_name.contains(['/', '\\'])
            || volume_name.starts_with('.')
        {
            return Err(VaultError::Validation(format!(
                "illegal volume name '{volume_name}'"
            )));
        }
        Ok(self.root.join(volume_name))
    }
}

#[async_trait]
impl VolumeBackend for FsVolumeBackend {
    async fn create(&self, volume_name: &str, _quota_mb: u64) -> VaultResult<PathBuf> {
        let dir = self.dir(volume_name)?;
        tokio::fs::create_dir_all(&dir).await?;
        Ok(tokio::fs::canonicalize(&dir).await?)
    }

    async fn destroy(&self, volume_name: &str) -> VaultResult<()> {
        let dir = self.dir(volume_name)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// What a purge removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReport {
    pub state_entries_removed: u64,
    pub volume_removed: bool,
}

/// State and volume operations for tools.
#[derive(Clone)]
pub struct StateManager {
    store: Arc<dyn ToolStore>,
    permissions: PermissionRegistry,
    volumes: Arc<dyn VolumeBackend>,
    scheduler: Arc<AdmissionScheduler>,
    write_timeout: Duration,
}

impl StateManager {
    /// `write_timeout` bounds how long an external write waits for a
    /// running execution of the same tool.
    pub fn new(
        store: Arc<dyn ToolStore>,
        permissions: PermissionRegistry,
        volumes: Arc<dyn VolumeBackend>,
        scheduler: Arc<AdmissionScheduler>,
        write_timeout: Duration,
    ) -> Self {
        Self {
            store,
            permissions,
            volumes,
            scheduler,
            write_timeout,
        }
    }

    pub fn scheduler(&self) -> &Arc<AdmissionScheduler> {
        &self.scheduler
    }

    async fn turn(&self, tool_id: &ToolId, cancel: &CancellationToken) -> VaultResult<ToolTurn> {
        tokio::select! {
            turn = self.scheduler.exclusive(tool_id, self.write_timeout) => turn,
            _ = cancel.cancelled() => Err(VaultError::Cancelled),
        }
    }

    /// The manifest, unless the tool is unknown or its state was purged.
    async fn live_manifest(&self, tool_id: &ToolId) -> VaultResult<ToolManifest> {
        let manifest = self.store.get_manifest(tool_id).await?;
        if manifest.purged_at.is_some() {
            return Err(VaultError::NotFound {
                entity: "tool state",
                key: tool_id.to_string(),
            });
        }
        Ok(manifest)
    }

    async fn writable_manifest(&self, tool_id: &ToolId) -> VaultResult<ToolManifest> {
        let manifest = self.live_manifest(tool_id).await?;
        if manifest.status == ToolStatus::Revoked {
            return Err(VaultError::InvalidLifecycleTransition(format!(
                "tool {tool_id} is revoked; its state is read-only"
            )));
        }
        Ok(manifest)
    }

    pub async fn get_state(
        &self,
        tool_id: &ToolId,
        key: &str,
    ) -> VaultResult<Option<serde_json::Value>> {
        self.live_manifest(tool_id).await?;
        Ok(self.store.get_state(tool_id, key).await?.map(|e| e.value))
    }

    /// Set one key under the tool's storage quota.
    pub async fn set_state(
        &self,
        tool_id: &ToolId,
        key: &str,
        value: serde_json::Value,
        cancel: &CancellationToken,
    ) -> VaultResult<()> {
        let mut batch = StateBatch::default();
        batch.set.insert(key.to_string(), value);
        self.apply_batch(tool_id, &batch, cancel).await
    }

    /// Delete one key. Returns whether it existed.
    pub async fn delete_state(
        &self,
        tool_id: &ToolId,
        key: &str,
        cancel: &CancellationToken,
    ) -> VaultResult<bool> {
        self.writable_manifest(tool_id).await?;
        let _turn = self.turn(tool_id, cancel).await?;
        if self.store.get_state(tool_id, key).await?.is_none() {
            return Ok(false);
        }
        let batch = StateBatch {
            set: BTreeMap::new(),
            delete: vec![key.to_string()],
        };
        self.store.apply_batch(tool_id, &batch, u64::MAX).await?;
        Ok(true)
    }

    pub async fn list_state_keys(&self, tool_id: &ToolId) -> VaultResult<Vec<String>> {
        self.live_manifest(tool_id).await?;
        Ok(self
            .store
            .list_state(tool_id)
            .await?
            .into_iter()
            .map(|e| e.key)
            .collect())
    }

    /// Every key and value of a tool, as handed to the sandbox.
    pub async fn snapshot(&self, tool_id: &ToolId) -> VaultResult<BTreeMap<String, serde_json::Value>> {
        self.live_manifest(tool_id).await?;
        Ok(self
            .store
            .list_state(tool_id)
            .await?
            .into_iter()
            .map(|e| (e.key, e.value))
            .collect())
    }

    /// Bytes of state currently held by a tool.
    pub async fn usage_bytes(&self, tool_id: &ToolId) -> VaultResult<u64> {
        self.live_manifest(tool_id).await?;
        Ok(self
            .store
            .list_state(tool_id)
            .await?
            .iter()
            .map(|e| e.size_bytes)
            .sum())
    }

    /// Apply a batch all-or-nothing under the freshly resolved quota, once
    /// no execution of the tool is running.
    pub async fn apply_batch(
        &self,
        tool_id: &ToolId,
        batch: &StateBatch,
        cancel: &CancellationToken,
    ) -> VaultResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let _turn = self.turn(tool_id, cancel).await?;
        self.apply_batch_in_turn(tool_id, batch).await
    }

    /// `apply_batch` for a caller that already holds the tool's turn.
    pub(crate) async fn apply_batch_in_turn(
        &self,
        tool_id: &ToolId,
        batch: &StateBatch,
    ) -> VaultResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        if let Some(key) = batch
            .set
            .keys()
            .chain(batch.delete.iter())
            .find(|k| k.trim().is_empty())
        {
            return Err(VaultError::Validation(format!("illegal state key '{key}'")));
        }
        self.writable_manifest(tool_id).await?;
        let quota = if batch.set.is_empty() {
            u64::MAX
        } else {
            self.permissions
                .check_and_resolve(tool_id)
                .await?
                .storage_quota_bytes()
        };
        self.store.apply_batch(tool_id, batch, quota).await?;
        debug!(
            tool_id = %tool_id,
            set = batch.set.len(),
            deleted = batch.delete.len(),
            "state batch applied"
        );
        Ok(())
    }

    /// Allocate the tool's volume. Idempotent: an existing volume is returned
    /// unchanged.
    pub async fn allocate_volume(&self, tool_id: &ToolId, quota_mb: u64) -> VaultResult<ToolVolume> {
        let manifest = self.store.get_manifest(tool_id).await?;
        if manifest.status == ToolStatus::Revoked {
            if manifest.purged_at.is_some() {
                return Err(VaultError::NotFound {
                    entity: "tool volume",
                    key: tool_id.to_string(),
                });
            }
            return Err(VaultError::InvalidLifecycleTransition(format!(
                "cannot allocate a volume for revoked tool {tool_id}"
            )));
        }
        if let Some(existing) = self.store.get_volume(tool_id).await? {
            return Ok(existing);
        }

        let name = volume_name(tool_id);
        let host_path = self.volumes.create(&name, quota_mb).await?;
        let volume = ToolVolume {
            tool_id: tool_id.clone(),
            volume_name: name,
            mount_path: VOLUME_MOUNT_PATH.to_string(),
            host_path: host_path.display().to_string(),
            quota_mb,
            created_at: Utc::now(),
        };
        match self.store.insert_volume(&volume).await {
            Ok(()) => {
                info!(event = "volume.allocated", tool_id = %tool_id, quota_mb = quota_mb);
                Ok(volume)
            }
            Err(toolvault_state::StorageError::Duplicate { .. }) => self
                .store
                .get_volume(tool_id)
                .await?
                .ok_or_else(|| VaultError::Storage(format!("volume for {tool_id} vanished"))),
            Err(e) => Err(e.into()),
        }
    }

    /// The tool's volume, allocating it with the resolved storage quota if
    /// missing.
    pub async fn ensure_volume(&self, tool_id: &ToolId) -> VaultResult<ToolVolume> {
        if let Some(existing) = self.store.get_volume(tool_id).await? {
            return Ok(existing);
        }
        let resolved = self.permissions.check_and_resolve(tool_id).await?;
        self.allocate_volume(tool_id, resolved.storage_quota_mb).await
    }

    pub async fn volume(&self, tool_id: &ToolId) -> VaultResult<Option<ToolVolume>> {
        Ok(self.store.get_volume(tool_id).await?)
    }

    /// Destroy a revoked tool's state and volume. Irreversible. Purging an
    /// already purged tool reports nothing removed.
    pub async fn purge_volume(&self, tool_id: &ToolId) -> VaultResult<PurgeReport> {
        let manifest = self.store.get_manifest(tool_id).await?;
        if manifest.status != ToolStatus::Revoked {
            return Err(VaultError::InvalidLifecycleTransition(format!(
                "purge requires a revoked tool; {tool_id} is {}",
                manifest.status
            )));
        }
        if manifest.purged_at.is_some() {
            return Ok(PurgeReport::default());
        }

        let state_entries_removed = self.store.purge_state(tool_id).await?;
        let mut volume_removed = false;
        if let Some(volume) = self.store.get_volume(tool_id).await? {
            self.volumes.destroy(&volume.volume_name).await?;
            volume_removed = self.store.delete_volume(tool_id).await?;
        }
        self.store.mark_purged(tool_id, Utc::now()).await?;
        info!(
            event = "volume.purged",
            tool_id = %tool_id,
            state_entries_removed = state_entries_removed,
            volume_removed = volume_removed,
        );
        Ok(PurgeReport {
            state_entries_removed,
            volume_removed,
        })
    }
}
