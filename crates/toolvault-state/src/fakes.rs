//! In-memory fakes for storage traits (testing only)
//!
//! `MemoryToolStore` satisfies every trait contract in `storage_traits`
//! without any external dependencies. All relations share one lock, so each
//! call is atomic with respect to every other.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::records::*;
use crate::storage_traits::*;

#[derive(Debug, Default)]
struct Inner {
    manifests: Vec<ToolManifest>,
    permissions: HashMap<(String, PermissionKind), Permission>,
    permission_seq: u64,
    volumes: HashMap<String, ToolVolume>,
    state: HashMap<String, BTreeMap<String, ToolStateEntry>>,
    executions: Vec<ExecutionRecord>,
    discovery: Vec<DiscoveryRequest>,
    audit: Vec<LifecycleAuditEntry>,
}

/// In-memory implementation of every toolvault relation.
#[derive(Debug, Default)]
pub struct MemoryToolStore {
    inner: Mutex<Inner>,
    fail_permission_writes: AtomicBool,
}

impl MemoryToolStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `upsert_permission` fail with a backend error until
    /// switched off again.
    pub fn fail_permission_writes(&self, fail: bool) {
        self.fail_permission_writes.store(fail, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// ManifestStore
// ---------------------------------------------------------------------------

#[async_trait]
impl ManifestStore for MemoryToolStore {
    async fn insert_manifest(&self, manifest: &ToolManifest) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.manifests.iter().any(|m| m.name == manifest.name) {
            return Err(StorageError::Duplicate {
                entity: "manifest name",
                key: manifest.name.clone(),
            });
        }
        if inner.manifests.iter().any(|m| m.id == manifest.id) {
            return Err(StorageError::Duplicate {
                entity: "manifest id",
                key: manifest.id.to_string(),
            });
        }
        inner.manifests.push(manifest.clone());
        Ok(())
    }

    async fn get_manifest(&self, id: &ToolId) -> StorageResult<ToolManifest> {
        let inner = self.inner.lock().unwrap();
        inner
            .manifests
            .iter()
            .find(|m| &m.id == id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("tool", id))
    }

    async fn find_manifest_by_name(&self, name: &str) -> StorageResult<Option<ToolManifest>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.manifests.iter().find(|m| m.name == name).cloned())
    }

    async fn list_manifests(&self, status: Option<ToolStatus>) -> StorageResult<Vec<ToolManifest>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .manifests
            .iter()
            .filter(|m| status.map_or(true, |s| m.status == s))
            .cloned()
            .collect())
    }

    async fn set_status(
        &self,
        id: &ToolId,
        expected: ToolStatus,
        next: ToolStatus,
        at: DateTime<Utc>,
    ) -> StorageResult<ToolManifest> {
        let mut inner = self.inner.lock().unwrap();
        let manifest = inner
            .manifests
            .iter_mut()
            .find(|m| &m.id == id)
            .ok_or_else(|| StorageError::not_found("tool", id))?;
        if manifest.status != expected {
            return Err(StorageError::StaleState {
                entity: "tool",
                key: id.to_string(),
                actual: manifest.status.to_string(),
                expected: expected.to_string(),
            });
        }
        manifest.status = next;
        manifest.updated_at = at;
        match next {
            ToolStatus::Approved => manifest.approved_at = Some(at),
            ToolStatus::Revoked => manifest.revoked_at = Some(at),
            _ => {}
        }
        Ok(manifest.clone())
    }

    async fn set_superseded_by(&self, id: &ToolId, successor: &ToolId) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let manifest = inner
            .manifests
            .iter_mut()
            .find(|m| &m.id == id)
            .ok_or_else(|| StorageError::not_found("tool", id))?;
        manifest.superseded_by = Some(successor.clone());
        manifest.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_purged(&self, id: &ToolId, at: DateTime<Utc>) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let manifest = inner
            .manifests
            .iter_mut()
            .find(|m| &m.id == id)
            .ok_or_else(|| StorageError::not_found("tool", id))?;
        manifest.purged_at = Some(at);
        manifest.updated_at = at;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PermissionStore
// ---------------------------------------------------------------------------

#[async_trait]
impl PermissionStore for MemoryToolStore {
    async fn upsert_permission(
        &self,
        tool_id: &ToolId,
        kind: PermissionKind,
        value: &str,
        granted_by: &str,
    ) -> StorageResult<Permission> {
        if self.fail_permission_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("permission write failed".to_string()));
        }
        let mut inner = self.inner.lock().unwrap();
        inner.permission_seq += 1;
        let row = Permission {
            tool_id: tool_id.clone(),
            kind,
            value: value.to_string(),
            granted_by: granted_by.to_string(),
            seq: inner.permission_seq,
            granted_at: Utc::now(),
        };
        inner
            .permissions
            .insert((tool_id.0.clone(), kind), row.clone());
        Ok(row)
    }

    async fn list_permissions(&self, tool_id: &ToolId) -> StorageResult<Vec<Permission>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<Permission> = inner
            .permissions
            .values()
            .filter(|p| &p.tool_id == tool_id)
            .cloned()
            .collect();
        rows.sort_by_key(|p| p.kind);
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// VolumeStore
// ---------------------------------------------------------------------------

#[async_trait]
impl VolumeStore for MemoryToolStore {
    async fn insert_volume(&self, volume: &ToolVolume) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.volumes.contains_key(&volume.tool_id.0) {
            return Err(StorageError::Duplicate {
                entity: "volume for tool",
                key: volume.tool_id.to_string(),
            });
        }
        if inner
            .volumes
            .values()
            .any(|v| v.volume_name == volume.volume_name)
        {
            return Err(StorageError::Duplicate {
                entity: "volume name",
                key: volume.volume_name.clone(),
            });
        }
        inner
            .volumes
            .insert(volume.tool_id.0.clone(), volume.clone());
        Ok(())
    }

    async fn get_volume(&self, tool_id: &ToolId) -> StorageResult<Option<ToolVolume>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.volumes.get(&tool_id.0).cloned())
    }

    async fn delete_volume(&self, tool_id: &ToolId) -> StorageResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.volumes.remove(&tool_id.0).is_some())
    }
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

#[async_trait]
impl StateStore for MemoryToolStore {
    async fn get_state(&self, tool_id: &ToolId, key: &str) -> StorageResult<Option<ToolStateEntry>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .state
            .get(&tool_id.0)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    async fn list_state(&self, tool_id: &ToolId) -> StorageResult<Vec<ToolStateEntry>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .state
            .get(&tool_id.0)
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn apply_batch(
        &self,
        tool_id: &ToolId,
        batch: &StateBatch,
        quota_bytes: u64,
    ) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let existing: Vec<ToolStateEntry> = inner
            .state
            .get(&tool_id.0)
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default();
        let required = projected_state_size(&existing, batch)?;
        if required > quota_bytes {
            return Err(StorageError::QuotaExceeded {
                tool_id: tool_id.to_string(),
                required,
                quota: quota_bytes,
            });
        }

        let entries = inner.state.entry(tool_id.0.clone()).or_default();
        for key in &batch.delete {
            entries.remove(key);
        }
        for (key, value) in &batch.set {
            entries.insert(
                key.clone(),
                ToolStateEntry::new(tool_id.clone(), key.clone(), value.clone()),
            );
        }
        Ok(())
    }

    async fn purge_state(&self, tool_id: &ToolId) -> StorageResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner
            .state
            .remove(&tool_id.0)
            .map(|entries| entries.len() as u64)
            .unwrap_or(0))
    }
}

// ---------------------------------------------------------------------------
// ExecutionLedger
// ---------------------------------------------------------------------------

#[async_trait]
impl ExecutionLedger for MemoryToolStore {
    async fn append_execution(&self, record: &ExecutionRecord) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .executions
            .iter()
            .any(|r| r.execution_id == record.execution_id)
        {
            return Err(StorageError::Duplicate {
                entity: "execution",
                key: record.execution_id.to_string(),
            });
        }
        inner.executions.push(record.clone());
        Ok(())
    }

    async fn finish_execution(
        &self,
        id: &ExecutionId,
        outcome: ExecutionOutcome,
        completed_at: DateTime<Utc>,
    ) -> StorageResult<ExecutionRecord> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .executions
            .iter_mut()
            .find(|r| &r.execution_id == id)
            .ok_or_else(|| StorageError::not_found("execution", id))?;
        if record.status != ExecutionStatus::Running {
            return Err(StorageError::StaleState {
                entity: "execution",
                key: id.to_string(),
                actual: record.status.to_string(),
                expected: ExecutionStatus::Running.to_string(),
            });
        }
        record.finish(outcome, completed_at);
        Ok(record.clone())
    }

    async fn get_execution(&self, id: &ExecutionId) -> StorageResult<ExecutionRecord> {
        let inner = self.inner.lock().unwrap();
        inner
            .executions
            .iter()
            .find(|r| &r.execution_id == id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("execution", id))
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> StorageResult<Vec<ExecutionRecord>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<ExecutionRecord> = inner
            .executions
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.started_at);
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// DiscoveryStore
// ---------------------------------------------------------------------------

#[async_trait]
impl DiscoveryStore for MemoryToolStore {
    async fn insert_discovery(&self, request: &DiscoveryRequest) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .discovery
            .iter()
            .any(|r| r.request_id == request.request_id)
        {
            return Err(StorageError::Duplicate {
                entity: "discovery request",
                key: request.request_id.to_string(),
            });
        }
        inner.discovery.push(request.clone());
        Ok(())
    }

    async fn get_discovery(&self, id: &DiscoveryRequestId) -> StorageResult<DiscoveryRequest> {
        let inner = self.inner.lock().unwrap();
        inner
            .discovery
            .iter()
            .find(|r| &r.request_id == id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("discovery request", id))
    }

    async fn find_open_discovery(&self, dedup_key: &str) -> StorageResult<Option<DiscoveryRequest>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .discovery
            .iter()
            .find(|r| r.dedup_key == dedup_key && !r.status.is_terminal())
            .cloned())
    }

    async fn update_discovery(
        &self,
        request: &DiscoveryRequest,
        expected: DiscoveryStatus,
    ) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let stored = inner
            .discovery
            .iter_mut()
            .find(|r| r.request_id == request.request_id)
            .ok_or_else(|| StorageError::not_found("discovery request", &request.request_id))?;
        if stored.status != expected {
            return Err(StorageError::StaleState {
                entity: "discovery request",
                key: request.request_id.to_string(),
                actual: stored.status.to_string(),
                expected: expected.to_string(),
            });
        }
        *stored = request.clone();
        Ok(())
    }

    async fn list_discovery(
        &self,
        status: Option<DiscoveryStatus>,
    ) -> StorageResult<Vec<DiscoveryRequest>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .discovery
            .iter()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// AuditLog
// ---------------------------------------------------------------------------

#[async_trait]
impl AuditLog for MemoryToolStore {
    async fn append_audit(&self, entry: &LifecycleAuditEntry) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.audit.push(entry.clone());
        Ok(())
    }

    async fn list_audit(&self, tool_id: Option<&ToolId>) -> StorageResult<Vec<LifecycleAuditEntry>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .audit
            .iter()
            .filter(|e| tool_id.map_or(true, |t| e.tool_id.as_ref() == Some(t)))
            .cloned()
            .collect())
    }
}
