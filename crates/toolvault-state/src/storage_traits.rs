//! Storage trait definitions for toolvault
//!
//! One trait per durable relation:
//! - `ManifestStore`: tool identity and lifecycle status
//! - `PermissionStore`: per-tool grants, last-write-wins by sequence
//! - `VolumeStore`: one private volume per tool
//! - `StateStore`: per-tool key/value state with quota enforcement
//! - `ExecutionLedger`: append-only invocation records
//! - `DiscoveryStore`: capability-gap requests
//! - `AuditLog`: import and lifecycle attempts
//!
//! `ToolStore` bundles all of them so callers can inject a single
//! `Arc<dyn ToolStore>`. All traits are async and backend-agnostic;
//! in-memory fakes live in the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::records::*;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// ManifestStore
// ---------------------------------------------------------------------------

/// Durable manifest records.
///
/// Guarantees:
/// - `name` is unique across every manifest ever inserted.
/// - Manifests are never deleted.
/// - `set_status` is compare-and-set on the previous status.
#[async_trait]
pub trait ManifestStore: Send + Sync {
    /// Insert a new manifest. Fails with `Duplicate` when the name is taken.
    async fn insert_manifest(&self, manifest: &ToolManifest) -> StorageResult<()>;

    /// Fetch a manifest by ID.
    async fn get_manifest(&self, id: &ToolId) -> StorageResult<ToolManifest>;

    /// Fetch a manifest by unique name.
    async fn find_manifest_by_name(&self, name: &str) -> StorageResult<Option<ToolManifest>>;

    /// List manifests, optionally by status, oldest first.
    async fn list_manifests(&self, status: Option<ToolStatus>) -> StorageResult<Vec<ToolManifest>>;

    /// Move `id` from `expected` to `next`. Fails with `StaleState` and
    /// changes nothing if the stored status is not `expected`.
    async fn set_status(
        &self,
        id: &ToolId,
        expected: ToolStatus,
        next: ToolStatus,
        at: DateTime<Utc>,
    ) -> StorageResult<ToolManifest>;

    /// Record that a revoked manifest was re-proposed as `successor`.
    async fn set_superseded_by(&self, id: &ToolId, successor: &ToolId) -> StorageResult<()>;

    /// Record that a tool's state and volume were destroyed.
    async fn mark_purged(&self, id: &ToolId, at: DateTime<Utc>) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// PermissionStore
// ---------------------------------------------------------------------------

/// Per-tool grants.
///
/// Guarantees:
/// - At most one row per `(tool_id, kind)`.
/// - Every upsert is assigned a strictly increasing `seq` by the store;
///   the stored row is always the one with the highest `seq`.
#[async_trait]
pub trait PermissionStore: Send + Sync {
    /// Overwrite the grant for `(tool_id, kind)` and return the stored row.
    async fn upsert_permission(
        &self,
        tool_id: &ToolId,
        kind: PermissionKind,
        value: &str,
        granted_by: &str,
    ) -> StorageResult<Permission>;

    /// All grants for a tool.
    async fn list_permissions(&self, tool_id: &ToolId) -> StorageResult<Vec<Permission>>;
}

// ---------------------------------------------------------------------------
// VolumeStore
// ---------------------------------------------------------------------------

/// Volume bookkeeping. The bytes themselves live on the host.
#[async_trait]
pub trait VolumeStore: Send + Sync {
    /// Record a volume. Fails with `Duplicate` if the tool already has one
    /// or the volume name is taken.
    async fn insert_volume(&self, volume: &ToolVolume) -> StorageResult<()>;

    /// The tool's volume, if allocated.
    async fn get_volume(&self, tool_id: &ToolId) -> StorageResult<Option<ToolVolume>>;

    /// Forget a tool's volume. Returns whether a row existed.
    async fn delete_volume(&self, tool_id: &ToolId) -> StorageResult<bool>;
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// Per-tool key/value state.
///
/// Guarantees:
/// - Keys are namespaced by `tool_id`; no read ever crosses tools.
/// - `apply_batch` is all-or-nothing and rejects with `QuotaExceeded` when
///   the resulting total `size_bytes` would exceed `quota_bytes`.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_state(&self, tool_id: &ToolId, key: &str) -> StorageResult<Option<ToolStateEntry>>;

    /// Every entry of a tool, ordered by key.
    async fn list_state(&self, tool_id: &ToolId) -> StorageResult<Vec<ToolStateEntry>>;

    /// Apply sets and deletes atomically under the quota.
    async fn apply_batch(
        &self,
        tool_id: &ToolId,
        batch: &StateBatch,
        quota_bytes: u64,
    ) -> StorageResult<()>;

    /// Remove every entry of a tool. Returns the number removed.
    async fn purge_state(&self, tool_id: &ToolId) -> StorageResult<u64>;
}

// ---------------------------------------------------------------------------
// ExecutionLedger
// ---------------------------------------------------------------------------

/// Append-only invocation ledger.
///
/// Guarantees:
/// - A record transitions out of `running` exactly once.
/// - Terminal records are immutable.
#[async_trait]
pub trait ExecutionLedger: Send + Sync {
    /// Append a record (usually `running`; terminal rows are allowed for
    /// invocations rejected before launch).
    async fn append_execution(&self, record: &ExecutionRecord) -> StorageResult<()>;

    /// Complete a running record. Fails with `StaleState` if it is already
    /// terminal.
    async fn finish_execution(
        &self,
        id: &ExecutionId,
        outcome: ExecutionOutcome,
        completed_at: DateTime<Utc>,
    ) -> StorageResult<ExecutionRecord>;

    async fn get_execution(&self, id: &ExecutionId) -> StorageResult<ExecutionRecord>;

    /// Filtered listing, ordered by `started_at` ascending.
    async fn list_executions(&self, filter: &ExecutionFilter) -> StorageResult<Vec<ExecutionRecord>>;
}

// ---------------------------------------------------------------------------
// DiscoveryStore
// ---------------------------------------------------------------------------

/// Capability-gap request queue.
#[async_trait]
pub trait DiscoveryStore: Send + Sync {
    async fn insert_discovery(&self, request: &DiscoveryRequest) -> StorageResult<()>;

    async fn get_discovery(&self, id: &DiscoveryRequestId) -> StorageResult<DiscoveryRequest>;

    /// A non-terminal request with the same dedup key, if any.
    async fn find_open_discovery(&self, dedup_key: &str) -> StorageResult<Option<DiscoveryRequest>>;

    /// Replace a request whose stored status is `expected`. Fails with
    /// `StaleState` otherwise.
    async fn update_discovery(
        &self,
        request: &DiscoveryRequest,
        expected: DiscoveryStatus,
    ) -> StorageResult<()>;

    /// List requests, optionally by status, oldest first.
    async fn list_discovery(
        &self,
        status: Option<DiscoveryStatus>,
    ) -> StorageResult<Vec<DiscoveryRequest>>;
}

// ---------------------------------------------------------------------------
// AuditLog
// ---------------------------------------------------------------------------

/// Append-only log of import and lifecycle attempts.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append_audit(&self, entry: &LifecycleAuditEntry) -> StorageResult<()>;

    /// Entries for one tool (or all when `None`), oldest first.
    async fn list_audit(&self, tool_id: Option<&ToolId>) -> StorageResult<Vec<LifecycleAuditEntry>>;
}

/// Every relation behind one injectable handle.
pub trait ToolStore:
    ManifestStore + PermissionStore + VolumeStore + StateStore + ExecutionLedger + DiscoveryStore + AuditLog
{
}

impl<T> ToolStore for T where
    T: ManifestStore
        + PermissionStore
        + VolumeStore
        + StateStore
        + ExecutionLedger
        + DiscoveryStore
        + AuditLog
{
}

/// Size in bytes a state batch leaves behind, given the current entries.
///
/// Shared by every backend so quota accounting is identical.
pub fn projected_state_size(existing: &[ToolStateEntry], batch: &StateBatch) -> StorageResult<u64> {
    let mut total = 0u64;
    for entry in existing {
        if batch.set.contains_key(&entry.key) || batch.delete.contains(&entry.key) {
            continue;
        }
        total += entry.size_bytes;
    }
    for value in batch.set.values() {
        total += serde_json::to_vec(value)?.len() as u64;
    }
    Ok(total)
}
