//! SurrealDB-backed implementation of every toolvault relation
//!
//! Uses the row types in `schema` for persistence, converting to/from the
//! `records` types at the boundary. Mutations are serialized through one
//! writer lock so read-check-write sequences (name uniqueness, permission
//! sequence numbers, quota-checked state batches, compare-and-set status
//! changes) cannot interleave.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::handle;
use crate::records::*;
use crate::schema::{
    AuditRow, DiscoveryRow, ExecutionRow, ManifestRow, PermissionRow, StateRow, VolumeRow,
};
use crate::storage_traits::*;

/// SurrealDB-backed [`ToolStore`].
pub struct SurrealToolStore {
    db: Surreal<Any>,
    write: Mutex<()>,
}

impl SurrealToolStore {
    /// Wrap an already-initialized connection.
    pub fn new(db: Surreal<Any>) -> Self {
        Self {
            db,
            write: Mutex::new(()),
        }
    }

    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        let db = handle::connect_url("mem://").await?;
        info!("SurrealToolStore connected (in-memory)");
        Ok(Self::new(db))
    }

    /// Connect to an explicit URL (`mem://`, `surrealkv://path`, `ws://…`).
    pub async fn open(url: &str) -> crate::Result<Self> {
        let db = handle::connect_url(url).await?;
        info!(url, "SurrealToolStore connected");
        Ok(Self::new(db))
    }

    /// Create from environment variables, falling back to local
    /// persistence under `local_path`.
    pub async fn from_env(local_path: &str) -> crate::Result<Self> {
        let db = handle::connect_from_env(local_path).await?;
        Ok(Self::new(db))
    }

    // -- private helpers -----------------------------------------------------

    /// Run a query with one bound string parameter and decode every row.
    async fn select<T: DeserializeOwned>(
        &self,
        sql: &str,
        key: &'static str,
        value: String,
    ) -> StorageResult<Vec<T>> {
        let mut res = self
            .db
            .query(sql)
            .bind((key, value))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        res.take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    async fn select_all<T: DeserializeOwned>(&self, sql: &str) -> StorageResult<Vec<T>> {
        let mut res = self
            .db
            .query(sql)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        res.take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    async fn create_row<T>(&self, table: &'static str, row: T) -> StorageResult<()>
    where
        T: serde::Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let _created: Option<T> = self
            .db
            .create(table)
            .content(row)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    /// Replace the content of the row whose `field` equals `value`.
    async fn replace_row<T>(
        &self,
        table: &str,
        field: &str,
        value: String,
        row: T,
    ) -> StorageResult<()>
    where
        T: serde::Serialize + Send + Sync + 'static,
    {
        let sql = format!("UPDATE {table} CONTENT $row WHERE {field} = $key");
        self.db
            .query(sql)
            .bind(("row", row))
            .bind(("key", value))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .check()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn fetch_manifest(&self, id: &ToolId) -> StorageResult<ManifestRow> {
        let rows: Vec<ManifestRow> = self
            .select(
                "SELECT * FROM tool_manifests WHERE tool_id = $tid",
                "tid",
                id.0.clone(),
            )
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::not_found("tool", id))
    }

    async fn fetch_execution(&self, id: &ExecutionId) -> StorageResult<ExecutionRow> {
        let rows: Vec<ExecutionRow> = self
            .select(
                "SELECT * FROM tool_executions WHERE execution_id = $eid",
                "eid",
                id.0.clone(),
            )
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::not_found("execution", id))
    }

    async fn fetch_discovery(&self, id: &DiscoveryRequestId) -> StorageResult<DiscoveryRow> {
        let rows: Vec<DiscoveryRow> = self
            .select(
                "SELECT * FROM discovery_requests WHERE request_id = $rid",
                "rid",
                id.0.clone(),
            )
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::not_found("discovery request", id))
    }

    async fn next_permission_seq(&self) -> StorageResult<u64> {
        #[derive(Deserialize)]
        struct SeqRow {
            seq: u64,
        }
        let rows: Vec<SeqRow> = self
            .select_all("SELECT seq FROM tool_permissions ORDER BY seq DESC LIMIT 1")
            .await?;
        Ok(rows.first().map(|r| r.seq).unwrap_or(0) + 1)
    }
}

// ---------------------------------------------------------------------------
// ManifestStore
// ---------------------------------------------------------------------------

#[async_trait]
impl ManifestStore for SurrealToolStore {
    async fn insert_manifest(&self, manifest: &ToolManifest) -> StorageResult<()> {
        let _guard = self.write.lock().await;
        if self.find_manifest_by_name(&manifest.name).await?.is_some() {
            return Err(StorageError::Duplicate {
                entity: "manifest name",
                key: manifest.name.clone(),
            });
        }
        debug!(tool_id = %manifest.id, name = %manifest.name, "inserting manifest");
        self.create_row("tool_manifests", ManifestRow::from_record(manifest)?)
            .await
    }

    async fn get_manifest(&self, id: &ToolId) -> StorageResult<ToolManifest> {
        self.fetch_manifest(id).await?.into_record()
    }

    async fn find_manifest_by_name(&self, name: &str) -> StorageResult<Option<ToolManifest>> {
        let rows: Vec<ManifestRow> = self
            .select(
                "SELECT * FROM tool_manifests WHERE name = $name",
                "name",
                name.to_string(),
            )
            .await?;
        rows.into_iter().next().map(ManifestRow::into_record).transpose()
    }

    async fn list_manifests(&self, status: Option<ToolStatus>) -> StorageResult<Vec<ToolManifest>> {
        let rows: Vec<ManifestRow> = match status {
            Some(s) => {
                self.select(
                    "SELECT * FROM tool_manifests WHERE status = $status ORDER BY created_at ASC",
                    "status",
                    s.to_string(),
                )
                .await?
            }
            None => {
                self.select_all("SELECT * FROM tool_manifests ORDER BY created_at ASC")
                    .await?
            }
        };
        rows.into_iter().map(ManifestRow::into_record).collect()
    }

    async fn set_status(
        &self,
        id: &ToolId,
        expected: ToolStatus,
        next: ToolStatus,
        at: DateTime<Utc>,
    ) -> StorageResult<ToolManifest> {
        let _guard = self.write.lock().await;
        let row = self.fetch_manifest(id).await?;
        let mut manifest = row.into_record()?;
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
        self.replace_row(
            "tool_manifests",
            "tool_id",
            id.0.clone(),
            ManifestRow::from_record(&manifest)?,
        )
        .await?;
        Ok(manifest)
    }

    async fn set_superseded_by(&self, id: &ToolId, successor: &ToolId) -> StorageResult<()> {
        let _guard = self.write.lock().await;
        let mut manifest = self.fetch_manifest(id).await?.into_record()?;
        manifest.superseded_by = Some(successor.clone());
        manifest.updated_at = Utc::now();
        self.replace_row(
            "tool_manifests",
            "tool_id",
            id.0.clone(),
            ManifestRow::from_record(&manifest)?,
        )
        .await
    }

    async fn mark_purged(&self, id: &ToolId, at: DateTime<Utc>) -> StorageResult<()> {
        let _guard = self.write.lock().await;
        let mut manifest = self.fetch_manifest(id).await?.into_record()?;
        manifest.purged_at = Some(at);
        manifest.updated_at = at;
        self.replace_row(
            "tool_manifests",
            "tool_id",
            id.0.clone(),
            ManifestRow::from_record(&manifest)?,
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// PermissionStore
// ---------------------------------------------------------------------------

#[async_trait]
impl PermissionStore for SurrealToolStore {
    async fn upsert_permission(
        &self,
        tool_id: &ToolId,
        kind: PermissionKind,
        value: &str,
        granted_by: &str,
    ) -> StorageResult<Permission> {
        let _guard = self.write.lock().await;
        let seq = self.next_permission_seq().await?;
        let row = PermissionRow::new(tool_id, kind, value, granted_by, seq);

        let sql = r#"
            BEGIN TRANSACTION;
            DELETE tool_permissions WHERE tool_id = $tid AND kind = $kind;
            CREATE tool_permissions CONTENT $row;
            COMMIT TRANSACTION;
        "#;
        self.db
            .query(sql)
            .bind(("tid", tool_id.0.clone()))
            .bind(("kind", kind.to_string()))
            .bind(("row", row.clone()))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .check()
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        debug!(tool_id = %tool_id, kind = %kind, seq, "permission stored");
        row.into_record()
    }

    async fn list_permissions(&self, tool_id: &ToolId) -> StorageResult<Vec<Permission>> {
        let rows: Vec<PermissionRow> = self
            .select(
                "SELECT * FROM tool_permissions WHERE tool_id = $tid",
                "tid",
                tool_id.0.clone(),
            )
            .await?;
        let mut perms = rows
            .into_iter()
            .map(PermissionRow::into_record)
            .collect::<StorageResult<Vec<_>>>()?;
        perms.sort_by_key(|p| p.kind);
        Ok(perms)
    }
}

// ---------------------------------------------------------------------------
// VolumeStore
// ---------------------------------------------------------------------------

#[async_trait]
impl VolumeStore for SurrealToolStore {
    async fn insert_volume(&self, volume: &ToolVolume) -> StorageResult<()> {
        let _guard = self.write.lock().await;
        if self.get_volume(&volume.tool_id).await?.is_some() {
            return Err(StorageError::Duplicate {
                entity: "volume for tool",
                key: volume.tool_id.to_string(),
            });
        }
        let taken: Vec<VolumeRow> = self
            .select(
                "SELECT * FROM tool_volumes WHERE volume_name = $name",
                "name",
                volume.volume_name.clone(),
            )
            .await?;
        if !taken.is_empty() {
            return Err(StorageError::Duplicate {
                entity: "volume name",
                key: volume.volume_name.clone(),
            });
        }
        self.create_row("tool_volumes", VolumeRow::from(volume)).await
    }

    async fn get_volume(&self, tool_id: &ToolId) -> StorageResult<Option<ToolVolume>> {
        let rows: Vec<VolumeRow> = self
            .select(
                "SELECT * FROM tool_volumes WHERE tool_id = $tid",
                "tid",
                tool_id.0.clone(),
            )
            .await?;
        Ok(rows.into_iter().next().map(ToolVolume::from))
    }

    async fn delete_volume(&self, tool_id: &ToolId) -> StorageResult<bool> {
        let _guard = self.write.lock().await;
        let rows: Vec<VolumeRow> = self
            .select(
                "DELETE tool_volumes WHERE tool_id = $tid RETURN BEFORE",
                "tid",
                tool_id.0.clone(),
            )
            .await?;
        Ok(!rows.is_empty())
    }
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

#[async_trait]
impl StateStore for SurrealToolStore {
    async fn get_state(&self, tool_id: &ToolId, key: &str) -> StorageResult<Option<ToolStateEntry>> {
        let mut res = self
            .db
            .query("SELECT * FROM tool_state WHERE tool_id = $tid AND state_key = $key")
            .bind(("tid", tool_id.0.clone()))
            .bind(("key", key.to_string()))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let rows: Vec<StateRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(rows.into_iter().next().map(ToolStateEntry::from))
    }

    async fn list_state(&self, tool_id: &ToolId) -> StorageResult<Vec<ToolStateEntry>> {
        let rows: Vec<StateRow> = self
            .select(
                "SELECT * FROM tool_state WHERE tool_id = $tid ORDER BY state_key ASC",
                "tid",
                tool_id.0.clone(),
            )
            .await?;
        Ok(rows.into_iter().map(ToolStateEntry::from).collect())
    }

    async fn apply_batch(
        &self,
        tool_id: &ToolId,
        batch: &StateBatch,
        quota_bytes: u64,
    ) -> StorageResult<()> {
        let _guard = self.write.lock().await;
        let existing = self.list_state(tool_id).await?;
        let required = projected_state_size(&existing, batch)?;
        if required > quota_bytes {
            return Err(StorageError::QuotaExceeded {
                tool_id: tool_id.to_string(),
                required,
                quota: quota_bytes,
            });
        }
        if batch.is_empty() {
            return Ok(());
        }

        let mut touched: Vec<String> = batch.delete.clone();
        touched.extend(batch.set.keys().cloned());
        let rows: Vec<StateRow> = batch
            .set
            .iter()
            .map(|(k, v)| StateRow::from(&ToolStateEntry::new(tool_id.clone(), k.clone(), v.clone())))
            .collect();

        let sql = if rows.is_empty() {
            r#"
                BEGIN TRANSACTION;
                DELETE tool_state WHERE tool_id = $tid AND state_key INSIDE $keys;
                COMMIT TRANSACTION;
            "#
        } else {
            r#"
                BEGIN TRANSACTION;
                DELETE tool_state WHERE tool_id = $tid AND state_key INSIDE $keys;
                INSERT INTO tool_state $rows;
                COMMIT TRANSACTION;
            "#
        };
        self.db
            .query(sql)
            .bind(("tid", tool_id.0.clone()))
            .bind(("keys", touched))
            .bind(("rows", rows))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .check()
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        debug!(tool_id = %tool_id, bytes = required, "state batch applied");
        Ok(())
    }

    async fn purge_state(&self, tool_id: &ToolId) -> StorageResult<u64> {
        let _guard = self.write.lock().await;
        let rows: Vec<StateRow> = self
            .select(
                "DELETE tool_state WHERE tool_id = $tid RETURN BEFORE",
                "tid",
                tool_id.0.clone(),
            )
            .await?;
        Ok(rows.len() as u64)
    }
}

// ---------------------------------------------------------------------------
// ExecutionLedger
// ---------------------------------------------------------------------------

#[async_trait]
impl ExecutionLedger for SurrealToolStore {
    async fn append_execution(&self, record: &ExecutionRecord) -> StorageResult<()> {
        let _guard = self.write.lock().await;
        let existing: Vec<ExecutionRow> = self
            .select(
                "SELECT * FROM tool_executions WHERE execution_id = $eid",
                "eid",
                record.execution_id.0.clone(),
            )
            .await?;
        if !existing.is_empty() {
            return Err(StorageError::Duplicate {
                entity: "execution",
                key: record.execution_id.to_string(),
            });
        }
        debug!(execution_id = %record.execution_id, status = %record.status, "appending execution");
        self.create_row("tool_executions", ExecutionRow::from(record))
            .await
    }

    async fn finish_execution(
        &self,
        id: &ExecutionId,
        outcome: ExecutionOutcome,
        completed_at: DateTime<Utc>,
    ) -> StorageResult<ExecutionRecord> {
        let _guard = self.write.lock().await;
        let mut record = self.fetch_execution(id).await?.into_record()?;
        if record.status != ExecutionStatus::Running {
            return Err(StorageError::StaleState {
                entity: "execution",
                key: id.to_string(),
                actual: record.status.to_string(),
                expected: ExecutionStatus::Running.to_string(),
            });
        }
        record.finish(outcome, completed_at);
        self.replace_row(
            "tool_executions",
            "execution_id",
            id.0.clone(),
            ExecutionRow::from(&record),
        )
        .await?;
        Ok(record)
    }

    async fn get_execution(&self, id: &ExecutionId) -> StorageResult<ExecutionRecord> {
        self.fetch_execution(id).await?.into_record()
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> StorageResult<Vec<ExecutionRecord>> {
        let rows: Vec<ExecutionRow> = match (&filter.tool_id, filter.status) {
            (Some(tool), _) => {
                self.select(
                    "SELECT * FROM tool_executions WHERE tool_id = $tid ORDER BY started_at ASC",
                    "tid",
                    tool.0.clone(),
                )
                .await?
            }
            (None, Some(status)) => {
                self.select(
                    "SELECT * FROM tool_executions WHERE status = $status ORDER BY started_at ASC",
                    "status",
                    status.to_string(),
                )
                .await?
            }
            (None, None) => {
                self.select_all("SELECT * FROM tool_executions ORDER BY started_at ASC")
                    .await?
            }
        };

        let mut records = Vec::new();
        for row in rows {
            let record = row.into_record()?;
            if filter.matches(&record) {
                records.push(record);
            }
        }
        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// DiscoveryStore
// ---------------------------------------------------------------------------

#[async_trait]
impl DiscoveryStore for SurrealToolStore {
    async fn insert_discovery(&self, request: &DiscoveryRequest) -> StorageResult<()> {
        let _guard = self.write.lock().await;
        if self.fetch_discovery(&request.request_id).await.is_ok() {
            return Err(StorageError::Duplicate {
                entity: "discovery request",
                key: request.request_id.to_string(),
            });
        }
        self.create_row("discovery_requests", DiscoveryRow::from(request))
            .await
    }

    async fn get_discovery(&self, id: &DiscoveryRequestId) -> StorageResult<DiscoveryRequest> {
        self.fetch_discovery(id).await?.into_record()
    }

    async fn find_open_discovery(&self, dedup_key: &str) -> StorageResult<Option<DiscoveryRequest>> {
        let rows: Vec<DiscoveryRow> = self
            .select(
                "SELECT * FROM discovery_requests WHERE dedup_key = $key \
                 AND status INSIDE ['pending', 'searching'] ORDER BY created_at ASC",
                "key",
                dedup_key.to_string(),
            )
            .await?;
        rows.into_iter().next().map(DiscoveryRow::into_record).transpose()
    }

    async fn update_discovery(
        &self,
        request: &DiscoveryRequest,
        expected: DiscoveryStatus,
    ) -> StorageResult<()> {
        let _guard = self.write.lock().await;
        let stored = self.fetch_discovery(&request.request_id).await?.into_record()?;
        if stored.status != expected {
            return Err(StorageError::StaleState {
                entity: "discovery request",
                key: request.request_id.to_string(),
                actual: stored.status.to_string(),
                expected: expected.to_string(),
            });
        }
        self.replace_row(
            "discovery_requests",
            "request_id",
            request.request_id.0.clone(),
            DiscoveryRow::from(request),
        )
        .await
    }

    async fn list_discovery(
        &self,
        status: Option<DiscoveryStatus>,
    ) -> StorageResult<Vec<DiscoveryRequest>> {
        let rows: Vec<DiscoveryRow> = match status {
            Some(s) => {
                self.select(
                    "SELECT * FROM discovery_requests WHERE status = $status ORDER BY created_at ASC",
                    "status",
                    s.to_string(),
                )
                .await?
            }
            None => {
                self.select_all("SELECT * FROM discovery_requests ORDER BY created_at ASC")
                    .await?
            }
        };
        rows.into_iter().map(DiscoveryRow::into_record).collect()
    }
}

// ---------------------------------------------------------------------------
// AuditLog
// ---------------------------------------------------------------------------

#[async_trait]
impl AuditLog for SurrealToolStore {
    async fn append_audit(&self, entry: &LifecycleAuditEntry) -> StorageResult<()> {
        let _guard = self.write.lock().await;
        self.create_row("lifecycle_audit", AuditRow::from(entry)).await
    }

    async fn list_audit(&self, tool_id: Option<&ToolId>) -> StorageResult<Vec<LifecycleAuditEntry>> {
        let rows: Vec<AuditRow> = match tool_id {
            Some(t) => {
                self.select(
                    "SELECT * FROM lifecycle_audit WHERE tool_id = $tid ORDER BY at ASC",
                    "tid",
                    t.0.clone(),
                )
                .await?
            }
            None => {
                self.select_all("SELECT * FROM lifecycle_audit ORDER BY at ASC")
                    .await?
            }
        };
        rows.into_iter().map(AuditRow::into_record).collect()
    }
}
