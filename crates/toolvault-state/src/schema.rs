//! Row layouts for the toolvault SurrealDB tables
//!
//! Tables:
//! - tool_manifests: tool identity, lifecycle status and declared capabilities
//! - tool_permissions: one grant per (tool, kind)
//! - tool_volumes: one private volume per tool
//! - tool_state: per-tool key/value entries
//! - tool_executions: append-only invocation ledger
//! - discovery_requests: capability-gap queue
//! - lifecycle_audit: import and lifecycle attempts
//!
//! Nested structures (schemas, capabilities, execution spec) are stored as
//! plain JSON objects and decoded into the typed records at the boundary.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::records::*;
use crate::storage_traits::StorageResult;

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Module for serializing optional chrono DateTime to SurrealDB datetime format
mod surreal_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(d) => {
                let sd = SurrealDatetime::from(*d);
                serde::Serialize::serialize(&Some(sd), serializer)
            }
            None => serde::Serialize::serialize(&None::<SurrealDatetime>, serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

fn parse<T: FromStr<Err = StorageError>>(s: &str) -> StorageResult<T> {
    s.parse()
}

fn parse_opt<T: FromStr<Err = StorageError>>(s: Option<&str>) -> StorageResult<Option<T>> {
    s.map(parse).transpose()
}

// ---------------------------------------------------------------------------
// tool_manifests
// ---------------------------------------------------------------------------

/// Manifest row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestRow {
    /// SurrealDB record ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub tool_id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub source_type: String,
    pub source_location: String,
    /// "pending_approval" | "approved" | "active" | "disabled" | "revoked"
    pub status: String,
    pub capabilities: serde_json::Value,
    pub parameters_schema: serde_json::Value,
    pub output_schema: Option<serde_json::Value>,
    pub execution: serde_json::Value,
    pub requested_permissions: serde_json::Value,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "surreal_datetime")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub revoked_at: Option<DateTime<Utc>>,
    pub superseded_by: Option<String>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub purged_at: Option<DateTime<Utc>>,
}

impl ManifestRow {
    pub fn from_record(m: &ToolManifest) -> StorageResult<Self> {
        Ok(ManifestRow {
            id: None,
            tool_id: m.id.0.clone(),
            name: m.name.clone(),
            version: m.version.clone(),
            description: m.description.clone(),
            source_type: m.source_type.to_string(),
            source_location: m.source_location.clone(),
            status: m.status.to_string(),
            capabilities: serde_json::to_value(&m.capabilities)?,
            parameters_schema: serde_json::to_value(&m.parameters_schema)?,
            output_schema: m
                .output_schema
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
            execution: serde_json::to_value(&m.execution)?,
            requested_permissions: serde_json::to_value(&m.requested_permissions)?,
            created_at: m.created_at,
            updated_at: m.updated_at,
            approved_at: m.approved_at,
            revoked_at: m.revoked_at,
            superseded_by: m.superseded_by.as_ref().map(|s| s.0.clone()),
            purged_at: m.purged_at,
        })
    }

    pub fn into_record(self) -> StorageResult<ToolManifest> {
        Ok(ToolManifest {
            id: ToolId(self.tool_id),
            name: self.name,
            version: self.version,
            description: self.description,
            source_type: parse(&self.source_type)?,
            source_location: self.source_location,
            status: parse(&self.status)?,
            capabilities: serde_json::from_value(self.capabilities)?,
            parameters_schema: serde_json::from_value(self.parameters_schema)?,
            output_schema: self
                .output_schema
                .map(serde_json::from_value)
                .transpose()?,
            execution: serde_json::from_value(self.execution)?,
            requested_permissions: serde_json::from_value(self.requested_permissions)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
            approved_at: self.approved_at,
            revoked_at: self.revoked_at,
            superseded_by: self.superseded_by.map(ToolId),
            purged_at: self.purged_at,
        })
    }
}

// ---------------------------------------------------------------------------
// tool_permissions
// ---------------------------------------------------------------------------

/// Permission row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRow {
    /// SurrealDB record ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub tool_id: String,
    pub kind: String,
    pub value: String,
    pub granted_by: String,
    pub seq: u64,
    #[serde(with = "surreal_datetime")]
    pub granted_at: DateTime<Utc>,
}

impl PermissionRow {
    pub fn new(tool_id: &ToolId, kind: PermissionKind, value: &str, granted_by: &str, seq: u64) -> Self {
        PermissionRow {
            id: None,
            tool_id: tool_id.0.clone(),
            kind: kind.to_string(),
            value: value.to_string(),
            granted_by: granted_by.to_string(),
            seq,
            granted_at: Utc::now(),
        }
    }

    pub fn into_record(self) -> StorageResult<Permission> {
        Ok(Permission {
            tool_id: ToolId(self.tool_id),
            kind: parse(&self.kind)?,
            value: self.value,
            granted_by: self.granted_by,
            seq: self.seq,
            granted_at: self.granted_at,
        })
    }
}

// ---------------------------------------------------------------------------
// tool_volumes
// ---------------------------------------------------------------------------

/// Volume row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeRow {
    /// SurrealDB record ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub tool_id: String,
    pub volume_name: String,
    pub mount_path: String,
    pub host_path: String,
    pub quota_mb: u64,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
}

impl From<&ToolVolume> for VolumeRow {
    fn from(v: &ToolVolume) -> Self {
        VolumeRow {
            id: None,
            tool_id: v.tool_id.0.clone(),
            volume_name: v.volume_name.clone(),
            mount_path: v.mount_path.clone(),
            host_path: v.host_path.clone(),
            quota_mb: v.quota_mb,
            created_at: v.created_at,
        }
    }
}

impl From<VolumeRow> for ToolVolume {
    fn from(row: VolumeRow) -> Self {
        ToolVolume {
            tool_id: ToolId(row.tool_id),
            volume_name: row.volume_name,
            mount_path: row.mount_path,
            host_path: row.host_path,
            quota_mb: row.quota_mb,
            created_at: row.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// tool_state
// ---------------------------------------------------------------------------

/// State entry row. `key` is a reserved word in SurrealQL, hence `state_key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRow {
    /// SurrealDB record ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub tool_id: String,
    pub state_key: String,
    pub value: serde_json::Value,
    pub size_bytes: u64,
    #[serde(with = "surreal_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl From<&ToolStateEntry> for StateRow {
    fn from(e: &ToolStateEntry) -> Self {
        StateRow {
            id: None,
            tool_id: e.tool_id.0.clone(),
            state_key: e.key.clone(),
            value: e.value.clone(),
            size_bytes: e.size_bytes,
            updated_at: e.updated_at,
        }
    }
}

impl From<StateRow> for ToolStateEntry {
    fn from(row: StateRow) -> Self {
        ToolStateEntry {
            tool_id: ToolId(row.tool_id),
            key: row.state_key,
            value: row.value,
            size_bytes: row.size_bytes,
            updated_at: row.updated_at,
        }
    }
}

// ---------------------------------------------------------------------------
// tool_executions
// ---------------------------------------------------------------------------

/// Execution ledger row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRow {
    /// SurrealDB record ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub execution_id: String,
    pub tool_id: String,
    pub conversation_id: Option<String>,
    pub turn_id: Option<String>,
    pub capability: Option<String>,
    pub input_params: serde_json::Value,
    #[serde(with = "surreal_datetime")]
    pub started_at: DateTime<Utc>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    /// "running" | "success" | "failure" | "timeout" | "cancelled"
    pub status: String,
    pub error_kind: Option<String>,
    pub output: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub exit_code: Option<i32>,
    pub cpu_usage_ms: Option<u64>,
    pub memory_peak_mb: Option<u64>,
    pub sandbox_instance_id: Option<String>,
}

impl From<&ExecutionRecord> for ExecutionRow {
    fn from(r: &ExecutionRecord) -> Self {
        ExecutionRow {
            id: None,
            execution_id: r.execution_id.0.clone(),
            tool_id: r.tool_id.0.clone(),
            conversation_id: r.conversation_id.clone(),
            turn_id: r.turn_id.clone(),
            capability: r.capability.clone(),
            input_params: r.input_params.clone(),
            started_at: r.started_at,
            completed_at: r.completed_at,
            duration_ms: r.duration_ms,
            status: r.status.to_string(),
            error_kind: r.error_kind.map(|k| k.to_string()),
            output: r.output.clone(),
            error_message: r.error_message.clone(),
            exit_code: r.exit_code,
            cpu_usage_ms: r.cpu_usage_ms,
            memory_peak_mb: r.memory_peak_mb,
            sandbox_instance_id: r.sandbox_instance_id.clone(),
        }
    }
}

impl ExecutionRow {
    pub fn into_record(self) -> StorageResult<ExecutionRecord> {
        Ok(ExecutionRecord {
            execution_id: ExecutionId(self.execution_id),
            tool_id: ToolId(self.tool_id),
            conversation_id: self.conversation_id,
            turn_id: self.turn_id,
            capability: self.capability,
            input_params: self.input_params,
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_ms: self.duration_ms,
            status: parse(&self.status)?,
            error_kind: parse_opt(self.error_kind.as_deref())?,
            output: self.output,
            error_message: self.error_message,
            exit_code: self.exit_code,
            cpu_usage_ms: self.cpu_usage_ms,
            memory_peak_mb: self.memory_peak_mb,
            sandbox_instance_id: self.sandbox_instance_id,
        })
    }
}

// ---------------------------------------------------------------------------
// discovery_requests
// ---------------------------------------------------------------------------

/// Discovery queue row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryRow {
    /// SurrealDB record ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub request_id: String,
    pub capability_description: String,
    pub dedup_key: String,
    pub requested_by: String,
    /// "pending" | "searching" | "found" | "failed" | "rejected"
    pub status: String,
    pub discovered_candidates: serde_json::Value,
    pub resulting_tool_id: Option<String>,
    pub error_message: Option<String>,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "surreal_datetime")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&DiscoveryRequest> for DiscoveryRow {
    fn from(r: &DiscoveryRequest) -> Self {
        DiscoveryRow {
            id: None,
            request_id: r.request_id.0.clone(),
            capability_description: r.capability_description.clone(),
            dedup_key: r.dedup_key.clone(),
            requested_by: r.requested_by.clone(),
            status: r.status.to_string(),
            discovered_candidates: r.discovered_candidates.clone(),
            resulting_tool_id: r.resulting_tool_id.as_ref().map(|t| t.0.clone()),
            error_message: r.error_message.clone(),
            created_at: r.created_at,
            updated_at: r.updated_at,
            completed_at: r.completed_at,
        }
    }
}

impl DiscoveryRow {
    pub fn into_record(self) -> StorageResult<DiscoveryRequest> {
        Ok(DiscoveryRequest {
            request_id: DiscoveryRequestId(self.request_id),
            capability_description: self.capability_description,
            dedup_key: self.dedup_key,
            requested_by: self.requested_by,
            status: parse(&self.status)?,
            discovered_candidates: self.discovered_candidates,
            resulting_tool_id: self.resulting_tool_id.map(ToolId),
            error_message: self.error_message,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        })
    }
}

// ---------------------------------------------------------------------------
// lifecycle_audit
// ---------------------------------------------------------------------------

/// Lifecycle audit row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRow {
    /// SurrealDB record ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub tool_id: Option<String>,
    pub action: String,
    pub from_status: Option<String>,
    pub to_status: Option<String>,
    pub accepted: bool,
    pub detail: String,
    pub actor: String,
    #[serde(with = "surreal_datetime")]
    pub at: DateTime<Utc>,
}

impl From<&LifecycleAuditEntry> for AuditRow {
    fn from(e: &LifecycleAuditEntry) -> Self {
        AuditRow {
            id: None,
            tool_id: e.tool_id.as_ref().map(|t| t.0.clone()),
            action: e.action.clone(),
            from_status: e.from_status.map(|s| s.to_string()),
            to_status: e.to_status.map(|s| s.to_string()),
            accepted: e.accepted,
            detail: e.detail.clone(),
            actor: e.actor.clone(),
            at: e.at,
        }
    }
}

impl AuditRow {
    pub fn into_record(self) -> StorageResult<LifecycleAuditEntry> {
        Ok(LifecycleAuditEntry {
            tool_id: self.tool_id.map(ToolId),
            action: self.action,
            from_status: parse_opt(self.from_status.as_deref())?,
            to_status: parse_opt(self.to_status.as_deref())?,
            accepted: self.accepted,
            detail: self.detail,
            actor: self.actor,
            at: self.at,
        })
    }
}
