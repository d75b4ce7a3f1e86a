//! Record types for the six toolvault relations (plus the lifecycle audit log).
//!
//! These are the backend-agnostic shapes exchanged through
//! [`crate::storage_traits`]. The SurrealDB row layouts live in `schema.rs`
//! and are converted to/from these types at the store boundary.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a new random identifier.
            pub fn new() -> Self {
                $name(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }
    };
}

uuid_id!(
    /// Identity of a tool manifest.
    ToolId
);
uuid_id!(
    /// Identity of one invocation in the execution ledger.
    ExecutionId
);
uuid_id!(
    /// Identity of a discovery queue entry.
    DiscoveryRequestId
);

/// Generates `as_str` / `Display` / `FromStr` for snake_case string enums.
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = StorageError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(StorageError::Backend(format!(
                        "unknown {} value: {other}",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// Lifecycle status of a tool manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    PendingApproval,
    Approved,
    Active,
    Disabled,
    Revoked,
}

string_enum!(ToolStatus {
    PendingApproval => "pending_approval",
    Approved => "approved",
    Active => "active",
    Disabled => "disabled",
    Revoked => "revoked",
});

/// Where a manifest came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Local,
    RemoteSpec,
    Discovered,
}

string_enum!(SourceType {
    Local => "local",
    RemoteSpec => "remote_spec",
    Discovered => "discovered",
});

/// Tagged schema descriptor for tool parameters and outputs.
///
/// The `type` tag mirrors JSON Schema so manifests written against JSON
/// Schema conventions deserialize directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchemaDescriptor {
    Object {
        #[serde(default)]
        properties: BTreeMap<String, SchemaDescriptor>,
        #[serde(default)]
        required: Vec<String>,
        #[serde(default = "default_true")]
        additional_properties: bool,
    },
    String {
        #[serde(default)]
        min_length: Option<usize>,
        #[serde(default)]
        max_length: Option<usize>,
        #[serde(default, rename = "enum")]
        allowed: Option<Vec<String>>,
    },
    Integer {
        #[serde(default)]
        minimum: Option<i64>,
        #[serde(default)]
        maximum: Option<i64>,
    },
    Number {
        #[serde(default)]
        minimum: Option<f64>,
        #[serde(default)]
        maximum: Option<f64>,
    },
    Boolean,
    Array {
        items: Box<SchemaDescriptor>,
        #[serde(default)]
        max_items: Option<usize>,
    },
    Any,
}

fn default_true() -> bool {
    true
}

impl SchemaDescriptor {
    /// An object schema with no declared properties that accepts anything.
    pub fn open_object() -> Self {
        SchemaDescriptor::Object {
            properties: BTreeMap::new(),
            required: Vec::new(),
            additional_properties: true,
        }
    }
}

impl Default for SchemaDescriptor {
    fn default() -> Self {
        Self::open_object()
    }
}

/// One named operation a tool exposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: SchemaDescriptor,
    #[serde(default)]
    pub output: Option<SchemaDescriptor>,
    /// Whether the operation needs outbound network access to work at all.
    #[serde(default)]
    pub requires_network: bool,
}

/// How the sandbox launches the tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSpec {
    /// Container image reference.
    pub image: String,
    /// Entrypoint argv; empty means the image default.
    #[serde(default)]
    pub entrypoint: Vec<String>,
    /// Default wall-clock timeout in seconds.
    pub default_timeout_secs: u64,
}

/// A permission the manifest asked for at import. Informational only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub kind: PermissionKind,
    pub value: String,
}

/// Durable description of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolManifest {
    pub id: ToolId,
    pub name: String,
    pub version: String,
    pub description: String,
    pub source_type: SourceType,
    pub source_location: String,
    pub status: ToolStatus,
    pub capabilities: Vec<CapabilityDescriptor>,
    pub parameters_schema: SchemaDescriptor,
    pub output_schema: Option<SchemaDescriptor>,
    pub execution: ExecutionSpec,
    pub requested_permissions: Vec<PermissionRequest>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    /// Set on a revoked manifest once it has been re-proposed.
    pub superseded_by: Option<ToolId>,
    /// Set once a revoked tool's state and volume have been destroyed.
    pub purged_at: Option<DateTime<Utc>>,
}

impl ToolManifest {
    /// Look up a declared capability by name.
    pub fn capability(&self, name: &str) -> Option<&CapabilityDescriptor> {
        self.capabilities.iter().find(|c| c.name == name)
    }
}

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

/// The four grantable permission axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionKind {
    NetworkAccess,
    StorageQuota,
    CpuLimit,
    MemoryLimit,
}

string_enum!(PermissionKind {
    NetworkAccess => "network_access",
    StorageQuota => "storage_quota",
    CpuLimit => "cpu_limit",
    MemoryLimit => "memory_limit",
});

impl PermissionKind {
    pub const ALL: [PermissionKind; 4] = [
        PermissionKind::NetworkAccess,
        PermissionKind::StorageQuota,
        PermissionKind::CpuLimit,
        PermissionKind::MemoryLimit,
    ];
}

/// One stored grant. At most one per `(tool_id, kind)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub tool_id: ToolId,
    pub kind: PermissionKind,
    pub value: String,
    pub granted_by: String,
    /// Registry-assigned sequence; the highest sequence wins.
    pub seq: u64,
    pub granted_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Volumes & state
// ---------------------------------------------------------------------------

/// Private persistent storage area of one tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolVolume {
    pub tool_id: ToolId,
    pub volume_name: String,
    pub mount_path: String,
    pub host_path: String,
    pub quota_mb: u64,
    pub created_at: DateTime<Utc>,
}

/// One key of a tool's private key/value state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolStateEntry {
    pub tool_id: ToolId,
    pub key: String,
    pub value: serde_json::Value,
    pub size_bytes: u64,
    pub updated_at: DateTime<Utc>,
}

impl ToolStateEntry {
    pub fn new(tool_id: ToolId, key: impl Into<String>, value: serde_json::Value) -> Self {
        let size_bytes = serde_json::to_vec(&value).map(|v| v.len() as u64).unwrap_or(0);
        Self {
            tool_id,
            key: key.into(),
            value,
            size_bytes,
            updated_at: Utc::now(),
        }
    }
}

/// An all-or-nothing set of state mutations for one tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateBatch {
    pub set: BTreeMap<String, serde_json::Value>,
    pub delete: Vec<String>,
}

impl StateBatch {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.delete.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Execution ledger
// ---------------------------------------------------------------------------

/// Status of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failure,
    Timeout,
    Cancelled,
}

string_enum!(ExecutionStatus {
    Running => "running",
    Success => "success",
    Failure => "failure",
    Timeout => "timeout",
    Cancelled => "cancelled",
});

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

/// Why a non-successful invocation ended the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    InvalidLifecycleTransition,
    PermissionDenied,
    QuotaExceeded,
    ResourceExceeded,
    ExecutionTimeout,
    SandboxBusy,
    SandboxUnavailable,
    ExecutionFailure,
    Cancelled,
    Orphaned,
}

string_enum!(ErrorKind {
    Validation => "validation",
    InvalidLifecycleTransition => "invalid_lifecycle_transition",
    PermissionDenied => "permission_denied",
    QuotaExceeded => "quota_exceeded",
    ResourceExceeded => "resource_exceeded",
    ExecutionTimeout => "execution_timeout",
    SandboxBusy => "sandbox_busy",
    SandboxUnavailable => "sandbox_unavailable",
    ExecutionFailure => "execution_failure",
    Cancelled => "cancelled",
    Orphaned => "orphaned",
});

/// One row of the append-only execution ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: ExecutionId,
    pub tool_id: ToolId,
    pub conversation_id: Option<String>,
    pub turn_id: Option<String>,
    pub capability: Option<String>,
    pub input_params: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub status: ExecutionStatus,
    pub error_kind: Option<ErrorKind>,
    pub output: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub exit_code: Option<i32>,
    pub cpu_usage_ms: Option<u64>,
    pub memory_peak_mb: Option<u64>,
    pub sandbox_instance_id: Option<String>,
}

impl ExecutionRecord {
    /// A fresh `running` row.
    pub fn running(tool_id: ToolId, input_params: serde_json::Value) -> Self {
        Self {
            execution_id: ExecutionId::new(),
            tool_id,
            conversation_id: None,
            turn_id: None,
            capability: None,
            input_params,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            status: ExecutionStatus::Running,
            error_kind: None,
            output: None,
            error_message: None,
            exit_code: None,
            cpu_usage_ms: None,
            memory_peak_mb: None,
            sandbox_instance_id: None,
        }
    }

    /// Copy a terminal outcome onto this record.
    pub fn finish(&mut self, outcome: ExecutionOutcome, completed_at: DateTime<Utc>) {
        let elapsed = (completed_at - self.started_at).num_milliseconds().max(0) as u64;
        self.status = outcome.status;
        self.error_kind = outcome.error_kind;
        self.output = outcome.output;
        self.error_message = outcome.error_message;
        self.exit_code = outcome.exit_code;
        self.cpu_usage_ms = outcome.cpu_usage_ms;
        self.memory_peak_mb = outcome.memory_peak_mb;
        self.completed_at = Some(completed_at);
        self.duration_ms = Some(elapsed);
    }
}

/// Terminal data written when a running record completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub error_kind: Option<ErrorKind>,
    pub output: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub exit_code: Option<i32>,
    pub cpu_usage_ms: Option<u64>,
    pub memory_peak_mb: Option<u64>,
}

impl ExecutionOutcome {
    /// A failure outcome with no sandbox data.
    pub fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        let status = match kind {
            ErrorKind::ExecutionTimeout => ExecutionStatus::Timeout,
            ErrorKind::Cancelled => ExecutionStatus::Cancelled,
            _ => ExecutionStatus::Failure,
        };
        Self {
            status,
            error_kind: Some(kind),
            output: None,
            error_message: Some(message.into()),
            exit_code: None,
            cpu_usage_ms: None,
            memory_peak_mb: None,
        }
    }
}

/// Read-only ledger filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFilter {
    pub tool_id: Option<ToolId>,
    pub status: Option<ExecutionStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl ExecutionFilter {
    pub fn for_tool(tool_id: &ToolId) -> Self {
        Self {
            tool_id: Some(tool_id.clone()),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &ExecutionRecord) -> bool {
        self.tool_id.as_ref().map_or(true, |t| &record.tool_id == t)
            && self.status.map_or(true, |s| record.status == s)
            && self.since.map_or(true, |s| record.started_at >= s)
            && self.until.map_or(true, |u| record.started_at <= u)
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Status of a capability-gap request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryStatus {
    Pending,
    Searching,
    Found,
    Failed,
    Rejected,
}

string_enum!(DiscoveryStatus {
    Pending => "pending",
    Searching => "searching",
    Found => "found",
    Failed => "failed",
    Rejected => "rejected",
});

impl DiscoveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DiscoveryStatus::Found | DiscoveryStatus::Failed | DiscoveryStatus::Rejected
        )
    }
}

/// One entry of the discovery queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    pub request_id: DiscoveryRequestId,
    pub capability_description: String,
    /// Hash of the normalized description, used for deduplication.
    pub dedup_key: String,
    pub requested_by: String,
    pub status: DiscoveryStatus,
    pub discovered_candidates: serde_json::Value,
    pub resulting_tool_id: Option<ToolId>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// One import or lifecycle attempt, accepted or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleAuditEntry {
    pub tool_id: Option<ToolId>,
    pub action: String,
    pub from_status: Option<ToolStatus>,
    pub to_status: Option<ToolStatus>,
    pub accepted: bool,
    pub detail: String,
    pub actor: String,
    pub at: DateTime<Utc>,
}
