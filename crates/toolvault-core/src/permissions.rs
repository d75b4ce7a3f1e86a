//! Permission registry: typed grants, restrictive defaults and per-call
//! resolution.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use toolvault_state::{Permission, PermissionKind, ToolId, ToolStatus, ToolStore};
use tracing::warn;

use crate::audit::AuditDraft;
use crate::error::{VaultError, VaultResult};
use crate::metrics::METRICS;

pub const DEFAULT_STORAGE_QUOTA_MB: u64 = 1;
pub const DEFAULT_CPU_PERCENT: u32 = 10;
pub const DEFAULT_MEMORY_MB: u64 = 64;
pub const MAX_CPU_PERCENT: u32 = 400;

/// Network exposure of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkMode {
    #[default]
    None,
    IsolatedBridge,
}

impl NetworkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkMode::None => "none",
            NetworkMode::IsolatedBridge => "isolated-bridge",
        }
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated grant value for one permission kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PermissionGrant {
    NetworkAccess(NetworkMode),
    StorageQuota(u64),
    CpuLimit(u32),
    MemoryLimit(u64),
}

impl PermissionGrant {
    /// Parse the string form of a grant. Rejects anything out of range.
    pub fn parse(kind: PermissionKind, raw: &str) -> VaultResult<Self> {
        let value = raw.trim();
        match kind {
            PermissionKind::NetworkAccess => match value.to_ascii_lowercase().as_str() {
                "none" | "false" => Ok(PermissionGrant::NetworkAccess(NetworkMode::None)),
                "isolated-bridge" | "true" => {
                    Ok(PermissionGrant::NetworkAccess(NetworkMode::IsolatedBridge))
                }
                _ => Err(invalid(kind, raw, "expected none or isolated-bridge")),
            },
            PermissionKind::StorageQuota => {
                positive(kind, raw, value).map(PermissionGrant::StorageQuota)
            }
            PermissionKind::MemoryLimit => {
                positive(kind, raw, value).map(PermissionGrant::MemoryLimit)
            }
            PermissionKind::CpuLimit => {
                let pct: u32 = value
                    .parse()
                    .map_err(|_| invalid(kind, raw, "expected an integer percent"))?;
                if !(1..=MAX_CPU_PERCENT).contains(&pct) {
                    return Err(invalid(kind, raw, "expected 1..=400 percent of one core"));
                }
                Ok(PermissionGrant::CpuLimit(pct))
            }
        }
    }

    pub fn kind(&self) -> PermissionKind {
        match self {
            PermissionGrant::NetworkAccess(_) => PermissionKind::NetworkAccess,
            PermissionGrant::StorageQuota(_) => PermissionKind::StorageQuota,
            PermissionGrant::CpuLimit(_) => PermissionKind::CpuLimit,
            PermissionGrant::MemoryLimit(_) => PermissionKind::MemoryLimit,
        }
    }

    /// Canonical string stored in the registry.
    pub fn value_string(&self) -> String {
        match self {
            PermissionGrant::NetworkAccess(mode) => mode.as_str().to_string(),
            PermissionGrant::StorageQuota(mb) | PermissionGrant::MemoryLimit(mb) => mb.to_string(),
            PermissionGrant::CpuLimit(pct) => pct.to_string(),
        }
    }
}

fn positive(kind: PermissionKind, raw: &str, value: &str) -> VaultResult<u64> {
    match value.parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(invalid(kind, raw, "expected a positive integer (MB)")),
    }
}

fn invalid(kind: PermissionKind, raw: &str, expected: &str) -> VaultError {
    VaultError::Validation(format!("invalid {kind} value '{raw}': {expected}"))
}

/// The effective limits for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPermissions {
    pub network: NetworkMode,
    pub storage_quota_mb: u64,
    pub cpu_percent: u32,
    pub memory_mb: u64,
}

impl Default for ResolvedPermissions {
    fn default() -> Self {
        Self {
            network: NetworkMode::None,
            storage_quota_mb: DEFAULT_STORAGE_QUOTA_MB,
            cpu_percent: DEFAULT_CPU_PERCENT,
            memory_mb: DEFAULT_MEMORY_MB,
        }
    }
}

impl ResolvedPermissions {
    /// Fold stored rows over the defaults. Rows that no longer parse are
    /// ignored so the default (most restrictive) value applies.
    pub fn from_permissions(rows: &[Permission]) -> Self {
        let mut resolved = Self::default();
        for row in rows {
            match PermissionGrant::parse(row.kind, &row.value) {
                Ok(grant) => resolved.apply(grant),
                Err(e) => warn!(
                    event = "permission.invalid_stored_value",
                    tool_id = %row.tool_id,
                    kind = %row.kind,
                    error = %e,
                ),
            }
        }
        resolved
    }

    fn apply(&mut self, grant: PermissionGrant) {
        match grant {
            PermissionGrant::NetworkAccess(mode) => self.network = mode,
            PermissionGrant::StorageQuota(mb) => self.storage_quota_mb = mb,
            PermissionGrant::CpuLimit(pct) => self.cpu_percent = pct,
            PermissionGrant::MemoryLimit(mb) => self.memory_mb = mb,
        }
    }

    pub fn storage_quota_bytes(&self) -> u64 {
        self.storage_quota_mb.saturating_mul(1024 * 1024)
    }
}

/// Source of truth for grants, consulted before every execution.
#[derive(Clone)]
pub struct PermissionRegistry {
    store: Arc<dyn ToolStore>,
}

impl PermissionRegistry {
    pub fn new(store: Arc<dyn ToolStore>) -> Self {
        Self { store }
    }

    /// Validate and store a grant. Only tools in `approved`, `active` or
    /// `disabled` accept grants.
    pub async fn grant(
        &self,
        tool_id: &ToolId,
        kind: PermissionKind,
        value: &str,
        granted_by: &str,
    ) -> VaultResult<Permission> {
        let draft = AuditDraft::new("grant", granted_by)
            .tool(tool_id)
            .detail(format!("{kind}={value}"));

        let grant = match PermissionGrant::parse(kind, value) {
            Ok(g) => g,
            Err(e) => {
                METRICS.inc_lifecycle_rejected();
                draft.detail(e.to_string()).rejected(self.store.as_ref()).await;
                return Err(e);
            }
        };

        let manifest = self.store.get_manifest(tool_id).await?;
        let draft = draft.from(manifest.status).to(manifest.status);
        if !matches!(
            manifest.status,
            ToolStatus::Approved | ToolStatus::Active | ToolStatus::Disabled
        ) {
            METRICS.inc_lifecycle_rejected();
            let err = VaultError::InvalidLifecycleTransition(format!(
                "cannot grant {kind} to tool {tool_id} in status {}",
                manifest.status
            ));
            draft.detail(err.to_string()).rejected(self.store.as_ref()).await;
            return Err(err);
        }

        let stored = self
            .store
            .upsert_permission(tool_id, kind, &grant.value_string(), granted_by)
            .await?;
        draft.accepted(self.store.as_ref()).await;
        Ok(stored)
    }

    /// Write grants without a status check. Used by approval, which is the
    /// only path that seeds a pending tool.
    pub(crate) async fn seed(
        &self,
        tool_id: &ToolId,
        grants: &[PermissionGrant],
        granted_by: &str,
    ) -> VaultResult<Vec<Permission>> {
        let mut stored = Vec::with_capacity(grants.len());
        for grant in grants {
            stored.push(
                self.store
                    .upsert_permission(tool_id, grant.kind(), &grant.value_string(), granted_by)
                    .await?,
            );
        }
        Ok(stored)
    }

    /// Stored grants for a tool.
    pub async fn list(&self, tool_id: &ToolId) -> VaultResult<Vec<Permission>> {
        Ok(self.store.list_permissions(tool_id).await?)
    }

    /// Resolve the effective limits. Never cached; every call reads the
    /// registry.
    pub async fn check_and_resolve(&self, tool_id: &ToolId) -> VaultResult<ResolvedPermissions> {
        self.store.get_manifest(tool_id).await?;
        let rows = self.store.list_permissions(tool_id).await?;
        Ok(ResolvedPermissions::from_permissions(&rows))
    }
}
