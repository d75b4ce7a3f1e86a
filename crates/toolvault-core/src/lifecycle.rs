//! Manifest import and the lifecycle state machine.
//!
//! ```text
//! pending_approval -approve-> approved -install-> active <-disable/enable-> disabled
//! active | disabled -revoke-> revoked   (terminal; repropose creates a new manifest)
//! ```
//!
//! Every attempt is audited. Illegal operations fail with
//! `InvalidLifecycleTransition` and mutate nothing. An operation on a
//! manifest already in the target status is a no-op. Status changes are
//! compare-and-set so two concurrent callers cannot both apply.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use toolvault_state::{SourceType, StorageError, ToolId, ToolManifest, ToolStatus, ToolStore};
use tracing::{debug, warn};

use crate::audit::AuditDraft;
use crate::error::{VaultError, VaultResult};
use crate::manifest_import::{ManifestDocument, MAX_NAME_LEN};
use crate::metrics::METRICS;
use crate::permissions::{NetworkMode, PermissionGrant, PermissionRegistry};
use crate::state::{PurgeReport, StateManager};

/// Outcome of a revoke call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevokeReport {
    pub manifest: ToolManifest,
    /// Present when this call purged state and volume.
    pub purged: Option<PurgeReport>,
}

enum Precheck {
    /// Already in the target status.
    NoOp(ToolManifest),
    Proceed(ToolManifest),
}

/// Drives manifests through their lifecycle.
#[derive(Clone)]
pub struct LifecycleController {
    store: Arc<dyn ToolStore>,
    permissions: PermissionRegistry,
    state: StateManager,
}

impl LifecycleController {
    pub fn new(
        store: Arc<dyn ToolStore>,
        permissions: PermissionRegistry,
        state: StateManager,
    ) -> Self {
        Self {
            store,
            permissions,
            state,
        }
    }

    // -----------------------------------------------------------------------
    // Import
    // -----------------------------------------------------------------------

    /// Validate a document and record it as `pending_approval`.
    pub async fn import(
        &self,
        document: ManifestDocument,
        source_type: SourceType,
        source_location: &str,
        actor: &str,
    ) -> VaultResult<ToolManifest> {
        let draft = AuditDraft::new("import", actor).to(ToolStatus::PendingApproval);
        let name = document.name.clone();

        let manifest = match document.into_manifest(source_type, source_location) {
            Ok(m) => m,
            Err(e) => {
                METRICS.inc_lifecycle_rejected();
                draft
                    .detail(format!("{name}: {e}"))
                    .rejected(self.store.as_ref())
                    .await;
                return Err(e);
            }
        };

        let draft = draft.tool(&manifest.id).detail(format!(
            "{} {} from {} ({})",
            manifest.name, manifest.version, source_location, source_type
        ));
        if let Err(e) = self.store.insert_manifest(&manifest).await {
            METRICS.inc_lifecycle_rejected();
            let err = VaultError::from(e);
            draft
                .detail(format!("{name}: {err}"))
                .rejected(self.store.as_ref())
                .await;
            return Err(err);
        }
        draft.accepted(self.store.as_ref()).await;
        Ok(manifest)
    }

    /// Import a local `.json` or `.toml` manifest file.
    pub async fn import_path(&self, path: &Path, actor: &str) -> VaultResult<ToolManifest> {
        let location = path.display().to_string();
        match ManifestDocument::from_path(path) {
            Ok(doc) => self.import(doc, SourceType::Local, &location, actor).await,
            Err(e) => {
                METRICS.inc_lifecycle_rejected();
                AuditDraft::new("import", actor)
                    .detail(format!("{location}: {e}"))
                    .rejected(self.store.as_ref())
                    .await;
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// `pending_approval -> approved`, seeding the permission registry.
    /// An empty grant list seeds an explicit `network_access=none`.
    pub async fn approve(
        &self,
        tool_id: &ToolId,
        grants: &[PermissionGrant],
        actor: &str,
    ) -> VaultResult<ToolManifest> {
        let manifest = match self
            .precheck("approve", tool_id, &[ToolStatus::PendingApproval], ToolStatus::Approved, actor)
            .await?
        {
            Precheck::NoOp(m) => return Ok(m),
            Precheck::Proceed(m) => m,
        };

        let approved = self
            .commit("approve", &manifest, ToolStatus::Approved, actor, grant_summary(grants))
            .await?;
        let seeded: Vec<PermissionGrant> = if grants.is_empty() {
            vec![PermissionGrant::NetworkAccess(NetworkMode::None)]
        } else {
            grants.to_vec()
        };
        if let Err(e) = self.permissions.seed(tool_id, &seeded, actor).await {
            self.roll_back_approval(tool_id, actor, &e).await;
            return Err(e);
        }
        Ok(approved)
    }

    /// Return a tool whose grants could not be seeded to `pending_approval`.
    async fn roll_back_approval(&self, tool_id: &ToolId, actor: &str, cause: &VaultError) {
        METRICS.inc_lifecycle_rejected();
        if let Err(e) = self
            .store
            .set_status(tool_id, ToolStatus::Approved, ToolStatus::PendingApproval, Utc::now())
            .await
        {
            warn!(tool_id = %tool_id, error = %e, "approval rollback failed");
        }
        AuditDraft::new("approve", actor)
            .tool(tool_id)
            .from(ToolStatus::Approved)
            .to(ToolStatus::PendingApproval)
            .detail(format!("rolled back: permissions not seeded: {cause}"))
            .rejected(self.store.as_ref())
            .await;
    }

    /// `approved -> active`. The volume exists before the status flips.
    pub async fn install(&self, tool_id: &ToolId, actor: &str) -> VaultResult<ToolManifest> {
        let manifest = match self
            .precheck("install", tool_id, &[ToolStatus::Approved], ToolStatus::Active, actor)
            .await?
        {
            Precheck::NoOp(m) => return Ok(m),
            Precheck::Proceed(m) => m,
        };

        let volume = self.state.ensure_volume(tool_id).await?;
        self.commit(
            "install",
            &manifest,
            ToolStatus::Active,
            actor,
            format!("volume {} ({} MB)", volume.volume_name, volume.quota_mb),
        )
        .await
    }

    /// `active -> disabled`.
    pub async fn disable(&self, tool_id: &ToolId, actor: &str) -> VaultResult<ToolManifest> {
        match self
            .precheck("disable", tool_id, &[ToolStatus::Active], ToolStatus::Disabled, actor)
            .await?
        {
            Precheck::NoOp(m) => Ok(m),
            Precheck::Proceed(m) => {
                self.commit("disable", &m, ToolStatus::Disabled, actor, String::new())
                    .await
            }
        }
    }

    /// `disabled -> active`. Permissions are re-resolved from the registry.
    pub async fn enable(&self, tool_id: &ToolId, actor: &str) -> VaultResult<ToolManifest> {
        let manifest = match self
            .precheck("enable", tool_id, &[ToolStatus::Disabled], ToolStatus::Active, actor)
            .await?
        {
            Precheck::NoOp(m) => return Ok(m),
            Precheck::Proceed(m) => m,
        };
        let resolved = self.permissions.check_and_resolve(tool_id).await?;
        debug!(tool_id = %tool_id, ?resolved, "permissions re-resolved on enable");
        self.commit(
            "enable",
            &manifest,
            ToolStatus::Active,
            actor,
            format!(
                "network={} storage={}MB cpu={}% memory={}MB",
                resolved.network, resolved.storage_quota_mb, resolved.cpu_percent, resolved.memory_mb
            ),
        )
        .await
    }

    /// `active | disabled -> revoked`, optionally purging state and volume.
    /// Revoking an already revoked tool with `purge = true` performs the purge.
    pub async fn revoke(&self, tool_id: &ToolId, purge: bool, actor: &str) -> VaultResult<RevokeReport> {
        let manifest = match self
            .precheck(
                "revoke",
                tool_id,
                &[ToolStatus::Active, ToolStatus::Disabled],
                ToolStatus::Revoked,
                actor,
            )
            .await?
        {
            Precheck::NoOp(m) => m,
            Precheck::Proceed(m) => {
                let detail = if purge { "purge requested" } else { "state retained" };
                self.commit("revoke", &m, ToolStatus::Revoked, actor, detail.to_string())
                    .await?
            }
        };

        if !purge || manifest.purged_at.is_some() {
            return Ok(RevokeReport {
                manifest,
                purged: None,
            });
        }
        let report = self.state.purge_volume(tool_id).await?;
        AuditDraft::new("purge", actor)
            .tool(tool_id)
            .from(ToolStatus::Revoked)
            .to(ToolStatus::Revoked)
            .detail(format!(
                "{} state entries removed, volume removed: {}",
                report.state_entries_removed, report.volume_removed
            ))
            .accepted(self.store.as_ref())
            .await;
        Ok(RevokeReport {
            manifest: self.store.get_manifest(tool_id).await?,
            purged: Some(report),
        })
    }

    /// Create a fresh `pending_approval` manifest from a revoked one under
    /// the name `<name>-r<N>` (first free N >= 2).
    pub async fn repropose(&self, tool_id: &ToolId, actor: &str) -> VaultResult<ToolManifest> {
        let old = self.store.get_manifest(tool_id).await?;
        let draft = AuditDraft::new("repropose", actor).tool(tool_id).from(old.status);

        let rejection = if old.status != ToolStatus::Revoked {
            Some(format!(
                "only revoked tools can be re-proposed; {} is {}",
                old.name, old.status
            ))
        } else {
            old.superseded_by
                .as_ref()
                .map(|s| format!("{} was already re-proposed as {s}", old.name))
        };
        if let Some(reason) = rejection {
            METRICS.inc_lifecycle_rejected();
            let err = VaultError::InvalidLifecycleTransition(reason);
            draft.detail(err.to_string()).rejected(self.store.as_ref()).await;
            return Err(err);
        }

        let mut n = 2u32;
        let successor = loop {
            let name = reproposal_name(&old.name, n);
            n += 1;
            if self.store.find_manifest_by_name(&name).await?.is_some() {
                continue;
            }
            let mut document = ManifestDocument::from_manifest(&old);
            document.name = name;
            let manifest = document.into_manifest(old.source_type, &old.source_location)?;
            match self.store.insert_manifest(&manifest).await {
                Ok(()) => break manifest,
                Err(StorageError::Duplicate { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        };

        self.store.set_superseded_by(tool_id, &successor.id).await?;
        draft
            .to(ToolStatus::PendingApproval)
            .detail(format!("superseded by {} ({})", successor.name, successor.id))
            .accepted(self.store.as_ref())
            .await;
        AuditDraft::new("import", actor)
            .tool(&successor.id)
            .to(ToolStatus::PendingApproval)
            .detail(format!("re-proposal of {} ({})", old.name, old.id))
            .accepted(self.store.as_ref())
            .await;
        Ok(successor)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn precheck(
        &self,
        action: &str,
        tool_id: &ToolId,
        allowed_from: &[ToolStatus],
        target: ToolStatus,
        actor: &str,
    ) -> VaultResult<Precheck> {
        let manifest = self.store.get_manifest(tool_id).await?;
        if manifest.status == target {
            AuditDraft::new(action, actor)
                .tool(tool_id)
                .from(manifest.status)
                .to(target)
                .detail("no-op: already in target status")
                .accepted(self.store.as_ref())
                .await;
            return Ok(Precheck::NoOp(manifest));
        }
        if !allowed_from.contains(&manifest.status) {
            METRICS.inc_lifecycle_rejected();
            let err = VaultError::InvalidLifecycleTransition(format!(
                "{action} not allowed for {} in status {}",
                manifest.name, manifest.status
            ));
            AuditDraft::new(action, actor)
                .tool(tool_id)
                .from(manifest.status)
                .to(target)
                .detail(err.to_string())
                .rejected(self.store.as_ref())
                .await;
            return Err(err);
        }
        Ok(Precheck::Proceed(manifest))
    }

    async fn commit(
        &self,
        action: &str,
        manifest: &ToolManifest,
        target: ToolStatus,
        actor: &str,
        detail: String,
    ) -> VaultResult<ToolManifest> {
        let draft = AuditDraft::new(action, actor)
            .tool(&manifest.id)
            .from(manifest.status)
            .to(target);
        match self
            .store
            .set_status(&manifest.id, manifest.status, target, Utc::now())
            .await
        {
            Ok(updated) => {
                draft.detail(detail).accepted(self.store.as_ref()).await;
                Ok(updated)
            }
            Err(e) => {
                METRICS.inc_lifecycle_rejected();
                let err = VaultError::from(e);
                draft.detail(err.to_string()).rejected(self.store.as_ref()).await;
                Err(err)
            }
        }
    }
}

fn grant_summary(grants: &[PermissionGrant]) -> String {
    if grants.is_empty() {
        return "no grants; network_access=none".to_string();
    }
    grants
        .iter()
        .map(|g| format!("{}={}", g.kind(), g.value_string()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// `<name>-r<n>`, truncating `name` so the result stays a legal tool name.
pub fn reproposal_name(name: &str, n: u32) -> String {
    let suffix = format!("-r{n}");
    let keep = MAX_NAME_LEN.saturating_sub(suffix.len()).min(name.len());
    format!("{}{suffix}", &name[..keep])
}
