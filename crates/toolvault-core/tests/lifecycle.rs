//! Lifecycle state machine, permission grants and state retention across
//! revocation.

mod common;

use common::{active_tool, harness, import, ADMIN};
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use toolvault_core::toolvault_state::fakes::MemoryToolStore;
use toolvault_core::toolvault_state::{PermissionKind, SourceType, ToolStatus, ToolStore};
use toolvault_core::{
    FsVolumeBackend, NetworkMode, PermissionGrant, ScriptedRuntime, ToolVault, VaultError,
};

#[tokio::test]
async fn test_import_approve_install_reaches_active() {
    let h = harness();
    let manifest = import(&h, "weather").await;
    assert_eq!(manifest.status, ToolStatus::PendingApproval);
    assert_eq!(manifest.requested_permissions.len(), 2);

    let approved = h
        .vault
        .lifecycle()
        .approve(&manifest.id, &[PermissionGrant::MemoryLimit(512)], ADMIN)
        .await
        .unwrap();
    assert_eq!(approved.status, ToolStatus::Approved);
    assert!(approved.approved_at.is_some());

    let active = h.vault.lifecycle().install(&manifest.id, ADMIN).await.unwrap();
    assert_eq!(active.status, ToolStatus::Active);

    let volume = h.vault.state().volume(&manifest.id).await.unwrap().unwrap();
    assert_eq!(volume.mount_path, "/data");
    assert!(std::path::Path::new(&volume.host_path).is_dir());

    let resolved = h
        .vault
        .permissions()
        .check_and_resolve(&manifest.id)
        .await
        .unwrap();
    assert_eq!(resolved.memory_mb, 512);
    assert_eq!(resolved.network, NetworkMode::None);
}

#[tokio::test]
async fn test_requested_permissions_are_not_grants() {
    let h = harness();
    let manifest = import(&h, "weather").await;
    assert!(h
        .vault
        .permissions()
        .list(&manifest.id)
        .await
        .unwrap()
        .is_empty());

    // Approval without grants seeds an explicit no-network grant only.
    h.vault
        .lifecycle()
        .approve(&manifest.id, &[], ADMIN)
        .await
        .unwrap();
    let grants = h.vault.permissions().list(&manifest.id).await.unwrap();
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].kind, PermissionKind::NetworkAccess);
    let resolved = h
        .vault
        .permissions()
        .check_and_resolve(&manifest.id)
        .await
        .unwrap();
    assert_eq!(resolved.memory_mb, 64);
}

#[tokio::test]
async fn test_illegal_transition_is_rejected_and_audited() {
    let h = harness();
    let manifest = import(&h, "weather").await;

    let err = h
        .vault
        .lifecycle()
        .install(&manifest.id, ADMIN)
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::InvalidLifecycleTransition(_)));

    let unchanged = h.store.get_manifest(&manifest.id).await.unwrap();
    assert_eq!(unchanged.status, ToolStatus::PendingApproval);
    assert!(h.vault.state().volume(&manifest.id).await.unwrap().is_none());

    let audit = h.store.list_audit(Some(&manifest.id)).await.unwrap();
    let rejected = audit
        .iter()
        .find(|e| e.action == "install")
        .expect("install attempt audited");
    assert!(!rejected.accepted);
    assert_eq!(rejected.actor, ADMIN);
}

#[tokio::test]
async fn test_repeated_transition_is_noop() {
    let h = harness();
    let manifest = active_tool(&h, "weather", &[]).await;
    let before = h.store.get_manifest(&manifest.id).await.unwrap();

    let again = h.vault.lifecycle().install(&manifest.id, ADMIN).await.unwrap();
    assert_eq!(again.status, ToolStatus::Active);
    assert_eq!(again.updated_at, before.updated_at);
}

#[tokio::test]
async fn test_disable_enable_resolves_fresh_permissions() {
    let h = harness();
    let manifest = active_tool(&h, "weather", &[]).await;

    h.vault.lifecycle().disable(&manifest.id, ADMIN).await.unwrap();
    h.vault
        .permissions()
        .grant(&manifest.id, PermissionKind::MemoryLimit, "256", ADMIN)
        .await
        .unwrap();
    let enabled = h.vault.lifecycle().enable(&manifest.id, ADMIN).await.unwrap();
    assert_eq!(enabled.status, ToolStatus::Active);

    let audit = h.store.list_audit(Some(&manifest.id)).await.unwrap();
    let enable = audit.iter().rev().find(|e| e.action == "enable").unwrap();
    assert!(enable.accepted);
    assert!(enable.detail.contains("memory=256MB"));
}

#[tokio::test]
async fn test_failed_permission_seed_rolls_back_approval() {
    let memory = Arc::new(MemoryToolStore::new());
    let store: Arc<dyn ToolStore> = memory.clone();
    let volumes = tempfile::tempdir().unwrap();
    let vault = ToolVault::new(
        Arc::clone(&store),
        Arc::new(ScriptedRuntime::new()),
        Arc::new(FsVolumeBackend::new(volumes.path())),
        &common::test_config(),
    );
    let manifest = vault
        .lifecycle()
        .import(common::weather_doc("weather"), SourceType::Local, "tests://weather", ADMIN)
        .await
        .unwrap();

    memory.fail_permission_writes(true);
    let err = vault
        .lifecycle()
        .approve(&manifest.id, &[PermissionGrant::MemoryLimit(256)], ADMIN)
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::Storage(_)));
    let current = store.get_manifest(&manifest.id).await.unwrap();
    assert_eq!(current.status, ToolStatus::PendingApproval);
    assert!(store.list_permissions(&manifest.id).await.unwrap().is_empty());
    let audit = store.list_audit(Some(&manifest.id)).await.unwrap();
    let last = audit.last().unwrap();
    assert_eq!(last.action, "approve");
    assert!(!last.accepted);
    assert!(last.detail.contains("rolled back"));

    memory.fail_permission_writes(false);
    let approved = vault
        .lifecycle()
        .approve(&manifest.id, &[PermissionGrant::MemoryLimit(256)], ADMIN)
        .await
        .unwrap();
    assert_eq!(approved.status, ToolStatus::Approved);
    assert_eq!(store.list_permissions(&manifest.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_grant_rejected_before_approval() {
    let h = harness();
    let manifest = import(&h, "weather").await;
    let err = h
        .vault
        .permissions()
        .grant(&manifest.id, PermissionKind::NetworkAccess, "isolated-bridge", ADMIN)
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::InvalidLifecycleTransition(_)));
}

#[tokio::test]
async fn test_grant_rejects_invalid_value() {
    let h = harness();
    let manifest = active_tool(&h, "weather", &[]).await;
    let err = h
        .vault
        .permissions()
        .grant(&manifest.id, PermissionKind::CpuLimit, "9000", ADMIN)
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::Validation(_)));
}

#[tokio::test]
async fn test_revoke_without_purge_keeps_state_read_only() {
    let h = harness();
    let manifest = active_tool(&h, "weather", &[]).await;
    h.vault
        .state()
        .set_state(&manifest.id, "last_city", json!("Oslo"), &CancellationToken::new())
        .await
        .unwrap();

    let report = h
        .vault
        .lifecycle()
        .revoke(&manifest.id, false, ADMIN)
        .await
        .unwrap();
    assert_eq!(report.manifest.status, ToolStatus::Revoked);
    assert!(report.purged.is_none());

    assert_eq!(
        h.vault.state().get_state(&manifest.id, "last_city").await.unwrap(),
        Some(json!("Oslo"))
    );
    let err = h
        .vault
        .state()
        .set_state(&manifest.id, "last_city", json!("Bergen"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::InvalidLifecycleTransition(_)));

    // Revoked is terminal.
    let err = h.vault.lifecycle().enable(&manifest.id, ADMIN).await.unwrap_err();
    assert!(matches!(err, VaultError::InvalidLifecycleTransition(_)));
}

#[tokio::test]
async fn test_disabled_tool_keeps_state_through_reenable() {
    let h = harness();
    let manifest = active_tool(&h, "weather", &[]).await;
    h.vault
        .state()
        .set_state(&manifest.id, "count", json!(3), &CancellationToken::new())
        .await
        .unwrap();
    h.vault.lifecycle().disable(&manifest.id, ADMIN).await.unwrap();
    h.vault.lifecycle().enable(&manifest.id, ADMIN).await.unwrap();
    assert_eq!(
        h.vault.state().get_state(&manifest.id, "count").await.unwrap(),
        Some(json!(3))
    );
}

#[tokio::test]
async fn test_revoke_with_purge_removes_state_and_volume() {
    let h = harness();
    let manifest = active_tool(&h, "weather", &[]).await;
    h.vault
        .state()
        .set_state(&manifest.id, "last_city", json!("Oslo"), &CancellationToken::new())
        .await
        .unwrap();
    let volume = h.vault.state().volume(&manifest.id).await.unwrap().unwrap();

    let report = h
        .vault
        .lifecycle()
        .revoke(&manifest.id, true, ADMIN)
        .await
        .unwrap();
    let purged = report.purged.unwrap();
    assert_eq!(purged.state_entries_removed, 1);
    assert!(purged.volume_removed);
    assert!(report.manifest.purged_at.is_some());
    assert!(!std::path::Path::new(&volume.host_path).exists());

    let err = h
        .vault
        .state()
        .get_state(&manifest.id, "last_city")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    let err = h
        .vault
        .state()
        .allocate_volume(&manifest.id, 1)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_purge_after_plain_revoke() {
    let h = harness();
    let manifest = active_tool(&h, "weather", &[]).await;
    h.vault
        .lifecycle()
        .revoke(&manifest.id, false, ADMIN)
        .await
        .unwrap();
    let report = h
        .vault
        .lifecycle()
        .revoke(&manifest.id, true, ADMIN)
        .await
        .unwrap();
    assert!(report.purged.is_some());

    // A second purge has nothing left to do.
    let again = h
        .vault
        .lifecycle()
        .revoke(&manifest.id, true, ADMIN)
        .await
        .unwrap();
    assert!(again.purged.is_none());
}

#[tokio::test]
async fn test_repropose_creates_fresh_pending_manifest() {
    let h = harness();
    let manifest = active_tool(&h, "weather", &[PermissionGrant::MemoryLimit(512)]).await;

    let err = h
        .vault
        .lifecycle()
        .repropose(&manifest.id, ADMIN)
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::InvalidLifecycleTransition(_)));

    h.vault
        .lifecycle()
        .revoke(&manifest.id, false, ADMIN)
        .await
        .unwrap();
    let successor = h
        .vault
        .lifecycle()
        .repropose(&manifest.id, ADMIN)
        .await
        .unwrap();
    assert_eq!(successor.name, "weather-r2");
    assert_eq!(successor.status, ToolStatus::PendingApproval);
    assert_ne!(successor.id, manifest.id);
    assert_eq!(successor.capabilities, manifest.capabilities);
    assert!(h
        .vault
        .permissions()
        .list(&successor.id)
        .await
        .unwrap()
        .is_empty());

    let old = h.store.get_manifest(&manifest.id).await.unwrap();
    assert_eq!(old.superseded_by, Some(successor.id.clone()));
    assert_eq!(old.status, ToolStatus::Revoked);

    let err = h
        .vault
        .lifecycle()
        .repropose(&manifest.id, ADMIN)
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::InvalidLifecycleTransition(_)));
}

#[tokio::test]
async fn test_duplicate_name_rejected() {
    let h = harness();
    import(&h, "weather").await;
    let err = h
        .vault
        .lifecycle()
        .import(
            common::weather_doc("weather"),
            toolvault_core::toolvault_state::SourceType::Local,
            "tests://weather",
            ADMIN,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::Duplicate { .. }));
}
