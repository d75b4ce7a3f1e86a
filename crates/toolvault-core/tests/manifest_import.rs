//! Importing manifests from files and the audit trail of failed imports.

mod common;

use common::{harness, ADMIN};
use toolvault_core::toolvault_state::{PermissionKind, SourceType, ToolStatus};
use toolvault_core::VaultError;

const CURRENCY_TOML: &str = r#"
name = "currency-convert"
version = "0.2.0"
description = "Convert between currencies"

[parameters_schema]
type = "object"
required = ["amount", "from", "to"]

[parameters_schema.properties.amount]
type = "number"
minimum = 0.0

[parameters_schema.properties.from]
type = "string"
min_length = 3
max_length = 3

[parameters_schema.properties.to]
type = "string"
min_length = 3
max_length = 3

[permissions]
network_access = "isolated-bridge"
storage_quota = 4

[execution]
image = "registry.local/currency:0.2"
entrypoint = ["/bin/convert", "--json"]
timeout = 20
"#;

#[tokio::test]
async fn test_import_toml_file() {
    let h = harness();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("currency.toml");
    std::fs::write(&path, CURRENCY_TOML).unwrap();

    let manifest = h.vault.lifecycle().import_path(&path, ADMIN).await.unwrap();
    assert_eq!(manifest.name, "currency-convert");
    assert_eq!(manifest.source_type, SourceType::Local);
    assert_eq!(manifest.source_location, path.display().to_string());
    assert_eq!(manifest.status, ToolStatus::PendingApproval);
    assert_eq!(manifest.execution.entrypoint, vec!["/bin/convert", "--json"]);
    assert_eq!(manifest.execution.default_timeout_secs, 20);

    let kinds: Vec<_> = manifest
        .requested_permissions
        .iter()
        .map(|p| (p.kind, p.value.as_str()))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (PermissionKind::NetworkAccess, "isolated-bridge"),
            (PermissionKind::StorageQuota, "4"),
        ]
    );
}

#[tokio::test]
async fn test_import_json_file() {
    let h = harness();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weather.json");
    std::fs::write(
        &path,
        serde_json::to_string(&common::weather_doc("weather")).unwrap(),
    )
    .unwrap();

    let manifest = h.vault.lifecycle().import_path(&path, ADMIN).await.unwrap();
    assert_eq!(manifest.name, "weather");
    assert_eq!(manifest.capabilities.len(), 1);
}

#[tokio::test]
async fn test_unsupported_extension_rejected_and_audited() {
    let h = harness();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weather.yaml");
    std::fs::write(&path, "name: weather").unwrap();

    let err = h
        .vault
        .lifecycle()
        .import_path(&path, ADMIN)
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::Validation(_)));

    let audit = h.store.list_audit(None).await.unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].action, "import");
    assert!(!audit[0].accepted);
    assert!(audit[0].tool_id.is_none());
}

#[tokio::test]
async fn test_invalid_manifest_leaves_no_tool() {
    let h = harness();
    let mut doc = common::weather_doc("weather");
    doc.execution.timeout = Some(0);

    let err = h
        .vault
        .lifecycle()
        .import(doc, SourceType::RemoteSpec, "https://tools.example/weather", ADMIN)
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::Validation(_)));
    assert!(h
        .store
        .find_manifest_by_name("weather")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_unknown_permission_kind_rejected() {
    let text = CURRENCY_TOML.replace("storage_quota = 4", "gpu = 1");
    let err = toolvault_core::ManifestDocument::parse_inline(&text).unwrap_err();
    assert!(matches!(err, VaultError::Validation(_)));
}
