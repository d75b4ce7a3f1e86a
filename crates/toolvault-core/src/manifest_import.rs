//! Manifest documents: parsing from JSON/TOML and validation into a
//! [`ToolManifest`].
//!
//! A document is validated as a whole. Any invalid field rejects the entire
//! import; nothing is written until the document is known to be good.

use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use toolvault_state::{
    CapabilityDescriptor, ExecutionSpec, PermissionKind, PermissionRequest, SchemaDescriptor,
    SourceType, ToolId, ToolManifest, ToolStatus,
};

use crate::error::{VaultError, VaultResult};
use crate::permissions::PermissionGrant;

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const MAX_TIMEOUT_SECS: u64 = 3_600;
pub const MAX_NAME_LEN: usize = 64;

/// Serialization format of a manifest document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    Json,
    Toml,
}

impl ManifestFormat {
    /// Pick the format from a file extension.
    pub fn from_path(path: &Path) -> VaultResult<Self> {
        match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase) {
            Some(ext) if ext == "json" => Ok(ManifestFormat::Json),
            Some(ext) if ext == "toml" => Ok(ManifestFormat::Toml),
            _ => Err(VaultError::Validation(format!(
                "unsupported manifest file {}: expected .json or .toml",
                path.display()
            ))),
        }
    }
}

/// A grant value as written in a manifest: `true`, `512`, or `"isolated-bridge"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GrantValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl GrantValue {
    fn raw(&self) -> String {
        match self {
            GrantValue::Bool(b) => b.to_string(),
            GrantValue::Int(n) => n.to_string(),
            GrantValue::Text(s) => s.clone(),
        }
    }
}

/// Permissions the manifest asks for. Informational; never a grant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PermissionsSection {
    pub network_access: Option<GrantValue>,
    pub storage_quota: Option<GrantValue>,
    pub cpu_limit: Option<GrantValue>,
    pub memory_limit: Option<GrantValue>,
}

impl PermissionsSection {
    fn entries(&self) -> [(PermissionKind, Option<&GrantValue>); 4] {
        [
            (PermissionKind::NetworkAccess, self.network_access.as_ref()),
            (PermissionKind::StorageQuota, self.storage_quota.as_ref()),
            (PermissionKind::CpuLimit, self.cpu_limit.as_ref()),
            (PermissionKind::MemoryLimit, self.memory_limit.as_ref()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSection {
    pub image: String,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    /// Seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// The on-disk / on-wire manifest shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestDocument {
    pub name: String,
    pub version: String,
    pub description: String,
    #[serde(default)]
    pub capabilities: Vec<CapabilityDescriptor>,
    #[serde(default)]
    pub parameters_schema: Option<SchemaDescriptor>,
    #[serde(default)]
    pub output_schema: Option<SchemaDescriptor>,
    #[serde(default)]
    pub permissions: PermissionsSection,
    pub execution: ExecutionSection,
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").expect("static pattern"))
}

/// Whether `name` is a legal tool name.
pub fn is_valid_tool_name(name: &str) -> bool {
    name_pattern().is_match(name)
}

impl ManifestDocument {
    pub fn parse(text: &str, format: ManifestFormat) -> VaultResult<Self> {
        match format {
            ManifestFormat::Json => serde_json::from_str(text)
                .map_err(|e| VaultError::Validation(format!("manifest JSON: {e}"))),
            ManifestFormat::Toml => toml::from_str(text)
                .map_err(|e| VaultError::Validation(format!("manifest TOML: {e}"))),
        }
    }

    /// Parse an inline document; a leading `{` means JSON, anything else TOML.
    pub fn parse_inline(text: &str) -> VaultResult<Self> {
        let format = if text.trim_start().starts_with('{') {
            ManifestFormat::Json
        } else {
            ManifestFormat::Toml
        };
        Self::parse(text, format)
    }

    /// Read and parse a manifest file, choosing the format by extension.
    pub fn from_path(path: &Path) -> VaultResult<Self> {
        let format = ManifestFormat::from_path(path)?;
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text, format)
    }

    /// Requested grants, each validated as a typed grant.
    pub fn requested_grants(&self) -> VaultResult<Vec<PermissionGrant>> {
        self.permissions
            .entries()
            .into_iter()
            .filter_map(|(kind, value)| value.map(|v| PermissionGrant::parse(kind, &v.raw())))
            .collect()
    }

    /// Validate every field and build a `pending_approval` manifest with a
    /// fresh id.
    pub fn into_manifest(
        self,
        source_type: SourceType,
        source_location: &str,
    ) -> VaultResult<ToolManifest> {
        if !is_valid_tool_name(&self.name) {
            return Err(VaultError::Validation(format!(
                "invalid tool name '{}': expected [a-z0-9][a-z0-9_-]{{0,63}}",
                self.name
            )));
        }
        for (field, value) in [
            ("version", &self.version),
            ("description", &self.description),
            ("execution.image", &self.execution.image),
        ] {
            if value.trim().is_empty() {
                return Err(VaultError::Validation(format!("{field} must not be empty")));
            }
        }

        let timeout = self.execution.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS);
        if !(1..=MAX_TIMEOUT_SECS).contains(&timeout) {
            return Err(VaultError::Validation(format!(
                "execution.timeout {timeout}s outside 1..={MAX_TIMEOUT_SECS}"
            )));
        }

        let mut seen = HashSet::new();
        for cap in &self.capabilities {
            if cap.name.trim().is_empty() {
                return Err(VaultError::Validation("capability name must not be empty".into()));
            }
            if !seen.insert(cap.name.as_str()) {
                return Err(VaultError::Validation(format!(
                    "duplicate capability '{}'",
                    cap.name
                )));
            }
        }

        let requested_permissions = self
            .requested_grants()?
            .into_iter()
            .map(|g| PermissionRequest {
                kind: g.kind(),
                value: g.value_string(),
            })
            .collect();

        let now = Utc::now();
        Ok(ToolManifest {
            id: ToolId::new(),
            name: self.name,
            version: self.version,
            description: self.description,
            source_type,
            source_location: source_location.to_string(),
            status: ToolStatus::PendingApproval,
            capabilities: self.capabilities,
            parameters_schema: self.parameters_schema.unwrap_or_default(),
            output_schema: self.output_schema,
            execution: ExecutionSpec {
                image: self.execution.image,
                entrypoint: self.execution.entrypoint,
                default_timeout_secs: timeout,
            },
            requested_permissions,
            created_at: now,
            updated_at: now,
            approved_at: None,
            revoked_at: None,
            superseded_by: None,
            purged_at: None,
        })
    }

    /// Rebuild a document from a stored manifest (used by re-proposal).
    pub fn from_manifest(manifest: &ToolManifest) -> Self {
        let mut permissions = PermissionsSection::default();
        for req in &manifest.requested_permissions {
            let value = Some(GrantValue::Text(req.value.clone()));
            match req.kind {
                PermissionKind::NetworkAccess => permissions.network_access = value,
                PermissionKind::StorageQuota => permissions.storage_quota = value,
                PermissionKind::CpuLimit => permissions.cpu_limit = value,
                PermissionKind::MemoryLimit => permissions.memory_limit = value,
            }
        }
        Self {
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            description: manifest.description.clone(),
            capabilities: manifest.capabilities.clone(),
            parameters_schema: Some(manifest.parameters_schema.clone()),
            output_schema: manifest.output_schema.clone(),
            permissions,
            execution: ExecutionSection {
                image: manifest.execution.image.clone(),
                entrypoint: manifest.execution.entrypoint.clone(),
                timeout: Some(manifest.execution.default_timeout_secs),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WEATHER_TOML: &str = r#"
name = "weather"
version = "1.0.0"
description = "Current conditions for a city"

[execution]
image = "ghcr.io/acme/weather:1.0"
entrypoint = ["python", "/app/main.py"]
timeout = 10

[permissions]
network_access = true
memory_limit = 128

[[capabilities]]
name = "current"
description = "Current conditions"
requires_network = true

[capabilities.parameters]
type = "object"
required = ["city"]

[capabilities.parameters.properties.city]
type = "string"
"#;

    #[test]
    fn test_toml_document_imports() {
        let doc = ManifestDocument::parse(WEATHER_TOML, ManifestFormat::Toml).unwrap();
        let manifest = doc.into_manifest(SourceType::Local, "weather.toml").unwrap();
        assert_eq!(manifest.status, ToolStatus::PendingApproval);
        assert_eq!(manifest.execution.default_timeout_secs, 10);
        assert_eq!(manifest.execution.entrypoint.len(), 2);
        let cap = manifest.capability("current").unwrap();
        assert!(cap.requires_network);
        assert_eq!(manifest.requested_permissions.len(), 2);
        assert_eq!(manifest.requested_permissions[0].value, "isolated-bridge");
    }

    #[test]
    fn test_inline_json_defaults() {
        let doc = ManifestDocument::parse_inline(
            r#"{"name": "echo", "version": "0.1", "description": "echo", "execution": {"image": "alpine"}}"#,
        )
        .unwrap();
        let manifest = doc.into_manifest(SourceType::RemoteSpec, "inline").unwrap();
        assert_eq!(manifest.execution.default_timeout_secs, DEFAULT_TIMEOUT_SECS);
        assert_eq!(manifest.parameters_schema, SchemaDescriptor::open_object());
        assert!(manifest.capabilities.is_empty());
    }

    #[test]
    fn test_missing_required_field_is_validation_error() {
        let err = ManifestDocument::parse_inline(r#"{"name": "x", "version": "1"}"#).unwrap_err();
        assert!(matches!(err, VaultError::Validation(_)));
    }

    #[test]
    fn test_name_rules() {
        assert!(is_valid_tool_name("web-search_2"));
        assert!(!is_valid_tool_name("Web"));
        assert!(!is_valid_tool_name("-lead"));
        assert!(!is_valid_tool_name(""));
        assert!(!is_valid_tool_name(&"a".repeat(65)));
        assert!(is_valid_tool_name(&"a".repeat(64)));
    }

    fn doc(f: impl FnOnce(&mut ManifestDocument)) -> VaultResult<ToolManifest> {
        let mut d = ManifestDocument::parse(WEATHER_TOML, ManifestFormat::Toml).unwrap();
        f(&mut d);
        d.into_manifest(SourceType::Local, "t")
    }

    #[test]
    fn test_any_bad_field_rejects_whole_document() {
        assert!(doc(|d| d.execution.timeout = Some(0)).is_err());
        assert!(doc(|d| d.execution.timeout = Some(3_601)).is_err());
        assert!(doc(|d| d.execution.image = " ".into()).is_err());
        assert!(doc(|d| d.permissions.cpu_limit = Some(GrantValue::Int(900))).is_err());
        assert!(doc(|d| d.permissions.network_access = Some(GrantValue::Text("host".into()))).is_err());
        assert!(doc(|d| {
            let dup = d.capabilities[0].clone();
            d.capabilities.push(dup);
        })
        .is_err());
    }

    #[test]
    fn test_unsupported_extension() {
        assert!(ManifestFormat::from_path(Path::new("tool.yaml")).is_err());
        assert_eq!(
            ManifestFormat::from_path(Path::new("tool.JSON")).unwrap(),
            ManifestFormat::Json
        );
    }

    #[test]
    fn test_from_manifest_round_trips_through_validation() {
        let original = ManifestDocument::parse(WEATHER_TOML, ManifestFormat::Toml)
            .unwrap()
            .into_manifest(SourceType::Local, "t")
            .unwrap();
        let again = ManifestDocument::from_manifest(&original)
            .into_manifest(SourceType::Local, "t")
            .unwrap();
        assert_eq!(again.capabilities, original.capabilities);
        assert_eq!(again.requested_permissions, original.requested_permissions);
        assert_ne!(again.id, original.id);
    }
}
