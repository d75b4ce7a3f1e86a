#![allow(dead_code)]

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;
use toolvault_core::toolvault_state::fakes::MemoryToolStore;
use toolvault_core::toolvault_state::{SourceType, ToolManifest, ToolStore};
use toolvault_core::{
    FsVolumeBackend, ManifestDocument, PermissionGrant, ScriptedRuntime, ToolVault, VaultConfig,
};

pub const ADMIN: &str = "admin@test";

/// A vault over in-memory storage, a scripted sandbox and a temp volume root.
pub struct Harness {
    pub vault: ToolVault,
    pub runtime: Arc<ScriptedRuntime>,
    pub store: Arc<dyn ToolStore>,
    pub volumes: TempDir,
}

pub fn test_config() -> VaultConfig {
    let mut config = VaultConfig::default();
    config.engine.backoff_base_ms = 5;
    config.engine.admission_timeout_ms = 5_000;
    config.engine.max_output_bytes = 8 * 1024 * 1024;
    config
}

pub fn harness() -> Harness {
    harness_with(test_config())
}

pub fn harness_with(config: VaultConfig) -> Harness {
    let volumes = tempfile::tempdir().unwrap();
    let store: Arc<dyn ToolStore> = Arc::new(MemoryToolStore::new());
    let runtime = Arc::new(ScriptedRuntime::new());
    let vault = ToolVault::new(
        Arc::clone(&store),
        runtime.clone(),
        Arc::new(FsVolumeBackend::new(volumes.path())),
        &config,
    );
    Harness {
        vault,
        runtime,
        store,
        volumes,
    }
}

/// A weather lookup tool with a required `city` and a network-bound
/// `forecast` capability.
pub fn weather_doc(name: &str) -> ManifestDocument {
    serde_json::from_value(json!({
        "name": name,
        "version": "1.0.0",
        "description": "Current weather for a city",
        "parameters_schema": {
            "type": "object",
            "properties": { "city": { "type": "string", "min_length": 1 } },
            "required": ["city"]
        },
        "capabilities": [
            {
                "name": "forecast",
                "description": "Fetch a forecast from the upstream API",
                "parameters": {
                    "type": "object",
                    "properties": { "days": { "type": "integer", "minimum": 1, "maximum": 7 } },
                    "required": ["days"]
                },
                "requires_network": true
            }
        ],
        "permissions": { "network_access": false, "memory_limit": 512 },
        "execution": { "image": "registry.local/weather:1", "timeout": 10 }
    }))
    .unwrap()
}

pub async fn import(h: &Harness, name: &str) -> ToolManifest {
    h.vault
        .lifecycle()
        .import(weather_doc(name), SourceType::Local, "tests://weather", ADMIN)
        .await
        .unwrap()
}

/// Import, approve with `grants` and install.
pub async fn active_tool(h: &Harness, name: &str, grants: &[PermissionGrant]) -> ToolManifest {
    let manifest = import(h, name).await;
    h.vault
        .lifecycle()
        .approve(&manifest.id, grants, ADMIN)
        .await
        .unwrap();
    h.vault
        .lifecycle()
        .install(&manifest.id, ADMIN)
        .await
        .unwrap()
}
