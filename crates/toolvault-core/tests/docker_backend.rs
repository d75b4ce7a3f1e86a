//! The Docker backend driven end to end through a stand-in `docker` CLI.
#![cfg(unix)]

mod common;

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::{test_config, weather_doc, ADMIN};
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use toolvault_core::toolvault_state::fakes::MemoryToolStore;
use toolvault_core::toolvault_state::{
    ErrorKind, ExecutionFilter, ExecutionStatus, SourceType, ToolId, ToolStore,
};
use toolvault_core::{DockerRuntime, FsVolumeBackend, InvocationRequest, ToolVault, VaultError};

const SCRIPT: &str = r#"#!/bin/sh
case "$1" in
  run)
    cat > /dev/null
    echo run >> "__RUNS__"
    sleep 0.3
    echo '__STDOUT__'
    echo "tool failed deliberately" >&2
    exit __EXIT__
    ;;
  inspect)
    case "$3" in
      *StartedAt*) __STARTED__ ;;
      *OOMKilled*) echo false ;;
    esac
    ;;
  stats)
    echo '{"CPUPerc":"50.00%","MemUsage":"20MiB / 64MiB","Name":"x"}'
    ;;
esac
exit 0
"#;

const STARTED: &str = "echo 2026-10-19T10:00:00.123456789Z";
const NEVER_STARTED: &str = "echo 0001-01-01T00:00:00Z";
const INSPECT_FAILS: &str = "exit 1";

struct FakeDocker {
    dir: TempDir,
    bin: PathBuf,
}

impl FakeDocker {
    fn new(exit: i32, stdout: &str, started: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("docker");
        let runs = dir.path().join("runs");
        let script = SCRIPT
            .replace("__RUNS__", &runs.display().to_string())
            .replace("__STDOUT__", stdout)
            .replace("__EXIT__", &exit.to_string())
            .replace("__STARTED__", started);
        std::fs::write(&bin, script).unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        Self { dir, bin }
    }

    fn runs(&self) -> usize {
        std::fs::read_to_string(self.dir.path().join("runs"))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }
}

async fn docker_vault(docker: &FakeDocker, volumes: &Path) -> (ToolVault, Arc<dyn ToolStore>, ToolId) {
    let mut config = test_config();
    config.runtime.docker_bin = docker.bin.display().to_string();
    config.runtime.stats_interval_ms = 50;
    let store: Arc<dyn ToolStore> = Arc::new(MemoryToolStore::new());
    let vault = ToolVault::new(
        Arc::clone(&store),
        Arc::new(DockerRuntime::new(config.runtime.clone())),
        Arc::new(FsVolumeBackend::new(volumes)),
        &config,
    );
    let lifecycle = vault.lifecycle();
    let tool = lifecycle
        .import(weather_doc("weather"), SourceType::Local, "tests://weather", ADMIN)
        .await
        .unwrap();
    lifecycle.approve(&tool.id, &[], ADMIN).await.unwrap();
    lifecycle.install(&tool.id, ADMIN).await.unwrap();
    (vault, store, tool.id)
}

fn call(tool_id: &ToolId) -> InvocationRequest {
    InvocationRequest::new(tool_id.clone(), json!({"city": "Oslo"}))
}

#[tokio::test]
async fn test_tool_exit_125_is_a_tool_failure() {
    let docker = FakeDocker::new(125, "{}", STARTED);
    let volumes = tempfile::tempdir().unwrap();
    let (vault, store, tool_id) = docker_vault(&docker, volumes.path()).await;

    let result = vault
        .engine()
        .execute(call(&tool_id), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Failure);
    assert_eq!(result.error_kind, Some(ErrorKind::ExecutionFailure));
    assert_eq!(result.exit_code, Some(125));
    assert_eq!(result.attempts, 1);
    assert_eq!(docker.runs(), 1);

    let rows = store
        .list_executions(&ExecutionFilter::for_tool(&tool_id))
        .await
        .unwrap();
    assert_eq!(rows[0].error_kind, Some(ErrorKind::ExecutionFailure));
}

#[tokio::test]
async fn test_container_that_never_started_is_unavailable() {
    for started in [NEVER_STARTED, INSPECT_FAILS] {
        let docker = FakeDocker::new(125, "", started);
        let volumes = tempfile::tempdir().unwrap();
        let (vault, _store, tool_id) = docker_vault(&docker, volumes.path()).await;

        let err = vault
            .engine()
            .execute(call(&tool_id), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::SandboxUnavailable(_)), "{started}: {err}");
        assert_eq!(docker.runs(), 3, "{started}");
    }
}

#[tokio::test]
async fn test_resource_usage_is_sampled() {
    let docker = FakeDocker::new(0, r#"{"temp_c": 4}"#, STARTED);
    let volumes = tempfile::tempdir().unwrap();
    let (vault, store, tool_id) = docker_vault(&docker, volumes.path()).await;

    let result = vault
        .engine()
        .execute(call(&tool_id), CancellationToken::new())
        .await
        .unwrap();
    assert!(result.is_success());
    assert_eq!(result.output, Some(json!({"temp_c": 4})));
    assert_eq!(result.resource_usage.memory_peak_mb, Some(20));
    assert!(result.resource_usage.cpu_usage_ms.is_some());

    let rows = store
        .list_executions(&ExecutionFilter::for_tool(&tool_id))
        .await
        .unwrap();
    assert_eq!(rows[0].memory_peak_mb, Some(20));
    assert!(rows[0].cpu_usage_ms.is_some());
}
