//! End-to-end execution tests against the scripted sandbox backend.

mod common;

use std::time::{Duration, Instant};

use common::{active_tool, harness, harness_with, test_config, ADMIN};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use toolvault_core::toolvault_state::{
    ErrorKind, ExecutionFilter, ExecutionRecord, ExecutionStatus, PermissionKind, ToolId,
};
use toolvault_core::{
    InvocationRequest, NetworkMode, PermissionGrant, ScriptedStep, VaultError, ORPHANED_MESSAGE,
};

fn weather_call(tool_id: &ToolId) -> InvocationRequest {
    InvocationRequest::new(tool_id.clone(), json!({"city": "Oslo"}))
}

async fn records(h: &common::Harness, tool_id: &ToolId) -> Vec<ExecutionRecord> {
    h.vault
        .ledger()
        .list(&ExecutionFilter::for_tool(tool_id))
        .await
        .unwrap()
}

// -------------------------------------------------------------------------
// Success path and state
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_execute_success_records_output() {
    let h = harness();
    let tool = active_tool(&h, "weather", &[]).await;
    h.runtime.push(ScriptedStep::ok(json!({"temp_c": 4})));

    let result = h
        .vault
        .engine()
        .execute(
            weather_call(&tool.id).with_correlation("conv-1", "turn-3"),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(result.is_success());
    assert_eq!(result.output, Some(json!({"temp_c": 4})));
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.attempts, 1);

    let rows = records(&h, &tool.id).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, ExecutionStatus::Success);
    assert_eq!(rows[0].conversation_id.as_deref(), Some("conv-1"));
    assert_eq!(rows[0].turn_id.as_deref(), Some("turn-3"));
    assert_eq!(rows[0].input_params, json!({"city": "Oslo"}));
    assert!(rows[0].completed_at.unwrap() >= rows[0].started_at);

    let launch = &h.runtime.launches()[0];
    assert_eq!(launch.image, "registry.local/weather:1");
    assert_eq!(launch.network, NetworkMode::None);
    assert_eq!(launch.memory_mb, 64);
    assert_eq!(launch.timeout, Duration::from_secs(10));
    assert_eq!(h.runtime.teardowns(), vec![launch.instance_id.clone()]);
}

#[tokio::test]
async fn test_state_carries_across_invocations() {
    let h = harness();
    let tool = active_tool(&h, "weather", &[]).await;
    h.runtime.push(ScriptedStep::ok(json!({
        "output": {"temp_c": 4},
        "state": {"set": {"last_city": "Oslo"}}
    })));
    h.runtime.push(ScriptedStep::ok(json!({"temp_c": 6})));

    let engine = h.vault.engine();
    let first = engine
        .execute(weather_call(&tool.id), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.output, Some(json!({"temp_c": 4})));
    engine
        .execute(weather_call(&tool.id), CancellationToken::new())
        .await
        .unwrap();

    let launches = h.runtime.launches();
    let stdin: Value = serde_json::from_slice(&launches[1].stdin).unwrap();
    assert_eq!(stdin["state"]["last_city"], json!("Oslo"));
    assert_eq!(stdin["params"], json!({"city": "Oslo"}));
    assert!(launches[1]
        .env
        .iter()
        .any(|(k, v)| k == "TOOL_PARAMS" && v == r#"{"city":"Oslo"}"#));
    let (_, mount) = launches[1].volume.clone().unwrap();
    assert_eq!(mount, "/data");
}

#[tokio::test]
async fn test_state_quota_exceeded_writes_nothing() {
    let h = harness();
    let tool = active_tool(&h, "weather", &[]).await;
    let blob = "x".repeat(2 * 1024 * 1024);
    h.runtime.push(ScriptedStep::ok(json!({
        "output": 1,
        "state": {"set": {"blob": blob, "small": 1}}
    })));

    let result = h
        .vault
        .engine()
        .execute(weather_call(&tool.id), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Failure);
    assert_eq!(result.error_kind, Some(ErrorKind::QuotaExceeded));
    assert!(h
        .vault
        .state()
        .list_state_keys(&tool.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_external_state_write_waits_for_running_execution() {
    let h = harness();
    let tool = active_tool(&h, "weather", &[]).await;
    let state = h.vault.state();
    state
        .set_state(&tool.id, "count", json!(0), &CancellationToken::new())
        .await
        .unwrap();
    h.runtime.push(
        ScriptedStep::ok(json!({"output": 1, "state": {"set": {"count": 1}}}))
            .after(Duration::from_millis(200)),
    );

    let engine = h.vault.engine().clone();
    let tool_id = tool.id.clone();
    let run = tokio::spawn(async move {
        engine
            .execute(weather_call(&tool_id), CancellationToken::new())
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    state
        .set_state(&tool.id, "count", json!(100), &CancellationToken::new())
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(run.await.unwrap().unwrap().is_success());
    assert_eq!(
        state.get_state(&tool.id, "count").await.unwrap(),
        Some(json!(100))
    );
}

#[tokio::test]
async fn test_external_state_write_honours_deadline_and_cancel() {
    let mut config = test_config();
    config.engine.admission_timeout_ms = 30;
    let h = harness_with(config);
    let tool = active_tool(&h, "weather", &[]).await;
    h.runtime.push(
        ScriptedStep::ok(json!({"output": 1, "state": {"set": {"count": 1}}}))
            .after(Duration::from_millis(200)),
    );

    let engine = h.vault.engine().clone();
    let tool_id = tool.id.clone();
    let run = tokio::spawn(async move {
        engine
            .execute(weather_call(&tool_id), CancellationToken::new())
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let state = h.vault.state();
    let err = state
        .set_state(&tool.id, "count", json!(100), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::SandboxBusy { .. }));

    let cancelled = CancellationToken::new();
    cancelled.cancel();
    let err = state
        .delete_state(&tool.id, "count", &cancelled)
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::Cancelled));

    assert!(run.await.unwrap().unwrap().is_success());
    assert_eq!(
        state.get_state(&tool.id, "count").await.unwrap(),
        Some(json!(1))
    );
}

// -------------------------------------------------------------------------
// Rejections before launch
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_network_capability_denied_without_grant() {
    let h = harness();
    let tool = active_tool(&h, "weather", &[]).await;

    let err = h
        .vault
        .engine()
        .execute(
            InvocationRequest::new(tool.id.clone(), json!({"days": 3})).with_capability("forecast"),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::PermissionDenied(_)));
    assert_eq!(h.runtime.launch_count(), 0);

    let rows = records(&h, &tool.id).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, ExecutionStatus::Failure);
    assert_eq!(rows[0].error_kind, Some(ErrorKind::PermissionDenied));
}

#[tokio::test]
async fn test_network_grant_reaches_the_sandbox() {
    let h = harness();
    let tool = active_tool(
        &h,
        "weather",
        &[PermissionGrant::NetworkAccess(NetworkMode::IsolatedBridge)],
    )
    .await;

    let result = h
        .vault
        .engine()
        .execute(
            InvocationRequest::new(tool.id.clone(), json!({"days": 3})).with_capability("forecast"),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(result.is_success());
    assert_eq!(h.runtime.launches()[0].network, NetworkMode::IsolatedBridge);
}

#[tokio::test]
async fn test_grant_change_applies_to_next_execution() {
    let h = harness();
    let tool = active_tool(
        &h,
        "weather",
        &[PermissionGrant::NetworkAccess(NetworkMode::IsolatedBridge)],
    )
    .await;
    let forecast =
        || InvocationRequest::new(tool.id.clone(), json!({"days": 3})).with_capability("forecast");
    let engine = h.vault.engine();

    assert!(engine
        .execute(forecast(), CancellationToken::new())
        .await
        .unwrap()
        .is_success());
    assert_eq!(h.runtime.launches()[0].network, NetworkMode::IsolatedBridge);

    h.vault
        .permissions()
        .grant(&tool.id, PermissionKind::NetworkAccess, "none", ADMIN)
        .await
        .unwrap();
    let err = engine
        .execute(forecast(), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::PermissionDenied(_)));

    engine
        .execute(weather_call(&tool.id), CancellationToken::new())
        .await
        .unwrap();
    let launches = h.runtime.launches();
    assert_eq!(launches.len(), 2);
    assert_eq!(launches[1].network, NetworkMode::None);
}

#[tokio::test]
async fn test_revoked_tool_cannot_regain_network_or_run() {
    let h = harness();
    let tool = active_tool(
        &h,
        "weather",
        &[PermissionGrant::NetworkAccess(NetworkMode::IsolatedBridge)],
    )
    .await;
    h.vault
        .lifecycle()
        .revoke(&tool.id, false, ADMIN)
        .await
        .unwrap();

    let err = h
        .vault
        .permissions()
        .grant(&tool.id, PermissionKind::NetworkAccess, "isolated-bridge", ADMIN)
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::InvalidLifecycleTransition(_)));

    let err = h
        .vault
        .engine()
        .execute(
            InvocationRequest::new(tool.id.clone(), json!({"days": 3})).with_capability("forecast"),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::PermissionDenied(_)));
    assert_eq!(h.runtime.launch_count(), 0);
    assert_eq!(
        records(&h, &tool.id).await[0].error_kind,
        Some(ErrorKind::PermissionDenied)
    );
}

#[tokio::test]
async fn test_invalid_params_rejected() {
    let h = harness();
    let tool = active_tool(&h, "weather", &[]).await;

    let err = h
        .vault
        .engine()
        .execute(
            InvocationRequest::new(tool.id.clone(), json!({"city": 7})),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::Validation(_)));
    assert_eq!(h.runtime.launch_count(), 0);
    assert_eq!(
        records(&h, &tool.id).await[0].error_kind,
        Some(ErrorKind::Validation)
    );
}

#[tokio::test]
async fn test_inactive_tool_rejected() {
    let h = harness();
    let tool = active_tool(&h, "weather", &[]).await;
    h.vault.lifecycle().disable(&tool.id, ADMIN).await.unwrap();

    let err = h
        .vault
        .engine()
        .execute(weather_call(&tool.id), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::PermissionDenied(_)));
    assert_eq!(h.runtime.launch_count(), 0);
}

#[tokio::test]
async fn test_unknown_tool_is_not_found() {
    let h = harness();
    let err = h
        .vault
        .engine()
        .execute(weather_call(&ToolId::new()), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_timeout_above_maximum_rejected() {
    let h = harness();
    let tool = active_tool(&h, "weather", &[]).await;
    let err = h
        .vault
        .engine()
        .execute(
            weather_call(&tool.id).with_timeout(Duration::from_secs(7200)),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::Validation(_)));
}

// -------------------------------------------------------------------------
// Abnormal terminations
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_memory_cap_kill_is_resource_exceeded() {
    let h = harness();
    let tool = active_tool(&h, "weather", &[PermissionGrant::MemoryLimit(512)]).await;
    // Partial output with state mutations must not be applied.
    h.runtime.push(ScriptedStep::raw(
        137,
        json!({"output": 1, "state": {"set": {"partial": true}}}).to_string(),
        "",
    ));

    let result = h
        .vault
        .engine()
        .execute(weather_call(&tool.id), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Failure);
    assert_eq!(result.error_kind, Some(ErrorKind::ResourceExceeded));
    assert_eq!(result.exit_code, Some(137));
    assert_eq!(h.runtime.launches()[0].memory_mb, 512);
    assert_eq!(
        h.vault.state().get_state(&tool.id, "partial").await.unwrap(),
        None
    );
}

#[tokio::test]
async fn test_oom_kill_reported_by_backend() {
    let h = harness();
    let tool = active_tool(&h, "weather", &[]).await;
    h.runtime.push(ScriptedStep::oom());

    let result = h
        .vault
        .engine()
        .execute(weather_call(&tool.id), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.error_kind, Some(ErrorKind::ResourceExceeded));
    assert_eq!(result.resource_usage.memory_peak_mb, Some(64));
}

#[tokio::test]
async fn test_nonzero_exit_is_execution_failure() {
    let h = harness();
    let tool = active_tool(&h, "weather", &[]).await;
    h.runtime.push(ScriptedStep::fail(2, "upstream returned 503"));

    let result = h
        .vault
        .engine()
        .execute(weather_call(&tool.id), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Failure);
    assert_eq!(result.error_kind, Some(ErrorKind::ExecutionFailure));
    assert_eq!(result.exit_code, Some(2));
    assert!(result.error_message.unwrap().contains("upstream returned 503"));
}

#[tokio::test]
async fn test_non_json_stdout_is_failure() {
    let h = harness();
    let tool = active_tool(&h, "weather", &[]).await;
    h.runtime.push(ScriptedStep::raw(0, "sunny", ""));

    let result = h
        .vault
        .engine()
        .execute(weather_call(&tool.id), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.error_kind, Some(ErrorKind::ExecutionFailure));
}

#[tokio::test]
async fn test_oversized_output_is_reported_as_such() {
    let mut config = test_config();
    config.engine.max_output_bytes = 64;
    let h = harness_with(config);
    let tool = active_tool(&h, "weather", &[]).await;
    h.runtime
        .push(ScriptedStep::ok(json!({"report": "x".repeat(500)})));

    let result = h
        .vault
        .engine()
        .execute(weather_call(&tool.id), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.error_kind, Some(ErrorKind::ExecutionFailure));
    assert!(result
        .error_message
        .unwrap()
        .contains("output exceeded max_output_bytes"));
}

#[tokio::test]
async fn test_timeout_kills_and_records() {
    let h = harness();
    let tool = active_tool(&h, "weather", &[]).await;
    h.runtime.push(ScriptedStep::hang());

    let result = h
        .vault
        .engine()
        .execute(
            weather_call(&tool.id).with_timeout(Duration::from_millis(50)),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Timeout);
    assert_eq!(result.error_kind, Some(ErrorKind::ExecutionTimeout));
    assert_eq!(h.runtime.teardowns().len(), 1);
    assert_eq!(records(&h, &tool.id).await[0].status, ExecutionStatus::Timeout);
}

#[tokio::test]
async fn test_cancel_during_run() {
    let h = harness();
    let tool = active_tool(&h, "weather", &[]).await;
    h.runtime.push(ScriptedStep::hang());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let result = h
        .vault
        .engine()
        .execute(weather_call(&tool.id), cancel)
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Cancelled);
    assert_eq!(result.error_kind, Some(ErrorKind::Cancelled));
    assert_eq!(h.runtime.running(), 0);
}

#[tokio::test]
async fn test_dropped_call_is_finalized() {
    let h = harness();
    let tool = active_tool(&h, "weather", &[]).await;
    h.runtime.push(ScriptedStep::hang());

    let call = h
        .vault
        .engine()
        .execute(weather_call(&tool.id), CancellationToken::new());
    assert!(tokio::time::timeout(Duration::from_millis(30), call)
        .await
        .is_err());

    let mut row = records(&h, &tool.id).await.remove(0);
    for _ in 0..50 {
        if row.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        row = records(&h, &tool.id).await.remove(0);
    }
    assert_eq!(row.status, ExecutionStatus::Cancelled);
    assert!(row.error_message.unwrap().contains("abandoned"));

    // The tool lock was released with the record.
    let next = h
        .vault
        .engine()
        .execute(weather_call(&tool.id), CancellationToken::new())
        .await
        .unwrap();
    assert!(next.is_success());
    assert!(h
        .runtime
        .teardowns()
        .contains(&row.sandbox_instance_id.unwrap()));
}

// -------------------------------------------------------------------------
// Scheduling
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_same_tool_runs_never_overlap() {
    let h = harness();
    let tool = active_tool(&h, "weather", &[]).await;
    h.runtime
        .respond_with(|_| ScriptedStep::ok(json!({"ok": true})).after(Duration::from_millis(50)));

    let engine = h.vault.engine();
    let (a, b) = tokio::join!(
        engine.execute(weather_call(&tool.id), CancellationToken::new()),
        engine.execute(weather_call(&tool.id), CancellationToken::new()),
    );
    assert!(a.unwrap().is_success());
    assert!(b.unwrap().is_success());
    assert_eq!(h.runtime.peak_running(), 1);

    let mut rows = records(&h, &tool.id).await;
    rows.sort_by_key(|r| r.started_at);
    assert_eq!(rows.len(), 2);
    assert!(rows[0].completed_at.unwrap() <= rows[1].started_at);
}

#[tokio::test]
async fn test_global_cap_across_tools() {
    let mut config = test_config();
    config.engine.max_concurrent_executions = 2;
    let h = harness_with(config);
    h.runtime
        .respond_with(|_| ScriptedStep::ok(json!(null)).after(Duration::from_millis(40)));

    let mut tools = Vec::new();
    for name in ["t-a", "t-b", "t-c", "t-d"] {
        tools.push(active_tool(&h, name, &[]).await);
    }
    let engine = h.vault.engine();
    let calls = tools
        .iter()
        .map(|t| engine.execute(weather_call(&t.id), CancellationToken::new()));
    let results = futures::future::join_all(calls).await;
    assert!(results.into_iter().all(|r| r.unwrap().is_success()));
    assert_eq!(h.runtime.peak_running(), 2);
}

#[tokio::test]
async fn test_admission_timeout_is_sandbox_busy() {
    let mut config = test_config();
    config.engine.max_concurrent_executions = 1;
    config.engine.admission_timeout_ms = 50;
    let h = harness_with(config);
    let slow = active_tool(&h, "slow", &[]).await;
    let other = active_tool(&h, "other", &[]).await;
    h.runtime.push(ScriptedStep::hang());

    let cancel = CancellationToken::new();
    let engine = h.vault.engine().clone();
    let holder = {
        let cancel = cancel.clone();
        let id = slow.id.clone();
        tokio::spawn(async move { engine.execute(weather_call(&id), cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = h
        .vault
        .engine()
        .execute(weather_call(&other.id), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::SandboxBusy { .. }));
    let rows = records(&h, &other.id).await;
    assert_eq!(rows[0].error_kind, Some(ErrorKind::SandboxBusy));

    cancel.cancel();
    let held = holder.await.unwrap().unwrap();
    assert_eq!(held.status, ExecutionStatus::Cancelled);
}

#[tokio::test]
async fn test_cancel_while_queued() {
    let mut config = test_config();
    config.engine.max_concurrent_executions = 1;
    let h = harness_with(config);
    let slow = active_tool(&h, "slow", &[]).await;
    let other = active_tool(&h, "other", &[]).await;
    h.runtime.push(ScriptedStep::hang());

    let release = CancellationToken::new();
    let engine = h.vault.engine().clone();
    let holder = {
        let release = release.clone();
        let id = slow.id.clone();
        tokio::spawn(async move { engine.execute(weather_call(&id), release).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = h
        .vault
        .engine()
        .execute(weather_call(&other.id), cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::Cancelled));
    assert_eq!(
        records(&h, &other.id).await[0].status,
        ExecutionStatus::Cancelled
    );

    release.cancel();
    holder.await.unwrap().unwrap();
    assert_eq!(h.runtime.launch_count(), 1);
}

// -------------------------------------------------------------------------
// Platform retries
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_platform_error_retried() {
    let h = harness();
    let tool = active_tool(&h, "weather", &[]).await;
    h.runtime
        .push(ScriptedStep::unavailable("docker daemon restarting"))
        .push(ScriptedStep::ok(json!({"temp_c": 1})));

    let result = h
        .vault
        .engine()
        .execute(weather_call(&tool.id), CancellationToken::new())
        .await
        .unwrap();
    assert!(result.is_success());
    assert_eq!(result.attempts, 2);
    assert_eq!(h.runtime.launch_count(), 2);
    assert_eq!(records(&h, &tool.id).await.len(), 1);
}

#[tokio::test]
async fn test_platform_unavailable_after_retries() {
    let h = harness();
    let tool = active_tool(&h, "weather", &[]).await;
    h.runtime
        .respond_with(|_| ScriptedStep::unavailable("cannot connect to the docker daemon"));

    let err = h
        .vault
        .engine()
        .execute(weather_call(&tool.id), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::SandboxUnavailable(_)));
    assert!(err.is_retryable());
    assert_eq!(h.runtime.launch_count(), 3);

    let rows = records(&h, &tool.id).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, ExecutionStatus::Failure);
    assert_eq!(rows[0].error_kind, Some(ErrorKind::SandboxUnavailable));
}

// -------------------------------------------------------------------------
// Ledger and reconciliation
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_reconcile_closes_orphaned_rows() {
    let h = harness();
    let tool = active_tool(&h, "weather", &[]).await;
    let mut orphan = ExecutionRecord::running(tool.id.clone(), json!({"city": "Oslo"}));
    orphan.sandbox_instance_id = Some("toolvault-orphan".to_string());
    h.store.append_execution(&orphan).await.unwrap();

    assert_eq!(h.vault.reconcile().await.unwrap(), 1);
    let row = h.vault.ledger().get(&orphan.execution_id).await.unwrap();
    assert_eq!(row.status, ExecutionStatus::Failure);
    assert_eq!(row.error_kind, Some(ErrorKind::Orphaned));
    assert_eq!(row.error_message.as_deref(), Some(ORPHANED_MESSAGE));
    assert!(row.completed_at.is_some());
    assert_eq!(h.runtime.teardowns(), vec!["toolvault-orphan".to_string()]);

    assert_eq!(h.vault.reconcile().await.unwrap(), 0);
}

#[tokio::test]
async fn test_summary_over_mixed_runs() {
    let h = harness();
    let tool = active_tool(&h, "weather", &[]).await;
    h.runtime
        .push(ScriptedStep::ok(json!(1)))
        .push(ScriptedStep::fail(1, "bad"))
        .push(ScriptedStep::ok(json!(2)));
    for _ in 0..3 {
        h.vault
            .engine()
            .execute(weather_call(&tool.id), CancellationToken::new())
            .await
            .unwrap();
    }

    let summary = h.vault.ledger().summarize(Some(&tool.id)).await.unwrap();
    assert_eq!(summary.total, 3);
    assert_eq!(summary.count(ExecutionStatus::Success), 2);
    assert_eq!(summary.count(ExecutionStatus::Failure), 1);
}
