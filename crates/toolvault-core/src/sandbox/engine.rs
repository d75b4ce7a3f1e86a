//! The execution engine: one isolated, resource-capped launch per
//! invocation, every one recorded in the ledger.
//!
//! Invocations rejected before launch (inactive tool, bad input, missing
//! network grant, admission timeout) are written as terminal ledger rows and
//! returned as errors. Once a launch is attempted the call returns `Ok` with
//! the terminal status of the run; the one exception is a platform that
//! stays unavailable after all retries, which is recorded and returned as
//! `SandboxUnavailable`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use toolvault_state::{
    ErrorKind, ExecutionId, ExecutionOutcome, ExecutionRecord, ExecutionStatus, SchemaDescriptor,
    StateBatch, ToolId, ToolManifest, ToolStatus, ToolStore,
};
use tracing::{debug, warn, Instrument};

use super::execution::{launch_with_retry, RetryPolicy};
use super::runtime::{truncate_output, LaunchOutcome, LaunchSpec, RuntimeError, SandboxRuntime};
use super::scheduler::{AdmissionPermit, AdmissionScheduler};
use crate::config::EngineConfig;
use crate::error::{VaultError, VaultResult};
use crate::metrics::METRICS;
use crate::obs::{
    emit_execution_finished, emit_execution_started, emit_finalize_error, execution_span,
};
use crate::permissions::{NetworkMode, PermissionRegistry, ResolvedPermissions};
use crate::state::StateManager;
use crate::validation::validate;

/// Exit status of a SIGKILLed process; the memory cap kills with SIGKILL.
const SIGKILL_EXIT: i32 = 137;
/// Longest stderr excerpt copied into a ledger error message.
const ERROR_EXCERPT_BYTES: usize = 4096;

/// Conversation context an invocation belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correlation {
    pub conversation_id: Option<String>,
    pub turn_id: Option<String>,
}

/// One call of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub tool_id: ToolId,
    pub input_params: Value,
    /// Capability to invoke; `None` uses the manifest-level schema.
    pub capability: Option<String>,
    #[serde(default)]
    pub correlation: Correlation,
    /// Overrides the manifest's default timeout.
    pub timeout: Option<Duration>,
}

impl InvocationRequest {
    pub fn new(tool_id: ToolId, input_params: Value) -> Self {
        Self {
            tool_id,
            input_params,
            capability: None,
            correlation: Correlation::default(),
            timeout: None,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    pub fn with_correlation(mut self, conversation_id: &str, turn_id: &str) -> Self {
        self.correlation = Correlation {
            conversation_id: Some(conversation_id.to_string()),
            turn_id: Some(turn_id.to_string()),
        };
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Resources a run consumed, as far as the backend reports them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub duration_ms: u64,
    pub cpu_usage_ms: Option<u64>,
    pub memory_peak_mb: Option<u64>,
}

/// What the caller gets back from a launched invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: ExecutionId,
    pub tool_id: ToolId,
    pub status: ExecutionStatus,
    pub output: Option<Value>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub exit_code: Option<i32>,
    pub resource_usage: ResourceUsage,
    /// Launch attempts, including platform retries.
    pub attempts: u32,
}

impl ExecutionResult {
    fn from_record(record: &ExecutionRecord, attempts: u32) -> Self {
        Self {
            execution_id: record.execution_id.clone(),
            tool_id: record.tool_id.clone(),
            status: record.status,
            output: record.output.clone(),
            error_kind: record.error_kind,
            error_message: record.error_message.clone(),
            exit_code: record.exit_code,
            resource_usage: ResourceUsage {
                duration_ms: record.duration_ms.unwrap_or(0),
                cpu_usage_ms: record.cpu_usage_ms,
                memory_peak_mb: record.memory_peak_mb,
            },
            attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

/// Finalizes a running record and tears down its sandbox if the execution
/// future is dropped or panics before completing normally.
struct RecordGuard {
    store: Arc<dyn ToolStore>,
    runtime: Arc<dyn SandboxRuntime>,
    execution_id: ExecutionId,
    instance_id: String,
    permit: Option<AdmissionPermit>,
    armed: bool,
}

impl RecordGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for RecordGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                execution_id = %self.execution_id,
                "no runtime to finalize abandoned execution; left for reconciliation"
            );
            return;
        };
        let store = Arc::clone(&self.store);
        let runtime = Arc::clone(&self.runtime);
        let execution_id = self.execution_id.clone();
        let instance_id = std::mem::take(&mut self.instance_id);
        // The tool stays locked until its record is terminal.
        let permit = self.permit.take();
        handle.spawn(async move {
            let outcome =
                ExecutionOutcome::failed(ErrorKind::Cancelled, "execution abandoned before completion");
            match store.finish_execution(&execution_id, outcome, Utc::now()).await {
                Ok(record) => {
                    METRICS.record_finished(record.status);
                    emit_execution_finished(&record);
                }
                Err(e) => emit_finalize_error(execution_id.as_str(), &e),
            }
            let _ = runtime.teardown(&instance_id).await;
            drop(permit);
        });
    }
}

/// Runs invocations against a [`SandboxRuntime`].
#[derive(Clone)]
pub struct ExecutionEngine {
    store: Arc<dyn ToolStore>,
    permissions: PermissionRegistry,
    state: StateManager,
    runtime: Arc<dyn SandboxRuntime>,
    scheduler: Arc<AdmissionScheduler>,
    config: EngineConfig,
    pids_limit: u32,
}

/// What passed preflight and is needed for launch.
struct Admitted<'m> {
    output_schema: Option<&'m SchemaDescriptor>,
    timeout: Duration,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<dyn ToolStore>,
        permissions: PermissionRegistry,
        state: StateManager,
        runtime: Arc<dyn SandboxRuntime>,
        scheduler: Arc<AdmissionScheduler>,
        config: EngineConfig,
        pids_limit: u32,
    ) -> Self {
        Self {
            store,
            permissions,
            state,
            runtime,
            scheduler,
            config,
            pids_limit,
        }
    }

    pub fn scheduler(&self) -> &AdmissionScheduler {
        &self.scheduler
    }

    pub fn backend_name(&self) -> &'static str {
        self.runtime.backend_name()
    }

    /// Execute one invocation. Always leaves a terminal ledger row for a
    /// known tool, whichever way the call ends.
    pub async fn execute(
        &self,
        request: InvocationRequest,
        cancel: CancellationToken,
    ) -> VaultResult<ExecutionResult> {
        let manifest = self.store.get_manifest(&request.tool_id).await?;

        let mut record = ExecutionRecord::running(request.tool_id.clone(), request.input_params.clone());
        record.capability = request.capability.clone();
        record.conversation_id = request.correlation.conversation_id.clone();
        record.turn_id = request.correlation.turn_id.clone();
        let span = execution_span(record.execution_id.as_str(), request.tool_id.as_str());

        self.execute_inner(manifest, request, record, cancel)
            .instrument(span)
            .await
    }

    async fn execute_inner(
        &self,
        manifest: ToolManifest,
        request: InvocationRequest,
        mut record: ExecutionRecord,
        cancel: CancellationToken,
    ) -> VaultResult<ExecutionResult> {
        let tool_id = request.tool_id.clone();

        let resolved = match self.permissions.check_and_resolve(&tool_id).await {
            Ok(r) => r,
            Err(e) => return Err(self.reject(record, e).await),
        };
        let admitted = match self.preflight(&manifest, &request, &resolved) {
            Ok(a) => a,
            Err(e) => return Err(self.reject(record, e).await),
        };

        let permit = tokio::select! {
            admitted = self.scheduler.admit(&tool_id, self.config.admission_timeout()) => admitted,
            _ = cancel.cancelled() => Err(VaultError::Cancelled),
        };
        let permit = match permit {
            Ok(p) => p,
            Err(e) => {
                if matches!(e, VaultError::SandboxBusy { .. }) {
                    METRICS.inc_admission_rejected();
                }
                return Err(self.reject(record, e).await);
            }
        };
        debug!(waited_ms = permit.waited().as_millis() as u64, "admitted");

        // Status and grants may have changed while queued.
        let fresh = match self.store.get_manifest(&tool_id).await {
            Ok(m) => m,
            Err(e) => return Err(self.reject(record, e.into()).await),
        };
        let resolved = match self.permissions.check_and_resolve(&tool_id).await {
            Ok(r) => r,
            Err(e) => return Err(self.reject(record, e).await),
        };
        if let Err(e) = self.preflight(&fresh, &request, &resolved) {
            return Err(self.reject(record, e).await);
        }

        let volume = match self.state.ensure_volume(&tool_id).await {
            Ok(v) => v,
            Err(e) => return Err(self.reject(record, e).await),
        };
        let snapshot = match self.state.snapshot(&tool_id).await {
            Ok(s) => s,
            Err(e) => return Err(self.reject(record, e).await),
        };

        let instance_id = format!("toolvault-{}", record.execution_id);
        let payload = serde_json::to_string(&request.input_params).and_then(|params| {
            let stdin = serde_json::to_vec(&json!({
                "params": request.input_params,
                "state": snapshot,
                "capability": request.capability,
            }))?;
            Ok((params, stdin))
        });
        let (params_json, stdin) = match payload {
            Ok(p) => p,
            Err(e) => return Err(self.reject(record, e.into()).await),
        };
        let spec = LaunchSpec {
            instance_id: instance_id.clone(),
            image: fresh.execution.image.clone(),
            entrypoint: fresh.execution.entrypoint.clone(),
            env: vec![("TOOL_PARAMS".to_string(), params_json)],
            stdin,
            network: resolved.network,
            cpu_percent: resolved.cpu_percent,
            memory_mb: resolved.memory_mb,
            pids_limit: self.pids_limit,
            volume: Some((PathBuf::from(&volume.host_path), volume.mount_path.clone())),
            timeout: admitted.timeout,
            max_output_bytes: self.config.max_output_bytes,
        };

        record.sandbox_instance_id = Some(instance_id.clone());
        record.started_at = Utc::now();
        self.store.append_execution(&record).await?;
        METRICS.inc_started();
        emit_execution_started(&record);

        let mut guard = RecordGuard {
            store: Arc::clone(&self.store),
            runtime: Arc::clone(&self.runtime),
            execution_id: record.execution_id.clone(),
            instance_id: instance_id.clone(),
            permit: Some(permit),
            armed: true,
        };

        let runtime = self.runtime.as_ref();
        let spec_ref = &spec;
        let cancel_ref = &cancel;
        let mut first = true;
        let attempted = launch_with_retry(
            &RetryPolicy::from(&self.config),
            tool_id.as_str(),
            &cancel,
            move || {
                let retry = !first;
                first = false;
                async move {
                    if retry {
                        let _ = runtime.teardown(&spec_ref.instance_id).await;
                    }
                    runtime.launch(spec_ref, cancel_ref).await
                }
            },
        )
        .await;

        let mut unavailable = None;
        let outcome = match attempted.result {
            Ok(launch) => {
                self.interpret(&tool_id, launch, admitted.output_schema).await
            }
            Err(RuntimeError::Timeout { limit_ms }) => ExecutionOutcome::failed(
                ErrorKind::ExecutionTimeout,
                format!("killed after exceeding the {limit_ms}ms timeout"),
            ),
            Err(RuntimeError::Cancelled) => {
                ExecutionOutcome::failed(ErrorKind::Cancelled, "cancelled by caller")
            }
            Err(RuntimeError::Unavailable(reason)) => {
                let msg = format!("{reason} (after {} attempt(s))", attempted.attempts);
                unavailable = Some(msg.clone());
                ExecutionOutcome::failed(ErrorKind::SandboxUnavailable, msg)
            }
        };

        let finished = self
            .store
            .finish_execution(&record.execution_id, outcome, Utc::now())
            .await;
        guard.disarm();
        if let Err(e) = self.runtime.teardown(&instance_id).await {
            warn!(instance_id = %instance_id, error = %e, "sandbox teardown failed");
        }
        let finished = finished?;
        METRICS.record_finished(finished.status);
        emit_execution_finished(&finished);
        drop(guard);

        if let Some(msg) = unavailable {
            return Err(VaultError::SandboxUnavailable(msg));
        }
        Ok(ExecutionResult::from_record(&finished, attempted.attempts))
    }

    /// Checks that need no sandbox: status, capability, input schema,
    /// timeout and network grant.
    fn preflight<'m>(
        &self,
        manifest: &'m ToolManifest,
        request: &InvocationRequest,
        resolved: &ResolvedPermissions,
    ) -> VaultResult<Admitted<'m>> {
        if manifest.status != ToolStatus::Active {
            return Err(VaultError::PermissionDenied(format!(
                "tool {} is {}, not active",
                manifest.name, manifest.status
            )));
        }

        let capability = match &request.capability {
            Some(name) => Some(manifest.capability(name).ok_or_else(|| {
                VaultError::Validation(format!(
                    "tool {} has no capability '{name}'",
                    manifest.name
                ))
            })?),
            None => None,
        };
        let (schema, output_schema) = match capability {
            Some(cap) => (
                &cap.parameters,
                cap.output.as_ref().or(manifest.output_schema.as_ref()),
            ),
            None => (&manifest.parameters_schema, manifest.output_schema.as_ref()),
        };
        validate(schema, &request.input_params)?;

        let timeout = request
            .timeout
            .unwrap_or_else(|| Duration::from_secs(manifest.execution.default_timeout_secs));
        let max = Duration::from_secs(self.config.max_timeout_secs);
        if timeout.is_zero() || timeout > max {
            return Err(VaultError::Validation(format!(
                "timeout {}ms outside 1ms..={}s",
                timeout.as_millis(),
                self.config.max_timeout_secs
            )));
        }

        if capability.is_some_and(|c| c.requires_network) && resolved.network == NetworkMode::None {
            return Err(VaultError::PermissionDenied(format!(
                "capability '{}' requires network access, which tool {} is not granted",
                request.capability.as_deref().unwrap_or_default(),
                manifest.name
            )));
        }

        Ok(Admitted {
            output_schema,
            timeout,
        })
    }

    /// Write a terminal row for an invocation that never launched and hand
    /// the error back.
    async fn reject(&self, mut record: ExecutionRecord, err: VaultError) -> VaultError {
        record.finish(ExecutionOutcome::failed(err.kind(), err.to_string()), Utc::now());
        match self.store.append_execution(&record).await {
            Ok(()) => {
                METRICS.record_finished(record.status);
                emit_execution_finished(&record);
            }
            Err(e) => emit_finalize_error(record.execution_id.as_str(), &e),
        }
        err
    }

    /// Turn a completed launch into a terminal outcome, applying the tool's
    /// state mutations when the run succeeded.
    async fn interpret(
        &self,
        tool_id: &ToolId,
        launch: LaunchOutcome,
        output_schema: Option<&SchemaDescriptor>,
    ) -> ExecutionOutcome {
        let mut outcome = ExecutionOutcome {
            status: ExecutionStatus::Failure,
            error_kind: Some(ErrorKind::ExecutionFailure),
            output: None,
            error_message: None,
            exit_code: Some(launch.exit_code),
            cpu_usage_ms: launch.cpu_usage_ms,
            memory_peak_mb: launch.memory_peak_mb,
        };

        if launch.oom_killed || launch.exit_code == SIGKILL_EXIT {
            outcome.error_kind = Some(ErrorKind::ResourceExceeded);
            outcome.exit_code = Some(SIGKILL_EXIT);
            outcome.error_message = Some("killed by the memory limit".to_string());
            return outcome;
        }

        if launch.exit_code != 0 {
            let (excerpt, _) = truncate_output(launch.stderr.trim().to_string(), ERROR_EXCERPT_BYTES);
            outcome.error_message = Some(format!("exit code {}: {excerpt}", launch.exit_code));
            return outcome;
        }

        if launch.truncated {
            outcome.error_message = Some(format!(
                "output exceeded max_output_bytes ({})",
                self.config.max_output_bytes
            ));
            return outcome;
        }

        let (output, batch) = match parse_contract(&launch.stdout) {
            Ok(parsed) => parsed,
            Err(msg) => {
                outcome.error_message = Some(msg);
                return outcome;
            }
        };
        if let Some(schema) = output_schema {
            if let Err(e) = validate(schema, &output) {
                outcome.error_message = Some(format!("output rejected: {e}"));
                outcome.output = Some(output);
                return outcome;
            }
        }
        if let Some(batch) = batch {
            if let Err(e) = self.state.apply_batch_in_turn(tool_id, &batch).await {
                outcome.error_kind = Some(e.kind());
                outcome.error_message = Some(format!("state not applied: {e}"));
                outcome.output = Some(output);
                return outcome;
            }
        }

        outcome.status = ExecutionStatus::Success;
        outcome.error_kind = None;
        outcome.output = Some(output);
        outcome
    }
}

/// Parse tool stdout. An object with an `output` key may carry a `state`
/// batch; any other JSON value is the output itself.
fn parse_contract(stdout: &str) -> Result<(Value, Option<StateBatch>), String> {
    let value: Value = serde_json::from_str(stdout.trim())
        .map_err(|e| format!("tool stdout is not valid JSON: {e}"))?;
    match value {
        Value::Object(mut obj) if obj.contains_key("output") => {
            let output = obj.remove("output").unwrap_or(Value::Null);
            let batch = match obj.remove("state") {
                None | Some(Value::Null) => None,
                Some(state) => Some(
                    serde_json::from_value::<StateBatch>(state)
                        .map_err(|e| format!("malformed state mutations: {e}"))?,
                ),
            };
            Ok((output, batch))
        }
        other => Ok((other, None)),
    }
}
