//! Structured observability hooks for tool lifecycle and execution events.
//!
//! This module provides:
//! - The execution-scoped tracing span instrumenting each execution future
//! - Emission functions for lifecycle transitions, executions and discovery
//!
//! Events are emitted at `info!` level. Rejected operations and abnormal
//! execution endings are emitted at `warn!`.

use toolvault_state::{DiscoveryRequest, ExecutionRecord, LifecycleAuditEntry};
use tracing::{info, warn};

/// The span an execution future is instrumented with.
pub fn execution_span(execution_id: &str, tool_id: &str) -> tracing::Span {
    tracing::info_span!("toolvault.execution", execution_id = %execution_id, tool_id = %tool_id)
}

/// Emit event: an import or lifecycle attempt, accepted or rejected.
pub fn emit_lifecycle_transition(entry: &LifecycleAuditEntry) {
    let tool_id = entry.tool_id.as_ref().map(|t| t.as_str()).unwrap_or("-");
    let from = entry.from_status.map(|s| s.as_str()).unwrap_or("-");
    let to = entry.to_status.map(|s| s.as_str()).unwrap_or("-");
    if entry.accepted {
        info!(
            event = "lifecycle.accepted",
            action = %entry.action,
            tool_id = %tool_id,
            from = %from,
            to = %to,
            actor = %entry.actor,
        );
    } else {
        warn!(
            event = "lifecycle.rejected",
            action = %entry.action,
            tool_id = %tool_id,
            from = %from,
            to = %to,
            actor = %entry.actor,
            detail = %entry.detail,
        );
    }
}

/// Emit event: an execution record was opened.
pub fn emit_execution_started(record: &ExecutionRecord) {
    info!(
        event = "execution.started",
        execution_id = %record.execution_id,
        tool_id = %record.tool_id,
        capability = %record.capability.as_deref().unwrap_or("-"),
    );
}

/// Emit event: an execution record reached a terminal status.
pub fn emit_execution_finished(record: &ExecutionRecord) {
    let error_kind = record.error_kind.map(|k| k.as_str()).unwrap_or("-");
    info!(
        event = "execution.finished",
        execution_id = %record.execution_id,
        tool_id = %record.tool_id,
        status = %record.status,
        error_kind = %error_kind,
        duration_ms = record.duration_ms.unwrap_or(0),
        exit_code = record.exit_code.unwrap_or(-1),
    );
}

/// Emit event: a platform error is about to be retried.
pub fn emit_platform_retry(tool_id: &str, attempt: u32, delay_ms: u64, error: &dyn std::fmt::Display) {
    warn!(
        event = "execution.platform_retry",
        tool_id = %tool_id,
        attempt = attempt,
        delay_ms = delay_ms,
        error = %error,
    );
}

/// Emit event: finalizing a record failed (warning level).
pub fn emit_finalize_error(execution_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "execution.finalize_error", execution_id = %execution_id, error = %error);
}

/// Emit event: a discovery request changed status.
pub fn emit_discovery_updated(request: &DiscoveryRequest) {
    info!(
        event = "discovery.updated",
        request_id = %request.request_id,
        status = %request.status,
        resulting_tool_id = %request.resulting_tool_id.as_ref().map(|t| t.as_str()).unwrap_or("-"),
    );
}
