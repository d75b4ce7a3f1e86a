//! Startup recovery for executions a previous process never finished.

use std::sync::Arc;

use chrono::Utc;
use toolvault_state::{
    ErrorKind, ExecutionFilter, ExecutionOutcome, ExecutionStatus, StorageError, ToolStore,
};
use tracing::{info, warn};

use crate::error::VaultResult;
use crate::metrics::METRICS;
use crate::sandbox::SandboxRuntime;

pub const ORPHANED_MESSAGE: &str = "orphaned by manager restart";

/// Mark every `running` record as failed and tear down its sandbox.
/// Returns how many records were closed.
///
/// Only call this when no executions are in flight in any process sharing
/// the store.
pub async fn reconcile(store: &Arc<dyn ToolStore>, runtime: &dyn SandboxRuntime) -> VaultResult<u64> {
    let filter = ExecutionFilter {
        status: Some(ExecutionStatus::Running),
        ..ExecutionFilter::default()
    };
    let mut closed = 0;
    for record in store.list_executions(&filter).await? {
        let outcome = ExecutionOutcome::failed(ErrorKind::Orphaned, ORPHANED_MESSAGE);
        match store
            .finish_execution(&record.execution_id, outcome, Utc::now())
            .await
        {
            Ok(done) => {
                closed += 1;
                METRICS.record_finished(done.status);
            }
            // finished concurrently; nothing to do
            Err(StorageError::StaleState { .. }) => continue,
            Err(e) => return Err(e.into()),
        }
        if let Some(instance_id) = &record.sandbox_instance_id {
            if let Err(e) = runtime.teardown(instance_id).await {
                warn!(instance_id = %instance_id, error = %e, "orphaned sandbox teardown failed");
            }
        }
    }
    info!(event = "reconcile.finished", closed = closed);
    Ok(closed)
}
