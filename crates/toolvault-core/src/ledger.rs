//! Read side of the execution ledger.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use toolvault_state::{
    ExecutionFilter, ExecutionId, ExecutionRecord, ExecutionStatus, ToolId, ToolStore,
};

use crate::error::VaultResult;

/// Aggregate view of a tool's executions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub tool_id: Option<ToolId>,
    pub total: u64,
    /// Count per status name.
    pub by_status: BTreeMap<String, u64>,
    /// Mean duration of terminal executions.
    pub mean_duration_ms: Option<f64>,
    /// Share of terminal executions that succeeded.
    pub success_rate: Option<f64>,
}

impl ExecutionSummary {
    pub fn from_records(tool_id: Option<ToolId>, records: &[ExecutionRecord]) -> Self {
        let mut by_status = BTreeMap::new();
        let mut durations = Vec::new();
        let mut terminal = 0u64;
        let mut succeeded = 0u64;
        for record in records {
            *by_status.entry(record.status.to_string()).or_insert(0) += 1;
            if record.status.is_terminal() {
                terminal += 1;
                if record.status == ExecutionStatus::Success {
                    succeeded += 1;
                }
                if let Some(ms) = record.duration_ms {
                    durations.push(ms as f64);
                }
            }
        }
        let mean_duration_ms =
            (!durations.is_empty()).then(|| durations.iter().sum::<f64>() / durations.len() as f64);
        let success_rate = (terminal > 0).then(|| succeeded as f64 / terminal as f64);
        Self {
            tool_id,
            total: records.len() as u64,
            by_status,
            mean_duration_ms,
            success_rate,
        }
    }

    pub fn count(&self, status: ExecutionStatus) -> u64 {
        self.by_status.get(status.as_str()).copied().unwrap_or(0)
    }
}

/// Query access to execution records.
#[derive(Clone)]
pub struct LedgerReader {
    store: Arc<dyn ToolStore>,
}

impl LedgerReader {
    pub fn new(store: Arc<dyn ToolStore>) -> Self {
        Self { store }
    }

    /// Records matching `filter`, oldest first.
    pub async fn list(&self, filter: &ExecutionFilter) -> VaultResult<Vec<ExecutionRecord>> {
        Ok(self.store.list_executions(filter).await?)
    }

    pub async fn get(&self, execution_id: &ExecutionId) -> VaultResult<ExecutionRecord> {
        Ok(self.store.get_execution(execution_id).await?)
    }

    /// Counts per status and mean duration for one tool, or all tools.
    pub async fn summarize(&self, tool_id: Option<&ToolId>) -> VaultResult<ExecutionSummary> {
        let filter = ExecutionFilter {
            tool_id: tool_id.cloned(),
            ..ExecutionFilter::default()
        };
        let records = self.store.list_executions(&filter).await?;
        Ok(ExecutionSummary::from_records(tool_id.cloned(), &records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use toolvault_state::{ErrorKind, ExecutionOutcome};

    fn finished(tool: &ToolId, kind: Option<ErrorKind>, ms: i64) -> ExecutionRecord {
        let mut rec = ExecutionRecord::running(tool.clone(), json!({}));
        let outcome = match kind {
            Some(k) => ExecutionOutcome::failed(k, "x"),
            None => ExecutionOutcome {
                status: ExecutionStatus::Success,
                error_kind: None,
                output: Some(json!(1)),
                error_message: None,
                exit_code: Some(0),
                cpu_usage_ms: None,
                memory_peak_mb: None,
            },
        };
        let done = rec.started_at + Duration::milliseconds(ms);
        rec.finish(outcome, done);
        rec
    }

    #[test]
    fn test_summary_counts_and_mean() {
        let tool = ToolId::new();
        let records = vec![
            finished(&tool, None, 100),
            finished(&tool, None, 300),
            finished(&tool, Some(ErrorKind::ExecutionTimeout), 200),
            ExecutionRecord::running(tool.clone(), json!({})),
        ];
        let summary = ExecutionSummary::from_records(Some(tool), &records);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.count(ExecutionStatus::Success), 2);
        assert_eq!(summary.count(ExecutionStatus::Timeout), 1);
        assert_eq!(summary.count(ExecutionStatus::Running), 1);
        assert_eq!(summary.mean_duration_ms, Some(200.0));
        let rate = summary.success_rate.unwrap();
        assert!((rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_summary() {
        let summary = ExecutionSummary::from_records(None, &[]);
        assert_eq!(summary.total, 0);
        assert!(summary.mean_duration_ms.is_none());
        assert!(summary.success_rate.is_none());
    }
}
