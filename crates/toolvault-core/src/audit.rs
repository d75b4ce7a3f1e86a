//! Lifecycle audit trail helpers.

use chrono::Utc;
use toolvault_state::{LifecycleAuditEntry, ToolId, ToolStatus, ToolStore};
use tracing::warn;

use crate::obs::emit_lifecycle_transition;

/// An audit entry under construction.
pub(crate) struct AuditDraft {
    entry: LifecycleAuditEntry,
}

impl AuditDraft {
    pub(crate) fn new(action: &str, actor: &str) -> Self {
        Self {
            entry: LifecycleAuditEntry {
                tool_id: None,
                action: action.to_string(),
                from_status: None,
                to_status: None,
                accepted: false,
                detail: String::new(),
                actor: actor.to_string(),
                at: Utc::now(),
            },
        }
    }

    pub(crate) fn tool(mut self, tool_id: &ToolId) -> Self {
        self.entry.tool_id = Some(tool_id.clone());
        self
    }

    pub(crate) fn from(mut self, status: ToolStatus) -> Self {
        self.entry.from_status = Some(status);
        self
    }

    pub(crate) fn to(mut self, status: ToolStatus) -> Self {
        self.entry.to_status = Some(status);
        self
    }

    pub(crate) fn detail(mut self, detail: impl Into<String>) -> Self {
        self.entry.detail = detail.into();
        self
    }

    /// Persist as an accepted attempt.
    pub(crate) async fn accepted(self, store: &dyn ToolStore) {
        self.write(store, true).await
    }

    /// Persist as a rejected attempt.
    pub(crate) async fn rejected(self, store: &dyn ToolStore) {
        self.write(store, false).await
    }

    async fn write(mut self, store: &dyn ToolStore, accepted: bool) {
        self.entry.accepted = accepted;
        self.entry.at = Utc::now();
        emit_lifecycle_transition(&self.entry);
        // The audit trail never masks the outcome of the operation itself.
        if let Err(e) = store.append_audit(&self.entry).await {
            warn!(
                event = "audit.append_failed",
                action = %self.entry.action,
                error = %e,
            );
        }
    }
}
