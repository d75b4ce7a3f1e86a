//! Error taxonomy for toolvault operations.

use toolvault_state::{ErrorKind, StorageError};

/// Errors produced by lifecycle, permission, state and execution operations.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("invalid lifecycle transition: {0}")]
    InvalidLifecycleTransition(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("storage quota exceeded for tool {tool_id}: {required} bytes needed, {quota} allowed")]
    QuotaExceeded {
        tool_id: String,
        required: u64,
        quota: u64,
    },

    #[error("resource limit exceeded: {0}")]
    ResourceExceeded(String),

    #[error("execution timed out after {limit_ms}ms")]
    ExecutionTimeout { limit_ms: u64 },

    #[error("sandbox busy: tool {tool_id} not admitted within {waited_ms}ms")]
    SandboxBusy { tool_id: String, waited_ms: u64 },

    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    #[error("execution failed: {0}")]
    ExecutionFailure(String),

    #[error("execution cancelled")]
    Cancelled,

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("duplicate {entity}: {key}")]
    Duplicate { entity: &'static str, key: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl VaultError {
    /// The ledger classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            VaultError::Validation(_)
            | VaultError::NotFound { .. }
            | VaultError::Duplicate { .. } => ErrorKind::Validation,
            VaultError::InvalidLifecycleTransition(_) => ErrorKind::InvalidLifecycleTransition,
            VaultError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            VaultError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            VaultError::ResourceExceeded(_) => ErrorKind::ResourceExceeded,
            VaultError::ExecutionTimeout { .. } => ErrorKind::ExecutionTimeout,
            VaultError::SandboxBusy { .. } => ErrorKind::SandboxBusy,
            VaultError::SandboxUnavailable(_) => ErrorKind::SandboxUnavailable,
            VaultError::Cancelled => ErrorKind::Cancelled,
            VaultError::ExecutionFailure(_)
            | VaultError::Storage(_)
            | VaultError::Config(_)
            | VaultError::Serialization(_)
            | VaultError::Io(_) => ErrorKind::ExecutionFailure,
        }
    }

    /// Whether the operation may succeed if simply retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VaultError::SandboxUnavailable(_))
    }

    /// Whether this error means "the thing does not exist".
    pub fn is_not_found(&self) -> bool {
        matches!(self, VaultError::NotFound { .. })
    }
}

impl From<StorageError> for VaultError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { entity, key } => VaultError::NotFound { entity, key },
            StorageError::Duplicate { entity, key } => VaultError::Duplicate { entity, key },
            StorageError::StaleState { .. } => VaultError::InvalidLifecycleTransition(err.to_string()),
            StorageError::QuotaExceeded {
                tool_id,
                required,
                quota,
            } => VaultError::QuotaExceeded {
                tool_id,
                required,
                quota,
            },
            StorageError::Backend(msg) => VaultError::Storage(msg),
        }
    }
}

/// Result type for toolvault operations.
pub type VaultResult<T> = std::result::Result<T, VaultError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_errors_map_to_taxonomy() {
        let err: VaultError = StorageError::not_found("tool", "abc").into();
        assert!(err.is_not_found());

        let err: VaultError = StorageError::StaleState {
            entity: "tool",
            key: "abc".into(),
            actual: "revoked".into(),
            expected: "active".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::InvalidLifecycleTransition);
        assert!(err.to_string().contains("revoked"));

        let err: VaultError = StorageError::QuotaExceeded {
            tool_id: "t".into(),
            required: 10,
            quota: 5,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
    }

    #[test]
    fn test_only_unavailable_is_retryable() {
        assert!(VaultError::SandboxUnavailable("docker down".into()).is_retryable());
        assert!(!VaultError::ExecutionFailure("exit 1".into()).is_retryable());
        assert!(!VaultError::ExecutionTimeout { limit_ms: 10 }.is_retryable());
    }
}
