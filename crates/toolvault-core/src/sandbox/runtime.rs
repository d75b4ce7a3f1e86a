//! The isolation backend seam.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::permissions::NetworkMode;

/// Everything a backend needs to start one isolated execution.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    /// Unique per launch; used as the container name.
    pub instance_id: String,
    pub image: String,
    pub entrypoint: Vec<String>,
    /// Extra environment, e.g. `TOOL_PARAMS`.
    pub env: Vec<(String, String)>,
    /// Written to the tool's stdin, then stdin is closed.
    pub stdin: Vec<u8>,
    pub network: NetworkMode,
    pub cpu_percent: u32,
    pub memory_mb: u64,
    pub pids_limit: u32,
    /// Host path of the tool volume and where it is mounted.
    pub volume: Option<(PathBuf, String)>,
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

/// What came back from a launch that ran to completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// The backend reports the memory cap killed the process.
    pub oom_killed: bool,
    pub cpu_usage_ms: Option<u64>,
    pub memory_peak_mb: Option<u64>,
    /// stdout hit `max_output_bytes`. stderr is cut at the same size but
    /// only feeds error messages.
    pub truncated: bool,
}

/// Why a launch did not produce an outcome.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeError {
    /// The platform could not run anything (daemon down, image pull
    /// failure). Retryable.
    #[error("sandbox unavailable: {0}")]
    Unavailable(String),

    #[error("sandbox timed out after {limit_ms}ms")]
    Timeout { limit_ms: u64 },

    #[error("sandbox cancelled")]
    Cancelled,
}

/// An isolation backend (container runtime, scripted fake, ...).
///
/// A backend must force-kill the execution on timeout or cancellation
/// before returning. `teardown` must be safe to call more than once.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Human-readable backend name (e.g. "docker", "scripted").
    fn backend_name(&self) -> &'static str;

    /// Run one execution to completion, timeout or cancellation.
    async fn launch(
        &self,
        spec: &LaunchSpec,
        cancel: &CancellationToken,
    ) -> Result<LaunchOutcome, RuntimeError>;

    /// Release everything the launch left behind.
    async fn teardown(&self, instance_id: &str) -> Result<(), RuntimeError>;
}

/// Truncate captured output to `max` bytes on a char boundary, appending a
/// marker when anything was cut.
pub fn truncate_output(mut text: String, max: usize) -> (String, bool) {
    if text.len() <= max {
        return (text, false);
    }
    let mut cut = max;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str("\n... [output truncated]");
    (text, true)
}
