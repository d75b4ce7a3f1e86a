//! Scripted in-process sandbox backend for tests and dry runs.
//!
//! Responses are taken from a FIFO script first, then from an optional
//! handler, then default to `exit 0` with `{}` on stdout. Timeouts and
//! cancellation behave as in a real backend.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::runtime::{truncate_output, LaunchOutcome, LaunchSpec, RuntimeError, SandboxRuntime};

/// What a scripted launch does once its delay has elapsed.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedAction {
    Exit {
        code: i32,
        stdout: String,
        stderr: String,
    },
    OomKill,
    Unavailable(String),
    /// Never finishes; only timeout or cancellation end it.
    Hang,
}

/// One scripted launch.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptedStep {
    pub delay: Duration,
    pub action: ScriptedAction,
}

impl ScriptedStep {
    /// Exit 0 with `stdout` serialized as JSON.
    pub fn ok(stdout: serde_json::Value) -> Self {
        Self::raw(0, stdout.to_string(), "")
    }

    pub fn raw(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            delay: Duration::ZERO,
            action: ScriptedAction::Exit {
                code,
                stdout: stdout.into(),
                stderr: stderr.into(),
            },
        }
    }

    pub fn fail(code: i32, stderr: impl Into<String>) -> Self {
        Self::raw(code, "", stderr)
    }

    pub fn oom() -> Self {
        Self {
            delay: Duration::ZERO,
            action: ScriptedAction::OomKill,
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            delay: Duration::ZERO,
            action: ScriptedAction::Unavailable(reason.into()),
        }
    }

    pub fn hang() -> Self {
        Self {
            delay: Duration::ZERO,
            action: ScriptedAction::Hang,
        }
    }

    /// Run for `delay` before acting.
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

type Handler = dyn Fn(&LaunchSpec) -> ScriptedStep + Send + Sync;

/// A [`SandboxRuntime`] that follows a script.
#[derive(Default)]
pub struct ScriptedRuntime {
    script: Mutex<VecDeque<ScriptedStep>>,
    handler: Mutex<Option<Arc<Handler>>>,
    launches: Mutex<Vec<LaunchSpec>>,
    teardowns: Mutex<Vec<String>>,
    running: AtomicUsize,
    peak_running: AtomicUsize,
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one response.
    pub fn push(&self, step: ScriptedStep) -> &Self {
        self.script.lock().unwrap().push_back(step);
        self
    }

    /// Answer launches the script does not cover by calling `handler`.
    pub fn respond_with<F>(&self, handler: F) -> &Self
    where
        F: Fn(&LaunchSpec) -> ScriptedStep + Send + Sync + 'static,
    {
        *self.handler.lock().unwrap() = Some(Arc::new(handler));
        self
    }

    /// Every launch spec received, in order.
    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.launches.lock().unwrap().clone()
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().unwrap().len()
    }

    pub fn teardowns(&self) -> Vec<String> {
        self.teardowns.lock().unwrap().clone()
    }

    /// Launches in progress right now.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous launches seen.
    pub fn peak_running(&self) -> usize {
        self.peak_running.load(Ordering::SeqCst)
    }

    fn next_step(&self, spec: &LaunchSpec) -> ScriptedStep {
        if let Some(step) = self.script.lock().unwrap().pop_front() {
            return step;
        }
        let handler = self.handler.lock().unwrap().clone();
        match handler {
            Some(h) => h(spec),
            None => ScriptedStep::ok(serde_json::json!({})),
        }
    }
}

#[async_trait]
impl SandboxRuntime for ScriptedRuntime {
    fn backend_name(&self) -> &'static str {
        "scripted"
    }

    async fn launch(
        &self,
        spec: &LaunchSpec,
        cancel: &CancellationToken,
    ) -> Result<LaunchOutcome, RuntimeError> {
        self.launches.lock().unwrap().push(spec.clone());
        let step = self.next_step(spec);

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(now, Ordering::SeqCst);
        let _running = RunningGuard(&self.running);

        let run = async move {
            tokio::time::sleep(step.delay).await;
            match step.action {
                ScriptedAction::Exit {
                    code,
                    stdout,
                    stderr,
                } => {
                    let (stdout, out_cut) = truncate_output(stdout, spec.max_output_bytes);
                    let (stderr, _) = truncate_output(stderr, spec.max_output_bytes);
                    Ok(LaunchOutcome {
                        exit_code: code,
                        stdout,
                        stderr,
                        oom_killed: false,
                        cpu_usage_ms: Some(step.delay.as_millis() as u64),
                        memory_peak_mb: Some(spec.memory_mb / 2),
                        truncated: out_cut,
                    })
                }
                ScriptedAction::OomKill => Ok(LaunchOutcome {
                    exit_code: 137,
                    oom_killed: true,
                    memory_peak_mb: Some(spec.memory_mb),
                    ..LaunchOutcome::default()
                }),
                ScriptedAction::Unavailable(reason) => Err(RuntimeError::Unavailable(reason)),
                ScriptedAction::Hang => std::future::pending().await,
            }
        };

        tokio::select! {
            result = run => result,
            _ = tokio::time::sleep(spec.timeout) => Err(RuntimeError::Timeout {
                limit_ms: spec.timeout.as_millis() as u64,
            }),
            _ = cancel.cancelled() => Err(RuntimeError::Cancelled),
        }
    }

    async fn teardown(&self, instance_id: &str) -> Result<(), RuntimeError> {
        self.teardowns.lock().unwrap().push(instance_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::NetworkMode;

    fn spec(timeout: Duration) -> LaunchSpec {
        LaunchSpec {
            instance_id: "i-1".into(),
            image: "img".into(),
            entrypoint: vec![],
            env: vec![],
            stdin: vec![],
            network: NetworkMode::None,
            cpu_percent: 10,
            memory_mb: 64,
            pids_limit: 16,
            volume: None,
            timeout,
            max_output_bytes: 1024,
        }
    }

    #[tokio::test]
    async fn test_script_then_default() {
        let rt = ScriptedRuntime::new();
        rt.push(ScriptedStep::fail(3, "boom"));
        let first = rt
            .launch(&spec(Duration::from_secs(1)), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first.exit_code, 3);
        let second = rt
            .launch(&spec(Duration::from_secs(1)), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.exit_code, 0);
        assert_eq!(second.stdout, "{}");
        assert_eq!(rt.launch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_times_out() {
        let rt = ScriptedRuntime::new();
        rt.push(ScriptedStep::hang());
        let err = rt
            .launch(&spec(Duration::from_millis(50)), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, RuntimeError::Timeout { limit_ms: 50 });
        assert_eq!(rt.running(), 0);
    }

    #[tokio::test]
    async fn test_handler_sees_spec() {
        let rt = ScriptedRuntime::new();
        rt.respond_with(|spec| ScriptedStep::ok(serde_json::json!({"image": spec.image})));
        let out = rt
            .launch(&spec(Duration::from_secs(1)), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.stdout, r#"{"image":"img"}"#);
    }
}
