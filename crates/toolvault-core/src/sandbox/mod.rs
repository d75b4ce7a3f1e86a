//! Sandboxed tool execution.
//!
//! Provides:
//! - `runtime`: the `SandboxRuntime` backend trait and launch types
//! - `docker`: the container backend
//! - `scheduler`: global concurrency cap and per-tool FIFO admission
//! - `execution`: retry with exponential backoff for platform errors
//! - `engine`: the `ExecutionEngine` tying permissions, state and the ledger together
//! - `fakes`: a scripted backend for tests

pub mod docker;
pub mod engine;
pub mod execution;
pub mod fakes;
pub mod runtime;
pub mod scheduler;

pub use docker::DockerRuntime;
pub use engine::{Correlation, ExecutionEngine, ExecutionResult, InvocationRequest, ResourceUsage};
pub use execution::{launch_with_retry, Attempted, RetryPolicy};
pub use fakes::{ScriptedAction, ScriptedRuntime, ScriptedStep};
pub use runtime::{LaunchOutcome, LaunchSpec, RuntimeError, SandboxRuntime};
pub use scheduler::{AdmissionPermit, AdmissionScheduler, ToolTurn};
