//! toolvault core library
//!
//! Lifecycle management, permission enforcement, per-tool state and
//! sandboxed execution for third-party agent tools.

mod audit;
pub mod config;
pub mod discovery;
pub mod error;
pub mod ledger;
pub mod lifecycle;
pub mod manifest_import;
pub mod metrics;
pub mod obs;
pub mod permissions;
pub mod reconcile;
pub mod sandbox;
pub mod state;
pub mod telemetry;
pub mod validation;
pub mod vault;

pub use config::{EngineConfig, RuntimeConfig, StorageConfig, VaultConfig};
pub use discovery::{dedup_key, normalize_description, DiscoveryProducer, DiscoveryQueue, Resolution};
pub use error::{VaultError, VaultResult};
pub use ledger::{ExecutionSummary, LedgerReader};
pub use lifecycle::{reproposal_name, LifecycleController, RevokeReport};
pub use manifest_import::{ManifestDocument, ManifestFormat};
pub use metrics::METRICS;
pub use permissions::{NetworkMode, PermissionGrant, PermissionRegistry, ResolvedPermissions};
pub use reconcile::{reconcile, ORPHANED_MESSAGE};
pub use sandbox::{
    Correlation, DockerRuntime, ExecutionEngine, ExecutionResult, InvocationRequest,
    ResourceUsage, SandboxRuntime, ScriptedRuntime, ScriptedStep,
};
pub use state::{FsVolumeBackend, PurgeReport, StateManager, VolumeBackend};
pub use telemetry::init_tracing;
pub use vault::ToolVault;

pub use toolvault_state;

/// Crate version, reported by the binaries.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
