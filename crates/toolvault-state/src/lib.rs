//! toolvault-state: persistence layer for the tool sandbox manager
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: data integrity, uniqueness, and compare-and-set transitions.
//!
//! ## Key Components
//!
//! - `storage_traits`: one async trait per relation, bundled as `ToolStore`
//! - `records`: backend-agnostic record types exchanged through the traits
//! - `SurrealToolStore`: SurrealDB backend (`mem://`, `surrealkv://`, cloud)
//! - `fakes::MemoryToolStore`: in-memory backend for tests

mod error;
pub mod fakes;
mod handle;
pub mod migrations;
pub mod records;
mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use error::{StateError, StorageError};
pub use handle::{
    connect_cloud, connect_from_env, connect_url, CloudConfig, DEFAULT_DATABASE,
    DEFAULT_LOCAL_PATH, DEFAULT_NAMESPACE,
};
pub use records::*;
pub use schema::{
    AuditRow, DiscoveryRow, ExecutionRow, ManifestRow, PermissionRow, StateRow, VolumeRow,
};
pub use storage_traits::{
    projected_state_size, AuditLog, DiscoveryStore, ExecutionLedger, ManifestStore,
    PermissionStore, StateStore, StorageResult, ToolStore, VolumeStore,
};
pub use surreal_store::SurrealToolStore;

/// Result type for toolvault-state setup operations
pub type Result<T> = std::result::Result<T, StateError>;
