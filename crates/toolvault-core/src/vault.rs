//! The assembled vault: one store, one sandbox backend, one volume backend,
//! and the components wired over them.

use std::sync::Arc;

use toolvault_state::{SurrealToolStore, ToolStore};
use tracing::info;

use crate::config::VaultConfig;
use crate::discovery::DiscoveryQueue;
use crate::error::{VaultError, VaultResult};
use crate::ledger::LedgerReader;
use crate::lifecycle::LifecycleController;
use crate::permissions::PermissionRegistry;
use crate::reconcile::reconcile;
use crate::sandbox::{AdmissionScheduler, DockerRuntime, ExecutionEngine, SandboxRuntime};
use crate::state::{FsVolumeBackend, StateManager, VolumeBackend};

/// Entry point for embedding the manager.
#[derive(Clone)]
pub struct ToolVault {
    store: Arc<dyn ToolStore>,
    runtime: Arc<dyn SandboxRuntime>,
    permissions: PermissionRegistry,
    state: StateManager,
    lifecycle: LifecycleController,
    engine: ExecutionEngine,
    discovery: DiscoveryQueue,
    ledger: LedgerReader,
}

impl ToolVault {
    /// Wire the components over explicit backends.
    pub fn new(
        store: Arc<dyn ToolStore>,
        runtime: Arc<dyn SandboxRuntime>,
        volumes: Arc<dyn VolumeBackend>,
        config: &VaultConfig,
    ) -> Self {
        let permissions = PermissionRegistry::new(Arc::clone(&store));
        let scheduler = Arc::new(AdmissionScheduler::new(
            config.engine.max_concurrent_executions,
        ));
        let state = StateManager::new(
            Arc::clone(&store),
            permissions.clone(),
            volumes,
            Arc::clone(&scheduler),
            config.engine.admission_timeout(),
        );
        let lifecycle =
            LifecycleController::new(Arc::clone(&store), permissions.clone(), state.clone());
        let engine = ExecutionEngine::new(
            Arc::clone(&store),
            permissions.clone(),
            state.clone(),
            Arc::clone(&runtime),
            scheduler,
            config.engine.clone(),
            config.runtime.pids_limit,
        );
        let discovery = DiscoveryQueue::new(Arc::clone(&store), lifecycle.clone());
        let ledger = LedgerReader::new(Arc::clone(&store));
        Self {
            store,
            runtime,
            permissions,
            state,
            lifecycle,
            engine,
            discovery,
            ledger,
        }
    }

    /// Open the configured SurrealDB store with the Docker backend and
    /// host-directory volumes.
    pub async fn open(config: &VaultConfig) -> VaultResult<Self> {
        let store = match &config.storage.url {
            Some(url) => SurrealToolStore::open(url).await,
            None => SurrealToolStore::from_env(&config.storage.local_path).await,
        }
        .map_err(|e| VaultError::Storage(e.to_string()))?;

        let runtime = DockerRuntime::new(config.runtime.clone());
        let volumes = FsVolumeBackend::new(config.runtime.volume_root.clone());
        info!(
            backend = runtime.backend_name(),
            volume_root = %config.runtime.volume_root.display(),
            "toolvault opened"
        );
        Ok(Self::new(
            Arc::new(store),
            Arc::new(runtime),
            Arc::new(volumes),
            config,
        ))
    }

    pub fn store(&self) -> &Arc<dyn ToolStore> {
        &self.store
    }

    pub fn lifecycle(&self) -> &LifecycleController {
        &self.lifecycle
    }

    pub fn permissions(&self) -> &PermissionRegistry {
        &self.permissions
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    pub fn discovery(&self) -> &DiscoveryQueue {
        &self.discovery
    }

    pub fn ledger(&self) -> &LedgerReader {
        &self.ledger
    }

    /// Close executions left `running` by a previous process.
    pub async fn reconcile(&self) -> VaultResult<u64> {
        reconcile(&self.store, self.runtime.as_ref()).await
    }
}
