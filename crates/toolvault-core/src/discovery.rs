//! Capability-gap requests and their resolution into proposed manifests.
//!
//! Requests are deduplicated on a hash of the normalized description while
//! they are open. A worker claims the oldest pending request, asks a
//! [`DiscoveryProducer`] for a candidate, and resolves the request exactly
//! once.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use toolvault_state::{
    DiscoveryRequest, DiscoveryRequestId, DiscoveryStatus, SourceType, StorageError, ToolStore,
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{VaultError, VaultResult};
use crate::lifecycle::LifecycleController;
use crate::manifest_import::ManifestDocument;
use crate::obs::emit_discovery_updated;

/// How a request ends.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// A manifest to import as a `discovered` tool.
    Candidate(ManifestDocument),
    Failed(String),
    Rejected(String),
}

/// External source of candidate manifests (OpenAPI crawler, LLM extractor...).
#[async_trait]
pub trait DiscoveryProducer: Send + Sync {
    /// Look for a tool covering `request`. `Ok(None)` means nothing found.
    async fn propose(&self, request: &DiscoveryRequest) -> Result<Option<ManifestDocument>, String>;
}

/// Lowercase and collapse whitespace.
pub fn normalize_description(description: &str) -> String {
    description
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Hex SHA-256 of the normalized description.
pub fn dedup_key(description: &str) -> String {
    hex::encode(Sha256::digest(normalize_description(description).as_bytes()))
}

/// The discovery queue.
#[derive(Clone)]
pub struct DiscoveryQueue {
    store: Arc<dyn ToolStore>,
    lifecycle: LifecycleController,
    // enqueue dedup and resolve+import are check-then-act sequences
    write: Arc<Mutex<()>>,
}

impl DiscoveryQueue {
    pub fn new(store: Arc<dyn ToolStore>, lifecycle: LifecycleController) -> Self {
        Self {
            store,
            lifecycle,
            write: Arc::new(Mutex::new(())),
        }
    }

    /// Record a capability gap. An open request with the same normalized
    /// description is reused and its id returned.
    pub async fn enqueue(
        &self,
        capability_description: &str,
        requested_by: &str,
    ) -> VaultResult<DiscoveryRequestId> {
        if normalize_description(capability_description).is_empty() {
            return Err(VaultError::Validation(
                "capability description must not be empty".into(),
            ));
        }
        let key = dedup_key(capability_description);

        let _write = self.write.lock().await;
        if let Some(open) = self.store.find_open_discovery(&key).await? {
            debug!(request_id = %open.request_id, "discovery request deduplicated");
            return Ok(open.request_id);
        }

        let now = Utc::now();
        let request = DiscoveryRequest {
            request_id: DiscoveryRequestId::new(),
            capability_description: capability_description.trim().to_string(),
            dedup_key: key,
            requested_by: requested_by.to_string(),
            status: DiscoveryStatus::Pending,
            discovered_candidates: serde_json::Value::Array(Vec::new()),
            resulting_tool_id: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.store.insert_discovery(&request).await?;
        emit_discovery_updated(&request);
        Ok(request.request_id)
    }

    /// Move the oldest pending request to `searching` and return it.
    pub async fn claim(&self) -> VaultResult<Option<DiscoveryRequest>> {
        for mut request in self.store.list_discovery(Some(DiscoveryStatus::Pending)).await? {
            request.status = DiscoveryStatus::Searching;
            request.updated_at = Utc::now();
            match self
                .store
                .update_discovery(&request, DiscoveryStatus::Pending)
                .await
            {
                Ok(()) => {
                    emit_discovery_updated(&request);
                    return Ok(Some(request));
                }
                // claimed by someone else in the meantime
                Err(StorageError::StaleState { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Move a request to its terminal status. A second resolve fails with
    /// `InvalidLifecycleTransition`.
    pub async fn resolve(
        &self,
        request_id: &DiscoveryRequestId,
        resolution: Resolution,
        actor: &str,
    ) -> VaultResult<DiscoveryRequest> {
        let _write = self.write.lock().await;
        let mut request = self.store.get_discovery(request_id).await?;
        if request.status.is_terminal() {
            return Err(VaultError::InvalidLifecycleTransition(format!(
                "discovery request {request_id} is already {}",
                request.status
            )));
        }
        let expected = request.status;

        match resolution {
            Resolution::Candidate(document) => {
                if let serde_json::Value::Array(candidates) = &mut request.discovered_candidates {
                    candidates.push(serde_json::to_value(&document)?);
                }
                let location = format!("discovery:{request_id}");
                match self
                    .lifecycle
                    .import(document, SourceType::Discovered, &location, actor)
                    .await
                {
                    Ok(manifest) => {
                        request.status = DiscoveryStatus::Found;
                        request.resulting_tool_id = Some(manifest.id);
                    }
                    Err(e) => {
                        warn!(request_id = %request_id, error = %e, "discovered candidate rejected at import");
                        request.status = DiscoveryStatus::Failed;
                        request.error_message = Some(format!("candidate failed import: {e}"));
                    }
                }
            }
            Resolution::Failed(reason) => {
                request.status = DiscoveryStatus::Failed;
                request.error_message = Some(reason);
            }
            Resolution::Rejected(reason) => {
                request.status = DiscoveryStatus::Rejected;
                request.error_message = Some(reason);
            }
        }

        let now = Utc::now();
        request.updated_at = now;
        request.completed_at = Some(now);
        self.store.update_discovery(&request, expected).await?;
        emit_discovery_updated(&request);
        Ok(request)
    }

    /// Claim one request and resolve it with `producer`. Returns the
    /// resolved request, or `None` when nothing was pending.
    pub async fn process_next(
        &self,
        producer: &dyn DiscoveryProducer,
        actor: &str,
    ) -> VaultResult<Option<DiscoveryRequest>> {
        let Some(request) = self.claim().await? else {
            return Ok(None);
        };
        let resolution = match producer.propose(&request).await {
            Ok(Some(document)) => Resolution::Candidate(document),
            Ok(None) => Resolution::Failed("no candidate found".to_string()),
            Err(reason) => Resolution::Failed(reason),
        };
        self.resolve(&request.request_id, resolution, actor)
            .await
            .map(Some)
    }

    pub async fn get(&self, request_id: &DiscoveryRequestId) -> VaultResult<DiscoveryRequest> {
        Ok(self.store.get_discovery(request_id).await?)
    }

    pub async fn list(&self, status: Option<DiscoveryStatus>) -> VaultResult<Vec<DiscoveryRequest>> {
        Ok(self.store.list_discovery(status).await?)
    }
}
