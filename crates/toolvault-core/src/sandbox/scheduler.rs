//! Admission control: a global concurrency cap plus strict per-tool FIFO
//! serialization.
//!
//! The per-tool lock is taken first and the global slot second, so an
//! invocation queued behind another run of the same tool never holds one of
//! the global slots. Both waits share one deadline. State writes made
//! outside an execution take only the per-tool turn.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use toolvault_state::ToolId;

use crate::error::{VaultError, VaultResult};

type ToolLocks = Arc<Mutex<HashMap<ToolId, Arc<AsyncMutex<()>>>>>;

/// Drop a tool's lock entry once nobody holds or waits on it.
fn forget_idle(tools: &ToolLocks, tool_id: &ToolId) {
    let mut tools = tools.lock().unwrap_or_else(|p| p.into_inner());
    if tools.get(tool_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
        tools.remove(tool_id);
    }
}

/// Exclusive access to one tool. Nothing else runs against or mutates the
/// tool's state while it is held.
pub struct ToolTurn {
    guard: Option<OwnedMutexGuard<()>>,
    tool_id: ToolId,
    tools: ToolLocks,
}

impl Drop for ToolTurn {
    fn drop(&mut self) {
        drop(self.guard.take());
        forget_idle(&self.tools, &self.tool_id);
    }
}

/// Proof of admission. Dropping it releases the slot and the tool turn.
pub struct AdmissionPermit {
    _slot: OwnedSemaphorePermit,
    _turn: ToolTurn,
    waited: Duration,
}

impl AdmissionPermit {
    /// Time spent queued before admission.
    pub fn waited(&self) -> Duration {
        self.waited
    }
}

/// In-process scheduler shared by every execution and every state write.
pub struct AdmissionScheduler {
    slots: Arc<Semaphore>,
    max_concurrent: usize,
    tools: ToolLocks,
}

impl AdmissionScheduler {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            slots: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            tools: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn tool_lock(&self, tool_id: &ToolId) -> Arc<AsyncMutex<()>> {
        let mut tools = self.tools.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(
            tools
                .entry(tool_id.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    fn turn(&self, tool_id: &ToolId, guard: OwnedMutexGuard<()>) -> ToolTurn {
        ToolTurn {
            guard: Some(guard),
            tool_id: tool_id.clone(),
            tools: Arc::clone(&self.tools),
        }
    }

    fn busy(&self, tool_id: &ToolId, started: Instant) -> VaultError {
        forget_idle(&self.tools, tool_id);
        VaultError::SandboxBusy {
            tool_id: tool_id.to_string(),
            waited_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Wait for this tool's turn and a global slot, or fail with
    /// `SandboxBusy` once `deadline` has elapsed.
    pub async fn admit(&self, tool_id: &ToolId, deadline: Duration) -> VaultResult<AdmissionPermit> {
        let started = Instant::now();
        let tool_lock = self.tool_lock(tool_id);
        let slots = Arc::clone(&self.slots);

        let admitted = tokio::time::timeout(deadline, async move {
            let tool = tool_lock.lock_owned().await;
            let slot = slots.acquire_owned().await.ok()?;
            Some((tool, slot))
        })
        .await;

        match admitted {
            Ok(Some((tool, slot))) => Ok(AdmissionPermit {
                _slot: slot,
                _turn: self.turn(tool_id, tool),
                waited: started.elapsed(),
            }),
            Ok(None) | Err(_) => Err(self.busy(tool_id, started)),
        }
    }

    /// Wait for this tool's turn without taking a global slot. Used for
    /// state writes made outside an execution.
    pub async fn exclusive(&self, tool_id: &ToolId, deadline: Duration) -> VaultResult<ToolTurn> {
        let started = Instant::now();
        let tool_lock = self.tool_lock(tool_id);
        let locked = tokio::time::timeout(deadline, tool_lock.lock_owned()).await;
        match locked {
            Ok(guard) => Ok(self.turn(tool_id, guard)),
            Err(_) => Err(self.busy(tool_id, started)),
        }
    }

    /// Executions currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.slots.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Tools with a holder or a waiter.
    pub fn tracked_tools(&self) -> usize {
        self.tools.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}
