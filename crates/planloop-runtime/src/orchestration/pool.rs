//! Semaphore-based slot pool bounding how many subagent runs execute at once.
//!
//! The [`SlotPool`] issues one permit per running subagent. A permit is held
//! for the whole execution of a run, including the stop grace period after a
//! timeout or cancellation, and is returned to the pool when dropped. A run
//! waiting on runs it spawned may hand its permit back early and acquire a
//! fresh one afterwards.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{debug, info};

/// A permit granting one run the right to execute.
///
/// The run ID is removed from the pool's active set when the permit drops.
pub struct SlotPermit {
    run_id: String,
    active: Arc<RwLock<HashSet<String>>>,
    _permit: OwnedSemaphorePermit,
}

impl SlotPermit {
    /// ID of the run holding this slot.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        debug!(run_id = %self.run_id, "Slot released");
        // Drop cannot await; fall back to a spawned removal if contended.
        if let Ok(mut active) = self.active.try_write() {
            active.remove(&self.run_id);
        } else {
            let active = Arc::clone(&self.active);
            let run_id = std::mem::take(&mut self.run_id);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    active.write().await.remove(&run_id);
                });
            }
        }
    }
}

/// Fixed-capacity pool of execution slots.
pub struct SlotPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    active: Arc<RwLock<HashSet<String>>>,
}

impl SlotPool {
    /// Create a pool with `capacity` slots. Capacity is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        info!(capacity, "SlotPool created");

        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            active: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Wait for a free slot and assign it to `run_id`.
    pub async fn acquire(&self, run_id: &str) -> Result<SlotPermit, PoolError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        Ok(self.assign(run_id, permit).await)
    }

    async fn assign(&self, run_id: &str, permit: OwnedSemaphorePermit) -> SlotPermit {
        self.active.write().await.insert(run_id.to_string());
        debug!(run_id, available = self.semaphore.available_permits(), "Slot acquired");
        SlotPermit {
            run_id: run_id.to_string(),
            active: Arc::clone(&self.active),
            _permit: permit,
        }
    }

    /// Stop handing out slots. Pending `acquire` calls fail with [`PoolError::Closed`].
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// IDs of runs currently holding a slot, sorted.
    pub async fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.read().await.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of free slots.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Number of slots currently held.
    pub fn in_use(&self) -> usize {
        self.capacity - self.available()
    }
}

/// Errors from the slot pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The pool was closed during shutdown.
    #[error("Slot pool has been closed")]
    Closed,
}
