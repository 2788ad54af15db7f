//! Mutation serialization
//!
//! Writes to the same id are applied one at a time in arrival order; writes
//! to different ids proceed in parallel. Whole-catalog passes (groom, rescan)
//! take the structural lock exclusively and so exclude every per-id writer.
//! Readers never touch any of these locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

type IdLockTable = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

#[derive(Default)]
pub struct MutationSerializer {
    ids: Arc<IdLockTable>,
    structural: Arc<RwLock<()>>,
}

/// Held while one id is being mutated. Dropping it wakes the next writer
/// for the same id and prunes the table entry once nobody else waits.
pub struct IdLockGuard {
    id: String,
    table: Arc<IdLockTable>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for IdLockGuard {
    fn drop(&mut self) {
        // Release first so the strong count below reflects waiters only.
        drop(self.guard.take());
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(lock) = table.get(&self.id)
            && Arc::strong_count(lock) == 1
        {
            table.remove(&self.id);
        }
    }
}

impl MutationSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`. tokio's mutex is fair, so waiters
    /// are granted the lock in the order they called this.
    pub async fn lock_id(&self, id: &str) -> IdLockGuard {
        let lock = {
            let mut table = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(table.entry(id.to_string()).or_default())
        };
        let guard = lock.lock_owned().await;
        IdLockGuard {
            id: id.to_string(),
            table: Arc::clone(&self.ids),
            guard: Some(guard),
        }
    }

    /// Held alongside an id lock by every per-id mutation.
    pub async fn structural_shared(&self) -> OwnedRwLockReadGuard<()> {
        Arc::clone(&self.structural).read_owned().await
    }

    /// Excludes every per-id mutation for the duration of a whole-catalog pass.
    pub async fn structural_exclusive(&self) -> OwnedRwLockWriteGuard<()> {
        Arc::clone(&self.structural).write_owned().await
    }
}
