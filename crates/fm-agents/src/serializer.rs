use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

type LockMap = Arc<DashMap<String, Arc<Mutex<()>>>>;

// ---------------------------------------------------------------------------
// RunSerializer
// ---------------------------------------------------------------------------

/// Per-conversation mutual exclusion for runs within one process.
///
/// Two triggers for the same `agent:conversation` key must not interleave
/// their turn history; the second awaits the first's completion (a failed
/// first run releases the lock all the same; the waiter never sees its
/// error). Entries are created on first acquire and pruned when the last
/// holder releases, so an idle serializer carries no state.
///
/// This guards same-process collisions only. Cross-process exclusivity comes
/// from the task store's claim semantics, which is why both mechanisms exist
/// even in single-process deployments.
#[derive(Clone, Default)]
pub struct RunSerializer {
    locks: LockMap,
}

impl RunSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Await exclusive access to a conversation, returning an RAII permit.
    pub async fn acquire(&self, agent_id: Uuid, conversation_id: &str) -> RunPermit {
        let key = format!("{agent_id}:{conversation_id}");
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = lock.lock_owned().await;
        debug!(key = %key, "run permit acquired");

        RunPermit {
            key,
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }

    /// Number of conversations currently tracked (held or awaited).
    pub fn active_keys(&self) -> usize {
        self.locks.len()
    }
}

// ---------------------------------------------------------------------------
// RunPermit
// ---------------------------------------------------------------------------

/// Held for the duration of one run. Dropping it releases the conversation
/// and removes the registry entry when no other run holds or awaits it.
pub struct RunPermit {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockMap,
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        // Release before pruning so a queued waiter wakes immediately.
        self.guard.take();
        // A lone strong reference means the map's entry is the only one
        // left: no holder (our guard is gone) and no waiter (waiters keep a
        // clone alive while parked). `remove_if` holds the shard lock during
        // the check, serializing against concurrent `acquire` clones.
        self.locks
            .remove_if(&self.key, |_, entry| Arc::strong_count(entry) == 1);
        debug!(key = %self.key, "run permit released");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
