use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockTable = Arc<DashMap<String, Arc<Mutex<()>>>>;

/// One async mutex per instance id. Every read-modify-write of an instance
/// (lifecycle calls, reconciliation, key management) runs under its guard.
///
/// Entries only live while someone holds or waits on them, so ids that never
/// existed leave nothing behind.
#[derive(Default)]
pub struct InstanceLocks {
    locks: LockTable,
}

/// Held instance lock. Dropping the last interest in an id removes its entry.
pub struct InstanceGuard {
    guard: OwnedMutexGuard<()>,
    id: String,
    locks: LockTable,
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        // Two references: the table's and ours. Anything more is a waiter.
        let mutex = OwnedMutexGuard::mutex(&self.guard);
        self.locks.remove_if(&self.id, |_, entry| {
            Arc::ptr_eq(entry, mutex) && Arc::strong_count(entry) == 2
        });
    }
}

impl InstanceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    fn guard(&self, id: &str, guard: OwnedMutexGuard<()>) -> InstanceGuard {
        InstanceGuard {
            guard,
            id: id.to_string(),
            locks: self.locks.clone(),
        }
    }

    pub async fn lock(&self, id: &str) -> InstanceGuard {
        let guard = self.handle(id).lock_owned().await;
        self.guard(id, guard)
    }

    /// `None` when another task currently holds the instance.
    pub fn try_lock(&self, id: &str) -> Option<InstanceGuard> {
        let guard = self.handle(id).try_lock_owned().ok()?;
        Some(self.guard(id, guard))
    }

    /// Drop the lock entry of a removed instance. Tasks already waiting on it
    /// still acquire it and then find the instance gone.
    pub fn forget(&self, id: &str) {
        self.locks.remove(id);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
