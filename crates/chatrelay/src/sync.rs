//! Synchronization primitives for chatrelay.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

use crate::identity::Identity;

/// Per-identity async mutex with stale-entry pruning.
///
/// The registry serializes construction and teardown for one identity while
/// different identities proceed concurrently. Entries are created lazily on
/// first use and track last-access time so idle ones can be pruned.
#[derive(Clone, Default)]
pub struct IdentityLocks {
    locks: Arc<DashMap<Identity, (Arc<Mutex<()>>, Instant)>>,
}

impl IdentityLocks {
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Lock the given identity, waiting if another caller holds it.
    ///
    /// The guard is owned, so it can be held across awaits without borrowing
    /// the lock collection.
    pub async fn acquire(&self, identity: &Identity) -> OwnedMutexGuard<()> {
        let lock = {
            let now = Instant::now();
            self.locks
                .entry(identity.clone())
                .and_modify(|(_, touched)| *touched = now)
                .or_insert_with(|| (Arc::new(Mutex::new(())), now))
                .0
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop lock entries idle longer than `max_idle` with no waiters.
    ///
    /// An entry is removed only when the map holds the sole reference to its
    /// mutex (no caller is holding or waiting on it). Returns the number of
    /// entries removed.
    pub fn prune(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<Identity> = self
            .locks
            .iter()
            .filter(|entry| {
                let (lock, touched) = entry.value();
                Arc::strong_count(lock) == 1 && now.duration_since(*touched) > max_idle
            })
            .map(|entry| entry.key().clone())
            .collect();

        let count = stale.len();
        for identity in stale {
            self.locks.remove(&identity);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Identity {
        Identity::sanitize(s)
    }

    #[tokio::test]
    async fn same_identity_serializes() {
        let locks = IdentityLocks::new();

        let guard = locks.acquire(&id("user1")).await;

        let locks2 = locks.clone();
        let contended = tokio::spawn(async move { locks2.acquire(&id("user1")).await });

        // The second acquire must not complete while the guard is held.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contended.is_finished());

        drop(guard);
        contended.await.unwrap();
    }

    #[tokio::test]
    async fn different_identities_proceed_concurrently() {
        let locks = IdentityLocks::new();

        let _guard_a = locks.acquire(&id("user1")).await;
        let _guard_b = locks.acquire(&id("user2")).await;
    }

    #[tokio::test]
    async fn prune_removes_idle_entries() {
        let locks = IdentityLocks::new();

        drop(locks.acquire(&id("stale")).await);
        assert_eq!(locks.len(), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let removed = locks.prune(Duration::from_millis(5));
        assert_eq!(removed, 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn prune_keeps_held_locks() {
        let locks = IdentityLocks::new();

        let _guard = locks.acquire(&id("held")).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        let removed = locks.prune(Duration::from_millis(5));
        assert_eq!(removed, 0);
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn prune_on_empty_is_safe() {
        let locks = IdentityLocks::new();
        assert_eq!(locks.prune(Duration::from_millis(5)), 0);
    }
}
