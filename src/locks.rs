use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

const PRUNE_THRESHOLD: usize = 1024;

/// One async mutex per key, created on demand.
///
/// Used to serialize work scoped to a single resource (a provider timeline,
/// a chair, a patient flow) without a global lock: callers touching
/// unrelated keys never wait on each other.
pub struct KeyedLocks<K: Eq + Hash> {
    slots: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self { slots: DashMap::new() }
    }
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Ord + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
        if self.slots.len() > PRUNE_THRESHOLD {
            // Only the map holds an idle slot.
            self.slots.retain(|_, m| Arc::strong_count(m) > 1);
        }
        // The shard guard is released before awaiting.
        let slot = Arc::clone(self.slots.entry(key).or_default().value());
        slot.lock_owned().await
    }

    /// Locks every key in canonical (sorted) order so two callers with
    /// overlapping key sets cannot deadlock.
    pub async fn lock_all(&self, mut keys: Vec<K>) -> Vec<OwnedMutexGuard<()>> {
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.lock(key).await);
        }
        guards
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = Arc::new(KeyedLocks::<u32>::new());
        let guard = locks.lock(7).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock(7).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let locks = KeyedLocks::<u32>::new();
        let _a = locks.lock(1).await;
        let _b = tokio::time::timeout(Duration::from_millis(50), locks.lock(2))
            .await
            .expect("unrelated key must not block");
    }

    #[tokio::test]
    async fn lock_all_dedups_keys() {
        let locks = KeyedLocks::<u32>::new();
        let guards = locks.lock_all(vec![3, 1, 3, 2]).await;
        assert_eq!(guards.len(), 3);
        assert_eq!(locks.len(), 3);
    }

    #[tokio::test]
    async fn idle_slots_are_pruned_once_the_map_grows() {
        let locks = KeyedLocks::<usize>::new();
        let held = locks.lock(0).await;
        for key in 1..=PRUNE_THRESHOLD {
            drop(locks.lock(key).await);
        }
        assert_eq!(locks.len(), PRUNE_THRESHOLD + 1);

        // the next acquisition prunes everything nobody holds
        let _again = locks.lock(PRUNE_THRESHOLD + 10).await;
        assert_eq!(locks.len(), 2);
        drop(held);
    }
}
