//! Per-key async mutual exclusion
//!
//! Each key gets its own `tokio::sync::Mutex`, created on first use and
//! dropped once nobody holds or waits for it. Waiters queue in FIFO order.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug)]
pub struct KeyedLock<K: Eq + Hash> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> KeyedLock<K> {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &K) -> KeyedGuard<'_, K> {
        let mutex = self.locks.entry(key.clone()).or_default().clone();
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            guard: Some(guard),
            key: key.clone(),
            locks: &self.locks,
        }
    }

    /// Number of keys currently held or awaited.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLock<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Held lock on one key. Releasing it admits the next waiter.
pub struct KeyedGuard<'a, K: Eq + Hash> {
    guard: Option<OwnedMutexGuard<()>>,
    key: K,
    locks: &'a DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash> Drop for KeyedGuard<'_, K> {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map's own handle left: no holder, no waiters.
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = Arc::new(KeyedLock::<u32>::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let guard = locks.lock(&1).await;

        let mut handles = Vec::new();
        for i in 0..3 {
            let locks = locks.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _g = locks.lock(&1).await;
                order.lock().await.push(i);
            }));
            // Let each waiter enqueue before the next one.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(order.lock().await.is_empty());
        drop(guard);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyedLock::<u32>::new();
        let _a = locks.lock(&1).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(&2)).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn released_keys_are_dropped() {
        let locks = KeyedLock::<u32>::new();
        {
            let _a = locks.lock(&1).await;
            let _b = locks.lock(&2).await;
            assert_eq!(locks.len(), 2);
        }
        assert!(locks.is_empty());
    }
}
