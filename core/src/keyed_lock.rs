/// Per-key async mutual exclusion.
///
/// Read-modify-write cycles on one session or one execution are serialized;
/// different keys never contend.
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default, Clone)]
pub struct KeyedLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`. The lock is released when the
    /// returned guard is dropped, and the entry for `key` goes with it once
    /// nobody else holds or waits on it.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let held = mutex.lock_owned().await;
        KeyGuard {
            key: key.to_string(),
            locks: self.locks.clone(),
            held: Some(held),
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Exclusive access to one key
#[derive(Debug)]
pub struct KeyGuard {
    key: String,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // Release first so our own reference no longer counts
        self.held.take();
        // Waiters each own a clone of the mutex; the map entry is the last one.
        // `lock` clones under the same shard lock, so the check cannot race it.
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks = KeyedLocks::new();
        let counter = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..4 {
            let locks = locks.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("session-1").await;
                counter.lock().await.push(format!("start-{}", i));
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.lock().await.push(format!("end-{}", i));
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let log = counter.lock().await;
        // Every start is immediately followed by its own end
        for pair in log.chunks(2) {
            let start = pair[0].trim_start_matches("start-");
            let end = pair[1].trim_start_matches("end-");
            assert_eq!(start, end);
        }
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_released_keys_are_forgotten() {
        let locks = KeyedLocks::new();
        for i in 0..100 {
            let _guard = locks.lock(&format!("session-{}", i)).await;
        }
        assert!(locks.is_empty());

        let held = locks.lock("held").await;
        {
            let _other = locks.lock("idle").await;
        }
        assert_eq!(locks.len(), 1);
        drop(held);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_entry_survives_while_waiters_queue() {
        let locks = KeyedLocks::new();
        let first = locks.lock("shared").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("shared").await;
                locks.len()
            })
        };
        // Let the waiter reach the mutex before the holder lets go
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(first);

        assert_eq!(waiter.await.unwrap(), 1);
        assert!(locks.is_empty());
    }
}
