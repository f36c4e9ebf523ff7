//! Per-key in-flight task coalescing
//!
//! One leader executes per key; followers queue on the same lock, then
//! re-check shared state when they acquire it. The leader's outcome
//! reaches followers through that shared state (the entry map or the
//! failed-build table), so no broadcast channel is needed. Nothing here
//! survives a process restart.

use atlas_core::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

/// Per-key leader-lock registry
pub(crate) struct Singleflight<K> {
    inflight: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K: Eq + Hash + Clone> Singleflight<K> {
    pub(crate) fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the flight for `key`, waiting behind the current leader.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` when the ambient token fires while queued.
    pub(crate) async fn acquire(
        &self,
        key: K,
        token: &CancellationToken,
    ) -> Result<Flight<'_, K>> {
        let lock = self
            .inflight
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();

        let guard = tokio::select! {
            biased;
            () = token.cancelled() => return Err(Error::Cancelled),
            guard = Arc::clone(&lock).lock_owned() => guard,
        };

        Ok(Flight {
            key,
            lock,
            guard: Some(guard),
            owner: self,
        })
    }

    /// Wait until every currently in-flight task has finished.
    ///
    /// Tasks started after this call begins are not waited for.
    pub(crate) async fn wait_idle(&self) {
        let locks: Vec<Arc<AsyncMutex<()>>> =
            self.inflight.lock().values().cloned().collect();
        for lock in locks {
            drop(lock.lock().await);
        }
    }

    /// Number of keys with a registered flight
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inflight.lock().len()
    }
}

/// Held by the leader (or a woken follower) for the duration of its
/// critical section; releases and garbage-collects the key on drop.
pub(crate) struct Flight<'a, K: Eq + Hash + Clone> {
    key: K,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
    owner: &'a Singleflight<K>,
}

impl<K: Eq + Hash + Clone + std::fmt::Debug> std::fmt::Debug for Flight<'_, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flight").field("key", &self.key).finish()
    }
}

impl<K: Eq + Hash + Clone> Drop for Flight<'_, K> {
    fn drop(&mut self) {
        // Release the lock before inspecting the registry so waiters can
        // make progress even if cleanup is skipped
        self.guard.take();
        let mut inflight = self.owner.inflight.lock();
        if let Some(current) = inflight.get(&self.key) {
            // Only collect our own lock, and only when no follower still
            // holds a reference to it (map + self)
            if Arc::ptr_eq(current, &self.lock) && Arc::strong_count(&self.lock) <= 2 {
                inflight.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_flight_key_collected_after_drop() {
        let sf: Singleflight<String> = Singleflight::new();
        let token = CancellationToken::new();
        let flight = sf.acquire("k".to_string(), &token).await.unwrap();
        assert_eq!(sf.len(), 1);
        drop(flight);
        assert_eq!(sf.len(), 0);
    }

    #[tokio::test]
    async fn test_followers_serialize_behind_leader() {
        let sf = Arc::new(Singleflight::<u32>::new());
        let concurrent = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sf = Arc::clone(&sf);
            let concurrent = Arc::clone(&concurrent);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let token = CancellationToken::new();
                let _flight = sf.acquire(7, &token).await.unwrap();
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_errors() {
        let sf: Singleflight<u32> = Singleflight::new();
        let token = CancellationToken::new();
        let _leader = sf.acquire(1, &token).await.unwrap();

        let waiter_token = CancellationToken::new();
        waiter_token.cancel();
        let err = sf.acquire(1, &waiter_token).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_wait_idle_blocks_until_flights_finish() {
        let sf = Arc::new(Singleflight::<u32>::new());
        let token = CancellationToken::new();
        let flight = sf.acquire(1, &token).await.unwrap();

        let sf2 = Arc::clone(&sf);
        let waiter = tokio::spawn(async move { sf2.wait_idle().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(flight);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
