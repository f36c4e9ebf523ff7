//! Second-level cache for blast-radius analysis results
//!
//! Results are keyed by `(symbol, graph_generation)`, so bumping a graph's
//! generation on refresh or rebuild obsoletes every result computed
//! against the prior generation without explicit invalidation. The cached
//! result is opaque and read-only once inserted.

use crate::singleflight::Singleflight;
use atlas_core::config::BlastRadiusConfig;
use atlas_core::metrics::{hit_rate, metrics};
use atlas_core::types::now_ms;
use atlas_core::{Error, Result};
use lru::LruCache;
use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Derive the cache key for a symbol at a graph generation: the first 16
/// hex characters of `sha256("{symbol}:{generation}")`
fn cache_key(symbol_id: &str, generation: u64) -> String {
    let digest = Sha256::digest(format!("{symbol_id}:{generation}").as_bytes());
    hex::encode(&digest[..8])
}

struct BlastEntry<R> {
    result: Arc<R>,
    symbol_id: String,
    generation: u64,
    computed_at: Instant,
    last_access_ms: AtomicU64,
}

struct BlastState<R> {
    entries: HashMap<String, Arc<BlastEntry<R>>>,
    recency: LruCache<String, ()>,
}

/// Point-in-time blast-radius cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct BlastRadiusStats {
    /// Results currently resident
    pub entry_count: usize,
    /// Lookups satisfied from the cache
    pub hits: u64,
    /// Lookups that found nothing
    pub misses: u64,
    /// Analysis computations run
    pub compute_count: u64,
    /// Failed or timed-out computations
    pub error_count: u64,
    /// hits / (hits + misses), zero before any lookup
    pub hit_rate: f64,
}

#[derive(Default)]
struct BlastCounters {
    hits: atlas_core::metrics::Counter,
    misses: atlas_core::metrics::Counter,
    computes: atlas_core::metrics::Counter,
    errors: atlas_core::metrics::Counter,
}

/// LRU/TTL cache of opaque analysis results keyed by symbol and graph
/// generation, with singleflight-deduplicated computation
pub struct BlastRadiusCache<R: Send + Sync + 'static> {
    state: RwLock<BlastState<R>>,
    flights: Singleflight<String>,
    config: BlastRadiusConfig,
    counters: BlastCounters,
}

impl<R: Send + Sync + 'static> BlastRadiusCache<R> {
    /// Create a cache with the given configuration
    #[must_use]
    pub fn new(config: BlastRadiusConfig) -> Self {
        Self {
            state: RwLock::new(BlastState {
                entries: HashMap::new(),
                recency: LruCache::unbounded(),
            }),
            flights: Singleflight::new(),
            config,
            counters: BlastCounters::default(),
        }
    }

    fn expired(&self, entry: &BlastEntry<R>) -> bool {
        !self.config.max_age.is_zero() && entry.computed_at.elapsed() > self.config.max_age
    }

    /// Look up a cached result for a symbol at a graph generation
    #[must_use]
    pub fn get(&self, symbol_id: &str, generation: u64) -> Option<Arc<R>> {
        let key = cache_key(symbol_id, generation);
        let mut state = self.state.write();
        match state.entries.get(&key).cloned() {
            Some(entry) if !self.expired(&entry) => {
                entry
                    .last_access_ms
                    .store(now_ms(), std::sync::atomic::Ordering::Relaxed);
                state.recency.promote(&key);
                self.counters.hits.incr();
                metrics().blast_hits.incr();
                Some(Arc::clone(&entry.result))
            }
            Some(entry) => {
                // Expired: drop it now rather than waiting for eviction
                state.entries.remove(&key);
                state.recency.pop(&key);
                drop(entry);
                self.counters.misses.incr();
                metrics().blast_misses.incr();
                None
            }
            None => {
                self.counters.misses.incr();
                metrics().blast_misses.incr();
                None
            }
        }
    }

    /// Get a cached result or compute it, deduplicating concurrent
    /// computations for the same key.
    ///
    /// The computation is bounded by the configured `compute_timeout`.
    ///
    /// # Errors
    ///
    /// - `Timeout` when the analysis exceeds its deadline
    /// - `Cancelled` when the ambient token fires
    /// - Any error returned by `analyze`
    pub async fn get_or_compute<F, Fut>(
        &self,
        symbol_id: &str,
        generation: u64,
        token: &CancellationToken,
        analyze: F,
    ) -> Result<Arc<R>>
    where
        F: FnOnce(CancellationToken, String) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        if let Some(result) = self.get(symbol_id, generation) {
            return Ok(result);
        }

        let key = cache_key(symbol_id, generation);
        let _flight = self.flights.acquire(key.clone(), token).await?;

        // A leader may have inserted while we queued
        if let Some(result) = self.get(symbol_id, generation) {
            return Ok(result);
        }

        self.counters.computes.incr();
        let computed = tokio::select! {
            biased;
            () = token.cancelled() => return Err(Error::Cancelled),
            outcome = tokio::time::timeout(
                self.config.compute_timeout,
                analyze(token.clone(), symbol_id.to_string()),
            ) => match outcome {
                Err(_) => {
                    self.counters.errors.incr();
                    return Err(Error::timeout(
                        "blast-radius compute",
                        self.config.compute_timeout,
                    ));
                }
                Ok(Err(err)) => {
                    self.counters.errors.incr();
                    return Err(err);
                }
                Ok(Ok(result)) => result,
            },
        };

        let result = Arc::new(computed);
        let entry = Arc::new(BlastEntry {
            result: Arc::clone(&result),
            symbol_id: symbol_id.to_string(),
            generation,
            computed_at: Instant::now(),
            last_access_ms: AtomicU64::new(now_ms()),
        });

        let mut state = self.state.write();
        state.entries.insert(key.clone(), entry);
        state.recency.put(key, ());
        while state.entries.len() > self.config.max_entries {
            let Some((victim, ())) = state.recency.pop_lru() else {
                break;
            };
            state.entries.remove(&victim);
        }
        drop(state);

        Ok(result)
    }

    /// Drop the result for one symbol at one generation
    pub fn invalidate(&self, symbol_id: &str, generation: u64) {
        let key = cache_key(symbol_id, generation);
        let mut state = self.state.write();
        state.entries.remove(&key);
        state.recency.pop(&key);
    }

    /// Drop every result for a symbol, across generations
    pub fn invalidate_symbol(&self, symbol_id: &str) {
        let mut state = self.state.write();
        let keys: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.symbol_id == symbol_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            state.entries.remove(&key);
            state.recency.pop(&key);
        }
    }

    /// Drop every result computed against one graph generation
    pub fn invalidate_generation(&self, generation: u64) {
        let mut state = self.state.write();
        let keys: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.generation == generation)
            .map(|(key, _)| key.clone())
            .collect();
        debug!(generation, removed = keys.len(), "invalidating blast-radius generation");
        for key in keys {
            state.entries.remove(&key);
            state.recency.pop(&key);
        }
    }

    /// Drop every result
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.entries.clear();
        state.recency.clear();
    }

    /// Statistics snapshot
    #[must_use]
    pub fn stats(&self) -> BlastRadiusStats {
        let entry_count = self.state.read().entries.len();
        BlastRadiusStats {
            entry_count,
            hits: self.counters.hits.get(),
            misses: self.counters.misses.get(),
            compute_count: self.counters.computes.get(),
            error_count: self.counters.errors.get(),
            hit_rate: hit_rate(self.counters.hits.get(), self.counters.misses.get()),
        }
    }
}

impl<R: Send + Sync + 'static> Default for BlastRadiusCache<R> {
    fn default() -> Self {
        Self::new(BlastRadiusConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug, PartialEq, Eq)]
    struct Radius(Vec<String>);

    fn config() -> BlastRadiusConfig {
        BlastRadiusConfig::default()
    }

    #[test]
    fn test_cache_key_is_16_hex_chars() {
        let key = cache_key("pkg::func", 3);
        assert_eq!(key.len(), 16);
        assert!(key.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(key, cache_key("pkg::func", 4));
        assert_ne!(key, cache_key("pkg::other", 3));
    }

    #[tokio::test]
    async fn test_get_or_compute_caches() {
        let cache: BlastRadiusCache<Radius> = BlastRadiusCache::new(config());
        let token = CancellationToken::new();

        let first = cache
            .get_or_compute("sym", 1, &token, |_, _| async {
                Ok(Radius(vec!["caller".into()]))
            })
            .await
            .unwrap();
        assert_eq!(first.0, vec!["caller".to_string()]);

        // Second call must not recompute
        let second = cache
            .get_or_compute("sym", 1, &token, |_, _| async {
                panic!("must not recompute")
            })
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let stats = cache.stats();
        assert_eq!(stats.compute_count, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn test_compute_timeout() {
        let cache: BlastRadiusCache<Radius> =
            BlastRadiusCache::new(config().with_compute_timeout(Duration::from_millis(10)));
        let token = CancellationToken::new();

        let err = cache
            .get_or_compute("slow", 1, &token, |_, _| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Radius(vec![]))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(cache.stats().error_count, 1);
    }

    #[tokio::test]
    async fn test_generation_bump_obsoletes_results() {
        let cache: BlastRadiusCache<Radius> = BlastRadiusCache::new(config());
        let token = CancellationToken::new();

        cache
            .get_or_compute("sym", 1, &token, |_, _| async { Ok(Radius(vec![])) })
            .await
            .unwrap();

        // Same symbol, new generation: key differs, so it misses
        assert!(cache.get("sym", 1).is_some());
        assert!(cache.get("sym", 2).is_none());
    }

    #[tokio::test]
    async fn test_invalidate_generation() {
        let cache: BlastRadiusCache<Radius> = BlastRadiusCache::new(config());
        let token = CancellationToken::new();

        for symbol in ["a", "b"] {
            for generation in [1u64, 2] {
                cache
                    .get_or_compute(symbol, generation, &token, |_, _| async {
                        Ok(Radius(vec![]))
                    })
                    .await
                    .unwrap();
            }
        }

        cache.invalidate_generation(1);
        assert!(cache.get("a", 1).is_none());
        assert!(cache.get("b", 1).is_none());
        assert!(cache.get("a", 2).is_some());
        assert!(cache.get("b", 2).is_some());
    }

    #[tokio::test]
    async fn test_invalidate_symbol_spans_generations() {
        let cache: BlastRadiusCache<Radius> = BlastRadiusCache::new(config());
        let token = CancellationToken::new();

        for generation in [1u64, 2] {
            cache
                .get_or_compute("a", generation, &token, |_, _| async { Ok(Radius(vec![])) })
                .await
                .unwrap();
        }
        cache
            .get_or_compute("b", 1, &token, |_, _| async { Ok(Radius(vec![])) })
            .await
            .unwrap();

        cache.invalidate_symbol("a");
        assert!(cache.get("a", 1).is_none());
        assert!(cache.get("a", 2).is_none());
        assert!(cache.get("b", 1).is_some());
    }

    #[tokio::test]
    async fn test_lru_eviction_at_capacity() {
        let cache: BlastRadiusCache<Radius> =
            BlastRadiusCache::new(config().with_max_entries(2));
        let token = CancellationToken::new();

        for symbol in ["a", "b", "c"] {
            cache
                .get_or_compute(symbol, 1, &token, |_, _| async { Ok(Radius(vec![])) })
                .await
                .unwrap();
        }

        // "a" was least recently used
        assert!(cache.get("a", 1).is_none());
        assert!(cache.get("b", 1).is_some());
        assert!(cache.get("c", 1).is_some());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache: BlastRadiusCache<Radius> =
            BlastRadiusCache::new(config().with_max_age(Duration::from_millis(10)));
        let token = CancellationToken::new();

        cache
            .get_or_compute("sym", 1, &token, |_, _| async { Ok(Radius(vec![])) })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get("sym", 1).is_none());
        assert_eq!(cache.stats().entry_count, 0);
    }

    #[tokio::test]
    async fn test_singleflight_dedupes_concurrent_computes() {
        let cache: Arc<BlastRadiusCache<Radius>> = Arc::new(BlastRadiusCache::new(config()));
        let ran = Arc::new(std::sync::atomic::AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = Arc::clone(&cache);
            let ran = Arc::clone(&ran);
            handles.push(tokio::spawn(async move {
                let token = CancellationToken::new();
                cache
                    .get_or_compute("sym", 1, &token, move |_, _| {
                        let ran = Arc::clone(&ran);
                        async move {
                            ran.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(Radius(vec![]))
                        }
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(ran.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(cache.stats().compute_count, 1);
    }

    #[tokio::test]
    async fn test_cancelled_caller() {
        let cache: BlastRadiusCache<Radius> = BlastRadiusCache::new(config());
        let token = CancellationToken::new();
        token.cancel();

        let err = cache
            .get_or_compute("sym", 1, &token, |_, _| async { Ok(Radius(vec![])) })
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_clear() {
        let cache: BlastRadiusCache<Radius> = BlastRadiusCache::new(config());
        cache.clear();
        assert_eq!(cache.stats().entry_count, 0);
    }
}
