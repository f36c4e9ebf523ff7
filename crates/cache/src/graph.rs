//! The graph cache: LRU + TTL + memory-pressure eviction over
//! reference-counted entries, with singleflight build deduplication,
//! copy-on-write refresh, and error caching.

use crate::entry::{CacheCounters, CacheShared, CacheState, EntryHandle, FailedBuild, GraphEntry};
use crate::singleflight::Singleflight;
use atlas_core::config::{CacheConfig, HashConfig};
use atlas_core::metrics::{hit_rate, metrics};
use atlas_core::types::{GraphArtifact, GraphId, Manifest, absolutize};
use atlas_core::{Error, Result};
use atlas_hash::{EntryFacts, StalenessChecker};
use chrono::Utc;
use lru::LruCache;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Point-in-time cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Entries currently resident (including stale entries kept alive by
    /// outstanding handles)
    pub entry_count: usize,
    /// Lookups satisfied from the cache
    pub hits: u64,
    /// Lookups that found nothing servable
    pub misses: u64,
    /// Entries removed by the entry-count cap
    pub evictions: u64,
    /// Entries removed by the soft memory cap
    pub memory_evictions: u64,
    /// Successful builds
    pub build_count: u64,
    /// Successful in-place refreshes
    pub refresh_count: u64,
    /// Rebuilds forced by a failed staleness check
    pub stale_rebuilds: u64,
    /// Failed builds
    pub error_count: u64,
    /// Heuristic resident-memory estimate in bytes
    pub estimated_memory: u64,
    /// hits / (hits + misses), zero before any lookup
    pub hit_rate: f64,
}

/// In-memory cache of per-project code graphs.
///
/// Entries are owned exclusively by the cache; callers hold
/// [`EntryHandle`]s that pin an entry (but not its freshness) until
/// dropped. All map and recency mutations happen under one cache-wide
/// lock; per-entry state is atomic.
pub struct GraphCache<G: GraphArtifact> {
    shared: Arc<CacheShared<G>>,
    flights: Singleflight<GraphId>,
    staleness: StalenessChecker,
    config: CacheConfig,
    generation: AtomicU64,
}

impl<G: GraphArtifact> GraphCache<G> {
    /// Create a cache from cache and hashing configuration
    #[must_use]
    pub fn new(config: CacheConfig, hash_config: HashConfig) -> Self {
        let staleness = StalenessChecker::new(config.builder_version.clone(), hash_config);
        Self {
            shared: Arc::new(CacheShared {
                state: parking_lot::RwLock::new(CacheState {
                    entries: HashMap::new(),
                    recency: LruCache::unbounded(),
                    failed: HashMap::new(),
                    estimated_memory: 0,
                }),
                counters: CacheCounters::default(),
            }),
            flights: Singleflight::new(),
            staleness,
            config,
            generation: AtomicU64::new(0),
        }
    }

    /// The staleness checker (shared source-hash cache lives behind it)
    #[must_use]
    pub fn staleness(&self) -> &StalenessChecker {
        &self.staleness
    }

    fn canonical_root(root: &Path) -> PathBuf {
        root.canonicalize().unwrap_or_else(|_| absolutize(root))
    }

    fn expired(&self, entry: &GraphEntry<G>) -> bool {
        !self.config.max_age.is_zero() && entry.built_at.elapsed() > self.config.max_age
    }

    /// Look up a servable entry for a project root.
    ///
    /// Hits bump the recency order and pin the entry via the returned
    /// handle. Stale-marked and TTL-expired entries miss. This path does
    /// not consult the staleness engine; callers that need hash-verified
    /// freshness use [`get_or_build`](Self::get_or_build).
    #[must_use]
    pub fn get(&self, root: &Path) -> Option<EntryHandle<G>> {
        let id = GraphId::for_project_root(root);
        self.try_get(&id, true)
    }

    /// Internal lookup; `record` controls whether hit/miss counters move
    /// (internal double-checks and refresh acquisition stay silent)
    fn try_get(&self, id: &GraphId, record: bool) -> Option<EntryHandle<G>> {
        let mut state = self.shared.state.write();
        let found = state.entries.get(id).cloned();
        let servable = match found {
            Some(entry) if entry.is_stale() => None,
            Some(entry) if self.expired(&entry) => {
                entry.mark_stale();
                if !entry.in_use() {
                    state.remove_if_current(&entry);
                }
                None
            }
            other => other,
        };

        let Some(entry) = servable else {
            if record {
                self.shared.counters.misses.incr();
                metrics().graph_misses.incr();
            }
            return None;
        };

        entry.ref_count.fetch_add(1, Ordering::AcqRel);
        entry.touch();
        state.recency.promote(id);
        if record {
            self.shared.counters.hits.incr();
            metrics().graph_hits.incr();
        }
        Some(EntryHandle {
            entry,
            shared: Arc::clone(&self.shared),
        })
    }

    /// True if a servable (non-stale, non-expired) entry exists, without
    /// touching recency or counters
    #[must_use]
    pub fn contains(&self, root: &Path) -> bool {
        let id = GraphId::for_project_root(root);
        let state = self.shared.state.read();
        state
            .entries
            .get(&id)
            .is_some_and(|entry| !entry.is_stale() && !self.expired(entry))
    }

    fn check_failed(&self, id: &GraphId) -> Result<()> {
        let mut state = self.shared.state.write();
        if let Some(failure) = state.failed.get(id) {
            if failure.active() {
                return Err(failure.to_error());
            }
            // Expired records must not be consulted again
            state.failed.remove(id);
        }
        Ok(())
    }

    fn record_failure(&self, id: &GraphId, cause: &Error) -> Error {
        let failed_at = Utc::now();
        let ttl = self.config.error_cache_ttl;
        let failure = FailedBuild {
            message: cause.to_string(),
            failed_at,
            retry_at: failed_at
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero()),
            retry_deadline: Instant::now() + ttl,
        };
        let error = failure.to_error();
        self.shared.state.write().failed.insert(id.clone(), failure);
        self.shared.counters.errors.incr();
        metrics().build_errors.incr();
        error
    }

    async fn best_effort_fingerprint(&self, root: &Path, token: &CancellationToken) -> String {
        match self.staleness.current_fingerprint(root, token).await {
            Ok(fingerprint) => fingerprint.hash,
            Err(err) if err.is_cancelled() => String::new(),
            Err(err) => {
                warn!(
                    root = %root.display(),
                    error = %err,
                    "source hashing failed after build; entry will always rebuild"
                );
                String::new()
            }
        }
    }

    fn insert_entry(&self, entry: Arc<GraphEntry<G>>) -> EntryHandle<G> {
        let mut state = self.shared.state.write();

        // Double-check under the write lock: a concurrent populator may
        // have inserted while we were building
        if let Some(existing) = state.entries.get(&entry.id).cloned() {
            if existing.is_stale() {
                state.remove_if_current(&existing);
            } else {
                existing.ref_count.fetch_add(1, Ordering::AcqRel);
                existing.touch();
                state.recency.promote(&existing.id);
                return EntryHandle {
                    entry: existing,
                    shared: Arc::clone(&self.shared),
                };
            }
        }

        entry.ref_count.fetch_add(1, Ordering::AcqRel);
        state.entries.insert(entry.id.clone(), Arc::clone(&entry));
        state.recency.put(entry.id.clone(), ());
        state.estimated_memory += entry.estimated_bytes();
        state.failed.remove(&entry.id);
        self.evict_locked(&mut state);

        EntryHandle {
            entry,
            shared: Arc::clone(&self.shared),
        }
    }

    fn evict_locked(&self, state: &mut CacheState<G>) {
        while state.entries.len() > self.config.max_entries {
            if Self::evict_one(state) {
                self.shared.counters.evictions.incr();
                metrics().graph_evictions.incr();
            } else {
                // Everything else is in use; exceed the cap until a release
                break;
            }
        }

        if self.config.max_memory_mb > 0 {
            let cap = self.config.max_memory_mb * 1024 * 1024;
            while state.estimated_memory > cap {
                if Self::evict_one(state) {
                    self.shared.counters.memory_evictions.incr();
                    metrics().graph_memory_evictions.incr();
                } else {
                    break;
                }
            }
        }
    }

    /// Remove the least-recently-used entry with no outstanding handles
    fn evict_one(state: &mut CacheState<G>) -> bool {
        let order: Vec<GraphId> = state.recency.iter().map(|(id, _)| id.clone()).collect();
        // `iter` walks most-recent first; scan from the tail
        for id in order.iter().rev() {
            if let Some(entry) = state.entries.get(id) {
                if !entry.in_use() {
                    let victim = Arc::clone(entry);
                    state.remove_if_current(&victim);
                    debug!(graph_id = %victim.id, "evicted cache entry");
                    return true;
                }
            }
        }
        false
    }

    /// Get the cached graph for `root`, building it on a miss.
    ///
    /// Concurrent callers for the same project are deduplicated: exactly
    /// one `build` runs, and the rest observe its outcome. Build failures
    /// are cached for the configured error TTL and fail followers fast.
    /// When staleness checking is enabled, a cache hit is additionally
    /// verified against the builder version and the current source
    /// fingerprint; a stale hit is discarded and rebuilt.
    ///
    /// # Errors
    ///
    /// - `BuildFailed` on build failure (fresh or cached)
    /// - `Cancelled` when the ambient token fires while waiting or building
    pub async fn get_or_build<F, Fut>(
        &self,
        root: &Path,
        token: &CancellationToken,
        build: F,
    ) -> Result<EntryHandle<G>>
    where
        F: FnOnce(CancellationToken, PathBuf) -> Fut,
        Fut: Future<Output = Result<(G, Manifest)>>,
    {
        let root = Self::canonical_root(root);
        let id = GraphId::for_project_root(&root);

        if let Some(handle) = self.try_get(&id, true) {
            if !self.config.staleness_check_enabled {
                return Ok(handle);
            }
            let facts = EntryFacts {
                project_root: root.clone(),
                builder_version: handle.builder_version().to_string(),
                source_hash: handle.source_hash().to_string(),
            };
            let verdict = self.staleness.check(&facts, token).await;
            if verdict.is_fresh() {
                return Ok(handle);
            }
            debug!(graph_id = %id, verdict = ?verdict, "cache hit is stale; rebuilding");
            self.shared.counters.stale_rebuilds.incr();
            metrics().stale_rebuilds.incr();
            handle.entry.mark_stale();
            drop(handle);
        }

        self.check_failed(&id)?;

        let _flight = self.flights.acquire(id.clone(), token).await?;

        // A leader may have populated (or failed) while we queued
        if let Some(handle) = self.try_get(&id, false) {
            return Ok(handle);
        }
        self.check_failed(&id)?;

        let built = tokio::select! {
            biased;
            () = token.cancelled() => return Err(Error::Cancelled),
            result = build(token.clone(), root.clone()) => result,
        };

        match built {
            Ok((graph, manifest)) => {
                let source_hash = self.best_effort_fingerprint(&root, token).await;
                let entry = Arc::new(GraphEntry::new(
                    id,
                    root,
                    Arc::new(graph),
                    Arc::new(manifest),
                    self.generation.fetch_add(1, Ordering::Relaxed) + 1,
                    self.config.builder_version.clone(),
                    source_hash,
                ));
                self.shared.counters.builds.incr();
                metrics().graph_builds.incr();
                Ok(self.insert_entry(entry))
            }
            Err(err) if err.is_cancelled() => Err(err),
            Err(err) => Err(self.record_failure(&id, &err)),
        }
    }

    /// Copy-on-write refresh of an existing entry.
    ///
    /// `refresh_fn` receives the current graph and manifest and returns
    /// replacements; returning the *same* `Arc` instances signals a no-op
    /// (identity comparison, not semantic equality). Refreshers for the
    /// same entry are serialized; concurrent readers observe either the
    /// old or the new entry, never a torn state. If the entry was
    /// replaced or removed while the refresh ran, the update is abandoned
    /// and the call still succeeds.
    ///
    /// # Errors
    ///
    /// - `EntryNotFound` when no servable entry exists for `root`
    /// - `Cancelled` when the ambient token fires
    /// - Any error returned by `refresh_fn`
    pub async fn refresh<F, Fut>(
        &self,
        root: &Path,
        token: &CancellationToken,
        refresh_fn: F,
    ) -> Result<()>
    where
        F: FnOnce(CancellationToken, PathBuf, Arc<G>, Arc<Manifest>) -> Fut,
        Fut: Future<Output = Result<(Arc<G>, Arc<Manifest>)>>,
    {
        let root = Self::canonical_root(root);
        let id = GraphId::for_project_root(&root);
        let handle = self.try_get(&id, false).ok_or_else(|| Error::EntryNotFound {
            project_root: root.display().to_string(),
        })?;
        let entry = Arc::clone(&handle.entry);

        let _refresh_guard = entry.refresh_lock.lock().await;

        let refreshed = tokio::select! {
            biased;
            () = token.cancelled() => return Err(Error::Cancelled),
            result = refresh_fn(
                token.clone(),
                root.clone(),
                Arc::clone(&entry.graph),
                Arc::clone(&entry.manifest),
            ) => result,
        };
        let (new_graph, new_manifest) = refreshed?;

        if Arc::ptr_eq(&new_graph, &entry.graph) && Arc::ptr_eq(&new_manifest, &entry.manifest) {
            debug!(graph_id = %id, "refresh returned identical instances; no-op");
            return Ok(());
        }

        let source_hash = self.best_effort_fingerprint(&root, token).await;
        let replacement = Arc::new(GraphEntry::new(
            id.clone(),
            root,
            new_graph,
            new_manifest,
            self.generation.fetch_add(1, Ordering::Relaxed) + 1,
            self.config.builder_version.clone(),
            source_hash,
        ));

        let mut state = self.shared.state.write();
        let still_current = state
            .entries
            .get(&id)
            .is_some_and(|current| Arc::ptr_eq(current, &entry));
        if !still_current {
            // Another writer won the race; abandon without mutating
            debug!(graph_id = %id, "entry replaced during refresh; abandoning update");
            return Ok(());
        }

        state.estimated_memory = state
            .estimated_memory
            .saturating_sub(entry.estimated_bytes())
            + replacement.estimated_bytes();
        state.entries.insert(id, replacement);
        // The recency key is unchanged: the replacement inherits the old
        // entry's LRU position
        entry.mark_stale();
        self.shared.counters.refreshes.incr();
        metrics().graph_refreshes.incr();
        Ok(())
    }

    /// Remove the entry for `root` if nothing holds it.
    ///
    /// # Errors
    ///
    /// Returns `EntryInUse` when handles are outstanding; use
    /// [`force_invalidate`](Self::force_invalidate) to defer removal to
    /// the last release instead.
    pub fn invalidate(&self, root: &Path) -> Result<()> {
        let id = GraphId::for_project_root(root);
        let mut state = self.shared.state.write();
        let Some(entry) = state.entries.get(&id).cloned() else {
            return Ok(());
        };
        let refs = entry.ref_count.load(Ordering::Acquire);
        if refs > 0 {
            return Err(Error::EntryInUse {
                project_root: entry.project_root.display().to_string(),
                ref_count: refs,
            });
        }
        state.remove_if_current(&entry);
        self.staleness.hash_cache().invalidate(&entry.project_root);
        Ok(())
    }

    /// Mark the entry for `root` stale unconditionally.
    ///
    /// Removal happens immediately when no handles are outstanding,
    /// otherwise at the last release. Subsequent `get`s miss either way.
    pub fn force_invalidate(&self, root: &Path) {
        let id = GraphId::for_project_root(root);
        let mut state = self.shared.state.write();
        if let Some(entry) = state.entries.get(&id).cloned() {
            entry.mark_stale();
            if !entry.in_use() {
                state.remove_if_current(&entry);
            }
            self.staleness.hash_cache().invalidate(&entry.project_root);
        }
    }

    /// Force-invalidate every entry whose project root contains one of
    /// `paths`. Used by external file watchers.
    pub fn invalidate_files(&self, paths: &[PathBuf]) {
        let paths: Vec<PathBuf> = paths.iter().map(|p| absolutize(p)).collect();
        let mut state = self.shared.state.write();
        let affected: Vec<Arc<GraphEntry<G>>> = state
            .entries
            .values()
            .filter(|entry| paths.iter().any(|p| p.starts_with(&entry.project_root)))
            .cloned()
            .collect();
        for entry in affected {
            debug!(root = %entry.project_root.display(), "invalidating entry for changed files");
            entry.mark_stale();
            if !entry.in_use() {
                state.remove_if_current(&entry);
            }
            self.staleness.hash_cache().invalidate(&entry.project_root);
        }
    }

    /// Force-invalidate every entry
    pub fn invalidate_all(&self) {
        let mut state = self.shared.state.write();
        let all: Vec<Arc<GraphEntry<G>>> = state.entries.values().cloned().collect();
        for entry in all {
            entry.mark_stale();
            if !entry.in_use() {
                state.remove_if_current(&entry);
            }
        }
        self.staleness.hash_cache().clear();
    }

    /// Remove every entry not currently in use and stale-mark the rest
    pub fn clear(&self) {
        let mut state = self.shared.state.write();
        let all: Vec<Arc<GraphEntry<G>>> = state.entries.values().cloned().collect();
        for entry in all {
            entry.mark_stale();
            if !entry.in_use() {
                state.remove_if_current(&entry);
            }
        }
        state.failed.clear();
    }

    /// Wait for all in-flight builds to settle
    pub async fn wait_for_builds(&self) {
        self.flights.wait_idle().await;
    }

    /// Statistics snapshot
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let (entry_count, estimated_memory) = {
            let state = self.shared.state.read();
            (state.entries.len(), state.estimated_memory)
        };
        let counters = &self.shared.counters;
        CacheStats {
            entry_count,
            hits: counters.hits.get(),
            misses: counters.misses.get(),
            evictions: counters.evictions.get(),
            memory_evictions: counters.memory_evictions.get(),
            build_count: counters.builds.get(),
            refresh_count: counters.refreshes.get(),
            stale_rebuilds: counters.stale_rebuilds.get(),
            error_count: counters.errors.get(),
            estimated_memory,
            hit_rate: hit_rate(counters.hits.get(), counters.misses.get()),
        }
    }
}

impl<G: GraphArtifact> Default for GraphCache<G> {
    fn default() -> Self {
        Self::new(CacheConfig::default(), HashConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    struct TestGraph {
        nodes: usize,
        edges: usize,
        label: &'static str,
    }

    impl GraphArtifact for TestGraph {
        fn node_count(&self) -> usize {
            self.nodes
        }
        fn edge_count(&self) -> usize {
            self.edges
        }
    }

    fn graph(label: &'static str) -> TestGraph {
        TestGraph {
            nodes: 10,
            edges: 5,
            label,
        }
    }

    fn quiet_config() -> CacheConfig {
        CacheConfig::default()
            .with_staleness_check(false)
            .with_builder_version("v1")
    }

    fn cache(config: CacheConfig) -> GraphCache<TestGraph> {
        GraphCache::new(config, HashConfig::default())
    }

    async fn build_into(
        cache: &GraphCache<TestGraph>,
        root: &Path,
        label: &'static str,
    ) -> EntryHandle<TestGraph> {
        cache
            .get_or_build(root, &CancellationToken::new(), |_, _| async move {
                Ok((graph(label), Manifest::new()))
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_miss_then_build_then_hit() {
        let tmp = TempDir::new().unwrap();
        let cache = cache(quiet_config());

        assert!(cache.get(tmp.path()).is_none());
        let built = build_into(&cache, tmp.path(), "one").await;
        assert_eq!(built.graph().label, "one");

        let hit = cache.get(tmp.path()).unwrap();
        assert!(Arc::ptr_eq(hit.graph(), built.graph()));

        let stats = cache.stats();
        assert_eq!(stats.build_count, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.entry_count, 1);
    }

    #[tokio::test]
    async fn test_invalidate_in_use_is_refused() {
        let tmp = TempDir::new().unwrap();
        let cache = cache(quiet_config());
        let handle = build_into(&cache, tmp.path(), "g").await;

        let err = cache.invalidate(tmp.path()).unwrap_err();
        assert!(matches!(err, Error::EntryInUse { ref_count: 1, .. }));

        drop(handle);
        cache.invalidate(tmp.path()).unwrap();
        assert!(!cache.contains(tmp.path()));
    }

    #[tokio::test]
    async fn test_force_invalidate_defers_removal_to_last_release() {
        let tmp = TempDir::new().unwrap();
        let cache = cache(quiet_config());
        let handle = build_into(&cache, tmp.path(), "g").await;

        cache.force_invalidate(tmp.path());
        // The handle still works, but reads miss
        assert_eq!(handle.graph().label, "g");
        assert!(cache.get(tmp.path()).is_none());
        assert_eq!(cache.stats().entry_count, 1);

        drop(handle);
        assert_eq!(cache.stats().entry_count, 0);
    }

    #[tokio::test]
    async fn test_eviction_removes_lru_tail_first() {
        let cache = cache(quiet_config().with_max_entries(2));
        let roots: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();

        drop(build_into(&cache, roots[0].path(), "a").await);
        drop(build_into(&cache, roots[1].path(), "b").await);
        // Touch "a" so "b" becomes the LRU tail
        drop(cache.get(roots[0].path()).unwrap());

        drop(build_into(&cache, roots[2].path(), "c").await);

        assert!(cache.contains(roots[0].path()));
        assert!(!cache.contains(roots[1].path()));
        assert!(cache.contains(roots[2].path()));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_eviction_skips_in_use_entries() {
        let cache = cache(quiet_config().with_max_entries(1));
        let roots: Vec<TempDir> = (0..2).map(|_| TempDir::new().unwrap()).collect();

        let pinned = build_into(&cache, roots[0].path(), "a").await;
        let second = build_into(&cache, roots[1].path(), "b").await;

        // Both entries are held; the cap is exceeded until a release
        assert_eq!(cache.stats().entry_count, 2);
        assert_eq!(cache.stats().evictions, 0);

        drop(pinned);
        drop(second);
        // A later insert brings the count back under the cap
        let third = TempDir::new().unwrap();
        drop(build_into(&cache, third.path(), "c").await);
        assert_eq!(cache.stats().entry_count, 1);
    }

    #[tokio::test]
    async fn test_max_entries_one_evicts_prior() {
        let cache = cache(quiet_config().with_max_entries(1));
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();

        drop(build_into(&cache, a.path(), "a").await);
        drop(build_into(&cache, b.path(), "b").await);

        assert!(!cache.contains(a.path()));
        assert!(cache.contains(b.path()));
        assert_eq!(cache.stats().entry_count, 1);
    }

    #[tokio::test]
    async fn test_zero_max_age_never_expires() {
        let tmp = TempDir::new().unwrap();
        let cache = cache(quiet_config().with_max_age(Duration::ZERO));
        drop(build_into(&cache, tmp.path(), "g").await);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.get(tmp.path()).is_some());
    }

    #[tokio::test]
    async fn test_ttl_expiry_misses() {
        let tmp = TempDir::new().unwrap();
        let cache = cache(quiet_config().with_max_age(Duration::from_millis(10)));
        drop(build_into(&cache, tmp.path(), "g").await);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get(tmp.path()).is_none());
        assert_eq!(cache.stats().entry_count, 0);
    }

    #[tokio::test]
    async fn test_memory_pressure_eviction() {
        // Each test entry estimates 1 KiB + 10*500 + 5*100 = ~6.5 KiB;
        // 1 MB cap admits far more than two, so use large graphs
        let cache = cache(quiet_config().with_max_entries(100).with_max_memory_mb(1));
        let roots: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();

        for root in &roots {
            drop(
                cache
                    .get_or_build(root.path(), &CancellationToken::new(), |_, _| async {
                        Ok((
                            TestGraph {
                                nodes: 1000,
                                edges: 100,
                                label: "big",
                            },
                            Manifest::new(),
                        ))
                    })
                    .await
                    .unwrap(),
            );
        }

        // 3 * ~0.5 MB exceeds the 1 MB soft cap; at least one eviction ran
        let stats = cache.stats();
        assert!(stats.memory_evictions >= 1, "stats: {stats:?}");
        assert!(stats.estimated_memory <= 1024 * 1024);
    }

    #[tokio::test]
    async fn test_build_failure_is_cached() {
        let tmp = TempDir::new().unwrap();
        let cache = cache(quiet_config().with_error_cache_ttl(Duration::from_millis(50)));
        let token = CancellationToken::new();

        let err = cache
            .get_or_build(tmp.path(), &token, |_, _| async {
                Err(Error::configuration("boom"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BuildFailed { .. }));

        // Within the TTL the builder must not run again
        let err = cache
            .get_or_build(tmp.path(), &token, |_, _| async {
                panic!("builder must not run during the suppression window")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BuildFailed { .. }));
        assert_eq!(cache.stats().error_count, 1);

        // After expiry the next attempt retries and clears the record
        tokio::time::sleep(Duration::from_millis(80)).await;
        let handle = build_into(&cache, tmp.path(), "recovered").await;
        assert_eq!(handle.graph().label, "recovered");
    }

    #[tokio::test]
    async fn test_cancelled_build_not_cached_as_failure() {
        let tmp = TempDir::new().unwrap();
        let cache = cache(quiet_config());
        let token = CancellationToken::new();
        token.cancel();

        let err = cache
            .get_or_build(tmp.path(), &token, |_, _| async {
                Ok((graph("never"), Manifest::new()))
            })
            .await
            .unwrap_err();
        assert!(err.is_cancelled());

        // No failure record: an uncancelled build succeeds immediately
        let handle = build_into(&cache, tmp.path(), "ok").await;
        assert_eq!(handle.graph().label, "ok");
    }

    #[tokio::test]
    async fn test_refresh_swaps_entry_and_bumps_generation() {
        let tmp = TempDir::new().unwrap();
        let cache = cache(quiet_config());
        let before = build_into(&cache, tmp.path(), "old").await;
        let generation_before = before.generation();

        cache
            .refresh(tmp.path(), &CancellationToken::new(), |_, _, _, _| async {
                Ok((Arc::new(graph("new")), Arc::new(Manifest::new())))
            })
            .await
            .unwrap();

        let after = cache.get(tmp.path()).unwrap();
        assert_eq!(after.graph().label, "new");
        assert!(after.generation() > generation_before);
        // The old handle still serves its pinned entry
        assert_eq!(before.graph().label, "old");
        assert_eq!(cache.stats().refresh_count, 1);
        assert_eq!(cache.stats().entry_count, 1);
    }

    #[tokio::test]
    async fn test_refresh_identity_is_noop() {
        let tmp = TempDir::new().unwrap();
        let cache = cache(quiet_config());
        let handle = build_into(&cache, tmp.path(), "same").await;
        let generation = handle.generation();

        cache
            .refresh(
                tmp.path(),
                &CancellationToken::new(),
                |_, _, current_graph, current_manifest| async move {
                    Ok((current_graph, current_manifest))
                },
            )
            .await
            .unwrap();

        let after = cache.get(tmp.path()).unwrap();
        assert_eq!(after.generation(), generation);
        assert_eq!(cache.stats().refresh_count, 0);
    }

    #[tokio::test]
    async fn test_refresh_missing_entry_errors() {
        let tmp = TempDir::new().unwrap();
        let cache = cache(quiet_config());
        let err = cache
            .refresh(tmp.path(), &CancellationToken::new(), |_, _, g, m| async {
                Ok((g, m))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EntryNotFound { .. }));
    }

    #[tokio::test]
    async fn test_invalidate_files_matches_roots() {
        let cache = cache(quiet_config());
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        drop(build_into(&cache, a.path(), "a").await);
        drop(build_into(&cache, b.path(), "b").await);

        let changed = a.path().canonicalize().unwrap().join("src/lib.rs");
        cache.invalidate_files(&[changed]);

        assert!(!cache.contains(a.path()));
        assert!(cache.contains(b.path()));
    }

    #[tokio::test]
    async fn test_invalidate_all() {
        let cache = cache(quiet_config());
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        drop(build_into(&cache, a.path(), "a").await);
        drop(build_into(&cache, b.path(), "b").await);

        cache.invalidate_all();
        assert_eq!(cache.stats().entry_count, 0);
    }

    #[tokio::test]
    async fn test_stats_serialize() {
        let cache = cache(quiet_config());
        let json = serde_json::to_string(&cache.stats()).unwrap();
        assert!(json.contains("\"hit_rate\""));
    }
}
