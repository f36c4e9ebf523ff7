//! Cache entries and scoped-acquisition handles

use atlas_core::types::{GraphArtifact, GraphId, Manifest, now_ms};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::Mutex as AsyncMutex;

/// Heuristic per-entry memory estimate, in bytes.
///
/// `1 KiB base + 500 B per node + 100 B per edge + 200 B per manifest
/// file`. Advisory only; the memory cap is soft.
pub(crate) fn estimate_bytes(nodes: usize, edges: usize, manifest_files: usize) -> u64 {
    1024 + 500 * nodes as u64 + 100 * edges as u64 + 200 * manifest_files as u64
}

/// An immutable cached graph plus its bookkeeping.
///
/// The graph and manifest never change for the lifetime of an entry
/// instance; refresh replaces the instance wholesale. Mutable state is
/// confined to atomics so readers never block writers.
pub struct GraphEntry<G> {
    pub(crate) id: GraphId,
    pub(crate) project_root: PathBuf,
    pub(crate) graph: Arc<G>,
    pub(crate) manifest: Arc<Manifest>,
    pub(crate) generation: u64,
    pub(crate) builder_version: String,
    /// Source-tree fingerprint at build time; empty when hashing failed
    pub(crate) source_hash: String,
    pub(crate) built_at: Instant,
    pub(crate) last_access_ms: AtomicU64,
    pub(crate) ref_count: AtomicU32,
    pub(crate) stale: AtomicBool,
    /// Serializes refreshers for this entry
    pub(crate) refresh_lock: AsyncMutex<()>,
}

impl<G: GraphArtifact> GraphEntry<G> {
    pub(crate) fn new(
        id: GraphId,
        project_root: PathBuf,
        graph: Arc<G>,
        manifest: Arc<Manifest>,
        generation: u64,
        builder_version: String,
        source_hash: String,
    ) -> Self {
        Self {
            id,
            project_root,
            graph,
            manifest,
            generation,
            builder_version,
            source_hash,
            built_at: Instant::now(),
            last_access_ms: AtomicU64::new(now_ms()),
            ref_count: AtomicU32::new(0),
            stale: AtomicBool::new(false),
            refresh_lock: AsyncMutex::new(()),
        }
    }

    #[inline]
    pub(crate) fn touch(&self) {
        self.last_access_ms.store(now_ms(), Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn in_use(&self) -> bool {
        self.ref_count.load(Ordering::Acquire) > 0
    }

    #[inline]
    pub(crate) fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    pub(crate) fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }

    pub(crate) fn estimated_bytes(&self) -> u64 {
        estimate_bytes(
            self.graph.node_count(),
            self.graph.edge_count(),
            self.manifest.len(),
        )
    }
}

/// Shared state reachable from both the cache and its handles
pub(crate) struct CacheShared<G> {
    pub(crate) state: parking_lot::RwLock<CacheState<G>>,
    pub(crate) counters: CacheCounters,
}

/// Everything guarded by the cache-wide lock
pub(crate) struct CacheState<G> {
    pub(crate) entries: std::collections::HashMap<GraphId, Arc<GraphEntry<G>>>,
    /// Recency order; the map key set and this key set stay identical
    pub(crate) recency: lru::LruCache<GraphId, ()>,
    pub(crate) failed: std::collections::HashMap<GraphId, FailedBuild>,
    pub(crate) estimated_memory: u64,
}

impl<G: GraphArtifact> CacheState<G> {
    /// Remove `entry` if the map still points at this exact instance.
    ///
    /// Refresh may have swapped in a replacement; in that case the old
    /// instance is already detached and there is nothing to do.
    pub(crate) fn remove_if_current(&mut self, entry: &Arc<GraphEntry<G>>) -> bool {
        let current = self
            .entries
            .get(&entry.id)
            .is_some_and(|held| Arc::ptr_eq(held, entry));
        if current {
            self.entries.remove(&entry.id);
            self.recency.pop(&entry.id);
            self.estimated_memory = self
                .estimated_memory
                .saturating_sub(entry.estimated_bytes());
        }
        current
    }
}

/// A cached build failure suppressing retries until `retry_at`
#[derive(Debug, Clone)]
pub(crate) struct FailedBuild {
    pub(crate) message: String,
    pub(crate) failed_at: chrono::DateTime<chrono::Utc>,
    pub(crate) retry_at: chrono::DateTime<chrono::Utc>,
    pub(crate) retry_deadline: Instant,
}

impl FailedBuild {
    pub(crate) fn active(&self) -> bool {
        Instant::now() < self.retry_deadline
    }

    pub(crate) fn to_error(&self) -> atlas_core::Error {
        atlas_core::Error::BuildFailed {
            message: self.message.clone(),
            failed_at: self.failed_at,
            retry_at: self.retry_at,
        }
    }
}

/// Atomic counters backing [`CacheStats`](crate::graph::CacheStats)
#[derive(Default)]
pub(crate) struct CacheCounters {
    pub(crate) hits: atlas_core::metrics::Counter,
    pub(crate) misses: atlas_core::metrics::Counter,
    pub(crate) evictions: atlas_core::metrics::Counter,
    pub(crate) memory_evictions: atlas_core::metrics::Counter,
    pub(crate) builds: atlas_core::metrics::Counter,
    pub(crate) refreshes: atlas_core::metrics::Counter,
    pub(crate) stale_rebuilds: atlas_core::metrics::Counter,
    pub(crate) errors: atlas_core::metrics::Counter,
}

/// Scoped acquisition of a cache entry.
///
/// Holding a handle keeps the entry alive (but not fresh): a stale-marked
/// entry survives until its last handle drops, then leaves the cache. The
/// release-on-all-paths contract is discharged by `Drop`, so early
/// returns and panics release correctly.
pub struct EntryHandle<G: GraphArtifact> {
    pub(crate) entry: Arc<GraphEntry<G>>,
    pub(crate) shared: Arc<CacheShared<G>>,
}

impl<G: GraphArtifact> std::fmt::Debug for EntryHandle<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryHandle")
            .field("graph_id", &self.entry.id)
            .finish()
    }
}

impl<G: GraphArtifact> EntryHandle<G> {
    /// The cached graph
    #[must_use]
    pub fn graph(&self) -> &Arc<G> {
        &self.entry.graph
    }

    /// The manifest captured with the graph
    #[must_use]
    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.entry.manifest
    }

    /// Stable identifier of the cached project
    #[must_use]
    pub fn graph_id(&self) -> &GraphId {
        &self.entry.id
    }

    /// The project root this graph was built from
    #[must_use]
    pub fn project_root(&self) -> &std::path::Path {
        &self.entry.project_root
    }

    /// Monotonic generation token; bumps on every build and refresh.
    ///
    /// Downstream caches (blast radius) key their results by this value.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.entry.generation
    }

    /// Source-tree fingerprint recorded at build time; empty when hashing
    /// failed during the build
    #[must_use]
    pub fn source_hash(&self) -> &str {
        &self.entry.source_hash
    }

    /// Builder version recorded at build time
    #[must_use]
    pub fn builder_version(&self) -> &str {
        &self.entry.builder_version
    }

    /// Milliseconds since the epoch of the entry's most recent access
    #[must_use]
    pub fn last_access_ms(&self) -> u64 {
        self.entry.last_access_ms.load(Ordering::Relaxed)
    }
}

impl<G: GraphArtifact> Drop for EntryHandle<G> {
    fn drop(&mut self) {
        let previous = self.entry.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "entry handle released twice");
        if previous == 1 && self.entry.is_stale() {
            let mut state = self.shared.state.write();
            // Another handle may have been issued between the decrement
            // and the lock; re-check under the lock
            if !self.entry.in_use() {
                state.remove_if_current(&self.entry);
            }
        }
    }
}
