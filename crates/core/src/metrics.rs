//! Process-wide observability counters and histograms
//!
//! Lock-free instrumentation shared by the hashing, staleness,
//! verification, and cache subsystems. A global registry is available via
//! [`metrics`]; components accept an injected registry so tests and
//! multi-tenant embeddings can isolate their numbers.

use serde::Serialize;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A monotonically increasing counter
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Increment by one
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by `n`
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Upper bucket bounds for duration observations, in milliseconds
const DURATION_BUCKETS_MS: [u64; 10] = [1, 5, 10, 25, 50, 100, 250, 1000, 5000, 30_000];

/// Upper bucket bounds for file-count observations
const COUNT_BUCKETS: [u64; 8] = [10, 50, 100, 500, 1000, 5000, 20_000, 100_000];

/// A fixed-bucket histogram with an implicit overflow bucket
#[derive(Debug)]
pub struct Histogram {
    bounds: &'static [u64],
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    sum: AtomicU64,
}

impl Histogram {
    fn new(bounds: &'static [u64]) -> Self {
        let buckets = (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            buckets,
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
        }
    }

    /// Record one observation
    pub fn observe(&self, value: u64) {
        let idx = self
            .bounds
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.bounds.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
    }

    /// Record a duration in milliseconds
    pub fn observe_duration(&self, d: Duration) {
        self.observe(u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
    }

    /// Number of observations
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum of all observed values
    #[must_use]
    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            bounds: self.bounds.to_vec(),
            buckets: self
                .buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
            count: self.count(),
            sum: self.sum(),
        }
    }
}

/// Serializable point-in-time view of a histogram
#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    /// Upper bucket bounds; the final bucket is unbounded
    pub bounds: Vec<u64>,
    /// Per-bucket observation counts (one more than `bounds`)
    pub buckets: Vec<u64>,
    /// Total observations
    pub count: u64,
    /// Sum of observed values
    pub sum: u64,
}

/// Registry of all atlas metric series
#[derive(Debug)]
pub struct MetricsRegistry {
    /// Graph-cache hits
    pub graph_hits: Counter,
    /// Graph-cache misses
    pub graph_misses: Counter,
    /// Entry-count evictions
    pub graph_evictions: Counter,
    /// Memory-pressure evictions
    pub graph_memory_evictions: Counter,
    /// Successful graph builds
    pub graph_builds: Counter,
    /// Successful in-place refreshes
    pub graph_refreshes: Counter,
    /// Rebuilds triggered by a failed staleness check
    pub stale_rebuilds: Counter,
    /// Failed builds
    pub build_errors: Counter,

    /// Source-hash cache hits
    pub hash_cache_hits: Counter,
    /// Source-hash cache misses
    pub hash_cache_misses: Counter,

    /// Staleness verdicts: entry fresh
    pub staleness_fresh: Counter,
    /// Staleness verdicts: builder version mismatch
    pub staleness_version_mismatch: Counter,
    /// Staleness verdicts: source tree changed
    pub staleness_source_changed: Counter,
    /// Staleness verdicts: hashing failed
    pub staleness_hash_errors: Counter,

    /// Per-file verifications satisfied without hashing
    pub verify_fast_path: Counter,
    /// Per-file verifications that fell back to content hashing
    pub verify_hash_fallback: Counter,

    /// Blast-radius cache hits
    pub blast_hits: Counter,
    /// Blast-radius cache misses
    pub blast_misses: Counter,

    /// Wall-clock duration of source-tree fingerprints, in milliseconds
    pub source_hash_duration_ms: Histogram,
    /// Eligible-file counts per fingerprint
    pub source_hash_files: Histogram,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            graph_hits: Counter::default(),
            graph_misses: Counter::default(),
            graph_evictions: Counter::default(),
            graph_memory_evictions: Counter::default(),
            graph_builds: Counter::default(),
            graph_refreshes: Counter::default(),
            stale_rebuilds: Counter::default(),
            build_errors: Counter::default(),
            hash_cache_hits: Counter::default(),
            hash_cache_misses: Counter::default(),
            staleness_fresh: Counter::default(),
            staleness_version_mismatch: Counter::default(),
            staleness_source_changed: Counter::default(),
            staleness_hash_errors: Counter::default(),
            verify_fast_path: Counter::default(),
            verify_hash_fallback: Counter::default(),
            blast_hits: Counter::default(),
            blast_misses: Counter::default(),
            source_hash_duration_ms: Histogram::new(&DURATION_BUCKETS_MS),
            source_hash_files: Histogram::new(&COUNT_BUCKETS),
        }
    }

    /// Serializable snapshot of every series
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            graph_hits: self.graph_hits.get(),
            graph_misses: self.graph_misses.get(),
            graph_evictions: self.graph_evictions.get(),
            graph_memory_evictions: self.graph_memory_evictions.get(),
            graph_builds: self.graph_builds.get(),
            graph_refreshes: self.graph_refreshes.get(),
            stale_rebuilds: self.stale_rebuilds.get(),
            build_errors: self.build_errors.get(),
            hash_cache_hits: self.hash_cache_hits.get(),
            hash_cache_misses: self.hash_cache_misses.get(),
            staleness_fresh: self.staleness_fresh.get(),
            staleness_version_mismatch: self.staleness_version_mismatch.get(),
            staleness_source_changed: self.staleness_source_changed.get(),
            staleness_hash_errors: self.staleness_hash_errors.get(),
            verify_fast_path: self.verify_fast_path.get(),
            verify_hash_fallback: self.verify_hash_fallback.get(),
            blast_hits: self.blast_hits.get(),
            blast_misses: self.blast_misses.get(),
            blast_hit_rate: hit_rate(self.blast_hits.get(), self.blast_misses.get()),
            source_hash_duration_ms: self.source_hash_duration_ms.snapshot(),
            source_hash_files: self.source_hash_files.snapshot(),
        }
    }
}

/// Serializable point-in-time view of the registry
#[derive(Debug, Clone, Serialize)]
#[allow(missing_docs)]
pub struct MetricsSnapshot {
    pub graph_hits: u64,
    pub graph_misses: u64,
    pub graph_evictions: u64,
    pub graph_memory_evictions: u64,
    pub graph_builds: u64,
    pub graph_refreshes: u64,
    pub stale_rebuilds: u64,
    pub build_errors: u64,
    pub hash_cache_hits: u64,
    pub hash_cache_misses: u64,
    pub staleness_fresh: u64,
    pub staleness_version_mismatch: u64,
    pub staleness_source_changed: u64,
    pub staleness_hash_errors: u64,
    pub verify_fast_path: u64,
    pub verify_hash_fallback: u64,
    pub blast_hits: u64,
    pub blast_misses: u64,
    pub blast_hit_rate: f64,
    pub source_hash_duration_ms: HistogramSnapshot,
    pub source_hash_files: HistogramSnapshot,
}

/// Ratio of hits to total lookups; zero when nothing was observed
#[must_use]
pub fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

/// Global metrics registry instance
static METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

/// Returns a reference to the global metrics registry
pub fn metrics() -> &'static MetricsRegistry {
    METRICS.get_or_init(MetricsRegistry::new)
}
