//! TTL'd cache of source-tree fingerprints
//!
//! Hashing a large tree costs tens of milliseconds of stat traffic, and
//! staleness checks can arrive in bursts. This cache bounds that cost per
//! project root. Cleanup is lazy and piggybacks on writes so no background
//! task is needed; the cleanup period bounds the amortized sweep cost.

use atlas_core::config::HashConfig;
use atlas_core::metrics::metrics;
use atlas_core::types::{SourceFingerprint, absolutize};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::debug;

struct SourceHashRecord {
    fingerprint: SourceFingerprint,
    computed_at: Instant,
}

struct Inner {
    records: HashMap<PathBuf, SourceHashRecord>,
    last_cleanup: Instant,
}

/// Bounded `project_root → fingerprint` map with TTL expiry
pub struct SourceHashCache {
    inner: RwLock<Inner>,
    ttl: Duration,
    max_size: usize,
    cleanup_period: Duration,
}

impl SourceHashCache {
    /// Create a cache from hashing configuration
    #[must_use]
    pub fn new(config: &HashConfig) -> Self {
        Self {
            inner: RwLock::new(Inner {
                records: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
            ttl: config.ttl,
            max_size: config.max_cached,
            cleanup_period: config.cleanup_period,
        }
    }

    /// Process-wide shared instance with default configuration
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<SourceHashCache> = OnceLock::new();
        GLOBAL.get_or_init(|| Self::new(&HashConfig::default()))
    }

    fn expired(&self, record: &SourceHashRecord) -> bool {
        !self.ttl.is_zero() && record.computed_at.elapsed() > self.ttl
    }

    /// Look up a fingerprint that is still within its TTL
    #[must_use]
    pub fn get(&self, root: &Path) -> Option<SourceFingerprint> {
        let key = absolutize(root);
        let inner = self.inner.read();
        match inner.records.get(&key) {
            Some(record) if !self.expired(record) => {
                metrics().hash_cache_hits.incr();
                Some(record.fingerprint.clone())
            }
            _ => {
                metrics().hash_cache_misses.incr();
                None
            }
        }
    }

    /// Insert a freshly computed fingerprint.
    ///
    /// When the cache is over its size bound and the cleanup period has
    /// elapsed, expired records are swept as part of the write.
    pub fn insert(&self, root: &Path, fingerprint: SourceFingerprint) {
        let key = absolutize(root);
        let mut inner = self.inner.write();
        inner.records.insert(
            key,
            SourceHashRecord {
                fingerprint,
                computed_at: Instant::now(),
            },
        );

        if inner.records.len() > self.max_size
            && inner.last_cleanup.elapsed() > self.cleanup_period
        {
            let before = inner.records.len();
            let ttl = self.ttl;
            if !ttl.is_zero() {
                inner
                    .records
                    .retain(|_, record| record.computed_at.elapsed() <= ttl);
            }
            inner.last_cleanup = Instant::now();
            debug!(
                removed = before - inner.records.len(),
                remaining = inner.records.len(),
                "swept expired source-hash records"
            );
        }
    }

    /// Drop the record for one project root
    pub fn invalidate(&self, root: &Path) {
        self.inner.write().records.remove(&absolutize(root));
    }

    /// Drop every record
    pub fn clear(&self) {
        self.inner.write().records.clear();
    }

    /// Number of records currently held (including expired, pre-sweep)
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    /// True if no records are held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint(hash: &str) -> SourceFingerprint {
        SourceFingerprint {
            hash: hash.to_string(),
            file_count: 1,
        }
    }

    fn cache_with_ttl(ttl: Duration) -> SourceHashCache {
        SourceHashCache::new(&HashConfig::default().with_ttl(ttl))
    }

    #[test]
    fn test_insert_and_get() {
        let cache = cache_with_ttl(Duration::from_secs(60));
        let root = Path::new("/proj/a");
        cache.insert(root, fingerprint("abc"));
        assert_eq!(cache.get(root).unwrap().hash, "abc");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = cache_with_ttl(Duration::from_millis(10));
        let root = Path::new("/proj/a");
        cache.insert(root, fingerprint("abc"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get(root).is_none());
    }

    #[test]
    fn test_zero_ttl_never_expires() {
        let cache = cache_with_ttl(Duration::ZERO);
        let root = Path::new("/proj/a");
        cache.insert(root, fingerprint("abc"));
        std::thread::sleep(Duration::from_millis(15));
        assert!(cache.get(root).is_some());
    }

    #[test]
    fn test_invalidate_and_clear() {
        let cache = cache_with_ttl(Duration::from_secs(60));
        cache.insert(Path::new("/proj/a"), fingerprint("a"));
        cache.insert(Path::new("/proj/b"), fingerprint("b"));

        cache.invalidate(Path::new("/proj/a"));
        assert!(cache.get(Path::new("/proj/a")).is_none());
        assert!(cache.get(Path::new("/proj/b")).is_some());

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lazy_cleanup_sweeps_expired_records() {
        let mut config = HashConfig::default().with_ttl(Duration::from_millis(5));
        config.max_cached = 2;
        config.cleanup_period = Duration::from_millis(10);
        let cache = SourceHashCache::new(&config);

        cache.insert(Path::new("/proj/a"), fingerprint("a"));
        cache.insert(Path::new("/proj/b"), fingerprint("b"));
        cache.insert(Path::new("/proj/c"), fingerprint("c"));
        std::thread::sleep(Duration::from_millis(20));

        // Over the size bound and past the cleanup period: this write sweeps
        cache.insert(Path::new("/proj/d"), fingerprint("d"));
        assert_eq!(cache.len(), 1);
        assert!(cache.get(Path::new("/proj/d")).is_some());
    }

    #[test]
    fn test_relative_roots_share_absolute_key() {
        let cache = cache_with_ttl(Duration::from_secs(60));
        let cwd = std::env::current_dir().unwrap();
        cache.insert(Path::new("relative"), fingerprint("r"));
        assert!(cache.get(&cwd.join("relative")).is_some());
    }

    #[test]
    fn test_global_is_singleton() {
        let a: *const SourceHashCache = SourceHashCache::global();
        let b: *const SourceHashCache = SourceHashCache::global();
        assert_eq!(a, b);
    }
}
