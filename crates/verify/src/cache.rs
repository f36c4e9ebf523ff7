//! Short-TTL cache of per-file verification records
//!
//! Back-to-back queries often touch the same files; a successful
//! verification suppresses re-checking that file for a few hundred
//! milliseconds. Records are keyed by absolute path.

use atlas_core::types::absolutize;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Soft bound above which expired records are swept on write
const SWEEP_THRESHOLD: usize = 1024;

/// TTL'd set of recently verified files
pub struct VerificationCache {
    records: RwLock<HashMap<PathBuf, Instant>>,
    ttl: Duration,
}

impl VerificationCache {
    /// Create a cache with the given suppression window
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// True if the file was verified within the TTL
    #[must_use]
    pub fn is_fresh(&self, path: &Path) -> bool {
        let key = absolutize(path);
        self.records
            .read()
            .get(&key)
            .is_some_and(|verified_at| verified_at.elapsed() <= self.ttl)
    }

    /// Record a successful verification
    pub fn mark_verified(&self, path: &Path) {
        let key = absolutize(path);
        let mut records = self.records.write();
        records.insert(key, Instant::now());
        if records.len() > SWEEP_THRESHOLD {
            let ttl = self.ttl;
            records.retain(|_, verified_at| verified_at.elapsed() <= ttl);
        }
    }

    /// Drop the record for one file
    pub fn invalidate(&self, path: &Path) {
        self.records.write().remove(&absolutize(path));
    }

    /// Drop every record
    pub fn invalidate_all(&self) {
        self.records.write().clear();
    }

    /// Number of records currently held
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// True if no records are held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}
