//! Configuration for the cache, hashing, and verification subsystems

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Default file extensions recognized as source files
pub const DEFAULT_SOURCE_EXTENSIONS: &[&str] = &[
    "c", "cc", "cpp", "cs", "go", "h", "hpp", "java", "js", "jsx", "kt", "m", "php", "py", "rb",
    "rs", "scala", "swift", "ts", "tsx", "zig",
];

/// Default directory names skipped during source-tree walks
pub const DEFAULT_SKIP_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".idea",
    ".svn",
    ".venv",
    ".vscode",
    "__pycache__",
    "bin",
    "build",
    "dist",
    "node_modules",
    "obj",
    "target",
    "vendor",
];

/// Configuration for the graph cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Hard cap on entry count before LRU eviction kicks in
    pub max_entries: usize,
    /// TTL after which `get` treats an entry as expired; zero disables
    pub max_age: Duration,
    /// Soft memory cap in megabytes; zero means unlimited
    pub max_memory_mb: u64,
    /// Suppression window for failed builds
    pub error_cache_ttl: Duration,
    /// Whether `get_or_build` re-checks staleness on cache hits
    pub staleness_check_enabled: bool,
    /// Version token of the graph builder; entries built by other versions
    /// are considered stale
    pub builder_version: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 5,
            max_age: Duration::from_secs(30 * 60),
            max_memory_mb: 0,
            error_cache_ttl: Duration::from_secs(5),
            staleness_check_enabled: true,
            builder_version: String::new(),
        }
    }
}

impl CacheConfig {
    /// Set the entry cap
    #[must_use]
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Set the age TTL; `Duration::ZERO` disables age expiry
    #[must_use]
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Set the soft memory cap in megabytes; zero means unlimited
    #[must_use]
    pub fn with_max_memory_mb(mut self, mb: u64) -> Self {
        self.max_memory_mb = mb;
        self
    }

    /// Set the failed-build suppression window
    #[must_use]
    pub fn with_error_cache_ttl(mut self, ttl: Duration) -> Self {
        self.error_cache_ttl = ttl;
        self
    }

    /// Enable or disable the staleness check on `get_or_build` hits
    #[must_use]
    pub fn with_staleness_check(mut self, enabled: bool) -> Self {
        self.staleness_check_enabled = enabled;
        self
    }

    /// Set the builder version token
    #[must_use]
    pub fn with_builder_version(mut self, version: impl Into<String>) -> Self {
        self.builder_version = version.into();
        self
    }
}

/// Configuration for source-tree fingerprinting and the source-hash cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashConfig {
    /// Extensions (without leading dot) recognized as source files
    pub extensions: BTreeSet<String>,
    /// Directory names skipped during the walk
    pub skip_dirs: BTreeSet<String>,
    /// Hard cap on eligible files per tree
    pub max_files: usize,
    /// TTL for cached fingerprints; zero disables expiry
    pub ttl: Duration,
    /// Maximum number of cached fingerprints before lazy cleanup runs
    pub max_cached: usize,
    /// Minimum interval between lazy cleanup sweeps
    pub cleanup_period: Duration,
}

impl Default for HashConfig {
    fn default() -> Self {
        Self {
            extensions: DEFAULT_SOURCE_EXTENSIONS
                .iter()
                .map(ToString::to_string)
                .collect(),
            skip_dirs: DEFAULT_SKIP_DIRS.iter().map(ToString::to_string).collect(),
            max_files: 100_000,
            ttl: Duration::from_secs(30 * 60),
            max_cached: 100,
            cleanup_period: Duration::from_secs(5 * 60),
        }
    }
}

impl HashConfig {
    /// Replace the recognized extension set
    #[must_use]
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the skip-directory set
    #[must_use]
    pub fn with_skip_dirs<I, S>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip_dirs = dirs.into_iter().map(Into::into).collect();
        self
    }

    /// Set the eligible-file hard cap
    #[must_use]
    pub fn with_max_files(mut self, max_files: usize) -> Self {
        self.max_files = max_files;
        self
    }

    /// Set the fingerprint TTL; `Duration::ZERO` disables expiry
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Configuration for query-scoped verification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// Files modified within this window of now are always content-hashed,
    /// protecting against low-resolution filesystem timestamps
    pub mtime_resolution: Duration,
    /// Maximum concurrent per-file verifications
    pub parallel_limit: usize,
    /// Per-file verification suppression window
    pub verification_ttl: Duration,
    /// Per-file size limit for verification hashing
    pub max_file_size: u64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            mtime_resolution: Duration::from_secs(2),
            parallel_limit: 10,
            verification_ttl: Duration::from_millis(500),
            max_file_size: 10 * 1024 * 1024,
        }
    }
}

impl VerifyConfig {
    /// Set the mtime-resolution guard window
    #[must_use]
    pub fn with_mtime_resolution(mut self, window: Duration) -> Self {
        self.mtime_resolution = window;
        self
    }

    /// Set the bounded-parallelism limit
    #[must_use]
    pub fn with_parallel_limit(mut self, limit: usize) -> Self {
        self.parallel_limit = limit.max(1);
        self
    }

    /// Set the per-file verification TTL
    #[must_use]
    pub fn with_verification_ttl(mut self, ttl: Duration) -> Self {
        self.verification_ttl = ttl;
        self
    }

    /// Set the per-file size limit for hashing
    #[must_use]
    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }
}

/// Configuration for the blast-radius result cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlastRadiusConfig {
    /// Maximum cached results before LRU eviction
    pub max_entries: usize,
    /// TTL after which results expire; zero disables
    pub max_age: Duration,
    /// Deadline for a single analysis computation
    pub compute_timeout: Duration,
}

impl Default for BlastRadiusConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            max_age: Duration::from_secs(5 * 60),
            compute_timeout: Duration::from_millis(500),
        }
    }
}

impl BlastRadiusConfig {
    /// Set the result cap
    #[must_use]
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Set the result TTL; `Duration::ZERO` disables expiry
    #[must_use]
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Set the per-computation deadline
    #[must_use]
    pub fn with_compute_timeout(mut self, timeout: Duration) -> Self {
        self.compute_timeout = timeout;
        self
    }
}
