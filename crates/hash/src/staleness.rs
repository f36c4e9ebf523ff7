//! Staleness detection for cached graph entries
//!
//! An entry is stale when the builder that produced it has been upgraded
//! or when the source tree no longer matches the fingerprint captured at
//! build time. The version check is intentionally first: it costs a string
//! compare and avoids filesystem work entirely after a builder upgrade.

use crate::fingerprint::compute_source_fingerprint;
use crate::hash_cache::SourceHashCache;
use atlas_core::config::HashConfig;
use atlas_core::metrics::metrics;
use atlas_core::types::SourceFingerprint;
use atlas_core::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Verdict of a staleness check
#[derive(Debug)]
pub enum Staleness {
    /// Entry may be served
    Fresh,
    /// Entry was built by a different builder version
    VersionMismatch,
    /// Source tree diverged from the entry's build-time fingerprint
    SourceChanged,
    /// Current fingerprint could not be computed; entry treated as stale
    HashError(Error),
}

impl Staleness {
    /// True when the entry may satisfy reads
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh)
    }
}

/// The facts about a cache entry that staleness checking consumes
#[derive(Debug, Clone)]
pub struct EntryFacts {
    /// Project root the entry was built from
    pub project_root: PathBuf,
    /// Builder version recorded at build time
    pub builder_version: String,
    /// Source-tree fingerprint recorded at build time; empty when hashing
    /// failed during the build
    pub source_hash: String,
}

/// Decides whether cached entries still reflect the file system
pub struct StalenessChecker {
    builder_version: String,
    config: HashConfig,
    hash_cache: Arc<SourceHashCache>,
}

impl StalenessChecker {
    /// Create a checker with its own source-hash cache
    #[must_use]
    pub fn new(builder_version: impl Into<String>, config: HashConfig) -> Self {
        let hash_cache = Arc::new(SourceHashCache::new(&config));
        Self::with_hash_cache(builder_version, config, hash_cache)
    }

    /// Create a checker sharing an injected source-hash cache
    #[must_use]
    pub fn with_hash_cache(
        builder_version: impl Into<String>,
        config: HashConfig,
        hash_cache: Arc<SourceHashCache>,
    ) -> Self {
        Self {
            builder_version: builder_version.into(),
            config,
            hash_cache,
        }
    }

    /// The builder version current entries must carry to be fresh
    #[must_use]
    pub fn builder_version(&self) -> &str {
        &self.builder_version
    }

    /// The shared source-hash cache
    #[must_use]
    pub fn hash_cache(&self) -> &Arc<SourceHashCache> {
        &self.hash_cache
    }

    /// Current fingerprint for a root, served from the hash cache when
    /// still within its TTL.
    ///
    /// # Errors
    ///
    /// Propagates fingerprint failures (`Cancelled`, `TooManyFiles`,
    /// `HashIo`).
    pub async fn current_fingerprint(
        &self,
        root: &Path,
        token: &CancellationToken,
    ) -> Result<SourceFingerprint> {
        if let Some(cached) = self.hash_cache.get(root) {
            return Ok(cached);
        }

        let started = Instant::now();
        let walk_root = root.to_path_buf();
        let walk_config = self.config.clone();
        let walk_token = token.clone();
        let fingerprint = tokio::task::spawn_blocking(move || {
            compute_source_fingerprint(&walk_root, &walk_config, &walk_token)
        })
        .await
        .map_err(|e| Error::configuration(format!("fingerprint task failed: {e}")))??;

        metrics()
            .source_hash_duration_ms
            .observe_duration(started.elapsed());
        metrics()
            .source_hash_files
            .observe(fingerprint.file_count as u64);

        self.hash_cache.insert(root, fingerprint.clone());
        Ok(fingerprint)
    }

    /// Classify a cache entry as fresh or stale.
    ///
    /// Check order, fast to slow: builder version, then source fingerprint
    /// (through the hash cache). Hash failures are logged at warn and
    /// returned as `HashError`; callers treat the entry as stale.
    pub async fn check(&self, facts: &EntryFacts, token: &CancellationToken) -> Staleness {
        if facts.builder_version != self.builder_version {
            metrics().staleness_version_mismatch.incr();
            return Staleness::VersionMismatch;
        }

        let current = match self.current_fingerprint(&facts.project_root, token).await {
            Ok(fingerprint) => fingerprint,
            Err(err) => {
                warn!(
                    root = %facts.project_root.display(),
                    error = %err,
                    "source hashing failed during staleness check; treating entry as stale"
                );
                metrics().staleness_hash_errors.incr();
                return Staleness::HashError(err);
            }
        };

        // Entries without a build-time fingerprint always rebuild
        if facts.source_hash.is_empty() || facts.source_hash != current.hash {
            metrics().staleness_source_changed.incr();
            return Staleness::SourceChanged;
        }

        metrics().staleness_fresh.incr();
        Staleness::Fresh
    }
}
