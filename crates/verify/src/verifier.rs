//! Per-file and batch verification against manifest expectations
//!
//! Verification is query-scoped: only the files a pending operation
//! touches are checked, mtime-first with a content-hash fallback. A
//! matching mtime+size is trusted only when the file is older than the
//! filesystem's timestamp resolution window; files with future mtimes
//! (clock skew) are always hashed.

use crate::cache::VerificationCache;
use atlas_core::config::VerifyConfig;
use atlas_core::metrics::metrics;
use atlas_core::types::{mtime_ns, validate_relpath};
use atlas_core::{Error, Result};
use atlas_hash::{constant_time_hex_eq, hash_file_hex};
use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Manifest expectation for one file
#[derive(Debug, Clone)]
pub struct ExpectedFile {
    /// SHA-256 of contents, 64-char lowercase hex
    pub hash: String,
    /// Size in bytes
    pub size: u64,
    /// Modification time in nanoseconds since the epoch
    pub mtime_ns: i64,
}

/// Verdict for a single file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileVerdict {
    /// File matches its expectation
    Fresh,
    /// File content diverged
    Stale,
    /// File no longer exists
    Deleted,
}

/// Aggregate verdict for a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyStatus {
    /// Every file matched
    Fresh,
    /// Every checked file diverged or is gone
    Stale,
    /// Some, but not all, files diverged
    PartiallyStale,
    /// Only errors; nothing was confirmed stale or deleted
    Error,
}

/// Result of a batch verification
#[derive(Debug)]
pub struct BatchOutcome {
    /// Aggregate verdict
    pub status: VerifyStatus,
    /// Relative paths whose content diverged
    pub stale: Vec<String>,
    /// Relative paths that no longer exist
    pub deleted: Vec<String>,
    /// Per-file failures as (relative path, rendered error)
    pub errors: Vec<(String, String)>,
    /// Number of files processed (partial when cancelled)
    pub checked: usize,
    /// True when the ambient token fired mid-batch; lists are partial
    pub cancelled: bool,
}

impl BatchOutcome {
    /// Convert into a result: `StaleData` for divergence,
    /// `VerificationFailed` for error-only batches, `Cancelled` when the
    /// batch was cut short.
    ///
    /// # Errors
    ///
    /// See above; a `Fresh` outcome returns `Ok(())`.
    pub fn into_result(self) -> Result<()> {
        if self.cancelled {
            return Err(Error::Cancelled);
        }
        match self.status {
            VerifyStatus::Fresh => Ok(()),
            VerifyStatus::Error => Err(Error::VerificationFailed {
                failures: self.errors,
            }),
            VerifyStatus::Stale | VerifyStatus::PartiallyStale => Err(Error::StaleData {
                stale: self.stale,
                deleted: self.deleted,
            }),
        }
    }
}

/// Query-scoped file verifier
pub struct Verifier {
    config: VerifyConfig,
    cache: Arc<VerificationCache>,
}

impl Verifier {
    /// Create a verifier with its own verification cache
    #[must_use]
    pub fn new(config: VerifyConfig) -> Self {
        let cache = Arc::new(VerificationCache::new(config.verification_ttl));
        Self { config, cache }
    }

    /// Create a verifier sharing an injected verification cache
    #[must_use]
    pub fn with_cache(config: VerifyConfig, cache: Arc<VerificationCache>) -> Self {
        Self { config, cache }
    }

    /// The shared verification cache
    #[must_use]
    pub fn cache(&self) -> &Arc<VerificationCache> {
        &self.cache
    }

    /// Verify one file against its manifest expectation.
    ///
    /// # Errors
    ///
    /// - `PathTraversal` for unclean relative paths
    /// - `HashIo` for stat/read failures other than not-found
    /// - `FileTooLarge` when the hash fallback hits the size limit
    pub async fn verify_file(
        &self,
        root: &Path,
        relpath: &str,
        expected: &ExpectedFile,
    ) -> Result<FileVerdict> {
        validate_relpath(relpath)?;
        let path = root.join(relpath);

        if self.cache.is_fresh(&path) {
            return Ok(FileVerdict::Fresh);
        }

        let meta = match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(FileVerdict::Deleted);
            }
            Err(e) => return Err(Error::hash_io(e, &path, "stat")),
        };

        let modified = meta
            .modified()
            .map_err(|e| Error::hash_io(e, &path, "mtime"))?;
        let now = SystemTime::now();

        // A future mtime means clock skew somewhere; never trust it
        let skewed = modified > now;
        let mtime_matches =
            mtime_ns(modified) == expected.mtime_ns && meta.len() == expected.size;
        let settled = now
            .duration_since(modified)
            .is_ok_and(|age| age > self.config.mtime_resolution);

        if !skewed && mtime_matches && settled {
            metrics().verify_fast_path.incr();
            self.cache.mark_verified(&path);
            return Ok(FileVerdict::Fresh);
        }

        metrics().verify_hash_fallback.incr();
        let hash_path = path.clone();
        let max_size = self.config.max_file_size;
        let actual = tokio::task::spawn_blocking(move || hash_file_hex(&hash_path, max_size))
            .await
            .map_err(|e| Error::configuration(format!("hash task failed: {e}")))??;

        if constant_time_hex_eq(&actual, &expected.hash) {
            self.cache.mark_verified(&path);
            Ok(FileVerdict::Fresh)
        } else {
            debug!(path = %path.display(), "content hash mismatch");
            Ok(FileVerdict::Stale)
        }
    }

    /// Verify a set of files with bounded parallelism.
    ///
    /// Per-file errors are collected, never short-circuiting the batch.
    /// Cancellation stops the batch and returns the partial outcome with
    /// `cancelled` set.
    pub async fn verify_batch(
        &self,
        root: &Path,
        entries: &[(String, ExpectedFile)],
        token: &CancellationToken,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome {
            status: VerifyStatus::Fresh,
            stale: Vec::new(),
            deleted: Vec::new(),
            errors: Vec::new(),
            checked: 0,
            cancelled: false,
        };

        let mut results = futures::stream::iter(entries.iter().map(|(relpath, expected)| {
            let verify = self.verify_file(root, relpath, expected);
            async move { (relpath.clone(), verify.await) }
        }))
        .buffer_unordered(self.config.parallel_limit.max(1));

        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => {
                    outcome.cancelled = true;
                    break;
                }
                next = results.next() => match next {
                    Some((relpath, result)) => {
                        outcome.checked += 1;
                        match result {
                            Ok(FileVerdict::Fresh) => {}
                            Ok(FileVerdict::Stale) => outcome.stale.push(relpath),
                            Ok(FileVerdict::Deleted) => outcome.deleted.push(relpath),
                            Err(err) => outcome.errors.push((relpath, err.to_string())),
                        }
                    }
                    None => break,
                },
            }
        }

        outcome.stale.sort();
        outcome.deleted.sort();
        outcome.status = aggregate_status(
            entries.len(),
            outcome.stale.len() + outcome.deleted.len(),
            outcome.errors.len(),
        );
        outcome
    }
}

fn aggregate_status(total: usize, unfresh: usize, errors: usize) -> VerifyStatus {
    if unfresh == 0 && errors == 0 {
        VerifyStatus::Fresh
    } else if unfresh == 0 {
        VerifyStatus::Error
    } else if unfresh == total {
        VerifyStatus::Stale
    } else {
        VerifyStatus::PartiallyStale
    }
}
