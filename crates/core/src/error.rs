//! Error types shared across the atlas workspace

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Error type for cache, hashing, and verification operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Invalidation attempted on an entry that still has live handles
    #[error("cache entry for {project_root} is in use ({ref_count} handle(s) outstanding)")]
    #[diagnostic(
        code(atlas::cache::entry_in_use),
        help("Use force_invalidate to defer removal to the last release, or wait for handles to drop")
    )]
    EntryInUse {
        /// Project root of the busy entry
        project_root: String,
        /// Number of outstanding handles at the time of the call
        ref_count: u32,
    },

    /// Refresh requested for a project that has no live cache entry
    #[error("no cache entry for {project_root}")]
    #[diagnostic(
        code(atlas::cache::entry_not_found),
        help("The entry may have been evicted or marked stale; build it with get_or_build first")
    )]
    EntryNotFound {
        /// Project root that was looked up
        project_root: String,
    },

    /// Graph build failed; retries are suppressed until `retry_at`
    #[error("graph build failed: {message}")]
    #[diagnostic(
        code(atlas::cache::build_failed),
        help("The failure is cached; a new build will be attempted after the retry window elapses")
    )]
    BuildFailed {
        /// Builder error rendered to text
        message: String,
        /// When the build failed
        failed_at: DateTime<Utc>,
        /// Earliest wall-clock time a retry will be attempted
        retry_at: DateTime<Utc>,
    },

    /// Ambient cancellation signal observed
    #[error("operation cancelled")]
    #[diagnostic(code(atlas::cancelled))]
    Cancelled,

    /// Per-operation timeout exceeded
    #[error("{operation} timed out after {elapsed:?}")]
    #[diagnostic(code(atlas::timeout))]
    Timeout {
        /// Operation that exceeded its deadline (e.g. "blast-radius compute")
        operation: String,
        /// Configured deadline that was exceeded
        elapsed: Duration,
    },

    /// I/O failure during hashing or verification
    #[error("hash I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(atlas::hash::io),
        help("Check file permissions and ensure the path exists")
    )]
    HashIo {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g. "walk", "read", "stat")
        operation: String,
    },

    /// Verifier detected divergence between the cache and the filesystem
    #[error("stale data detected: {} stale, {} deleted", stale.len(), deleted.len())]
    #[diagnostic(
        code(atlas::verify::stale_data),
        help("Rebuild or refresh the graph for the affected project")
    )]
    StaleData {
        /// Relative paths whose content no longer matches the manifest
        stale: Vec<String>,
        /// Relative paths that no longer exist on disk
        deleted: Vec<String>,
    },

    /// Verifier could not read or hash one or more files
    #[error("verification failed for {} file(s)", failures.len())]
    #[diagnostic(code(atlas::verify::failed))]
    VerificationFailed {
        /// Per-file failures as (relative path, rendered error)
        failures: Vec<(String, String)>,
    },

    /// Source tree exceeded the eligible-file hard limit
    #[error("source tree has more than {limit} eligible files")]
    #[diagnostic(
        code(atlas::hash::too_many_files),
        help("Narrow the extension set or add skip directories to the hash configuration")
    )]
    TooManyFiles {
        /// Configured hard limit
        limit: usize,
    },

    /// A file exceeded the per-file size limit during verification hashing
    #[error("file {path} is {size} bytes, over the {limit}-byte limit")]
    #[diagnostic(code(atlas::verify::file_too_large))]
    FileTooLarge {
        /// Offending path
        path: String,
        /// Observed size in bytes
        size: u64,
        /// Configured limit in bytes
        limit: u64,
    },

    /// A relative path escaped the project root
    #[error("path {path} escapes the project root")]
    #[diagnostic(
        code(atlas::path_traversal),
        help("Manifest paths must be relative and free of '..' components")
    )]
    PathTraversal {
        /// The offending path
        path: String,
    },

    /// Configuration or validation error
    #[error("configuration error: {message}")]
    #[diagnostic(code(atlas::configuration))]
    Configuration {
        /// Description of the configuration issue
        message: String,
    },
}

impl Error {
    /// Create an I/O error with path context
    #[must_use]
    pub fn hash_io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::HashIo {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create an I/O error without path context
    #[must_use]
    pub fn hash_io_no_path(source: std::io::Error, operation: impl Into<String>) -> Self {
        Self::HashIo {
            source,
            path: None,
            operation: operation.into(),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create a timeout error
    #[must_use]
    pub fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed,
        }
    }

    /// Create a path-traversal error
    #[must_use]
    pub fn path_traversal(path: impl Into<String>) -> Self {
        Self::PathTraversal { path: path.into() }
    }

    /// True if this error is the ambient cancellation signal
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// True if retrying after `retry_at` could succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BuildFailed { .. } | Self::Timeout { .. })
    }
}

/// Result type for atlas operations
pub type Result<T> = std::result::Result<T, Error>;
