//! Shared foundation for the atlas graph-cache workspace
//!
//! This crate carries everything the cache, hashing, and verification
//! crates have in common:
//! - The unified error taxonomy ([`Error`], [`Result`])
//! - Opaque artifact contracts ([`GraphArtifact`], [`Manifest`])
//! - Configuration types with production defaults
//! - The process-wide metrics registry
//!
//! Consumers of the cache engine (graph builders, analyzers, watchers)
//! depend on this crate for the types that cross the callback boundary.

mod error;

pub mod config;
pub mod metrics;
pub mod types;

// Re-export error types at crate root
pub use error::{Error, Result};

// Re-export main types
pub use config::{
    BlastRadiusConfig, CacheConfig, DEFAULT_SKIP_DIRS, DEFAULT_SOURCE_EXTENSIONS, HashConfig,
    VerifyConfig,
};
pub use metrics::{MetricsRegistry, MetricsSnapshot, metrics};
pub use types::{
    GraphArtifact, GraphId, Manifest, ManifestFile, SourceFingerprint, absolutize, mtime_ns,
    now_ms, validate_relpath,
};
