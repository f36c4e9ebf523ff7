//! Source-tree fingerprinting and staleness detection for atlas
//!
//! This crate answers one question for the graph cache: does a cached
//! entry still reflect what is on disk? It does so with three layers:
//! - [`fingerprint`] walks a project root and produces a deterministic
//!   SHA-256 digest over its eligible source files
//! - [`hash_cache`] bounds the cost of repeated fingerprints with a TTL'd
//!   per-root cache
//! - [`staleness`] combines the builder-version check with fingerprint
//!   comparison into a single verdict

pub mod fingerprint;
pub mod hash_cache;
pub mod staleness;

// Re-export main types
pub use fingerprint::{compute_source_fingerprint, constant_time_hex_eq, hash_file_hex};
pub use hash_cache::SourceHashCache;
pub use staleness::{EntryFacts, Staleness, StalenessChecker};
