//! Query-scoped staleness verification for atlas
//!
//! The verifier answers a narrower question than full staleness checking:
//! of the files a pending query touches, which still match the manifest?
//! It is built for the hot path — an mtime-first fast path, a short-TTL
//! verification cache to coalesce back-to-back checks, and bounded
//! parallelism so batch latency tracks the slowest file rather than the
//! sum of all files.

pub mod cache;
pub mod strategy;
pub mod verifier;

// Re-export main types
pub use cache::VerificationCache;
pub use strategy::RebuildStrategy;
pub use verifier::{BatchOutcome, ExpectedFile, FileVerdict, VerifyStatus, Verifier};
