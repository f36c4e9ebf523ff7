//! Shared types for graphs, manifests, and fingerprints

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Opaque parsed artifact representing a project's code structure.
///
/// The cache never inspects graph contents; it only needs coarse size
/// information for its memory-pressure heuristic.
pub trait GraphArtifact: Send + Sync + 'static {
    /// Number of nodes in the graph
    fn node_count(&self) -> usize;
    /// Number of edges in the graph
    fn edge_count(&self) -> usize;
}

/// A graph identifier (SHA-256 hash of the canonical project root, as hex)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphId(String);

impl GraphId {
    /// Derive the identifier for a project root.
    ///
    /// The root is canonicalized when it exists so that `/p`, `/p/.` and
    /// symlinked spellings map to the same entry; otherwise the absolute
    /// form is used as-is.
    #[must_use]
    pub fn for_project_root(root: &Path) -> Self {
        let canonical = root
            .canonicalize()
            .unwrap_or_else(|_| root.to_path_buf());
        let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
        Self(hex::encode(digest))
    }

    /// Create from a hex string (validation)
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not 64 lowercase hex characters.
    pub fn from_hex(hex: impl Into<String>) -> Result<Self> {
        let s = hex.into();
        if s.len() != 64 {
            return Err(Error::configuration(format!(
                "GraphId must be 64 hex characters, got {}",
                s.len()
            )));
        }
        if !s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            return Err(Error::configuration(
                "GraphId must contain only lowercase hex digits",
            ));
        }
        Ok(Self(s))
    }

    /// Get the hex representation
    #[must_use]
    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for GraphId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-file metadata captured when a graph is built
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    /// SHA-256 of file contents, 64-char lowercase hex
    pub hash: String,
    /// File size in bytes
    pub size: u64,
    /// Modification time in nanoseconds since the epoch
    pub mtime_ns: i64,
}

/// Per-file snapshot of a project at build time, used for change detection.
///
/// Built atomically with the graph and immutable afterwards. Paths are
/// relative to the project root; ordering is deterministic via `BTreeMap`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Map of relative path to file metadata
    pub files: BTreeMap<String, ManifestFile>,
    /// True if the builder could not capture every file
    pub incomplete: bool,
    /// Builder-reported capture errors, if any
    pub errors: Vec<String>,
}

impl Manifest {
    /// Create an empty, complete manifest
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file record, validating path hygiene.
    ///
    /// # Errors
    ///
    /// Returns `PathTraversal` if the path is absolute or contains `..`
    /// components.
    pub fn insert(&mut self, relpath: impl Into<String>, file: ManifestFile) -> Result<()> {
        let relpath = relpath.into();
        validate_relpath(&relpath)?;
        self.files.insert(relpath, file);
        Ok(())
    }

    /// Number of files captured
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// True if no files were captured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Validate that a manifest path is relative and stays inside the root.
///
/// # Errors
///
/// Returns `PathTraversal` for absolute paths and paths containing `..`.
pub fn validate_relpath(relpath: &str) -> Result<()> {
    let path = Path::new(relpath);
    if path.is_absolute() {
        return Err(Error::path_traversal(relpath));
    }
    for component in path.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::path_traversal(relpath));
            }
            Component::Normal(_) | Component::CurDir => {}
        }
    }
    Ok(())
}

/// Deterministic fingerprint of a source tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFingerprint {
    /// SHA-256 over the sorted `(relpath, mtime_ns, size)` records, hex
    pub hash: String,
    /// Number of eligible files that contributed to the hash
    pub file_count: usize,
}

/// Milliseconds since the Unix epoch, saturating at zero for pre-epoch clocks
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Nanoseconds since the Unix epoch for a filesystem timestamp
#[must_use]
pub fn mtime_ns(mtime: SystemTime) -> i64 {
    match mtime.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
        // Pre-epoch mtimes happen on broken archives; represent them as negative
        Err(e) => -i64::try_from(e.duration().as_nanos()).unwrap_or(i64::MAX),
    }
}

/// Make a path absolute without requiring it to exist
#[must_use]
pub fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    }
}
