//! Deterministic source-tree fingerprinting
//!
//! A fingerprint is the SHA-256 over the lexicographically sorted
//! `"{relpath}:{mtime_ns}:{size}\n"` records of every eligible source file
//! under a project root. Sorting makes the digest independent of directory
//! traversal order, so two walkers on different platforms agree byte for
//! byte.

use atlas_core::config::HashConfig;
use atlas_core::types::{SourceFingerprint, mtime_ns, validate_relpath};
use atlas_core::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// One eligible file observed during the walk
struct FileRecord {
    relpath: String,
    mtime_ns: i64,
    size: u64,
}

/// Compute the `(hex_sha256, file_count)` fingerprint of a project root.
///
/// Pure function of filesystem state and configuration. Symlinks are not
/// followed; directories named in the skip-set are pruned; permission
/// errors are tolerated and summarized at warn level.
///
/// # Errors
///
/// - `Cancelled` when the ambient token fires mid-walk (no partial hash)
/// - `TooManyFiles` when the eligible-file cap is exceeded
/// - `HashIo` for non-permission I/O failures during the walk
pub fn compute_source_fingerprint(
    root: &Path,
    config: &HashConfig,
    token: &CancellationToken,
) -> Result<SourceFingerprint> {
    let mut records: Vec<FileRecord> = Vec::new();
    let mut denied: Vec<String> = Vec::new();

    let walker = walkdir::WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            !(entry.file_type().is_dir()
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| config.skip_dirs.contains(name)))
        });

    for result in walker {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let entry = match result {
            Ok(entry) => entry,
            Err(err) => {
                let permission_denied = err
                    .io_error()
                    .is_some_and(|io| io.kind() == std::io::ErrorKind::PermissionDenied);
                if permission_denied {
                    denied.push(
                        err.path()
                            .map_or_else(|| "<unknown>".to_string(), |p| p.display().to_string()),
                    );
                    continue;
                }
                let path = err.path().map(Path::to_path_buf);
                let source = err
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("walk error"));
                return Err(match path {
                    Some(p) => Error::hash_io(source, p, "walk"),
                    None => Error::hash_io_no_path(source, "walk"),
                });
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }
        let eligible = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| config.extensions.contains(ext));
        if !eligible {
            continue;
        }

        if records.len() >= config.max_files {
            return Err(Error::TooManyFiles {
                limit: config.max_files,
            });
        }

        let meta = entry
            .metadata()
            .map_err(|e| match e.into_io_error() {
                Some(io) => Error::hash_io(io, entry.path(), "stat"),
                None => Error::hash_io_no_path(std::io::Error::other("stat error"), "stat"),
            })?;

        let relpath = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        validate_relpath(&relpath)?;

        records.push(FileRecord {
            relpath,
            mtime_ns: meta.modified().map_or(0, mtime_ns),
            size: meta.len(),
        });
    }

    if !denied.is_empty() {
        warn!(
            root = %root.display(),
            skipped = denied.len(),
            first = %denied[0],
            "skipped unreadable paths during source fingerprint"
        );
    }

    // Mandatory for determinism across walkers and platforms
    records.sort_by(|a, b| a.relpath.cmp(&b.relpath));

    let mut hasher = Sha256::new();
    for record in &records {
        hasher.update(
            format!("{}:{}:{}\n", record.relpath, record.mtime_ns, record.size).as_bytes(),
        );
    }

    Ok(SourceFingerprint {
        hash: hex::encode(hasher.finalize()),
        file_count: records.len(),
    })
}

/// Hash a single file's contents to 64-char lowercase hex.
///
/// # Errors
///
/// Returns `FileTooLarge` when the file exceeds `max_size` and `HashIo`
/// for read failures.
pub fn hash_file_hex(path: &Path, max_size: u64) -> Result<String> {
    let meta = std::fs::symlink_metadata(path).map_err(|e| Error::hash_io(e, path, "stat"))?;
    if meta.len() > max_size {
        return Err(Error::FileTooLarge {
            path: path.display().to_string(),
            size: meta.len(),
            limit: max_size,
        });
    }

    let mut file = File::open(path).map_err(|e| Error::hash_io(e, path, "open"))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::hash_io(e, path, "read"))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Constant-time equality over two hex digests.
///
/// Equal-length inputs are compared without short-circuiting on the first
/// differing byte; unequal lengths return false immediately (length is not
/// secret).
#[must_use]
pub fn constant_time_hex_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}
