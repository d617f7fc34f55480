//! Conflict-safe filename reservation
//!
//! This module provides functionality for:
//! 1. Deriving a candidate filename from a download URL
//! 2. Incrementing `name__N.ext` suffixes until a free name is found
//! 3. Claiming the free name with an empty placeholder file while holding a lock
//!
//! The filesystem namespace is the registry: there is no in-memory record of
//! claimed names, so a placeholder has to exist before the lock is released.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace};

/// Separator placed between a file stem and its conflict counter.
pub const DEFAULT_SEPARATOR: &str = "__";

/// Name used when a URL has no usable final path segment.
const FALLBACK_FILENAME: &str = "download";

/// Error types for filename resolution
#[derive(Error, Debug)]
pub enum ResolverError {
    #[error("IO error while reserving {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid filename: {0:?}")]
    InvalidFilename(String),
}

/// Result type for resolver operations
pub type ResolverResult<T> = Result<T, ResolverError>;

/// Resolves filename conflicts inside destination directories.
///
/// One lock covers every directory the resolver is asked about. That is coarser
/// than a per-directory lock, which keeps reservations in different label
/// folders serialized but never lets two callers claim the same name.
#[derive(Debug)]
pub struct FilenameResolver {
    separator: String,
    lock: Mutex<()>,
}

impl Default for FilenameResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl FilenameResolver {
    /// Create a resolver using the `__` separator
    pub fn new() -> Self {
        Self::with_separator(DEFAULT_SEPARATOR)
    }

    /// Create a resolver with a custom counter separator
    pub fn with_separator(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
            lock: Mutex::new(()),
        }
    }

    /// The separator placed before conflict counters
    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Reserve a non-colliding file in `directory` based on `proposed`.
    ///
    /// On return the reserved path exists as an empty placeholder. The caller
    /// owns it: either overwrite it with the final content or remove it.
    pub fn resolve(&self, directory: &Path, proposed: &str) -> ResolverResult<PathBuf> {
        if proposed.is_empty() || proposed.contains(['/', '\\']) || proposed == "." || proposed == ".." {
            return Err(ResolverError::InvalidFilename(proposed.to_string()));
        }

        let _guard = self.lock.lock();

        let mut candidate = proposed.to_string();
        loop {
            let path = directory.join(&candidate);
            // create_new fails on an existing entry, so the check and the claim are one syscall
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => {
                    debug!("Reserved {}", path.display());
                    return Ok(path);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    trace!("{} is taken", path.display());
                    candidate = next_candidate(&candidate, &self.separator);
                }
                Err(source) => return Err(ResolverError::Io { path, source }),
            }
        }
    }
}

/// Compute the name that follows `filename` in the conflict sequence.
///
/// `a.jpg` becomes `a__1.jpg`, `a__1.jpg` becomes `a__2.jpg`. A stem whose
/// part after the last separator is not an integer, or is already `u64::MAX`,
/// gets a fresh `__1`.
pub fn next_candidate(filename: &str, separator: &str) -> String {
    let (stem, extension) = split_extension(filename);

    let (base, counter) = match stem.rsplit_once(separator) {
        Some((head, tail)) if !separator.is_empty() => match tail.parse::<u64>() {
            Ok(n) => match n.checked_add(1) {
                Some(next) => (head, next),
                None => (stem, 1),
            },
            Err(_) => (stem, 1),
        },
        _ => (stem, 1),
    };

    format!("{base}{separator}{counter}{extension}")
}

/// Split a filename into stem and extension (extension keeps its dot).
///
/// Leading dots do not start an extension, so `.hidden` has none.
pub fn split_extension(filename: &str) -> (&str, &str) {
    let trimmed = filename.trim_start_matches('.');
    let leading = filename.len() - trimmed.len();

    match trimmed.rfind('.') {
        Some(pos) => filename.split_at(leading + pos),
        None => (filename, ""),
    }
}

/// Derive the proposed filename for a URL: its last path segment without query or fragment.
pub fn filename_from_url(url: &str) -> String {
    let without_fragment = url.split('#').next().unwrap_or_default();
    let without_query = without_fragment.split('?').next().unwrap_or_default();
    let segment = without_query.rsplit('/').next().unwrap_or_default();

    match segment {
        "" | "." | ".." => FALLBACK_FILENAME.to_string(),
        s => s.replace(['\\', ':'], "_"),
    }
}
