//! Containment of relative paths inside a root directory.
//!
//! Used on both ends of the wire: the agent resolves incoming paths against
//! its sandbox root and the client resolves returned files against the local
//! project root. A path that leaves the root after cleaning is rejected.

use std::io;
use std::path::{Component, Path, PathBuf};

/// Errors resolving a relative path against a root.
#[derive(Debug, thiserror::Error)]
pub(crate) enum PathError {
    /// The path is empty or names the root itself.
    #[error("Path is empty")]
    Empty,

    /// The path is absolute or climbs above the root.
    #[error("Path escapes the root: {path}")]
    Escapes { path: String },

    /// Filesystem error while checking the resolved location.
    #[error("Failed to inspect {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl PathError {
    fn escapes(path: impl Into<String>) -> Self {
        Self::Escapes { path: path.into() }
    }

    /// Returns true if the path was rejected for leaving the root.
    #[allow(dead_code)] // Public API for callers
    pub fn is_escape(&self) -> bool {
        matches!(self, Self::Escapes { .. })
    }
}

/// Cleans `relative` lexically, returning the normalized relative path.
///
/// `.` segments are dropped and `..` pops the previous segment. Absolute
/// paths and paths that pop past the start are rejected.
pub(crate) fn clean_relative(relative: &str) -> Result<PathBuf, PathError> {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();

    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(PathError::escapes(relative));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(PathError::escapes(relative));
            }
        }
    }

    if parts.is_empty() {
        return Err(PathError::Empty);
    }

    Ok(parts.iter().collect())
}

/// Joins `relative` onto `root` after cleaning it.
///
/// Besides the lexical check, every existing component of the target is
/// inspected without following links. A symlink must resolve to a location
/// under the canonical root; a dangling one is rejected outright, since a
/// write through it would create its target wherever it points. Nothing is
/// created by this function.
pub(crate) fn contained_join(root: &Path, relative: &str) -> Result<PathBuf, PathError> {
    let cleaned = clean_relative(relative)?;

    let canonical_root = root.canonicalize().map_err(|source| PathError::Io {
        path: root.display().to_string(),
        source,
    })?;

    let mut probe = root.to_path_buf();
    for part in cleaned.components() {
        probe.push(part);
        let meta = match std::fs::symlink_metadata(&probe) {
            Ok(meta) => meta,
            // Nothing below a missing component exists either.
            Err(err) if err.kind() == io::ErrorKind::NotFound => break,
            Err(source) => {
                return Err(PathError::Io {
                    path: probe.display().to_string(),
                    source,
                })
            }
        };
        if !meta.file_type().is_symlink() {
            continue;
        }

        match probe.canonicalize() {
            Ok(resolved) if resolved.starts_with(&canonical_root) => {}
            Ok(_) => return Err(PathError::escapes(relative)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(PathError::escapes(relative))
            }
            Err(source) => {
                return Err(PathError::Io {
                    path: probe.display().to_string(),
                    source,
                })
            }
        }
    }

    Ok(root.join(cleaned))
}

/// Renders a path relative to some root as a `/`-separated wire path.
pub(crate) fn to_wire_path(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
