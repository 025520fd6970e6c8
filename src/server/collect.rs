//! Selection of files returned after a task.

use glob::{MatchOptions, Pattern};
use std::fs;
use std::path::Path;
use std::time::SystemTime;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::error::AgentError;
use crate::paths::to_wire_path;
use crate::protocol::{CollectSpec, FileRecord};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Compiles the collect patterns, rejecting invalid globs up front.
pub(crate) fn compile(spec: &CollectSpec) -> Result<Vec<Pattern>, AgentError> {
    spec.patterns
        .iter()
        .map(|p| {
            Pattern::new(p).map_err(|e| AgentError::invalid_params(format!("bad pattern {p:?}: {e}")))
        })
        .collect()
}

/// Collects the files under `root` selected by `patterns` and, with
/// `modified_only`, modified strictly after `started`.
///
/// Unreadable entries are skipped with a warning; the task already ran and
/// its result should still be returned.
pub(crate) fn collect_files(
    root: &Path,
    patterns: &[Pattern],
    modified_only: bool,
    started: SystemTime,
) -> Vec<FileRecord> {
    if patterns.is_empty() {
        return Vec::new();
    }

    let mut files = Vec::new();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry while collecting: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let wire = to_wire_path(relative);
        if !patterns.iter().any(|p| p.matches_with(&wire, MATCH_OPTIONS)) {
            continue;
        }

        if modified_only {
            let modified = entry.metadata().ok().and_then(|m| m.modified().ok());
            match modified {
                Some(mtime) if mtime > started => {}
                _ => continue,
            }
        }

        match fs::read(entry.path()) {
            Ok(content) => files.push(FileRecord {
                path: wire,
                content,
            }),
            Err(e) => warn!("Failed to read {} for collection: {}", wire, e),
        }
    }

    debug!("Collected {} file(s)", files.len());
    files
}
