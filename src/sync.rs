//! Pushes a local tree into the sandbox root.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::{DirEntry, WalkDir};

use crate::paths::to_wire_path;
use crate::protocol::FileRecord;
use crate::transport::AgentClient;

/// What a push transferred.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SyncReport {
    pub files: usize,
    pub bytes: u64,
}

/// Relative paths of every regular file under `root`, skipping directories
/// whose name is in `exclude`. Symlinks are not followed.
pub(crate) fn list_files(root: &Path, exclude: &[String]) -> Result<Vec<PathBuf>> {
    let is_excluded = |entry: &DirEntry| {
        entry.depth() > 0
            && entry.file_type().is_dir()
            && exclude
                .iter()
                .any(|name| entry.file_name().to_str() == Some(name.as_str()))
    };

    let mut files = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_excluded(e))
    {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("{} is outside {}", entry.path().display(), root.display()))?;
        files.push(relative.to_path_buf());
    }
    Ok(files)
}

/// Writes every file under `root` into the sandbox, in order.
///
/// The first failure aborts the push, naming the file.
pub(crate) async fn push(
    root: &Path,
    exclude: &[String],
    client: &mut AgentClient,
    lease: &str,
) -> Result<SyncReport> {
    let files = list_files(root, exclude)?;
    let mut report = SyncReport::default();

    for relative in files {
        let path = to_wire_path(&relative);
        let content = tokio::fs::read(root.join(&relative))
            .await
            .with_context(|| format!("Failed to read {path}"))?;
        let len = content.len() as u64;

        client
            .write_file(FileRecord { path: path.clone(), content }, lease)
            .await
            .with_context(|| format!("Failed to push {path}"))?;

        debug!("Pushed {} ({} bytes)", path, len);
        report.files += 1;
        report.bytes += len;
    }

    info!("Synced {} files ({} bytes)", report.files, report.bytes);
    Ok(report)
}
