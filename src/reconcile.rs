//! Writes files returned by a task back into the local tree.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::debug;

use crate::paths::contained_join;
use crate::protocol::FileRecord;

/// Overwrites each changed file under `root`. Returns the number written.
///
/// A path that would land outside `root` aborts reconciliation.
pub(crate) fn apply(root: &Path, changed: &[FileRecord]) -> Result<usize> {
    for file in changed {
        let target = contained_join(root, &file.path)
            .with_context(|| format!("Refusing to write {}", file.path))?;

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory for {}", file.path))?;
        }
        std::fs::write(&target, &file.content)
            .with_context(|| format!("Failed to write {}", file.path))?;
        debug!("Reconciled {} ({} bytes)", file.path, file.content.len());
    }
    Ok(changed.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::PathError;
    use std::fs;
    use tempfile::tempdir;

    fn record(path: &str, content: &[u8]) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            content: content.to_vec(),
        }
    }

    #[test]
    fn test_apply_overwrites_and_creates() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "old").unwrap();

        let written = apply(
            dir.path(),
            &[
                record("a.txt", b"new"),
                record(".build/test-results/report.xml", b"<ok/>"),
            ],
        )
        .unwrap();

        assert_eq!(written, 2);
        assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), b"new");
        assert_eq!(
            fs::read(dir.path().join(".build/test-results/report.xml")).unwrap(),
            b"<ok/>"
        );
    }

    #[test]
    fn test_apply_rejects_escape() {
        let parent = tempdir().unwrap();
        let root = parent.path().join("root");
        fs::create_dir(&root).unwrap();

        let err = apply(&root, &[record("../evil.txt", b"x")]).unwrap_err();
        assert!(err.downcast_ref::<PathError>().unwrap().is_escape());
        assert!(!parent.path().join("evil.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_apply_refuses_dangling_symlink() {
        let parent = tempdir().unwrap();
        let root = parent.path().join("root");
        fs::create_dir(&root).unwrap();
        std::os::unix::fs::symlink("../outside.txt", root.join("out.txt")).unwrap();

        let err = apply(&root, &[record("out.txt", b"pwned")]).unwrap_err();
        assert!(err.downcast_ref::<PathError>().unwrap().is_escape());
        assert!(!parent.path().join("outside.txt").exists());
    }

    #[test]
    fn test_apply_nothing() {
        let dir = tempdir().unwrap();
        assert_eq!(apply(dir.path(), &[]).unwrap(), 0);
    }
}
