//! Merge snapshots for the three-way sync
//!
//! Two sibling files per JSONL:
//!
//! - `<jsonl>.base` — the working tree as of the last successful import; the
//!   common ancestor for the next merge.
//! - `<jsonl>.left` — the working tree captured just before a pull; removed
//!   once the cycle completes.
//!
//! Copies are atomic (temp file + rename) so a crash mid-capture never
//! leaves a half-written ancestor. A merge with a missing snapshot refuses
//! to run: guessing an ancestor risks deleting the wrong side.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Missing {kind} snapshot at {path}; refusing to merge without an ancestor")]
    Missing { kind: &'static str, path: PathBuf },
}

/// Path of the pre-pull snapshot
pub fn left_path(jsonl_path: &Path) -> PathBuf {
    sibling(jsonl_path, "left")
}

/// Path of the last-successful-import snapshot
pub fn base_path(jsonl_path: &Path) -> PathBuf {
    sibling(jsonl_path, "base")
}

fn sibling(jsonl_path: &Path, suffix: &str) -> PathBuf {
    let mut name = jsonl_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push('.');
    name.push_str(suffix);
    jsonl_path.with_file_name(name)
}

/// Copies the current JSONL to `<jsonl>.left`
///
/// A missing JSONL captures an empty snapshot: a brand-new store merges
/// against "nothing existed yet".
pub fn capture_left(jsonl_path: &Path) -> Result<()> {
    copy_atomic(jsonl_path, &left_path(jsonl_path))
}

/// Copies the current JSONL to `<jsonl>.base`
pub fn update_base(jsonl_path: &Path) -> Result<()> {
    copy_atomic(jsonl_path, &base_path(jsonl_path))
}

/// Removes the transient `.left` snapshot, keeping `.base`
pub fn cleanup(jsonl_path: &Path) -> Result<()> {
    let left = left_path(jsonl_path);
    if left.exists() {
        fs::remove_file(&left)
            .with_context(|| format!("Failed to remove snapshot: {}", left.display()))?;
    }
    Ok(())
}

/// Verifies both merge inputs exist before a merge is attempted
pub fn require_snapshots(jsonl_path: &Path) -> Result<(), SnapshotError> {
    let base = base_path(jsonl_path);
    if !base.exists() {
        return Err(SnapshotError::Missing {
            kind: "base",
            path: base,
        });
    }
    let left = left_path(jsonl_path);
    if !left.exists() {
        return Err(SnapshotError::Missing {
            kind: "left",
            path: left,
        });
    }
    Ok(())
}

fn copy_atomic(from: &Path, to: &Path) -> Result<()> {
    let temp = sibling(to, "tmp");

    if from.exists() {
        fs::copy(from, &temp)
            .with_context(|| format!("Failed to copy {} to {}", from.display(), temp.display()))?;
    } else {
        fs::write(&temp, b"")
            .with_context(|| format!("Failed to create empty snapshot: {}", temp.display()))?;
    }

    fs::rename(&temp, to)
        .with_context(|| format!("Failed to rename {} to {}", temp.display(), to.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn snapshot_paths_are_siblings() {
        let jsonl = Path::new("/tmp/.braid/issues.jsonl");
        assert_eq!(
            left_path(jsonl),
            PathBuf::from("/tmp/.braid/issues.jsonl.left")
        );
        assert_eq!(
            base_path(jsonl),
            PathBuf::from("/tmp/.braid/issues.jsonl.base")
        );
    }

    #[test]
    fn capture_and_cleanup() {
        let dir = TempDir::new().unwrap();
        let jsonl = dir.path().join("issues.jsonl");
        fs::write(&jsonl, "{\"id\":\"br-aaa\"}\n").unwrap();

        capture_left(&jsonl).unwrap();
        update_base(&jsonl).unwrap();

        assert_eq!(
            fs::read_to_string(left_path(&jsonl)).unwrap(),
            fs::read_to_string(&jsonl).unwrap()
        );
        require_snapshots(&jsonl).unwrap();

        cleanup(&jsonl).unwrap();
        assert!(!left_path(&jsonl).exists());
        // base survives cleanup
        assert!(base_path(&jsonl).exists());
    }

    #[test]
    fn missing_source_captures_empty() {
        let dir = TempDir::new().unwrap();
        let jsonl = dir.path().join("issues.jsonl");

        capture_left(&jsonl).unwrap();
        assert_eq!(fs::read_to_string(left_path(&jsonl)).unwrap(), "");
    }

    #[test]
    fn merge_refuses_without_base() {
        let dir = TempDir::new().unwrap();
        let jsonl = dir.path().join("issues.jsonl");
        fs::write(&jsonl, "").unwrap();
        capture_left(&jsonl).unwrap();

        let err = require_snapshots(&jsonl).unwrap_err();
        assert!(matches!(err, SnapshotError::Missing { kind: "base", .. }));
    }

    #[test]
    fn merge_refuses_without_left() {
        let dir = TempDir::new().unwrap();
        let jsonl = dir.path().join("issues.jsonl");
        fs::write(&jsonl, "").unwrap();
        update_base(&jsonl).unwrap();

        let err = require_snapshots(&jsonl).unwrap_err();
        assert!(matches!(err, SnapshotError::Missing { kind: "left", .. }));
    }

    #[test]
    fn cleanup_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let jsonl = dir.path().join("issues.jsonl");
        cleanup(&jsonl).unwrap();
        cleanup(&jsonl).unwrap();
    }
}
