//! JSONL export with deferred finalization
//!
//! Export writes the file and reports what it wrote; it never touches
//! metadata. The caller runs [`finalize`] only after git has durably
//! committed the file — if the commit fails, the dirty set and stored hashes
//! still describe the pre-export state and the next cycle simply re-exports.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::jsonl;
use super::lock::SyncLock;
use super::{META_JSONL_CONTENT_HASH, META_JSONL_FILE_HASH, META_LAST_IMPORT_TIME, META_VERSION};
use crate::domain::{Issue, IssueId};
use crate::storage::{format_ts, IndexError, IndexStore, Workspace};

/// Minimum issue count before incremental export is considered
pub const INCREMENTAL_THRESHOLD: usize = 1_000;
/// Maximum dirty fraction for incremental export
pub const INCREMENTAL_DIRTY_RATIO: f64 = 0.20;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(
        "Refusing to export an empty index over a JSONL with {jsonl_count} issue(s).\n\
         This would destroy data. Run 'braid sync --import-only' first."
    )]
    CatastrophicOverwrite { jsonl_count: usize },

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// What an export wrote, for the deferred finalize step
#[derive(Debug, Clone)]
pub struct ExportResult {
    pub path: PathBuf,
    /// IDs this export accounted for; finalize clears exactly these dirty
    /// flags. For incremental exports this is the dirty set, not every ID in
    /// the file.
    pub exported_ids: Vec<IssueId>,
    pub content_hash: String,
    pub file_hash: String,
    pub export_time: DateTime<Utc>,
    /// True when the incremental path was taken
    pub incremental: bool,
}

/// Exports the index to the JSONL path
///
/// The caller holds the sync lock for the whole cycle; taking it as a
/// parameter keeps that contract in the signature.
pub fn export(
    store: &mut IndexStore,
    jsonl_path: &Path,
    _lock: &SyncLock,
) -> Result<ExportResult, ExportError> {
    let issues = store.all_issues_for_export()?;

    // Catastrophic-overwrite guard: an empty index must never flatten a
    // populated file.
    if issues.is_empty() && jsonl_path.exists() {
        let jsonl_count = jsonl::count_records(jsonl_path)?;
        if jsonl_count > 0 {
            return Err(ExportError::CatastrophicOverwrite { jsonl_count });
        }
    }

    let dirty = store.get_dirty_ids()?;

    let use_incremental = jsonl_path.exists()
        && issues.len() >= INCREMENTAL_THRESHOLD
        && (dirty.len() as f64) / (issues.len() as f64) <= INCREMENTAL_DIRTY_RATIO;

    let (exported_ids, incremental) = if use_incremental {
        export_incremental(&issues, &dirty, jsonl_path)?;
        (dirty, true)
    } else {
        let mut ids: Vec<IssueId> = issues.iter().map(|i| i.id.clone()).collect();
        // Dirty flags for issues that no longer exist are accounted too:
        // their absence from the file is the export.
        for id in &dirty {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        jsonl::write_issues_atomic(jsonl_path, &issues)?;
        (ids, false)
    };

    Ok(ExportResult {
        path: jsonl_path.to_path_buf(),
        exported_ids,
        content_hash: jsonl::content_hash(jsonl_path)?,
        file_hash: jsonl::file_hash(jsonl_path)?,
        export_time: Utc::now(),
        incremental,
    })
}

/// Rewrites only the dirty rows, keeping every other line byte-identical
fn export_incremental(
    issues: &[Issue],
    dirty: &[IssueId],
    jsonl_path: &Path,
) -> Result<(), ExportError> {
    // Existing file keyed by ID, lines preserved verbatim
    let mut lines: BTreeMap<IssueId, String> = BTreeMap::new();
    for parsed in jsonl::read_lines(jsonl_path)? {
        if let jsonl::ParsedLine::Record(issue) = parsed {
            let line = jsonl::record_line(&issue)?;
            lines.insert(issue.id.clone(), line);
        }
    }

    let by_id: BTreeMap<&IssueId, &Issue> = issues.iter().map(|i| (&i.id, i)).collect();

    for id in dirty {
        match by_id.get(id) {
            Some(issue) => {
                lines.insert(id.clone(), jsonl::record_line(issue)?);
            }
            // Hard-deleted or turned ephemeral: drop the line
            None => {
                lines.remove(id);
            }
        }
    }

    let ordered: Vec<String> = lines.into_values().collect();
    jsonl::write_lines_atomic(jsonl_path, &ordered)?;
    Ok(())
}

/// Post-commit finalization: clears dirty flags and records hashes
///
/// Hash metadata failures are fatal (a wrong stored hash breaks the skip
/// logic and the crash recovery path); the remaining keys are best-effort.
pub fn finalize(
    store: &mut IndexStore,
    workspace: &Workspace,
    result: &ExportResult,
) -> Result<(), ExportError> {
    store.clear_dirty_ids(&result.exported_ids)?;

    let content_key = workspace.metadata_key(META_JSONL_CONTENT_HASH, &result.path);
    store.set_metadata(&content_key, &result.content_hash)?;

    let file_key = workspace.metadata_key(META_JSONL_FILE_HASH, &result.path);
    store.set_metadata(&file_key, &result.file_hash)?;

    let import_key = workspace.metadata_key(META_LAST_IMPORT_TIME, &result.path);
    if let Err(e) = store.set_metadata(&import_key, &format_ts(result.export_time)) {
        eprintln!("warning: failed to record {}: {}", import_key, e);
    }
    if let Err(e) = store.set_metadata(META_VERSION, env!("CARGO_PKG_VERSION")) {
        eprintln!("warning: failed to record {}: {}", META_VERSION, e);
    }

    // Index mtime must end up >= JSONL mtime or the staleness gate will
    // re-import our own export.
    if store.is_file_backed() {
        store.touch()?;
    }

    Ok(())
}
