//! JSONL import into the index
//!
//! Line-by-line update-or-insert. A malformed line is logged with its number
//! and skipped; one bad record never fails the batch. Imports are idempotent
//! and never resurrect a stored tombstone.

use std::path::Path;

use thiserror::Error;

use super::jsonl::{self, ParsedLine};
use crate::domain::Issue;
use crate::storage::{IndexError, IndexStore, UpsertOutcome};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("Import read error: {0}")]
    Io(#[from] anyhow::Error),
}

/// Tally of one import pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportResult {
    pub created: usize,
    pub updated: usize,
    /// Records already identical in the index
    pub unchanged: usize,
    /// Live records refused because a tombstone holds their ID
    pub tombstone_protected: usize,
    /// Lines that failed to parse
    pub malformed: usize,
}

impl ImportResult {
    /// Number of records that changed the index
    pub fn applied(&self) -> usize {
        self.created + self.updated
    }

    /// True when a second run would do nothing
    pub fn is_noop(&self) -> bool {
        self.applied() == 0
    }
}

/// Imports a JSONL file into the index
pub fn import(store: &mut IndexStore, jsonl_path: &Path) -> Result<ImportResult, ImportError> {
    let mut result = ImportResult::default();

    for parsed in jsonl::read_lines(jsonl_path)? {
        match parsed {
            ParsedLine::Record(issue) => apply_record(store, &issue, &mut result)?,
            ParsedLine::Malformed { line_no, error } => {
                eprintln!(
                    "warning: {}:{}: skipping malformed record: {}",
                    jsonl_path.display(),
                    line_no,
                    error
                );
                result.malformed += 1;
            }
        }
    }

    Ok(result)
}

/// Applies already-parsed records (the merge plan's import side)
pub fn apply_records(
    store: &mut IndexStore,
    records: &[Issue],
) -> Result<ImportResult, ImportError> {
    let mut result = ImportResult::default();
    for issue in records {
        apply_record(store, issue, &mut result)?;
    }
    Ok(result)
}

fn apply_record(
    store: &mut IndexStore,
    issue: &Issue,
    result: &mut ImportResult,
) -> Result<(), ImportError> {
    match store.upsert_from_import(issue)? {
        UpsertOutcome::Created => result.created += 1,
        UpsertOutcome::Updated => result.updated += 1,
        UpsertOutcome::Unchanged => result.unchanged += 1,
        UpsertOutcome::TombstoneProtected => result.tombstone_protected += 1,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn make_issue(id: &str, title: &str) -> Issue {
        Issue::new(id.parse().unwrap(), title)
    }

    fn write_jsonl(path: &Path, issues: &[Issue]) {
        jsonl::write_issues_atomic(path, issues).unwrap();
    }

    #[test]
    fn import_creates_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("issues.jsonl");
        write_jsonl(&path, &[make_issue("br-aaa", "one"), make_issue("br-bbb", "two")]);

        let mut store = IndexStore::open_memory().unwrap();
        let result = import(&mut store, &path).unwrap();

        assert_eq!(result.created, 2);
        assert_eq!(result.malformed, 0);
        assert_eq!(store.count_issues().unwrap(), 2);
    }

    #[test]
    fn import_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("issues.jsonl");
        write_jsonl(&path, &[make_issue("br-aaa", "one")]);

        let mut store = IndexStore::open_memory().unwrap();
        import(&mut store, &path).unwrap();
        let dirty_before = store.get_dirty_ids().unwrap();

        let second = import(&mut store, &path).unwrap();
        assert!(second.is_noop());
        assert_eq!(second.unchanged, 1);
        assert_eq!(store.get_dirty_ids().unwrap(), dirty_before);
    }

    #[test]
    fn import_never_marks_dirty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("issues.jsonl");
        write_jsonl(&path, &[make_issue("br-aaa", "one")]);

        let mut store = IndexStore::open_memory().unwrap();
        import(&mut store, &path).unwrap();
        assert!(store.get_dirty_ids().unwrap().is_empty());
    }

    #[test]
    fn malformed_lines_are_skipped_with_count() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("issues.jsonl");

        let good = jsonl::record_line(&make_issue("br-aaa", "good")).unwrap();
        fs::write(&path, format!("{}\n{{broken\n{}\n", good, good)).unwrap();

        let mut store = IndexStore::open_memory().unwrap();
        let result = import(&mut store, &path).unwrap();

        assert_eq!(result.malformed, 1);
        // The duplicate good line is unchanged on second sight
        assert_eq!(result.created, 1);
        assert_eq!(result.unchanged, 1);
    }

    #[test]
    fn tombstone_is_applied_as_tombstone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("issues.jsonl");

        let mut tomb = make_issue("br-aaa", "dead");
        tomb.mark_tombstone("removed upstream");
        write_jsonl(&path, &[tomb]);

        let mut store = IndexStore::open_memory().unwrap();
        store.create_issue(&make_issue("br-aaa", "dead")).unwrap();

        let result = import(&mut store, &path).unwrap();
        assert_eq!(result.updated, 1);
        assert!(store
            .get_issue(&"br-aaa".parse().unwrap())
            .unwrap()
            .is_tombstone());
    }

    #[test]
    fn tombstone_never_resurrected_by_import() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("issues.jsonl");
        write_jsonl(&path, &[make_issue("br-aaa", "alive again?")]);

        let mut store = IndexStore::open_memory().unwrap();
        store.create_issue(&make_issue("br-aaa", "old")).unwrap();
        store
            .delete_issue(&"br-aaa".parse().unwrap(), "gone")
            .unwrap();

        let result = import(&mut store, &path).unwrap();
        assert_eq!(result.tombstone_protected, 1);
        assert!(store
            .get_issue(&"br-aaa".parse().unwrap())
            .unwrap()
            .is_tombstone());
    }

    #[test]
    fn updated_records_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("issues.jsonl");

        let mut store = IndexStore::open_memory().unwrap();
        let mut issue = make_issue("br-aaa", "old title");
        store.create_issue(&issue).unwrap();

        issue.title = "new title".to_string();
        issue.labels.push("imported".to_string());
        issue.touch();
        write_jsonl(&path, &[issue]);

        let result = import(&mut store, &path).unwrap();
        assert_eq!(result.updated, 1);

        let loaded = store
            .get_issue_full(&"br-aaa".parse().unwrap())
            .unwrap();
        assert_eq!(loaded.title, "new title");
        assert_eq!(loaded.labels, vec!["imported"]);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut store = IndexStore::open_memory().unwrap();
        let result = import(&mut store, &dir.path().join("missing.jsonl"));
        assert!(result.is_err());
    }
}
