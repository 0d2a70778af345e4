//! Property tests for the export/import core
//!
//! Strategies build arbitrary issue sets; the properties pin down the
//! round-trip, idempotence, ordering and tombstone invariants the sync
//! engine relies on.

use std::collections::BTreeMap;

use proptest::prelude::*;
use tempfile::TempDir;

use braid::domain::{Issue, IssueId, IssueType, Status};
use braid::storage::IndexStore;
use braid::sync::jsonl;
use braid::sync::{apply_records, import};

fn issue_id_strategy() -> impl Strategy<Value = IssueId> {
    "[a-z0-9]{1,6}".prop_map(|suffix| format!("br-{}", suffix).parse().unwrap())
}

fn status_strategy() -> impl Strategy<Value = Status> {
    prop_oneof![
        Just(Status::Open),
        Just(Status::InProgress),
        Just(Status::Closed),
        Just(Status::Tombstone),
        // Prefixed so a generated status never collides with a builtin name
        "x_[a-z]{1,8}".prop_map(Status::Custom),
    ]
}

fn issue_type_strategy() -> impl Strategy<Value = IssueType> {
    prop_oneof![
        Just(IssueType::Task),
        Just(IssueType::Bug),
        Just(IssueType::Feature),
        Just(IssueType::Chore),
        Just(IssueType::Epic),
    ]
}

fn issue_strategy() -> impl Strategy<Value = Issue> {
    (
        issue_id_strategy(),
        "[ -~]{1,40}",
        proptest::option::of("[ -~]{0,200}"),
        status_strategy(),
        issue_type_strategy(),
        0i64..5,
        proptest::collection::vec("[a-z]{1,10}", 0..4),
    )
        .prop_map(
            |(id, title, description, status, issue_type, priority, labels)| {
                let mut issue = Issue::new(id, title);
                if let Some(description) = description {
                    issue.description = description;
                }
                if status == Status::Closed {
                    issue.close();
                } else {
                    issue.status = status;
                }
                issue.issue_type = issue_type;
                issue.priority = priority;
                issue.labels = {
                    let mut labels = labels;
                    labels.sort();
                    labels.dedup();
                    labels
                };
                issue
            },
        )
}

/// Unique-by-ID issue sets
fn issue_set_strategy(max: usize) -> impl Strategy<Value = Vec<Issue>> {
    proptest::collection::vec(issue_strategy(), 0..max).prop_map(|issues| {
        let mut by_id: BTreeMap<IssueId, Issue> = BTreeMap::new();
        for issue in issues {
            by_id.entry(issue.id.clone()).or_insert(issue);
        }
        by_id.into_values().collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// import(export(S)) == S restricted to exported fields
    #[test]
    fn export_import_round_trip(issues in issue_set_strategy(12)) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("issues.jsonl");
        jsonl::write_issues_atomic(&path, &issues).unwrap();

        let mut store = IndexStore::open_memory().unwrap();
        let result = import(&mut store, &path).unwrap();
        prop_assert_eq!(result.malformed, 0);

        let restored = store.all_issues_for_export().unwrap();
        let mut expected = issues.clone();
        expected.sort_by(|a, b| a.id.cmp(&b.id));
        prop_assert_eq!(restored, expected);
    }

    /// export; export produces byte-identical JSONL
    #[test]
    fn repeated_export_is_stable(issues in issue_set_strategy(12)) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("issues.jsonl");

        jsonl::write_issues_atomic(&path, &issues).unwrap();
        let first = std::fs::read(&path).unwrap();

        jsonl::write_issues_atomic(&path, &issues).unwrap();
        let second = std::fs::read(&path).unwrap();

        prop_assert_eq!(first, second);
    }

    /// Every emitted JSONL is strictly sorted by id
    #[test]
    fn exported_file_is_sorted(issues in issue_set_strategy(12)) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("issues.jsonl");
        jsonl::write_issues_atomic(&path, &issues).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let ids: Vec<String> = raw
            .lines()
            .map(|line| {
                let value: serde_json::Value = serde_json::from_str(line).unwrap();
                value["id"].as_str().unwrap().to_string()
            })
            .collect();

        for pair in ids.windows(2) {
            prop_assert!(pair[0] < pair[1], "ids out of order: {} >= {}", pair[0], pair[1]);
        }
    }

    /// A second import of the same file changes nothing
    #[test]
    fn import_is_idempotent(issues in issue_set_strategy(12)) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("issues.jsonl");
        jsonl::write_issues_atomic(&path, &issues).unwrap();

        let mut store = IndexStore::open_memory().unwrap();
        import(&mut store, &path).unwrap();
        let second = import(&mut store, &path).unwrap();

        prop_assert!(second.is_noop());
        prop_assert!(store.get_dirty_ids().unwrap().is_empty());
    }

    /// No import sequence revives a tombstone
    #[test]
    fn tombstones_never_resurrected_by_import(
        mut revival in issue_strategy(),
        reason in "[a-z ]{1,20}",
    ) {
        let mut store = IndexStore::open_memory().unwrap();
        let original = Issue::new(revival.id.clone(), "original");
        store.create_issue(&original).unwrap();
        store.delete_issue(&original.id, &reason).unwrap();

        // Whatever the incoming record looks like, a live record never
        // replaces the tombstone
        revival.status = Status::Open;
        apply_records(&mut store, &[revival.clone()]).unwrap();

        prop_assert!(store.get_issue(&original.id).unwrap().is_tombstone());
    }

    /// Content hash is insensitive to trailing blank lines, sensitive to
    /// record changes
    #[test]
    fn content_hash_normalization(issues in issue_set_strategy(6)) {
        prop_assume!(!issues.is_empty());

        let dir = TempDir::new().unwrap();
        let path_a = dir.path().join("a.jsonl");
        let path_b = dir.path().join("b.jsonl");

        jsonl::write_issues_atomic(&path_a, &issues).unwrap();
        let mut padded = std::fs::read_to_string(&path_a).unwrap();
        padded.push_str("\n\n");
        std::fs::write(&path_b, padded).unwrap();

        prop_assert_eq!(
            jsonl::content_hash(&path_a).unwrap(),
            jsonl::content_hash(&path_b).unwrap()
        );
    }
}
