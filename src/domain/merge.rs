//! Record-level three-way merge for JSONL issue snapshots
//!
//! Inputs are the three sides of a sync cycle keyed by issue ID:
//! `base` (last successful import), `left` (pre-pull local export) and
//! `right` (post-pull working tree). The output is a plan: records to
//! import, IDs to prune into tombstones, and local records to keep over a
//! conflicting remote edit.
//!
//! Conflict precedence is fixed: tombstone wins over any live edit, then the
//! greater `updated_at`, then left.

use std::collections::{BTreeMap, BTreeSet};

use super::id::IssueId;
use super::issue::Issue;

/// How a conflict was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    KeptLocal,
    TookRemote,
}

/// A surfaced merge conflict; conflicts never abort a cycle
#[derive(Debug, Clone)]
pub struct MergeConflict {
    pub id: IssueId,
    pub resolution: Resolution,
    /// Both sides, for the warning line
    pub detail: String,
}

/// The outcome of a three-way merge
///
/// Applying the plan in sorted-ID order from identical inputs always
/// reproduces the same store state.
#[derive(Debug, Default)]
pub struct MergePlan {
    /// Records to upsert from the remote side
    pub imports: Vec<Issue>,
    /// IDs to prune into tombstones, with the recorded reason
    pub prunes: Vec<(IssueId, String)>,
    /// IDs whose local record survives a conflicting remote edit; they stay
    /// dirty so the next export re-publishes them
    pub keep_local: Vec<IssueId>,
    /// Every conflict encountered, for warning output
    pub conflicts: Vec<MergeConflict>,
}

impl MergePlan {
    pub fn is_empty(&self) -> bool {
        self.imports.is_empty() && self.prunes.is_empty() && self.keep_local.is_empty()
    }
}

/// Computes the merge plan for one JSONL path
pub fn plan(
    base: &BTreeMap<IssueId, Issue>,
    left: &BTreeMap<IssueId, Issue>,
    right: &BTreeMap<IssueId, Issue>,
) -> MergePlan {
    let mut out = MergePlan::default();

    let all_ids: BTreeSet<&IssueId> = base
        .keys()
        .chain(left.keys())
        .chain(right.keys())
        .collect();

    for id in all_ids {
        let b = base.get(id);
        let l = left.get(id);
        let r = right.get(id);

        match (b, l, r) {
            // Remote deleted the record
            (Some(b), Some(l), None) => {
                if l == b {
                    out.prunes
                        .push((id.clone(), "deleted upstream".to_string()));
                } else {
                    // Local edit races a remote delete: the edit survives
                    out.keep_local.push(id.clone());
                    out.conflicts.push(MergeConflict {
                        id: id.clone(),
                        resolution: Resolution::KeptLocal,
                        detail: format!(
                            "remote deleted, local modified at {}",
                            l.updated_at.to_rfc3339()
                        ),
                    });
                }
            }

            // Local deleted the record
            (Some(_), None, Some(_)) => {
                out.prunes
                    .push((id.clone(), "deleted locally".to_string()));
            }

            // Deleted on both sides, or never materialized
            (Some(_), None, None) | (None, None, None) => {}

            // Present on both live sides
            (b, Some(l), Some(r)) => {
                if l == r {
                    continue;
                }
                let l_changed = b.map_or(true, |b| l != b);
                let r_changed = b.map_or(true, |b| r != b);

                if l_changed && r_changed {
                    resolve_conflict(&mut out, id, l, r);
                } else if r_changed {
                    out.imports.push(r.clone());
                } // else: only left changed; it stays and re-exports
            }

            // New upstream
            (None, None, Some(r)) => {
                out.imports.push(r.clone());
            }

            // New locally; will be re-exported
            (None, Some(_), None) => {}
        }
    }

    out
}

/// Applies the fixed precedence: tombstone > greater updated_at > left
fn resolve_conflict(out: &mut MergePlan, id: &IssueId, l: &Issue, r: &Issue) {
    let (resolution, detail) = if l.is_tombstone() && !r.is_tombstone() {
        (
            Resolution::KeptLocal,
            format!(
                "local tombstone vs remote '{}' ({})",
                r.title,
                r.updated_at.to_rfc3339()
            ),
        )
    } else if r.is_tombstone() && !l.is_tombstone() {
        (
            Resolution::TookRemote,
            format!(
                "remote tombstone vs local '{}' ({})",
                l.title,
                l.updated_at.to_rfc3339()
            ),
        )
    } else if r.updated_at > l.updated_at {
        (
            Resolution::TookRemote,
            format!(
                "local '{}' ({}) vs remote '{}' ({})",
                l.title,
                l.updated_at.to_rfc3339(),
                r.title,
                r.updated_at.to_rfc3339()
            ),
        )
    } else {
        (
            Resolution::KeptLocal,
            format!(
                "local '{}' ({}) vs remote '{}' ({})",
                l.title,
                l.updated_at.to_rfc3339(),
                r.title,
                r.updated_at.to_rfc3339()
            ),
        )
    };

    match resolution {
        Resolution::TookRemote => out.imports.push(r.clone()),
        Resolution::KeptLocal => out.keep_local.push(id.clone()),
    }
    out.conflicts.push(MergeConflict {
        id: id.clone(),
        resolution,
        detail,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn make_issue(id: &str, title: &str) -> Issue {
        Issue::new(id.parse().unwrap(), title)
    }

    fn map(issues: Vec<Issue>) -> BTreeMap<IssueId, Issue> {
        issues.into_iter().map(|i| (i.id.clone(), i)).collect()
    }

    #[test]
    fn identical_sides_produce_empty_plan() {
        let a = make_issue("br-aaa", "one");
        let base = map(vec![a.clone()]);
        let plan = plan(&base, &base.clone(), &base.clone());
        assert!(plan.is_empty());
        assert!(plan.conflicts.is_empty());
    }

    #[test]
    fn remote_delete_of_unchanged_record_prunes() {
        let a = make_issue("br-aaa", "one");
        let base = map(vec![a.clone()]);
        let left = map(vec![a.clone()]);
        let right = map(vec![]);

        let plan = plan(&base, &left, &right);
        assert_eq!(plan.prunes.len(), 1);
        assert_eq!(plan.prunes[0].0.as_str(), "br-aaa");
        assert!(plan.conflicts.is_empty());
    }

    #[test]
    fn remote_delete_of_modified_record_keeps_local() {
        let a = make_issue("br-aaa", "one");
        let mut a_edited = a.clone();
        a_edited.title = "one (edited)".to_string();
        a_edited.touch();

        let base = map(vec![a.clone()]);
        let left = map(vec![a_edited]);
        let right = map(vec![]);

        let plan = plan(&base, &left, &right);
        // The local edit survives; no tombstone is created
        assert!(plan.prunes.is_empty());
        assert_eq!(plan.keep_local.len(), 1);
        assert_eq!(plan.conflicts.len(), 1);
        assert_eq!(plan.conflicts[0].resolution, Resolution::KeptLocal);
    }

    #[test]
    fn local_delete_prunes() {
        let a = make_issue("br-aaa", "one");
        let base = map(vec![a.clone()]);
        let left = map(vec![]);
        let right = map(vec![a.clone()]);

        let plan = plan(&base, &left, &right);
        assert_eq!(plan.prunes.len(), 1);
    }

    #[test]
    fn new_remote_record_imports() {
        let a = make_issue("br-aaa", "one");
        let plan = plan(&map(vec![]), &map(vec![]), &map(vec![a.clone()]));
        assert_eq!(plan.imports.len(), 1);
        assert_eq!(plan.imports[0].id, a.id);
    }

    #[test]
    fn new_local_record_is_left_alone() {
        let a = make_issue("br-aaa", "one");
        let plan = plan(&map(vec![]), &map(vec![a]), &map(vec![]));
        assert!(plan.is_empty());
    }

    #[test]
    fn only_remote_changed_imports() {
        let a = make_issue("br-aaa", "one");
        let mut a_remote = a.clone();
        a_remote.title = "one (remote)".to_string();
        a_remote.touch();

        let plan = plan(&map(vec![a.clone()]), &map(vec![a.clone()]), &map(vec![a_remote]));
        assert_eq!(plan.imports.len(), 1);
        assert_eq!(plan.imports[0].title, "one (remote)");
        assert!(plan.conflicts.is_empty());
    }

    #[test]
    fn both_changed_newer_updated_at_wins() {
        let a = make_issue("br-aaa", "old");

        let mut local = a.clone();
        local.title = "local".to_string();
        local.updated_at = a.updated_at + Duration::seconds(10);

        let mut remote = a.clone();
        remote.title = "remote".to_string();
        remote.updated_at = a.updated_at + Duration::seconds(20);

        let plan = plan(&map(vec![a.clone()]), &map(vec![local]), &map(vec![remote]));
        assert_eq!(plan.imports.len(), 1);
        assert_eq!(plan.imports[0].title, "remote");
        assert_eq!(plan.conflicts.len(), 1);
        assert_eq!(plan.conflicts[0].resolution, Resolution::TookRemote);
        // Both values appear in the warning detail
        assert!(plan.conflicts[0].detail.contains("local"));
        assert!(plan.conflicts[0].detail.contains("remote"));
    }

    #[test]
    fn both_changed_tie_keeps_left() {
        let a = make_issue("br-aaa", "old");
        let ts = Utc::now();

        let mut local = a.clone();
        local.title = "local".to_string();
        local.updated_at = ts;

        let mut remote = a.clone();
        remote.title = "remote".to_string();
        remote.updated_at = ts;

        let plan = plan(&map(vec![a]), &map(vec![local]), &map(vec![remote]));
        assert!(plan.imports.is_empty());
        assert_eq!(plan.keep_local.len(), 1);
    }

    #[test]
    fn tombstone_beats_newer_live_edit() {
        let a = make_issue("br-aaa", "old");

        let mut local = a.clone();
        local.mark_tombstone("gone");

        let mut remote = a.clone();
        remote.title = "remote".to_string();
        remote.updated_at = local.updated_at + Duration::seconds(60);

        let plan = plan(&map(vec![a]), &map(vec![local]), &map(vec![remote]));
        // Local tombstone wins even though remote is newer
        assert!(plan.imports.is_empty());
        assert_eq!(plan.keep_local.len(), 1);
        assert_eq!(plan.conflicts[0].resolution, Resolution::KeptLocal);
    }

    #[test]
    fn remote_tombstone_wins() {
        let a = make_issue("br-aaa", "old");

        let mut local = a.clone();
        local.title = "local".to_string();
        local.updated_at = a.updated_at + Duration::seconds(60);

        let mut remote = a.clone();
        remote.mark_tombstone("gone upstream");

        let plan = plan(&map(vec![a]), &map(vec![local]), &map(vec![remote]));
        assert_eq!(plan.imports.len(), 1);
        assert!(plan.imports[0].is_tombstone());
    }

    #[test]
    fn plan_order_is_deterministic() {
        let a = make_issue("br-aaa", "a");
        let b = make_issue("br-bbb", "b");
        let c = make_issue("br-ccc", "c");

        let plan = plan(
            &map(vec![]),
            &map(vec![]),
            &map(vec![c.clone(), a.clone(), b.clone()]),
        );
        let ids: Vec<&str> = plan.imports.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["br-aaa", "br-bbb", "br-ccc"]);
    }
}
