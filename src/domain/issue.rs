//! Issue domain model
//!
//! Issues are the records tracked in the index DB and exported to the
//! git-versioned JSONL file. Deletion is a soft transition to a tombstone
//! record that propagates to other clones; tombstones are only ever revived
//! through an explicit resurrect.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::id::IssueId;

/// Status of an issue
///
/// `Custom` carries statuses defined by agents on top of the built-in set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(from = "String", into = "String")]
pub enum Status {
    #[default]
    Open,
    InProgress,
    Closed,
    /// Hard terminal marker kept so deletions propagate across clones
    Tombstone,
    Custom(String),
}

impl Status {
    pub fn as_str(&self) -> &str {
        match self {
            Status::Open => "open",
            Status::InProgress => "in_progress",
            Status::Closed => "closed",
            Status::Tombstone => "tombstone",
            Status::Custom(s) => s,
        }
    }

    /// Returns true for the soft terminal state
    pub fn is_closed(&self) -> bool {
        matches!(self, Status::Closed)
    }

    /// Returns true for the hard terminal state
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Status::Tombstone)
    }
}

impl From<String> for Status {
    fn from(s: String) -> Self {
        match s.as_str() {
            "open" => Status::Open,
            "in_progress" => Status::InProgress,
            "closed" => Status::Closed,
            "tombstone" => Status::Tombstone,
            _ => Status::Custom(s),
        }
    }
}

impl From<Status> for String {
    fn from(s: Status) -> Self {
        s.as_str().to_string()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Type of an issue
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(from = "String", into = "String")]
pub enum IssueType {
    #[default]
    Task,
    Bug,
    Feature,
    Chore,
    Epic,
    Custom(String),
}

impl IssueType {
    pub fn as_str(&self) -> &str {
        match self {
            IssueType::Task => "task",
            IssueType::Bug => "bug",
            IssueType::Feature => "feature",
            IssueType::Chore => "chore",
            IssueType::Epic => "epic",
            IssueType::Custom(s) => s,
        }
    }

    /// Returns true if this is one of the built-in types
    pub fn is_builtin(&self) -> bool {
        !matches!(self, IssueType::Custom(_))
    }
}

impl From<String> for IssueType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "task" => IssueType::Task,
            "bug" => IssueType::Bug,
            "feature" => IssueType::Feature,
            "chore" => IssueType::Chore,
            "epic" => IssueType::Epic,
            _ => IssueType::Custom(s),
        }
    }
}

impl From<IssueType> for String {
    fn from(t: IssueType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of dependency between issues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// The target must close before this issue is ready
    #[default]
    Blocks,
    /// Hierarchical containment; also gates readiness
    ParentChild,
    /// Informational link
    RelatesTo,
    /// This issue was discovered while working the target
    DiscoveredFrom,
}

impl DependencyKind {
    /// The kinds that gate ready-work computations by default
    pub fn default_ready_kinds() -> Vec<DependencyKind> {
        vec![DependencyKind::Blocks, DependencyKind::ParentChild]
    }

    pub fn label(&self) -> &'static str {
        match self {
            DependencyKind::Blocks => "blocks",
            DependencyKind::ParentChild => "parent-child",
            DependencyKind::RelatesTo => "relates-to",
            DependencyKind::DiscoveredFrom => "discovered-from",
        }
    }
}

/// A directed dependency edge between two issues
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    /// The issue holding the dependency
    pub issue_id: IssueId,
    /// The issue depended upon
    pub depends_on_id: IssueId,
    /// The kind of edge
    #[serde(rename = "type", default)]
    pub kind: DependencyKind,
}

impl Dependency {
    pub fn new(issue_id: IssueId, depends_on_id: IssueId, kind: DependencyKind) -> Self {
        Self {
            issue_id,
            depends_on_id,
            kind,
        }
    }

    /// Creates a blocking dependency (the default kind)
    pub fn blocks(issue_id: IssueId, depends_on_id: IssueId) -> Self {
        Self::new(issue_id, depends_on_id, DependencyKind::Blocks)
    }
}

/// A comment on an issue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub author: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl Comment {
    pub fn new(author: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            text: text.into(),
            created_at: Utc::now(),
        }
    }
}

/// An issue record
///
/// This struct is both the index-DB row shape and the JSONL record shape;
/// `dependencies`, `labels` and `comments` are populated from their own
/// tables when the issue is serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    /// Unique identifier
    pub id: IssueId,

    /// Human-readable title
    pub title: String,

    /// Longer description
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Current status
    pub status: Status,

    /// Ordered priority; lower is more urgent
    #[serde(default = "default_priority")]
    pub priority: i64,

    /// Kind of work
    #[serde(rename = "type", default)]
    pub issue_type: IssueType,

    /// When the issue was created
    pub created_at: DateTime<Utc>,

    /// When the issue was last modified
    pub updated_at: DateTime<Utc>,

    /// When the issue was closed (if closed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,

    /// Who the issue is assigned to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,

    /// Short reason recorded when the issue became a tombstone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_reason: Option<String>,

    // --- Gate fields (agent coordination) ---
    /// What the issue is gated on (e.g. a timer or another record)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub await_type: Option<String>,

    /// Identifier of the awaited entity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub await_id: Option<String>,

    /// Gate timeout in nanoseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ns: Option<i64>,

    /// Parties waiting on this gate
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub waiters: Vec<String>,

    /// Index-only record; never exported to JSONL
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ephemeral: bool,

    // --- Populated from sibling tables on export ---
    /// Dependencies held by this issue
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,

    /// Labels attached to this issue
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,

    /// Comments on this issue
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<Comment>,
}

fn default_priority() -> i64 {
    2
}

impl Issue {
    /// Creates a new open issue with the given ID and title
    pub fn new(id: IssueId, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            title: title.into(),
            description: String::new(),
            status: Status::Open,
            priority: default_priority(),
            issue_type: IssueType::Task,
            created_at: now,
            updated_at: now,
            closed_at: None,
            assignee: None,
            delete_reason: None,
            await_type: None,
            await_id: None,
            timeout_ns: None,
            waiters: Vec::new(),
            ephemeral: false,
            dependencies: Vec::new(),
            labels: Vec::new(),
            comments: Vec::new(),
        }
    }

    /// Returns true if this record is a tombstone
    pub fn is_tombstone(&self) -> bool {
        self.status.is_tombstone()
    }

    /// Bumps the modification timestamp
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Transitions to closed; a no-op on terminal records
    pub fn close(&mut self) {
        if !self.status.is_closed() && !self.is_tombstone() {
            let now = Utc::now();
            self.status = Status::Closed;
            self.closed_at = Some(now);
            self.updated_at = now;
        }
    }

    /// Transitions to tombstone, recording the reason
    pub fn mark_tombstone(&mut self, reason: impl Into<String>) {
        self.status = Status::Tombstone;
        self.delete_reason = Some(reason.into());
        self.updated_at = Utc::now();
    }

    /// Explicitly revives a tombstone back to open
    ///
    /// This is the only sanctioned tombstone-to-live transition; import and
    /// merge never perform it.
    pub fn resurrect(&mut self) {
        if self.is_tombstone() {
            self.status = Status::Open;
            self.delete_reason = None;
            self.closed_at = None;
            self.updated_at = Utc::now();
        }
    }
}
