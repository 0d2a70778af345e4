//! SQLite index over the issue store
//!
//! The index sits in `.braid/braid.db` and is the fast query/mutation facade
//! the CLI, RPC server and sync engine all go through. The JSONL file stays
//! the source of truth; the index carries the dirty flags and sync metadata
//! that make incremental export and the defer-finalize protocol work.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;

use crate::domain::{
    Comment, DepGraph, Dependency, DependencyKind, GraphError, Issue, IssueId, IssueType, Status,
};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Index corruption: {0}")]
    Corruption(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type IndexResult<T> = Result<T, IndexError>;

/// Filters for [`IndexStore::search`]
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    /// Restrict to these issue types (empty = all)
    pub types: Vec<IssueType>,
    /// Exclude these statuses
    pub exclude_statuses: Vec<Status>,
    /// Include tombstone records (excluded by default)
    pub include_tombstones: bool,
    /// Restrict to this assignee
    pub assignee: Option<String>,
    /// Maximum number of results
    pub limit: Option<usize>,
}

/// What happened to a record during import
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
    /// The incoming live record collided with a stored tombstone
    TombstoneProtected,
}

const SCHEMA_VERSION: i32 = 1;

const SCHEMA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS issues (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT 'open',
        priority INTEGER NOT NULL DEFAULT 2,
        issue_type TEXT NOT NULL DEFAULT 'task',
        assignee TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        closed_at TEXT,
        delete_reason TEXT,
        await_type TEXT,
        await_id TEXT,
        timeout_ns INTEGER,
        waiters TEXT,
        ephemeral INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_issues_status ON issues(status);
    CREATE INDEX IF NOT EXISTS idx_issues_updated_at ON issues(updated_at);
    CREATE INDEX IF NOT EXISTS idx_issues_type ON issues(issue_type);
    CREATE INDEX IF NOT EXISTS idx_issues_tombstone ON issues(status)
        WHERE status = 'tombstone';
    CREATE INDEX IF NOT EXISTS idx_issues_ephemeral ON issues(ephemeral)
        WHERE ephemeral = 1;

    CREATE TABLE IF NOT EXISTS dependencies (
        issue_id TEXT NOT NULL,
        depends_on_id TEXT NOT NULL,
        kind TEXT NOT NULL DEFAULT 'blocks',
        PRIMARY KEY (issue_id, depends_on_id),
        FOREIGN KEY (issue_id) REFERENCES issues(id) ON DELETE CASCADE
    );
    CREATE INDEX IF NOT EXISTS idx_dependencies_depends_on
        ON dependencies(depends_on_id);

    CREATE TABLE IF NOT EXISTS labels (
        issue_id TEXT NOT NULL,
        label TEXT NOT NULL,
        PRIMARY KEY (issue_id, label),
        FOREIGN KEY (issue_id) REFERENCES issues(id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS comments (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        issue_id TEXT NOT NULL,
        author TEXT NOT NULL,
        text TEXT NOT NULL,
        created_at TEXT NOT NULL,
        FOREIGN KEY (issue_id) REFERENCES issues(id) ON DELETE CASCADE
    );
    CREATE INDEX IF NOT EXISTS idx_comments_issue ON comments(issue_id);

    CREATE TABLE IF NOT EXISTS dirty_issues (
        issue_id TEXT PRIMARY KEY,
        marked_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS metadata (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
";

/// Formats a timestamp the way every column and metadata value stores it
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(s: &str) -> IndexResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| IndexError::Corruption(format!("bad timestamp '{}': {}", s, e)))
}

/// The query/mutation facade over the SQLite index
pub struct IndexStore {
    conn: Connection,
    db_path: Option<PathBuf>,
}

impl IndexStore {
    /// Creates or opens the index at the given path
    pub fn open(db_path: &Path) -> IndexResult<Self> {
        let conn = Connection::open(db_path)?;
        let mut store = Self {
            conn,
            db_path: Some(db_path.to_path_buf()),
        };
        store.init_connection()?;
        Ok(store)
    }

    /// Opens an in-memory index (tests and ephemeral tooling)
    pub fn open_memory() -> IndexResult<Self> {
        let conn = Connection::open_in_memory()?;
        let mut store = Self {
            conn,
            db_path: None,
        };
        store.init_connection()?;
        Ok(store)
    }

    fn init_connection(&mut self) -> IndexResult<()> {
        self.conn
            .execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;

        let version: i32 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;

        if version != SCHEMA_VERSION {
            self.conn.execute_batch(SCHEMA_SQL)?;
            self.conn
                .execute(&format!("PRAGMA user_version = {}", SCHEMA_VERSION), [])?;
        }

        Ok(())
    }

    /// True if the index is backed by a file on disk
    ///
    /// The finalize mtime bump only applies to file-backed stores.
    pub fn is_file_backed(&self) -> bool {
        self.db_path.is_some()
    }

    /// Returns the database path for file-backed stores
    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Modification time of the database file, for the staleness gate
    pub fn last_modified(&self) -> IndexResult<Option<SystemTime>> {
        match &self.db_path {
            Some(path) => Ok(Some(std::fs::metadata(path)?.modified()?)),
            None => Ok(None),
        }
    }

    // --- Issue CRUD ---

    /// Creates a new issue; the issue becomes dirty
    ///
    /// Fails with `Conflict` if the ID exists, including when it exists as a
    /// tombstone — reviving a tombstone takes an explicit [`resurrect`].
    ///
    /// [`resurrect`]: IndexStore::resurrect
    pub fn create_issue(&mut self, issue: &Issue) -> IndexResult<()> {
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM issues WHERE id = ?1",
                params![issue.id.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(status) = existing {
            if Status::from(status).is_tombstone() {
                return Err(IndexError::Conflict(format!(
                    "{} was deleted; run 'braid resurrect {}' to revive it",
                    issue.id, issue.id
                )));
            }
            return Err(IndexError::Conflict(format!("{} already exists", issue.id)));
        }

        let tx = self.conn.transaction()?;
        insert_issue_row(&tx, issue)?;
        insert_collections(&tx, issue)?;
        mark_dirty_tx(&tx, &issue.id)?;
        tx.commit()?;
        Ok(())
    }

    /// Fetches a single issue row (collections left empty)
    pub fn get_issue(&self, id: &IssueId) -> IndexResult<Issue> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM issues WHERE id = ?1", ISSUE_COLUMNS),
                params![id.as_str()],
                issue_from_row,
            )
            .optional()?
            .ok_or_else(|| IndexError::NotFound(id.to_string()))?
    }

    /// Fetches an issue with dependencies, labels and comments populated
    pub fn get_issue_full(&self, id: &IssueId) -> IndexResult<Issue> {
        let mut issue = self.get_issue(id)?;
        issue.dependencies = self.list_dependencies(id)?;
        issue.labels = self.list_labels(id)?;
        issue.comments = self.list_comments(id)?;
        Ok(issue)
    }

    /// Rewrites an issue row; the issue becomes dirty
    ///
    /// A stored tombstone cannot be replaced by a live record this way.
    pub fn update_issue(&mut self, issue: &Issue) -> IndexResult<()> {
        let stored = self.get_issue(&issue.id)?;
        if stored.is_tombstone() && !issue.is_tombstone() {
            return Err(IndexError::Conflict(format!(
                "{} is a tombstone; run 'braid resurrect {}' first",
                issue.id, issue.id
            )));
        }

        let tx = self.conn.transaction()?;
        update_issue_row(&tx, issue)?;
        mark_dirty_tx(&tx, &issue.id)?;
        tx.commit()?;
        Ok(())
    }

    /// Closes an issue, optionally recording a reason as a comment
    pub fn close_issue(&mut self, id: &IssueId, reason: Option<&str>) -> IndexResult<()> {
        let mut issue = self.get_issue(id)?;
        if issue.is_tombstone() {
            return Err(IndexError::Conflict(format!("{} is a tombstone", id)));
        }
        issue.close();
        self.update_issue(&issue)?;
        if let Some(reason) = reason {
            self.add_comment(id, &Comment::new("braid", format!("closed: {}", reason)))?;
        }
        Ok(())
    }

    /// Soft-deletes an issue into a tombstone; the tombstone is dirty so the
    /// deletion propagates on the next export
    pub fn delete_issue(&mut self, id: &IssueId, reason: &str) -> IndexResult<()> {
        let mut issue = self.get_issue(id)?;
        issue.mark_tombstone(reason);

        let tx = self.conn.transaction()?;
        update_issue_row(&tx, &issue)?;
        // Edges from a dead record would hold other issues hostage
        tx.execute(
            "DELETE FROM dependencies WHERE issue_id = ?1 OR depends_on_id = ?1",
            params![id.as_str()],
        )?;
        mark_dirty_tx(&tx, id)?;
        tx.commit()?;
        Ok(())
    }

    /// Explicitly revives a tombstone back to open
    pub fn resurrect(&mut self, id: &IssueId) -> IndexResult<()> {
        let mut issue = self.get_issue(id)?;
        if !issue.is_tombstone() {
            return Err(IndexError::Conflict(format!("{} is not a tombstone", id)));
        }
        issue.resurrect();

        let tx = self.conn.transaction()?;
        update_issue_row(&tx, &issue)?;
        mark_dirty_tx(&tx, id)?;
        tx.commit()?;
        Ok(())
    }

    /// Lists all issues ordered by ID
    pub fn list_issues(&self, include_tombstones: bool) -> IndexResult<Vec<Issue>> {
        let sql = if include_tombstones {
            format!("SELECT {} FROM issues ORDER BY id", ISSUE_COLUMNS)
        } else {
            format!(
                "SELECT {} FROM issues WHERE status != 'tombstone' ORDER BY id",
                ISSUE_COLUMNS
            )
        };
        let mut stmt = self.conn.prepare(&sql)?;
        let issues = stmt
            .query_map([], issue_from_row)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .collect::<IndexResult<Vec<_>>>()?;
        Ok(issues)
    }

    /// Searches issues with filters; tombstones excluded unless asked for
    pub fn search(&self, filter: &SearchFilter) -> IndexResult<Vec<Issue>> {
        let mut sql = format!("SELECT {} FROM issues WHERE 1=1", ISSUE_COLUMNS);
        let mut args: Vec<String> = Vec::new();

        if !filter.include_tombstones {
            sql.push_str(" AND status != 'tombstone'");
        }
        for status in &filter.exclude_statuses {
            args.push(status.as_str().to_string());
            sql.push_str(&format!(" AND status != ?{}", args.len()));
        }
        if !filter.types.is_empty() {
            let placeholders: Vec<String> = filter
                .types
                .iter()
                .map(|t| {
                    args.push(t.as_str().to_string());
                    format!("?{}", args.len())
                })
                .collect();
            sql.push_str(&format!(" AND issue_type IN ({})", placeholders.join(", ")));
        }
        if let Some(assignee) = &filter.assignee {
            args.push(assignee.clone());
            sql.push_str(&format!(" AND assignee = ?{}", args.len()));
        }
        sql.push_str(" ORDER BY priority, id");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let issues = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), issue_from_row)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .collect::<IndexResult<Vec<_>>>()?;
        Ok(issues)
    }

    /// Total number of issue rows, tombstones included
    pub fn count_issues(&self) -> IndexResult<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM issues", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Every exportable issue with collections populated, sorted by ID
    ///
    /// Tombstones are included (deletions must propagate); ephemeral records
    /// never leave the index.
    pub fn all_issues_for_export(&self) -> IndexResult<Vec<Issue>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM issues WHERE ephemeral = 0 ORDER BY id",
            ISSUE_COLUMNS
        ))?;
        let mut issues = stmt
            .query_map([], issue_from_row)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .collect::<IndexResult<Vec<_>>>()?;

        let ids: HashSet<IssueId> = issues.iter().map(|i| i.id.clone()).collect();
        let mut deps = self.batch_get_dependencies(&ids)?;
        let mut labels = self.batch_get_labels(&ids)?;
        let mut comments = self.batch_get_comments(&ids)?;

        for issue in &mut issues {
            issue.dependencies = deps.remove(&issue.id).unwrap_or_default();
            issue.labels = labels.remove(&issue.id).unwrap_or_default();
            issue.comments = comments.remove(&issue.id).unwrap_or_default();
        }
        Ok(issues)
    }

    // --- Dependencies ---

    /// Adds a dependency edge; the holding issue becomes dirty
    ///
    /// Readiness-affecting kinds are cycle-checked against the existing
    /// graph; informational kinds are not.
    pub fn add_dependency(
        &mut self,
        dep: &Dependency,
        ready_kinds: &[DependencyKind],
    ) -> IndexResult<()> {
        // The holding side must exist; the target may be external
        self.get_issue(&dep.issue_id)?;

        if ready_kinds.contains(&dep.kind) && self.issue_exists(&dep.depends_on_id)? {
            let all_deps = self.all_dependencies()?;
            let ids = self.all_ids()?;
            let mut graph = DepGraph::build(ids, &all_deps, ready_kinds)?;
            graph.add_edge(&dep.issue_id, &dep.depends_on_id)?;
        }

        let tx = self.conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO dependencies (issue_id, depends_on_id, kind)
             VALUES (?1, ?2, ?3)",
            params![
                dep.issue_id.as_str(),
                dep.depends_on_id.as_str(),
                dep.kind.label()
            ],
        )?;
        if inserted == 0 {
            return Err(IndexError::Conflict(format!(
                "{} already depends on {}",
                dep.issue_id, dep.depends_on_id
            )));
        }
        touch_issue_row(&tx, &dep.issue_id)?;
        mark_dirty_tx(&tx, &dep.issue_id)?;
        tx.commit()?;
        Ok(())
    }

    /// Removes a dependency edge; returns false if it was absent
    pub fn remove_dependency(
        &mut self,
        issue_id: &IssueId,
        depends_on_id: &IssueId,
    ) -> IndexResult<bool> {
        let tx = self.conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM dependencies WHERE issue_id = ?1 AND depends_on_id = ?2",
            params![issue_id.as_str(), depends_on_id.as_str()],
        )?;
        if removed > 0 {
            touch_issue_row(&tx, issue_id)?;
            mark_dirty_tx(&tx, issue_id)?;
        }
        tx.commit()?;
        Ok(removed > 0)
    }

    /// Dependencies held by one issue
    pub fn list_dependencies(&self, id: &IssueId) -> IndexResult<Vec<Dependency>> {
        let mut stmt = self.conn.prepare(
            "SELECT issue_id, depends_on_id, kind FROM dependencies
             WHERE issue_id = ?1 ORDER BY depends_on_id",
        )?;
        let deps = stmt
            .query_map(params![id.as_str()], dependency_from_row)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .collect::<IndexResult<Vec<_>>>()?;
        Ok(deps)
    }

    /// Dependencies for a set of issues in one pass
    pub fn batch_get_dependencies(
        &self,
        ids: &HashSet<IssueId>,
    ) -> IndexResult<HashMap<IssueId, Vec<Dependency>>> {
        let mut out: HashMap<IssueId, Vec<Dependency>> = HashMap::new();
        for dep in self.all_dependencies()? {
            if ids.contains(&dep.issue_id) {
                out.entry(dep.issue_id.clone()).or_default().push(dep);
            }
        }
        Ok(out)
    }

    fn all_dependencies(&self) -> IndexResult<Vec<Dependency>> {
        let mut stmt = self.conn.prepare(
            "SELECT issue_id, depends_on_id, kind FROM dependencies
             ORDER BY issue_id, depends_on_id",
        )?;
        let deps = stmt
            .query_map([], dependency_from_row)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .collect::<IndexResult<Vec<_>>>()?;
        Ok(deps)
    }

    /// Dependencies whose target is not in the index
    pub fn find_orphan_dependencies(&self) -> IndexResult<Vec<Dependency>> {
        let mut stmt = self.conn.prepare(
            "SELECT d.issue_id, d.depends_on_id, d.kind FROM dependencies d
             LEFT JOIN issues i ON d.depends_on_id = i.id
             WHERE i.id IS NULL
             ORDER BY d.issue_id, d.depends_on_id",
        )?;
        let deps = stmt
            .query_map([], dependency_from_row)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .collect::<IndexResult<Vec<_>>>()?;
        Ok(deps)
    }

    // --- Labels ---

    /// Attaches a label; the issue becomes dirty
    pub fn add_label(&mut self, id: &IssueId, label: &str) -> IndexResult<()> {
        self.get_issue(id)?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO labels (issue_id, label) VALUES (?1, ?2)",
            params![id.as_str(), label],
        )?;
        touch_issue_row(&tx, id)?;
        mark_dirty_tx(&tx, id)?;
        tx.commit()?;
        Ok(())
    }

    /// Detaches a label; returns false if it was absent
    pub fn remove_label(&mut self, id: &IssueId, label: &str) -> IndexResult<bool> {
        let tx = self.conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM labels WHERE issue_id = ?1 AND label = ?2",
            params![id.as_str(), label],
        )?;
        if removed > 0 {
            touch_issue_row(&tx, id)?;
            mark_dirty_tx(&tx, id)?;
        }
        tx.commit()?;
        Ok(removed > 0)
    }

    pub fn list_labels(&self, id: &IssueId) -> IndexResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT label FROM labels WHERE issue_id = ?1 ORDER BY label")?;
        let labels = stmt
            .query_map(params![id.as_str()], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(labels)
    }

    /// Labels for a set of issues in one pass
    pub fn batch_get_labels(
        &self,
        ids: &HashSet<IssueId>,
    ) -> IndexResult<HashMap<IssueId, Vec<String>>> {
        let mut stmt = self
            .conn
            .prepare("SELECT issue_id, label FROM labels ORDER BY issue_id, label")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut out: HashMap<IssueId, Vec<String>> = HashMap::new();
        for (id_str, label) in rows {
            let id: IssueId = id_str
                .parse()
                .map_err(|e| IndexError::Corruption(format!("bad id in labels: {}", e)))?;
            if ids.contains(&id) {
                out.entry(id).or_default().push(label);
            }
        }
        Ok(out)
    }

    // --- Comments ---

    /// Appends a comment; the issue becomes dirty
    pub fn add_comment(&mut self, id: &IssueId, comment: &Comment) -> IndexResult<()> {
        self.get_issue(id)?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO comments (issue_id, author, text, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                id.as_str(),
                comment.author,
                comment.text,
                format_ts(comment.created_at)
            ],
        )?;
        touch_issue_row(&tx, id)?;
        mark_dirty_tx(&tx, id)?;
        tx.commit()?;
        Ok(())
    }

    pub fn list_comments(&self, id: &IssueId) -> IndexResult<Vec<Comment>> {
        let mut stmt = self.conn.prepare(
            "SELECT author, text, created_at FROM comments
             WHERE issue_id = ?1 ORDER BY id",
        )?;
        let comments = stmt
            .query_map(params![id.as_str()], comment_from_row)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .collect::<IndexResult<Vec<_>>>()?;
        Ok(comments)
    }

    /// Comments for a set of issues in one pass
    pub fn batch_get_comments(
        &self,
        ids: &HashSet<IssueId>,
    ) -> IndexResult<HashMap<IssueId, Vec<Comment>>> {
        let mut stmt = self.conn.prepare(
            "SELECT issue_id, author, text, created_at FROM comments ORDER BY issue_id, id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut out: HashMap<IssueId, Vec<Comment>> = HashMap::new();
        for (id_str, author, text, created_at) in rows {
            let id: IssueId = id_str
                .parse()
                .map_err(|e| IndexError::Corruption(format!("bad id in comments: {}", e)))?;
            if ids.contains(&id) {
                out.entry(id).or_default().push(Comment {
                    author,
                    text,
                    created_at: parse_ts(&created_at)?,
                });
            }
        }
        Ok(out)
    }

    // --- Dirty tracking ---

    /// IDs mutated since the last successful export, sorted
    pub fn get_dirty_ids(&self) -> IndexResult<Vec<IssueId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT issue_id FROM dirty_issues ORDER BY issue_id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids.into_iter()
            .map(|s| {
                s.parse()
                    .map_err(|e| IndexError::Corruption(format!("bad dirty id: {}", e)))
            })
            .collect()
    }

    /// Clears dirty flags for exactly the given IDs
    pub fn clear_dirty_ids(&mut self, ids: &[IssueId]) -> IndexResult<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare("DELETE FROM dirty_issues WHERE issue_id = ?1")?;
            for id in ids {
                stmt.execute(params![id.as_str()])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Marks an issue dirty without changing its row
    pub fn mark_dirty(&mut self, id: &IssueId) -> IndexResult<()> {
        mark_dirty_tx(&self.conn, id)
    }

    // --- Metadata ---

    pub fn get_metadata(&self, key: &str) -> IndexResult<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM metadata WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_metadata(&mut self, key: &str, value: &str) -> IndexResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_metadata(&mut self, key: &str) -> IndexResult<()> {
        self.conn
            .execute("DELETE FROM metadata WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// Writes a throwaway metadata row so the database file mtime advances
    /// past the JSONL mtime after finalize
    pub fn touch(&mut self) -> IndexResult<()> {
        self.set_metadata("index_touched_at", &format_ts(Utc::now()))
    }

    // --- Import support ---

    /// Update-or-insert from an imported record
    ///
    /// Imported rows are in sync with the file by definition, so this never
    /// marks anything dirty and never clears an existing dirty flag. A stored
    /// tombstone blocks an incoming live record.
    pub fn upsert_from_import(&mut self, incoming: &Issue) -> IndexResult<UpsertOutcome> {
        let existing = match self.get_issue_full(&incoming.id) {
            Ok(issue) => Some(issue),
            Err(IndexError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        match existing {
            None => {
                let tx = self.conn.transaction()?;
                insert_issue_row(&tx, incoming)?;
                insert_collections(&tx, incoming)?;
                tx.commit()?;
                Ok(UpsertOutcome::Created)
            }
            Some(stored) if stored.is_tombstone() && !incoming.is_tombstone() => {
                Ok(UpsertOutcome::TombstoneProtected)
            }
            Some(stored) if stored == *incoming => Ok(UpsertOutcome::Unchanged),
            Some(_) => {
                let tx = self.conn.transaction()?;
                update_issue_row(&tx, incoming)?;
                tx.execute(
                    "DELETE FROM dependencies WHERE issue_id = ?1",
                    params![incoming.id.as_str()],
                )?;
                tx.execute(
                    "DELETE FROM labels WHERE issue_id = ?1",
                    params![incoming.id.as_str()],
                )?;
                tx.execute(
                    "DELETE FROM comments WHERE issue_id = ?1",
                    params![incoming.id.as_str()],
                )?;
                insert_collections(&tx, incoming)?;
                tx.commit()?;
                Ok(UpsertOutcome::Updated)
            }
        }
    }

    /// Applies a prune from a merge plan: a live record becomes a tombstone
    ///
    /// Unlike [`delete_issue`] the tombstone is NOT marked dirty when the
    /// deletion came from upstream — the remote already has it.
    ///
    /// [`delete_issue`]: IndexStore::delete_issue
    pub fn prune_to_tombstone(&mut self, id: &IssueId, reason: &str) -> IndexResult<()> {
        let mut issue = match self.get_issue(id) {
            Ok(issue) => issue,
            // Already gone locally; nothing to prune
            Err(IndexError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        if issue.is_tombstone() {
            return Ok(());
        }
        issue.mark_tombstone(reason);

        let tx = self.conn.transaction()?;
        update_issue_row(&tx, &issue)?;
        tx.execute(
            "DELETE FROM dependencies WHERE issue_id = ?1 OR depends_on_id = ?1",
            params![id.as_str()],
        )?;
        tx.commit()?;
        Ok(())
    }

    // --- Validation ---

    /// IDs that collide case-insensitively; any hit is index corruption
    pub fn find_duplicate_ids(&self) -> IndexResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT lower(id) FROM issues GROUP BY lower(id) HAVING COUNT(*) > 1",
        )?;
        let dupes = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(dupes)
    }

    /// Distinct non-builtin issue types in use
    pub fn get_custom_types(&self) -> IndexResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT issue_type FROM issues
             WHERE issue_type NOT IN ('task', 'bug', 'feature', 'chore', 'epic')
             ORDER BY issue_type",
        )?;
        let types = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(types)
    }

    // --- Readiness ---

    /// Open issues whose readiness-affecting dependencies are all terminal
    pub fn ready_issues(&self, ready_kinds: &[DependencyKind]) -> IndexResult<Vec<Issue>> {
        let statuses = self.status_map()?;
        let graph = DepGraph::build(statuses.keys().cloned(), &self.all_dependencies()?, ready_kinds)?;
        let ready = graph.ready_issues(&statuses);
        ready.iter().map(|id| self.get_issue(id)).collect()
    }

    /// Open issues blocked by at least one live dependency
    pub fn blocked_issues(&self, ready_kinds: &[DependencyKind]) -> IndexResult<Vec<Issue>> {
        let statuses = self.status_map()?;
        let graph = DepGraph::build(statuses.keys().cloned(), &self.all_dependencies()?, ready_kinds)?;
        let blocked = graph.blocked_issues(&statuses);
        blocked.iter().map(|id| self.get_issue(id)).collect()
    }

    fn status_map(&self) -> IndexResult<HashMap<IssueId, Status>> {
        let mut stmt = self.conn.prepare("SELECT id, status FROM issues")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut map = HashMap::new();
        for (id, status) in rows {
            let id: IssueId = id
                .parse()
                .map_err(|e| IndexError::Corruption(format!("bad id in issues: {}", e)))?;
            map.insert(id, Status::from(status));
        }
        Ok(map)
    }

    fn issue_exists(&self, id: &IssueId) -> IndexResult<bool> {
        let exists: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM issues WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    fn all_ids(&self) -> IndexResult<Vec<IssueId>> {
        let mut stmt = self.conn.prepare("SELECT id FROM issues")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids.into_iter()
            .map(|s| {
                s.parse()
                    .map_err(|e| IndexError::Corruption(format!("bad id in issues: {}", e)))
            })
            .collect()
    }
}

const ISSUE_COLUMNS: &str = "id, title, description, status, priority, issue_type, assignee, \
     created_at, updated_at, closed_at, delete_reason, await_type, await_id, timeout_ns, \
     waiters, ephemeral";

fn issue_from_row(row: &Row<'_>) -> rusqlite::Result<IndexResult<Issue>> {
    // Two-layer Result: rusqlite's for column access, ours for value parsing
    let id: String = row.get(0)?;
    let title: String = row.get(1)?;
    let description: String = row.get(2)?;
    let status: String = row.get(3)?;
    let priority: i64 = row.get(4)?;
    let issue_type: String = row.get(5)?;
    let assignee: Option<String> = row.get(6)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;
    let closed_at: Option<String> = row.get(9)?;
    let delete_reason: Option<String> = row.get(10)?;
    let await_type: Option<String> = row.get(11)?;
    let await_id: Option<String> = row.get(12)?;
    let timeout_ns: Option<i64> = row.get(13)?;
    let waiters: Option<String> = row.get(14)?;
    let ephemeral: bool = row.get(15)?;

    Ok((|| {
        Ok(Issue {
            id: id
                .parse()
                .map_err(|e| IndexError::Corruption(format!("bad id '{}': {}", id, e)))?,
            title,
            description,
            status: Status::from(status),
            priority,
            issue_type: IssueType::from(issue_type),
            assignee,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
            closed_at: closed_at.as_deref().map(parse_ts).transpose()?,
            delete_reason,
            await_type,
            await_id,
            timeout_ns,
            waiters: match waiters {
                Some(json) => serde_json::from_str(&json)
                    .map_err(|e| IndexError::Corruption(format!("bad waiters: {}", e)))?,
                None => Vec::new(),
            },
            ephemeral,
            dependencies: Vec::new(),
            labels: Vec::new(),
            comments: Vec::new(),
        })
    })())
}

fn dependency_from_row(row: &Row<'_>) -> rusqlite::Result<IndexResult<Dependency>> {
    let issue_id: String = row.get(0)?;
    let depends_on_id: String = row.get(1)?;
    let kind: String = row.get(2)?;

    Ok((|| {
        Ok(Dependency {
            issue_id: issue_id
                .parse()
                .map_err(|e| IndexError::Corruption(format!("bad dep id: {}", e)))?,
            depends_on_id: depends_on_id
                .parse()
                .map_err(|e| IndexError::Corruption(format!("bad dep target: {}", e)))?,
            kind: kind_from_label(&kind)?,
        })
    })())
}

fn comment_from_row(row: &Row<'_>) -> rusqlite::Result<IndexResult<Comment>> {
    let author: String = row.get(0)?;
    let text: String = row.get(1)?;
    let created_at: String = row.get(2)?;

    Ok((|| {
        Ok(Comment {
            author,
            text,
            created_at: parse_ts(&created_at)?,
        })
    })())
}

fn kind_from_label(label: &str) -> IndexResult<DependencyKind> {
    match label {
        "blocks" => Ok(DependencyKind::Blocks),
        "parent-child" => Ok(DependencyKind::ParentChild),
        "relates-to" => Ok(DependencyKind::RelatesTo),
        "discovered-from" => Ok(DependencyKind::DiscoveredFrom),
        other => Err(IndexError::Corruption(format!(
            "unknown dependency kind '{}'",
            other
        ))),
    }
}

fn insert_issue_row(conn: &Connection, issue: &Issue) -> IndexResult<()> {
    let waiters = waiters_json(issue)?;
    conn.execute(
        "INSERT INTO issues (id, title, description, status, priority, issue_type, assignee,
             created_at, updated_at, closed_at, delete_reason, await_type, await_id, timeout_ns,
             waiters, ephemeral)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            issue.id.as_str(),
            issue.title,
            issue.description,
            issue.status.as_str(),
            issue.priority,
            issue.issue_type.as_str(),
            issue.assignee,
            format_ts(issue.created_at),
            format_ts(issue.updated_at),
            issue.closed_at.map(format_ts),
            issue.delete_reason,
            issue.await_type,
            issue.await_id,
            issue.timeout_ns,
            waiters,
            issue.ephemeral,
        ],
    )?;
    Ok(())
}

fn update_issue_row(conn: &Connection, issue: &Issue) -> IndexResult<()> {
    let waiters = waiters_json(issue)?;
    let updated = conn.execute(
        "UPDATE issues SET title = ?2, description = ?3, status = ?4, priority = ?5,
             issue_type = ?6, assignee = ?7, created_at = ?8, updated_at = ?9, closed_at = ?10,
             delete_reason = ?11, await_type = ?12, await_id = ?13, timeout_ns = ?14,
             waiters = ?15, ephemeral = ?16
         WHERE id = ?1",
        params![
            issue.id.as_str(),
            issue.title,
            issue.description,
            issue.status.as_str(),
            issue.priority,
            issue.issue_type.as_str(),
            issue.assignee,
            format_ts(issue.created_at),
            format_ts(issue.updated_at),
            issue.closed_at.map(format_ts),
            issue.delete_reason,
            issue.await_type,
            issue.await_id,
            issue.timeout_ns,
            waiters,
            issue.ephemeral,
        ],
    )?;
    if updated == 0 {
        return Err(IndexError::NotFound(issue.id.to_string()));
    }
    Ok(())
}

fn waiters_json(issue: &Issue) -> IndexResult<Option<String>> {
    if issue.waiters.is_empty() {
        return Ok(None);
    }
    serde_json::to_string(&issue.waiters)
        .map(Some)
        .map_err(|e| IndexError::Corruption(format!("waiters: {}", e)))
}

fn insert_collections(conn: &Connection, issue: &Issue) -> IndexResult<()> {
    for dep in &issue.dependencies {
        conn.execute(
            "INSERT OR IGNORE INTO dependencies (issue_id, depends_on_id, kind)
             VALUES (?1, ?2, ?3)",
            params![
                dep.issue_id.as_str(),
                dep.depends_on_id.as_str(),
                dep.kind.label()
            ],
        )?;
    }
    for label in &issue.labels {
        conn.execute(
            "INSERT OR IGNORE INTO labels (issue_id, label) VALUES (?1, ?2)",
            params![issue.id.as_str(), label],
        )?;
    }
    for comment in &issue.comments {
        conn.execute(
            "INSERT INTO comments (issue_id, author, text, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                issue.id.as_str(),
                comment.author,
                comment.text,
                format_ts(comment.created_at)
            ],
        )?;
    }
    Ok(())
}

fn touch_issue_row(conn: &Connection, id: &IssueId) -> IndexResult<()> {
    conn.execute(
        "UPDATE issues SET updated_at = ?2 WHERE id = ?1",
        params![id.as_str(), format_ts(Utc::now())],
    )?;
    Ok(())
}

fn mark_dirty_tx(conn: &Connection, id: &IssueId) -> IndexResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO dirty_issues (issue_id, marked_at) VALUES (?1, ?2)",
        params![id.as_str(), format_ts(Utc::now())],
    )?;
    Ok(())
}
