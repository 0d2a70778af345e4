//! The sync engine
//!
//! Drives the three cycle kinds over one workspace:
//!
//! * **export-only** — mutation-triggered; export, commit, finalize, push.
//! * **import-only** — file-system-triggered; hash-gated import.
//! * **full sync** — timer-triggered; export, snapshot, commit, pull,
//!   three-way merge, import, snapshot rotation, push.
//!
//! Invariants enforced here: the write lock is held across a whole cycle,
//! finalize only runs after git has the commit, repo identity is validated
//! before anything touches disk, and failures feed exponential backoff.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::backoff::BackoffState;
use super::export::{self, ExportError};
use super::git::{GitAdapter, GitError};
use super::identity::{self, IdentityError};
use super::import::{self, ImportError, ImportResult};
use super::jsonl;
use super::lock::{LockError, SyncLock};
use super::snapshot::{self, SnapshotError};
use super::{
    META_CLONE_ID, META_JSONL_CONTENT_HASH, META_JSONL_FILE_HASH, META_LAST_IMPORT_TIME,
    META_REPO_ID, META_SYNC_BRANCH, META_SYNC_REMOTE,
};
use crate::domain::merge::{self, MergeConflict};
use crate::storage::{format_ts, is_readonly, Config, IndexError, IndexStore, Workspace};

/// Wall-clock budget per cycle kind
pub const EXPORT_CYCLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const IMPORT_CYCLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const FULL_SYNC_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Export(#[from] ExportError),

    #[error(transparent)]
    Import(#[from] ImportError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("Index corruption: {0}. Rebuild the index from issues.jsonl.")]
    Corruption(String),

    #[error(
        "Index is stale: {jsonl} is newer than the index.\n\
         Run 'braid sync --import-only' or start the daemon."
    )]
    StaleIndex { jsonl: PathBuf },

    #[error("Cycle exceeded its {seconds}s budget during {step}")]
    CycleTimeout { step: &'static str, seconds: u64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    /// Fatal errors halt the daemon cycle for operator action instead of
    /// feeding backoff.
    pub fn is_fatal(&self) -> bool {
        match self {
            SyncError::Identity(_) | SyncError::Corruption(_) => true,
            SyncError::Export(ExportError::CatastrophicOverwrite { .. }) => true,
            SyncError::Index(IndexError::Corruption(_)) => true,
            _ => false,
        }
    }
}

/// How a cycle ended
#[derive(Debug)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// JSONL hash matched the stored hash; nothing to import
    SkippedUnchanged,
    /// Backoff window still open; not an error
    SkippedBackoff { until: DateTime<Utc> },
}

/// What a completed cycle did
#[derive(Debug, Default)]
pub struct CycleReport {
    pub exported: usize,
    pub committed: bool,
    pub pushed: bool,
    pub imported: Option<ImportResult>,
    pub pruned: usize,
    pub conflicts: Vec<MergeConflict>,
}

/// Staleness and dirty-state summary for read paths and the RPC surface
#[derive(Debug, serde::Serialize)]
pub struct SyncStatus {
    pub dirty_count: usize,
    pub jsonl_exists: bool,
    /// JSONL changed since the last import (by content hash)
    pub jsonl_newer: bool,
    /// Index has mutations not yet exported
    pub db_newer: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_import_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

/// Everything a cycle needs, handed around explicitly
pub struct SyncEngine {
    workspace: Workspace,
    config: Config,
    store: IndexStore,
    git: GitAdapter,
}

impl SyncEngine {
    /// Opens the engine for a workspace, loading config and index
    pub fn open(workspace: Workspace) -> Result<Self, SyncError> {
        let config = Config::load(&workspace.config_path()).map_err(SyncError::Other)?;
        let store = IndexStore::open(&workspace.db_path())?;
        let git = GitAdapter::new(workspace.root());
        Ok(Self {
            workspace,
            config,
            store,
            git,
        })
    }

    /// Builds an engine from parts (tests use an in-memory store)
    pub fn with_parts(
        workspace: Workspace,
        config: Config,
        store: IndexStore,
        git: GitAdapter,
    ) -> Self {
        Self {
            workspace,
            config,
            store,
            git,
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&mut self) -> &mut IndexStore {
        &mut self.store
    }

    /// The sync branch, if configured; metadata wins over config
    fn sync_branch(&self) -> Result<Option<String>, SyncError> {
        if let Some(branch) = self.store.get_metadata(META_SYNC_BRANCH)? {
            if !branch.is_empty() {
                return Ok(Some(branch));
            }
        }
        Ok(self.config.sync.branch.clone())
    }

    /// The remote to sync against; metadata wins over config
    fn sync_remote(&self) -> Result<String, SyncError> {
        if let Some(remote) = self.store.get_metadata(META_SYNC_REMOTE)? {
            if !remote.is_empty() {
                return Ok(remote);
            }
        }
        Ok(self.config.sync.remote.clone())
    }

    // --- Identity guard ---

    /// Validates (or first-run adopts) the repository fingerprint
    fn ensure_identity(&mut self) -> Result<(), SyncError> {
        let current = identity::compute_repo_id(&self.git, self.workspace.root());
        let stored = self.store.get_metadata(META_REPO_ID)?;

        match stored.as_deref() {
            None | Some("") => {
                if self.store.count_issues()? == 0 {
                    // Fresh index: adopt this repository
                    self.store.set_metadata(META_REPO_ID, &current)?;
                    if self.store.get_metadata(META_CLONE_ID)?.is_none() {
                        self.store.set_metadata(META_CLONE_ID, &clone_id(&self.workspace))?;
                    }
                    Ok(())
                } else {
                    Err(IdentityError::LegacyDatabase.into())
                }
            }
            Some(stored_id) => {
                let override_allowed = identity::override_from_env();
                if stored_id != current && override_allowed {
                    eprintln!(
                        "WARNING: repo fingerprint mismatch overridden: stored {} vs current {}",
                        identity::short(stored_id),
                        identity::short(&current)
                    );
                }
                identity::validate(Some(stored_id), &current, override_allowed)?;
                Ok(())
            }
        }
    }

    // --- Cycles ---

    /// Mutation-triggered cycle: export, commit, finalize, push
    pub fn export_only(&mut self) -> Result<CycleOutcome, SyncError> {
        let deadline = Instant::now() + EXPORT_CYCLE_TIMEOUT;
        let lock = SyncLock::acquire(&self.workspace.lock_path())?;
        self.ensure_identity()?;

        let jsonl_path = self.workspace.jsonl_path();
        let result = export::export(&mut self.store, &jsonl_path, &lock)?;
        check_deadline(deadline, "export", EXPORT_CYCLE_TIMEOUT)?;

        let mut report = CycleReport {
            exported: result.exported_ids.len(),
            ..Default::default()
        };

        if self.config.sync.auto_commit {
            let message = commit_message(result.exported_ids.len());
            match self.sync_branch()? {
                Some(branch) => {
                    let remote = self.sync_remote()?;
                    report.committed = self.git.commit_on_sync_branch(
                        &remote,
                        &branch,
                        &jsonl_path,
                        &message,
                    )?;
                    export::finalize(&mut self.store, &self.workspace, &result)?;
                    if self.config.sync.auto_push && report.committed {
                        // Push failure never rolls back finalize; the commit
                        // is durable and the next cycle retries the push.
                        match self.git.push_sync_branch(&remote, &branch) {
                            Ok(()) => report.pushed = true,
                            Err(e) => eprintln!("warning: push failed: {}", e),
                        }
                    }
                }
                None => {
                    report.committed = self.git.commit(&[&jsonl_path], &message)?;
                    export::finalize(&mut self.store, &self.workspace, &result)?;
                    if self.config.sync.auto_push && report.committed {
                        match self.git.push(Some(&self.sync_remote()?)) {
                            Ok(()) => report.pushed = true,
                            Err(e) => eprintln!("warning: push failed: {}", e),
                        }
                    }
                }
            }
        } else {
            // No commit step configured; nothing to defer behind
            export::finalize(&mut self.store, &self.workspace, &result)?;
        }

        Ok(CycleOutcome::Completed(report))
    }

    /// File-system-triggered cycle: hash-gated import
    pub fn import_only(&mut self, jsonl_path: &Path, pull: bool) -> Result<CycleOutcome, SyncError> {
        self.with_backoff(|engine| engine.import_only_inner(jsonl_path, pull))
    }

    fn import_only_inner(
        &mut self,
        jsonl_path: &Path,
        pull: bool,
    ) -> Result<CycleOutcome, SyncError> {
        let deadline = Instant::now() + IMPORT_CYCLE_TIMEOUT;
        let _lock = SyncLock::acquire(&self.workspace.lock_path())?;
        self.ensure_identity()?;

        if pull && self.git.first_remote()?.is_some() {
            self.git.pull(Some(&self.sync_remote()?))?;
        }
        check_deadline(deadline, "pull", IMPORT_CYCLE_TIMEOUT)?;

        if !jsonl_path.exists() {
            return Ok(CycleOutcome::SkippedUnchanged);
        }

        let current_hash = jsonl::content_hash(jsonl_path).map_err(SyncError::Other)?;
        let hash_key = self
            .workspace
            .metadata_key(META_JSONL_CONTENT_HASH, jsonl_path);
        if self.store.get_metadata(&hash_key)?.as_deref() == Some(current_hash.as_str()) {
            return Ok(CycleOutcome::SkippedUnchanged);
        }

        let pre_count = self.store.count_issues()?;
        let imported = import::import(&mut self.store, jsonl_path)?;
        let post_count = self.store.count_issues()?;
        check_deadline(deadline, "import", IMPORT_CYCLE_TIMEOUT)?;

        self.post_import_validation(pre_count, post_count)?;
        self.record_import_metadata(jsonl_path, &current_hash)?;

        Ok(CycleOutcome::Completed(CycleReport {
            imported: Some(imported),
            ..Default::default()
        }))
    }

    /// Timer-triggered cycle: the whole export/merge/import round trip
    pub fn full_sync(&mut self) -> Result<CycleOutcome, SyncError> {
        self.with_backoff(|engine| engine.full_sync_inner())
    }

    fn full_sync_inner(&mut self) -> Result<CycleOutcome, SyncError> {
        let deadline = Instant::now() + FULL_SYNC_TIMEOUT;
        let lock = SyncLock::acquire(&self.workspace.lock_path())?;
        self.ensure_identity()?;

        let jsonl_path = self.workspace.jsonl_path();
        let mut report = CycleReport::default();

        // Pre-export validation
        let dupes = self.store.find_duplicate_ids()?;
        if !dupes.is_empty() {
            return Err(SyncError::Corruption(format!(
                "duplicate issue ids: {}",
                dupes.join(", ")
            )));
        }
        for orphan in self.store.find_orphan_dependencies()? {
            eprintln!(
                "warning: {} depends on unknown issue {}",
                orphan.issue_id, orphan.depends_on_id
            );
        }

        // Export and snapshot the pre-pull state
        let result = export::export(&mut self.store, &jsonl_path, &lock)?;
        report.exported = result.exported_ids.len();
        snapshot::capture_left(&jsonl_path).map_err(SyncError::Other)?;
        check_deadline(deadline, "export", FULL_SYNC_TIMEOUT)?;

        // Commit, then finalize
        let sync_branch = self.sync_branch()?;
        let remote = self.sync_remote()?;
        if self.config.sync.auto_commit {
            let message = commit_message(result.exported_ids.len());
            report.committed = match &sync_branch {
                Some(branch) => {
                    self.git
                        .commit_on_sync_branch(&remote, branch, &jsonl_path, &message)?
                }
                None => self.git.commit(&[&jsonl_path], &message)?,
            };
        }
        export::finalize(&mut self.store, &self.workspace, &result)?;
        check_deadline(deadline, "commit", FULL_SYNC_TIMEOUT)?;

        // Pull the remote side into the working tree
        let has_remote = self.git.first_remote()?.is_some();
        if has_remote {
            match &sync_branch {
                Some(branch) => {
                    if self.git.fetch_sync_branch(&remote, branch)? {
                        if let Some(content) =
                            self.git
                                .read_jsonl_from_sync_branch(&remote, branch, &jsonl_path)?
                        {
                            jsonl::write_raw_atomic(&jsonl_path, &content)
                                .map_err(SyncError::Other)?;
                        }
                    }
                }
                None => self.git.pull(Some(&remote))?,
            }
        }
        check_deadline(deadline, "pull", FULL_SYNC_TIMEOUT)?;

        // Three-way merge when an ancestor exists; plain import otherwise
        let pre_count = self.store.count_issues()?;
        let base_path = snapshot::base_path(&jsonl_path);
        let imported = if base_path.exists() {
            snapshot::require_snapshots(&jsonl_path)?;
            let base = jsonl::read_records(&base_path).map_err(SyncError::Other)?;
            let left =
                jsonl::read_records(&snapshot::left_path(&jsonl_path)).map_err(SyncError::Other)?;
            let right = jsonl::read_records(&jsonl_path).map_err(SyncError::Other)?;

            let plan = merge::plan(&base, &left, &right);
            for conflict in &plan.conflicts {
                eprintln!(
                    "warning: merge conflict on {} ({:?}): {}",
                    conflict.id, conflict.resolution, conflict.detail
                );
            }
            for (id, reason) in &plan.prunes {
                self.store.prune_to_tombstone(id, reason)?;
                report.pruned += 1;
            }
            for id in &plan.keep_local {
                // Stays dirty so the next export re-publishes the local win
                self.store.mark_dirty(id)?;
            }
            report.conflicts = plan.conflicts;
            import::apply_records(&mut self.store, &plan.imports)?
        } else {
            // First sync: no ancestor, no deletion detection
            import::import(&mut self.store, &jsonl_path)?
        };
        let post_count = self.store.count_issues()?;
        check_deadline(deadline, "merge", FULL_SYNC_TIMEOUT)?;

        self.post_import_validation(pre_count, post_count)?;

        let current_hash = jsonl::content_hash(&jsonl_path).map_err(SyncError::Other)?;
        self.record_import_metadata(&jsonl_path, &current_hash)?;

        snapshot::update_base(&jsonl_path).map_err(SyncError::Other)?;
        snapshot::cleanup(&jsonl_path).map_err(SyncError::Other)?;

        // Push last; by now every local invariant holds, so a failure just
        // records backoff and the next cycle retries.
        if self.config.sync.auto_push && has_remote {
            match &sync_branch {
                Some(branch) => self.git.push_sync_branch(&remote, branch)?,
                None => self.git.push(Some(&remote))?,
            }
            report.pushed = true;
        }

        report.imported = Some(imported);
        Ok(CycleOutcome::Completed(report))
    }

    // --- Read-path staleness gate ---

    /// Compares index and JSONL modification times before a read
    ///
    /// In daemon mode the gate is unnecessary (the daemon keeps both sides
    /// current); non-daemon readers call this and either auto-import or get
    /// told how to recover.
    pub fn ensure_fresh(&mut self, allow_auto_import: bool) -> Result<(), SyncError> {
        let jsonl_path = self.workspace.jsonl_path();
        if !jsonl_path.exists() {
            return Ok(());
        }

        let jsonl_mtime = std::fs::metadata(&jsonl_path)
            .and_then(|m| m.modified())
            .map_err(IndexError::Io)?;
        let db_mtime = match self.store.last_modified()? {
            Some(mtime) => mtime,
            None => return Ok(()),
        };

        if jsonl_mtime <= db_mtime {
            return Ok(());
        }

        // Mtime says stale; the content hash settles it (a bare `touch`
        // must not trigger a re-import)
        let current_hash = jsonl::content_hash(&jsonl_path).map_err(SyncError::Other)?;
        let hash_key = self
            .workspace
            .metadata_key(META_JSONL_CONTENT_HASH, &jsonl_path);
        if self.store.get_metadata(&hash_key)?.as_deref() == Some(current_hash.as_str()) {
            return Ok(());
        }

        if allow_auto_import && !is_readonly() {
            self.import_only(&jsonl_path, false)?;
            Ok(())
        } else {
            Err(SyncError::StaleIndex { jsonl: jsonl_path })
        }
    }

    /// Current dirty/staleness summary
    pub fn status(&mut self) -> Result<SyncStatus, SyncError> {
        let jsonl_path = self.workspace.jsonl_path();
        let dirty_count = self.store.get_dirty_ids()?.len();
        let hash_key = self
            .workspace
            .metadata_key(META_JSONL_CONTENT_HASH, &jsonl_path);
        let stored_hash = self.store.get_metadata(&hash_key)?;
        let import_key = self
            .workspace
            .metadata_key(META_LAST_IMPORT_TIME, &jsonl_path);
        let last_import_time = self.store.get_metadata(&import_key)?;

        let jsonl_exists = jsonl_path.exists();
        let jsonl_newer = if jsonl_exists {
            let current = jsonl::content_hash(&jsonl_path).map_err(SyncError::Other)?;
            stored_hash.as_deref() != Some(current.as_str())
        } else {
            false
        };

        Ok(SyncStatus {
            dirty_count,
            jsonl_exists,
            jsonl_newer,
            db_newer: dirty_count > 0,
            last_import_time,
            content_hash: stored_hash,
        })
    }

    // --- Helpers ---

    /// Runs a cycle under the backoff policy: an open window skips, success
    /// resets, recoverable failure records, fatal failure surfaces untouched.
    fn with_backoff<F>(&mut self, run: F) -> Result<CycleOutcome, SyncError>
    where
        F: FnOnce(&mut Self) -> Result<CycleOutcome, SyncError>,
    {
        let backoff_path = self.workspace.backoff_path();
        let mut backoff = BackoffState::load(&backoff_path);
        if let Some(until) = backoff.active_until(Utc::now()) {
            return Ok(CycleOutcome::SkippedBackoff { until });
        }

        match run(self) {
            Ok(outcome) => {
                if backoff.failure_count > 0 {
                    if let Err(e) = BackoffState::clear(&backoff_path) {
                        eprintln!("warning: failed to clear backoff: {}", e);
                    }
                }
                Ok(outcome)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                backoff.record_failure(&e.to_string());
                if let Err(save_err) = backoff.save(&backoff_path) {
                    eprintln!("warning: failed to save backoff: {}", save_err);
                }
                Err(e)
            }
        }
    }

    fn post_import_validation(&mut self, _pre: usize, _post: usize) -> Result<(), SyncError> {
        let dupes = self.store.find_duplicate_ids()?;
        if !dupes.is_empty() {
            return Err(SyncError::Corruption(format!(
                "duplicate issue ids after import: {}",
                dupes.join(", ")
            )));
        }
        Ok(())
    }

    /// Records hash and time metadata after an import; hash keys fatal,
    /// the rest best-effort
    fn record_import_metadata(
        &mut self,
        jsonl_path: &Path,
        content_hash: &str,
    ) -> Result<(), SyncError> {
        let hash_key = self
            .workspace
            .metadata_key(META_JSONL_CONTENT_HASH, jsonl_path);
        self.store.set_metadata(&hash_key, content_hash)?;

        let file_hash = jsonl::file_hash(jsonl_path).map_err(SyncError::Other)?;
        let file_key = self
            .workspace
            .metadata_key(META_JSONL_FILE_HASH, jsonl_path);
        self.store.set_metadata(&file_key, &file_hash)?;

        let import_key = self
            .workspace
            .metadata_key(META_LAST_IMPORT_TIME, jsonl_path);
        if let Err(e) = self
            .store
            .set_metadata(&import_key, &format_ts(Utc::now()))
        {
            eprintln!("warning: failed to record {}: {}", import_key, e);
        }

        // Index mtime must move past the JSONL mtime we just consumed
        if self.store.is_file_backed() {
            self.store.touch()?;
        }
        Ok(())
    }
}

fn clone_id(workspace: &Workspace) -> String {
    let host = gethostname::gethostname().to_string_lossy().into_owned();
    let root = workspace
        .root()
        .canonicalize()
        .unwrap_or_else(|_| workspace.root().to_path_buf());
    blake3::hash(format!("{}:{}", host, root.display()).as_bytes())
        .to_hex()
        .to_string()
}

fn commit_message(count: usize) -> String {
    if count == 1 {
        "braid: sync 1 issue".to_string()
    } else {
        format!("braid: sync {} issues", count)
    }
}

fn check_deadline(
    deadline: Instant,
    step: &'static str,
    budget: Duration,
) -> Result<(), SyncError> {
    if Instant::now() >= deadline {
        return Err(SyncError::CycleTimeout {
            step,
            seconds: budget.as_secs(),
        });
    }
    Ok(())
}
