//! # Synchronization Core
//!
//! Keeps three representations of the issue store consistent: the SQLite
//! index, the working-tree JSONL, and the remote-tracked JSONL history.
//!
//! The flow of a full cycle: export → snapshot → commit → finalize → pull →
//! three-way merge → import → snapshot rotation → push. Metadata is only
//! finalized after git has durably committed the export, so a crash at any
//! point leaves a state the next cycle repairs by re-running.

pub mod backoff;
pub mod engine;
pub mod export;
pub mod git;
pub mod identity;
pub mod import;
pub mod jsonl;
pub mod lock;
pub mod snapshot;

pub use backoff::{BackoffState, INITIAL_BACKOFF_SECS, MAX_BACKOFF_SECS};
pub use engine::{CycleOutcome, CycleReport, SyncEngine, SyncError, SyncStatus};
pub use export::{
    export, finalize, ExportError, ExportResult, INCREMENTAL_DIRTY_RATIO, INCREMENTAL_THRESHOLD,
};
pub use git::{GitAdapter, GitError, GIT_COMMAND_TIMEOUT};
pub use identity::{canonicalize_remote_url, compute_repo_id, validate, IdentityError};
pub use import::{apply_records, import, ImportError, ImportResult};
pub use lock::{LockError, LockHolder, SyncLock};
pub use snapshot::SnapshotError;

/// Metadata keys recorded in the index; multi-repo layouts suffix them with
/// `:{repo-key}` via [`crate::storage::Workspace::metadata_key`].
pub const META_JSONL_CONTENT_HASH: &str = "jsonl_content_hash";
pub const META_JSONL_FILE_HASH: &str = "jsonl_file_hash";
pub const META_LAST_IMPORT_TIME: &str = "last_import_time";
pub const META_REPO_ID: &str = "repo_id";
pub const META_CLONE_ID: &str = "clone_id";
pub const META_VERSION: &str = "braid_version";
pub const META_SYNC_BRANCH: &str = "sync.branch";
pub const META_SYNC_REMOTE: &str = "sync.remote";
