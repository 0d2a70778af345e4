//! # Storage Layer
//!
//! The index DB, workspace layout and configuration.
//!
//! | Data | Format | Location |
//! |------|--------|----------|
//! | Issues (source of truth) | JSONL | `.braid/issues.jsonl` |
//! | Index + sync metadata | SQLite | `.braid/braid.db` |
//! | Config | YAML | `.braid/config.yaml` |
//!
//! The index is a cache over the JSONL file plus the state the sync engine
//! needs: per-issue dirty flags and the metadata table holding content
//! hashes, import times and the repository fingerprint.

mod config;
mod index;
mod workspace;

pub use config::{Config, ConfigError, DaemonConfig, SyncConfig};
pub use index::{format_ts, IndexError, IndexResult, IndexStore, SearchFilter, UpsertOutcome};
pub use workspace::{
    is_readonly, sanitize_repo_key, Workspace, WorkspaceError, ENV_ALLOW_REPO_MISMATCH,
    ENV_NO_DAEMON, ENV_READONLY, ENV_SOCKET,
};
