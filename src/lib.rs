//! # Braid
//!
//! A git-backed issue tracker for software teams and their agents. The
//! authoritative store is a newline-delimited JSON file under `.braid/`,
//! versioned by git; a SQLite index keeps queries fast and tracks the state
//! the synchronization core needs.
//!
//! ## Architecture
//!
//! The crate is organized into four main modules:
//!
//! - [`domain`] - Issue records, identifiers, the dependency graph, and the
//!   record-level three-way merge
//! - [`storage`] - The SQLite index, workspace layout, and configuration
//! - [`sync`] - Export/import, snapshots, git, locking, backoff, and the
//!   engine that orchestrates sync cycles
//! - [`daemon`] - The background process: watcher, RPC server, timer
//!
//! ## Data Flow
//!
//! ```text
//!   mutation (CLI / RPC)          editor / git pull
//!            │                           │
//!            ▼                           ▼
//!      ┌───────────┐  export      ┌──────────────┐
//!      │  Index DB │─────────────▶│ issues.jsonl │──▶ git commit / push
//!      │  (SQLite) │◀─────────────│  (source of  │◀── git pull
//!      └───────────┘  import /    │    truth)    │
//!            ▲         3-way merge└──────────────┘
//!            │                           │
//!            └────── daemon watches ─────┘
//! ```
//!
//! ## Synchronization invariants
//!
//! - Exports are stable-sorted by ID and written atomically.
//! - Metadata finalization is deferred until git acknowledges the commit.
//! - Tombstones propagate deletions and are never resurrected by import.
//! - A repository fingerprint guards against cross-repo index corruption.

pub mod daemon;
pub mod domain;
pub mod storage;
pub mod sync;

pub use domain::{Dependency, DependencyKind, Issue, IssueId, IssueType, Status};
pub use storage::{Config, IndexStore, Workspace};
pub use sync::SyncEngine;
