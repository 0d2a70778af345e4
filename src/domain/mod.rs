//! # Domain Layer
//!
//! Core types for the tracker: issue records, identifiers, the dependency
//! graph, and the record-level three-way merge used by the sync engine.

mod id;
mod issue;
mod graph;
pub mod merge;

pub use id::{IdError, IssueId};
pub use issue::{Comment, Dependency, DependencyKind, Issue, IssueType, Status};
pub use graph::{DepGraph, GraphError};
pub use merge::{MergeConflict, MergePlan, Resolution};
