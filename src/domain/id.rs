//! Issue identifiers
//!
//! ID Format: `{prefix}-{7-char-hash}` (e.g., `br-7f2b4c1`), with optional
//! dotted child segments for issues spawned under a parent
//! (e.g., `br-7f2b4c1.1`).
//!
//! The hash is derived from title + creation timestamp, so the same title
//! created at different times produces different IDs. IDs sort
//! lexicographically, which gives the JSONL export its stable ordering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum IdError {
    #[error("Invalid issue ID format: expected '{{prefix}}-{{hash}}', got '{0}'")]
    InvalidIssueId(String),

    #[error("Invalid child sequence in '{0}'")]
    InvalidSequence(String),
}

/// Generates a 7-character hash from title and timestamp
fn generate_hash(title: &str, timestamp: DateTime<Utc>) -> String {
    let input = format!("{}{}", title, timestamp.timestamp_nanos_opt().unwrap_or(0));
    let hash = blake3::hash(input.as_bytes());
    let hex = hash.to_hex();
    hex[..7].to_string()
}

/// Issue ID in the format `{prefix}-{hash}` with optional `.{seq}` segments
///
/// The full string form is kept internally so that comparison and ordering
/// are plain lexicographic string operations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IssueId(String);

impl IssueId {
    /// Creates a new issue ID from prefix, title and timestamp
    pub fn new(prefix: &str, title: &str, timestamp: DateTime<Utc>) -> Self {
        Self(format!("{}-{}", prefix, generate_hash(title, timestamp)))
    }

    /// Returns the full ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the prefix portion (before the first `-`)
    pub fn prefix(&self) -> &str {
        self.0.split('-').next().unwrap_or("")
    }

    /// Creates a child ID under this one with the given sequence number
    pub fn child(&self, sequence: u32) -> Self {
        Self(format!("{}.{}", self.0, sequence))
    }

    /// Returns the parent ID if this is a child ID
    pub fn parent(&self) -> Option<Self> {
        self.0
            .rsplit_once('.')
            .map(|(head, _)| Self(head.to_string()))
    }
}

impl fmt::Display for IssueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for IssueId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        let (prefix, rest) = s
            .split_once('-')
            .ok_or_else(|| IdError::InvalidIssueId(s.to_string()))?;

        if prefix.is_empty()
            || prefix.len() > 8
            || !prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        {
            return Err(IdError::InvalidIssueId(s.to_string()));
        }

        let mut segments = rest.split('.');
        let hash = segments
            .next()
            .ok_or_else(|| IdError::InvalidIssueId(s.to_string()))?;
        if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(IdError::InvalidIssueId(s.to_string()));
        }

        for seg in segments {
            if seg.is_empty() || !seg.chars().all(|c| c.is_ascii_digit()) {
                return Err(IdError::InvalidSequence(s.to_string()));
            }
        }

        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for IssueId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IssueId> for String {
    fn from(id: IssueId) -> Self {
        id.0
    }
}
