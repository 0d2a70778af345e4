//! Exponential backoff state for failed sync cycles
//!
//! One state file per `.braid` directory. Failures double the retry delay up
//! to a cap; a single success deletes the file. The daemon consults this
//! before scheduling import and full-sync cycles so a broken remote does not
//! turn into a hot loop.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// First retry delay after a failure
pub const INITIAL_BACKOFF_SECS: i64 = 15;
/// Ceiling for the retry delay
pub const MAX_BACKOFF_SECS: i64 = 3600;

/// Persisted retry state after sync failures
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BackoffState {
    /// Consecutive failures so far
    pub failure_count: u32,

    /// When the most recent failure happened
    pub last_failure_at: Option<DateTime<Utc>>,

    /// Earliest instant the next attempt may run
    pub next_retry_at: Option<DateTime<Utc>>,

    /// Message from the most recent failure
    pub last_error: Option<String>,
}

impl BackoffState {
    /// Loads state from disk; a missing or unreadable file is a clean slate
    pub fn load(path: &Path) -> Self {
        fs::read_to_string(path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default()
    }

    /// Persists the state
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize backoff")?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write backoff state: {}", path.display()))
    }

    /// Records a failure and computes the next allowed retry instant
    pub fn record_failure(&mut self, error: &str) {
        let now = Utc::now();
        self.failure_count += 1;
        self.last_failure_at = Some(now);
        self.last_error = Some(error.to_string());

        let exponent = self.failure_count.saturating_sub(1).min(31);
        let delay = INITIAL_BACKOFF_SECS
            .saturating_mul(1i64 << exponent)
            .min(MAX_BACKOFF_SECS);
        self.next_retry_at = Some(now + Duration::seconds(delay));
    }

    /// Clears all failure state after a success
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Resets and removes the state file
    pub fn clear(path: &Path) -> Result<()> {
        if path.exists() {
            fs::remove_file(path)
                .with_context(|| format!("Failed to remove backoff state: {}", path.display()))?;
        }
        Ok(())
    }

    /// Returns the retry instant if the backoff window is still open
    pub fn active_until(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.next_retry_at.filter(|until| *until > now)
    }

    /// Current delay in seconds, for logging
    pub fn current_delay_secs(&self) -> i64 {
        if self.failure_count == 0 {
            return 0;
        }
        let exponent = self.failure_count.saturating_sub(1).min(31);
        INITIAL_BACKOFF_SECS
            .saturating_mul(1i64 << exponent)
            .min(MAX_BACKOFF_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn fresh_state_is_inactive() {
        let state = BackoffState::default();
        assert!(state.active_until(Utc::now()).is_none());
        assert_eq!(state.current_delay_secs(), 0);
    }

    #[test]
    fn failure_opens_backoff_window() {
        let mut state = BackoffState::default();
        state.record_failure("git pull: connection refused");

        assert_eq!(state.failure_count, 1);
        assert_eq!(state.current_delay_secs(), INITIAL_BACKOFF_SECS);
        assert!(state.active_until(Utc::now()).is_some());
        assert!(state
            .last_error
            .as_deref()
            .unwrap()
            .contains("connection refused"));
    }

    #[test]
    fn delay_grows_monotonically_to_cap() {
        let mut state = BackoffState::default();
        let mut previous = 0;

        for _ in 0..12 {
            state.record_failure("still broken");
            let delay = state.current_delay_secs();
            assert!(delay >= previous);
            assert!(delay <= MAX_BACKOFF_SECS);
            previous = delay;
        }
        assert_eq!(previous, MAX_BACKOFF_SECS);
    }

    #[test]
    fn large_failure_counts_do_not_overflow() {
        let mut state = BackoffState {
            failure_count: u32::MAX - 1,
            ..Default::default()
        };
        state.record_failure("boom");
        assert_eq!(state.current_delay_secs(), MAX_BACKOFF_SECS);
    }

    #[test]
    fn success_resets_to_zero() {
        let mut state = BackoffState::default();
        state.record_failure("x");
        state.record_failure("x");
        state.reset();

        assert_eq!(state.failure_count, 0);
        assert!(state.active_until(Utc::now()).is_none());
        assert!(state.last_error.is_none());
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backoff.json");

        let mut state = BackoffState::default();
        state.record_failure("push rejected");
        state.save(&path).unwrap();

        let loaded = BackoffState::load(&path);
        assert_eq!(loaded.failure_count, 1);
        assert_eq!(loaded.last_error.as_deref(), Some("push rejected"));
    }

    #[test]
    fn missing_file_loads_clean() {
        let dir = TempDir::new().unwrap();
        let state = BackoffState::load(&dir.path().join("nope.json"));
        assert_eq!(state.failure_count, 0);
    }

    #[test]
    fn clear_removes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backoff.json");

        let mut state = BackoffState::default();
        state.record_failure("x");
        state.save(&path).unwrap();

        BackoffState::clear(&path).unwrap();
        assert!(!path.exists());
        // Clearing twice is fine
        BackoffState::clear(&path).unwrap();
    }
}
