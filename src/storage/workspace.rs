//! Workspace layout and discovery
//!
//! All per-project state lives under `.braid/` at the project root:
//!
//! ```text
//! .braid/
//! ├── braid.db             # SQLite index
//! ├── issues.jsonl         # authoritative issue store (git-versioned)
//! ├── issues.jsonl.base    # last-successful-import snapshot
//! ├── issues.jsonl.left    # pre-pull snapshot (transient)
//! ├── daemon.pid
//! ├── daemon.log
//! ├── daemon.sock          # local RPC socket
//! ├── sync.lock            # advisory write lock
//! ├── backoff.json         # retry state after sync failures
//! ├── config.yaml
//! └── redirect             # optional pointer to a canonical .braid dir
//! ```
//!
//! A `redirect` file containing a path makes every other file resolve inside
//! that directory instead, so several checkouts can share one index.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use thiserror::Error;

/// Environment variable that bypasses the repo-identity mismatch guard.
pub const ENV_ALLOW_REPO_MISMATCH: &str = "BRAID_ALLOW_REPO_MISMATCH";
/// Environment variable that disables daemon auto-start.
pub const ENV_NO_DAEMON: &str = "BRAID_NO_DAEMON";
/// Environment variable that marks the process read-only (skips auto-import).
pub const ENV_READONLY: &str = "BRAID_READONLY";
/// Environment variable that pins the RPC socket path.
pub const ENV_SOCKET: &str = "BRAID_SOCKET";

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Workspace already exists at {0}")]
    AlreadyExists(PathBuf),

    #[error("Not in a braid workspace. Run 'braid init' first.")]
    NotInWorkspace,

    #[error("Broken redirect: {0} does not exist")]
    BrokenRedirect(PathBuf),
}

/// A braid workspace rooted at a project directory
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    /// The resolved `.braid` directory (after following `redirect`)
    braid_dir: PathBuf,
}

impl Workspace {
    /// Opens an existing workspace at the given project root
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let braid_dir = root.join(".braid");

        if !braid_dir.is_dir() {
            return Err(WorkspaceError::NotInWorkspace.into());
        }

        let braid_dir = Self::resolve_redirect(braid_dir)?;
        Ok(Self { root, braid_dir })
    }

    /// Opens the workspace at the current directory or a parent
    pub fn open_current() -> Result<Self> {
        let root = Self::find_root().ok_or(WorkspaceError::NotInWorkspace)?;
        Self::open(root)
    }

    /// Initializes a new workspace at the given project root
    pub fn init(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let braid_dir = root.join(".braid");

        fs::create_dir_all(&braid_dir).with_context(|| {
            format!("Failed to create .braid directory: {}", braid_dir.display())
        })?;

        let gitignore_path = braid_dir.join(".gitignore");
        if !gitignore_path.exists() {
            let gitignore = r#"# The SQLite index is derived from issues.jsonl
braid.db
braid.db-wal
braid.db-shm

# Merge snapshots
issues.jsonl.left
*.jsonl.tmp

# Daemon runtime state
daemon.pid
daemon.log*
daemon.sock
sync.lock
backoff.json
"#;
            fs::write(&gitignore_path, gitignore).with_context(|| {
                format!("Failed to write .gitignore: {}", gitignore_path.display())
            })?;
        }

        Self::open(root)
    }

    /// Walks up from the current directory looking for `.braid/`
    pub fn find_root() -> Option<PathBuf> {
        let mut current = std::env::current_dir().ok()?;

        loop {
            if current.join(".braid").is_dir() {
                return Some(current);
            }
            if !current.pop() {
                return None;
            }
        }
    }

    /// Follows a `redirect` file, if present
    fn resolve_redirect(braid_dir: PathBuf) -> Result<PathBuf> {
        let redirect_path = braid_dir.join("redirect");
        if !redirect_path.is_file() {
            return Ok(braid_dir);
        }

        let target = fs::read_to_string(&redirect_path)
            .with_context(|| format!("Failed to read redirect: {}", redirect_path.display()))?;
        let target = PathBuf::from(target.trim());

        if !target.is_dir() {
            return Err(WorkspaceError::BrokenRedirect(target).into());
        }
        Ok(target)
    }

    /// Returns the project root path
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the resolved `.braid` directory
    pub fn braid_dir(&self) -> &Path {
        &self.braid_dir
    }

    pub fn db_path(&self) -> PathBuf {
        self.braid_dir.join("braid.db")
    }

    /// The primary JSONL path
    pub fn jsonl_path(&self) -> PathBuf {
        self.braid_dir.join("issues.jsonl")
    }

    /// All JSONL paths, primary first; extra `.jsonl` files support
    /// multi-repo layouts. Snapshot and temp files are excluded.
    pub fn jsonl_paths(&self) -> Result<Vec<PathBuf>> {
        let primary = self.jsonl_path();
        let mut paths = vec![primary.clone()];

        for entry in fs::read_dir(&self.braid_dir)
            .with_context(|| format!("Failed to read {}", self.braid_dir.display()))?
        {
            let path = entry?.path();
            if path == primary {
                continue;
            }
            if path.extension().is_some_and(|e| e == "jsonl") {
                paths.push(path);
            }
        }

        paths[1..].sort();
        Ok(paths)
    }

    pub fn pid_path(&self) -> PathBuf {
        self.braid_dir.join("daemon.pid")
    }

    pub fn log_path(&self) -> PathBuf {
        self.braid_dir.join("daemon.log")
    }

    /// The RPC socket path, honoring `BRAID_SOCKET`
    pub fn socket_path(&self) -> PathBuf {
        match std::env::var(ENV_SOCKET) {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => self.braid_dir.join("daemon.sock"),
        }
    }

    pub fn lock_path(&self) -> PathBuf {
        self.braid_dir.join("sync.lock")
    }

    pub fn backoff_path(&self) -> PathBuf {
        self.braid_dir.join("backoff.json")
    }

    pub fn config_path(&self) -> PathBuf {
        self.braid_dir.join("config.yaml")
    }

    /// Builds a metadata key for the given JSONL path
    ///
    /// The primary JSONL uses the bare key; any other file gets a
    /// `:{repo-key}` suffix derived from its stem so multi-repo layouts keep
    /// separate sync state.
    pub fn metadata_key(&self, base: &str, jsonl_path: &Path) -> String {
        if jsonl_path == self.jsonl_path() {
            return base.to_string();
        }

        let stem = jsonl_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string());

        format!("{}:{}", base, sanitize_repo_key(&stem))
    }
}

/// Replaces path-hostile characters in a repo key segment
///
/// ASCII printable characters are allowed, except `:` which collides with
/// the suffix separator (and is illegal in Windows path segments); anything
/// else becomes `_`.
pub fn sanitize_repo_key(segment: &str) -> String {
    segment
        .chars()
        .map(|c| {
            if c == ':' || !(' '..='~').contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect()
}

/// Returns true if the process is marked read-only via `BRAID_READONLY`
pub fn is_readonly() -> bool {
    std::env::var(ENV_READONLY).is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn init_creates_layout() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::init(dir.path()).unwrap();

        assert!(ws.braid_dir().is_dir());
        assert!(ws.braid_dir().join(".gitignore").exists());
        assert_eq!(ws.jsonl_path().file_name().unwrap(), "issues.jsonl");
    }

    #[test]
    fn open_missing_workspace_fails() {
        let dir = TempDir::new().unwrap();
        let result = Workspace::open(dir.path());
        assert!(result.is_err());
    }

    #[test]
    fn redirect_is_followed() {
        let dir = TempDir::new().unwrap();
        let canonical = TempDir::new().unwrap();

        let braid_dir = dir.path().join(".braid");
        fs::create_dir_all(&braid_dir).unwrap();
        fs::write(
            braid_dir.join("redirect"),
            canonical.path().to_string_lossy().as_bytes(),
        )
        .unwrap();

        let ws = Workspace::open(dir.path()).unwrap();
        assert_eq!(ws.braid_dir(), canonical.path());
    }

    #[test]
    fn broken_redirect_fails() {
        let dir = TempDir::new().unwrap();
        let braid_dir = dir.path().join(".braid");
        fs::create_dir_all(&braid_dir).unwrap();
        fs::write(braid_dir.join("redirect"), "/nonexistent/nowhere").unwrap();

        assert!(Workspace::open(dir.path()).is_err());
    }

    #[test]
    fn primary_jsonl_uses_bare_metadata_key() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::init(dir.path()).unwrap();

        let key = ws.metadata_key("jsonl_content_hash", &ws.jsonl_path());
        assert_eq!(key, "jsonl_content_hash");
    }

    #[test]
    fn secondary_jsonl_gets_suffix() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::init(dir.path()).unwrap();

        let other = ws.braid_dir().join("vendor.jsonl");
        let key = ws.metadata_key("jsonl_content_hash", &other);
        assert_eq!(key, "jsonl_content_hash:vendor");
    }

    #[test]
    fn repo_key_sanitization() {
        assert_eq!(sanitize_repo_key("plain"), "plain");
        assert_eq!(sanitize_repo_key("C:repo"), "C_repo");
        assert_eq!(sanitize_repo_key("naïve"), "na_ve");
        assert_eq!(sanitize_repo_key("tab\tname"), "tab_name");
    }

    #[test]
    fn jsonl_paths_lists_extras_sorted() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::init(dir.path()).unwrap();

        fs::write(ws.jsonl_path(), "").unwrap();
        fs::write(ws.braid_dir().join("zeta.jsonl"), "").unwrap();
        fs::write(ws.braid_dir().join("alpha.jsonl"), "").unwrap();
        // Snapshots and temp files must not be listed
        fs::write(ws.braid_dir().join("issues.jsonl.left"), "").unwrap();
        fs::write(ws.braid_dir().join("issues.jsonl.tmp"), "").unwrap();

        let paths = ws.jsonl_paths().unwrap();
        assert_eq!(paths[0], ws.jsonl_path());
        let names: Vec<_> = paths[1..]
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["alpha.jsonl", "zeta.jsonl"]);
    }
}
