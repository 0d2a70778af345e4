//! Git operations via the host `git` binary
//!
//! The engine never parses the object database; everything goes through
//! porcelain (and a little plumbing for the sync branch) with a bounded
//! timeout per command. Non-zero exits surface as [`GitError`] carrying
//! stderr.
//!
//! Sync-branch mode routes JSONL commits to a dedicated branch through a
//! temporary index file, so the working branch and working index are never
//! touched. Divergence with the remote branch is absorbed by committing with
//! both tips as parents; the record-level merge has already reconciled the
//! file contents by then.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Ceiling for any single git invocation
pub const GIT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git {op} failed: {stderr}")]
    CommandFailed { op: String, stderr: String },

    #[error("git {op} timed out after {seconds}s")]
    Timeout { op: String, seconds: u64 },

    #[error("Not a git repository: {0}")]
    NotARepo(PathBuf),

    #[error("Path {path} is outside the repository {repo}")]
    OutsideRepo { path: PathBuf, repo: PathBuf },

    #[error("git IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type GitResult<T> = Result<T, GitError>;

/// Adapter over the subset of git the sync engine uses
pub struct GitAdapter {
    repo_root: PathBuf,
    timeout: Duration,
}

impl GitAdapter {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            timeout: GIT_COMMAND_TIMEOUT,
        }
    }

    /// Overrides the per-command timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// True if the root is inside a git work tree
    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"], &[]).is_ok()
    }

    /// True if the given path has staged or unstaged changes
    pub fn has_changes(&self, path: &Path) -> GitResult<bool> {
        let rel = self.rel_path(path)?;
        let out = self.run(&["status", "--porcelain", "--", &rel], &[])?;
        Ok(!out.trim().is_empty())
    }

    /// Stages a path
    pub fn add(&self, path: &Path) -> GitResult<()> {
        let rel = self.rel_path(path)?;
        self.run(&["add", "--", &rel], &[])?;
        Ok(())
    }

    /// Stages and commits the given paths on the working branch
    ///
    /// Only the given paths are staged; the commit then takes whatever is
    /// staged, which also works on an unborn branch. Returns false when
    /// there was nothing to commit.
    pub fn commit(&self, paths: &[&Path], message: &str) -> GitResult<bool> {
        let mut any = false;
        for path in paths {
            if self.has_changes(path)? {
                any = true;
            }
            self.add(path)?;
        }
        if !any {
            return Ok(false);
        }

        match self.run(&["commit", "-m", message], &[]) {
            Ok(_) => Ok(true),
            Err(GitError::CommandFailed { stderr, .. })
                if stderr.contains("nothing to commit") =>
            {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Pulls the current branch; the configured JSONL merge driver resolves
    /// any non-fast-forward content
    ///
    /// A remote that has never seen this branch is not an error; there is
    /// simply nothing to pull yet.
    pub fn pull(&self, remote: Option<&str>) -> GitResult<()> {
        let result = match remote {
            Some(remote) => {
                let branch = self.current_branch()?;
                self.run(&["pull", "--no-edit", remote, &branch], &[])
            }
            None => self.run(&["pull", "--no-edit"], &[]),
        };
        match result {
            Ok(_) => Ok(()),
            Err(GitError::CommandFailed { stderr, .. })
                if stderr.contains("couldn't find remote ref") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Pushes the current branch
    pub fn push(&self, remote: Option<&str>) -> GitResult<()> {
        match remote {
            Some(remote) => {
                let branch = self.current_branch()?;
                self.run(&["push", remote, &branch], &[])?
            }
            None => self.run(&["push"], &[])?,
        };
        Ok(())
    }

    /// The checked-out branch name
    pub fn current_branch(&self) -> GitResult<String> {
        Ok(self
            .run(&["rev-parse", "--abbrev-ref", "HEAD"], &[])?
            .trim()
            .to_string())
    }

    /// First configured remote, if any
    pub fn first_remote(&self) -> GitResult<Option<String>> {
        let out = self.run(&["remote"], &[])?;
        Ok(out.lines().next().map(|s| s.trim().to_string()).filter(|s| !s.is_empty()))
    }

    /// URL of a named remote
    pub fn remote_url(&self, remote: &str) -> GitResult<Option<String>> {
        match self.run(&["remote", "get-url", remote], &[]) {
            Ok(out) => Ok(Some(out.trim().to_string())),
            Err(GitError::CommandFailed { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    // --- Sync branch ---

    /// Fetches the remote side of the sync branch into its tracking ref
    ///
    /// Returns false when the remote branch does not exist yet.
    pub fn fetch_sync_branch(&self, remote: &str, branch: &str) -> GitResult<bool> {
        let refspec = format!("+refs/heads/{b}:refs/remotes/{r}/{b}", b = branch, r = remote);
        match self.run(&["fetch", remote, &refspec], &[]) {
            Ok(_) => Ok(true),
            Err(GitError::CommandFailed { stderr, .. })
                if stderr.contains("couldn't find remote ref") =>
            {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Reads the JSONL blob at the remote tracking ref of the sync branch
    pub fn read_jsonl_from_sync_branch(
        &self,
        remote: &str,
        branch: &str,
        jsonl_path: &Path,
    ) -> GitResult<Option<String>> {
        let rel = self.rel_path(jsonl_path)?;
        let spec = format!("refs/remotes/{}/{}:{}", remote, branch, rel);
        match self.run(&["show", &spec], &[]) {
            Ok(content) => Ok(Some(content)),
            Err(GitError::CommandFailed { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Commits the JSONL onto the sync branch without touching the working
    /// branch or its index
    ///
    /// Builds the tree through a temporary index file. When the remote
    /// tracking ref has diverged from the local branch, both tips become
    /// parents so the following push fast-forwards. Returns false when the
    /// branch tip already holds this exact tree.
    pub fn commit_on_sync_branch(
        &self,
        remote: &str,
        branch: &str,
        jsonl_path: &Path,
        message: &str,
    ) -> GitResult<bool> {
        let rel = self.rel_path(jsonl_path)?;
        let git_dir = self.git_dir()?;
        let index_path = git_dir.join("braid-sync-index");
        let index_env = [(
            "GIT_INDEX_FILE",
            index_path.to_string_lossy().into_owned(),
        )];

        let local_ref = format!("refs/heads/{}", branch);
        let remote_ref = format!("refs/remotes/{}/{}", remote, branch);
        let local_tip = self.rev_parse(&local_ref)?;
        let remote_tip = self.rev_parse(&remote_ref)?;

        let result = (|| -> GitResult<bool> {
            match &local_tip {
                Some(tip) => self.run(&["read-tree", tip], &index_env)?,
                None => self.run(&["read-tree", "--empty"], &index_env)?,
            };

            self.run(&["update-index", "--add", "--", &rel], &index_env)?;
            let tree = self.run(&["write-tree"], &index_env)?.trim().to_string();

            // Nothing new on a clean, non-diverged branch
            if let Some(tip) = &local_tip {
                let tip_tree = self
                    .run(&["rev-parse", &format!("{}^{{tree}}", tip)], &[])?
                    .trim()
                    .to_string();
                let diverged = match &remote_tip {
                    Some(remote_tip) => !self.is_ancestor(remote_tip, tip)?,
                    None => false,
                };
                if tip_tree == tree && !diverged {
                    return Ok(false);
                }
            }

            let mut args: Vec<String> =
                vec!["commit-tree".to_string(), tree, "-m".to_string(), message.to_string()];
            if let Some(tip) = &local_tip {
                args.push("-p".to_string());
                args.push(tip.clone());
            }
            if let (Some(remote_tip), Some(tip)) = (&remote_tip, &local_tip) {
                if !self.is_ancestor(remote_tip, tip)? {
                    args.push("-p".to_string());
                    args.push(remote_tip.clone());
                }
            } else if let (Some(remote_tip), None) = (&remote_tip, &local_tip) {
                args.push("-p".to_string());
                args.push(remote_tip.clone());
            }

            let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
            let commit = self.run(&arg_refs, &[])?.trim().to_string();
            self.run(&["update-ref", &local_ref, &commit], &[])?;
            Ok(true)
        })();

        let _ = std::fs::remove_file(&index_path);
        result
    }

    /// Pushes the sync branch
    pub fn push_sync_branch(&self, remote: &str, branch: &str) -> GitResult<()> {
        let refspec = format!("refs/heads/{b}:refs/heads/{b}", b = branch);
        self.run(&["push", remote, &refspec], &[])?;
        Ok(())
    }

    // --- Internals ---

    fn rev_parse(&self, reference: &str) -> GitResult<Option<String>> {
        match self.run(&["rev-parse", "--verify", "--quiet", reference], &[]) {
            Ok(out) => Ok(Some(out.trim().to_string())),
            Err(GitError::CommandFailed { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> GitResult<bool> {
        match self.run(&["merge-base", "--is-ancestor", ancestor, descendant], &[]) {
            Ok(_) => Ok(true),
            Err(GitError::CommandFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn git_dir(&self) -> GitResult<PathBuf> {
        let out = self.run(&["rev-parse", "--git-dir"], &[])?;
        let dir = PathBuf::from(out.trim());
        if dir.is_absolute() {
            Ok(dir)
        } else {
            Ok(self.repo_root.join(dir))
        }
    }

    fn rel_path(&self, path: &Path) -> GitResult<String> {
        let canonical_root = self
            .repo_root
            .canonicalize()
            .unwrap_or_else(|_| self.repo_root.clone());
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

        canonical
            .strip_prefix(&canonical_root)
            .map(|p| p.to_string_lossy().into_owned())
            .map_err(|_| GitError::OutsideRepo {
                path: path.to_path_buf(),
                repo: self.repo_root.clone(),
            })
    }

    /// Runs one git command under the timeout, returning stdout
    fn run(&self, args: &[&str], envs: &[(&str, String)]) -> GitResult<String> {
        let op = args.first().copied().unwrap_or("git").to_string();

        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(&self.repo_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in envs {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                GitError::CommandFailed {
                    op: op.clone(),
                    stderr: "git binary not found on PATH".to_string(),
                }
            } else {
                GitError::Io(e)
            }
        })?;

        // Drain pipes on threads so a chatty command cannot deadlock the wait
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let stdout_thread = std::thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf);
            }
            buf
        });
        let stderr_thread = std::thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf);
            }
            buf
        });

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait()? {
                Some(status) => break status,
                None => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(GitError::Timeout {
                            op,
                            seconds: self.timeout.as_secs(),
                        });
                    }
                    std::thread::sleep(Duration::from_millis(25));
                }
            }
        };

        let stdout = stdout_thread.join().unwrap_or_default();
        let stderr = stderr_thread.join().unwrap_or_default();

        if status.success() {
            Ok(String::from_utf8_lossy(&stdout).into_owned())
        } else {
            Err(GitError::CommandFailed {
                op,
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn scratch_repo() -> (TempDir, GitAdapter) {
        let dir = TempDir::new().unwrap();
        let git = GitAdapter::new(dir.path());
        git.run(&["init", "--initial-branch=main"], &[]).unwrap();
        git.run(&["config", "user.email", "test@example.com"], &[])
            .unwrap();
        git.run(&["config", "user.name", "Test"], &[]).unwrap();
        (dir, git)
    }

    #[test]
    fn is_repo_detects() {
        let (dir, git) = scratch_repo();
        assert!(git.is_repo());

        let plain = TempDir::new().unwrap();
        assert!(!GitAdapter::new(plain.path()).is_repo());
        drop(dir);
    }

    #[test]
    fn has_changes_and_commit() {
        let (dir, git) = scratch_repo();
        let file = dir.path().join("issues.jsonl");
        fs::write(&file, "{}\n").unwrap();

        assert!(git.has_changes(&file).unwrap());
        assert!(git.commit(&[&file], "add issues").unwrap());
        assert!(!git.has_changes(&file).unwrap());

        // Second commit with no changes is a no-op
        assert!(!git.commit(&[&file], "again").unwrap());
    }

    #[test]
    fn command_failure_carries_stderr() {
        let (_dir, git) = scratch_repo();
        let err = git.run(&["rev-parse", "--verify", "no-such-ref"], &[]).unwrap_err();
        match err {
            GitError::CommandFailed { op, .. } => assert_eq!(op, "rev-parse"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn rel_path_rejects_outside_paths() {
        let (_dir, git) = scratch_repo();
        let outside = TempDir::new().unwrap();
        let err = git.rel_path(outside.path()).unwrap_err();
        assert!(matches!(err, GitError::OutsideRepo { .. }));
    }

    #[test]
    fn sync_branch_commit_leaves_working_branch_alone() {
        let (dir, git) = scratch_repo();

        // Seed the working branch
        let readme = dir.path().join("README.md");
        fs::write(&readme, "hello\n").unwrap();
        git.commit(&[&readme], "init").unwrap();
        let head_before = git.rev_parse("HEAD").unwrap().unwrap();

        let jsonl = dir.path().join("issues.jsonl");
        fs::write(&jsonl, "{\"id\":\"br-aaa\"}\n").unwrap();

        assert!(git
            .commit_on_sync_branch("origin", "braid-sync", &jsonl, "sync")
            .unwrap());

        // Working branch unmoved, sync branch exists with the blob
        assert_eq!(git.rev_parse("HEAD").unwrap().unwrap(), head_before);
        let tip = git.rev_parse("refs/heads/braid-sync").unwrap();
        assert!(tip.is_some());

        // Same content again is a no-op
        assert!(!git
            .commit_on_sync_branch("origin", "braid-sync", &jsonl, "sync again")
            .unwrap());

        // Changed content commits again
        fs::write(&jsonl, "{\"id\":\"br-bbb\"}\n").unwrap();
        assert!(git
            .commit_on_sync_branch("origin", "braid-sync", &jsonl, "sync more")
            .unwrap());
    }

    #[test]
    fn tiny_timeout_still_resolves_or_times_out() {
        let (_dir, git) = scratch_repo();
        let slow = GitAdapter::new(git.repo_root()).with_timeout(Duration::from_millis(10));
        match slow.run(&["rev-parse", "--git-dir"], &[]) {
            Ok(_) | Err(GitError::Timeout { .. }) => {}
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }
}
