pub mod repository;

pub use repository::GitRepository;

use crate::errors::{Result, TrellisError};
use std::path::Path;

/// Result of a rebase step.
///
/// Conflict is expected control flow, not a fault: callers must branch on
/// this variant rather than catch an error. Gateway failures (branch gone,
/// repository locked) stay on the `Err` side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebaseOutcome {
    /// The rebase applied cleanly; the branch now points at `commit`
    Applied { commit: String },
    /// The rebase stopped on conflicts in `files`; the repository is left
    /// mid-rebase awaiting resolution
    Conflict { files: Vec<String> },
}

/// Version-control operations the engine consumes.
///
/// One implementation wraps a real repository (git2); tests script the
/// trait directly.
pub trait VcsGateway {
    /// Name of the currently checked-out branch
    fn current_branch(&self) -> Result<String>;

    /// Create a branch at `start_point` (current HEAD when `None`)
    fn create_branch(&self, name: &str, start_point: Option<&str>) -> Result<()>;

    /// Check out an existing branch
    fn checkout(&self, name: &str) -> Result<()>;

    /// Delete a local branch; `force` skips the merged check
    fn delete_branch(&self, name: &str, force: bool) -> Result<()>;

    /// Create a commit, optionally staging everything first or amending HEAD
    fn commit(&self, message: &str, stage_all: bool, amend: bool) -> Result<String>;

    /// Rebase `branch` onto `onto`, replaying only commits after `upstream`
    fn rebase(&self, branch: &str, onto: &str, upstream: &str) -> Result<RebaseOutcome>;

    /// Continue an interrupted rebase after conflicts were resolved and staged
    fn continue_rebase(&self) -> Result<RebaseOutcome>;

    /// Abort an interrupted rebase, restoring the pre-rebase state
    fn abort_rebase(&self) -> Result<()>;

    /// Best common ancestor of two commits or refs
    fn merge_base(&self, a: &str, b: &str) -> Result<String>;

    fn has_uncommitted_changes(&self) -> Result<bool>;

    fn is_rebase_in_progress(&self) -> Result<bool>;

    /// Push `branch` to `remote`; `force` rewrites remote history
    fn push(&self, branch: &str, remote: &str, force: bool) -> Result<()>;

    fn fetch(&self, remote: &str) -> Result<()>;

    /// All local branch names
    fn list_branches(&self) -> Result<Vec<String>>;

    /// Commit id a branch or ref currently points at
    fn branch_commit(&self, name: &str) -> Result<String>;

    /// Move `branch` forward to commit `to` without creating a merge.
    /// Fails unless `to` is a descendant of the branch tip.
    fn fast_forward(&self, branch: &str, to: &str) -> Result<()>;
}

/// Check if a directory is a Git repository
pub fn is_git_repository(path: &Path) -> bool {
    path.join(".git").exists() || git2::Repository::discover(path).is_ok()
}

/// Find the root of the Git repository containing `start_path`
pub fn find_repository_root(start_path: &Path) -> Result<std::path::PathBuf> {
    let repo = git2::Repository::discover(start_path).map_err(TrellisError::Git)?;

    let workdir = repo
        .workdir()
        .ok_or_else(|| TrellisError::config("Repository has no working directory (bare repo?)"))?;

    Ok(workdir.to_path_buf())
}
