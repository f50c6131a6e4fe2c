use crate::errors::{Result, TrellisError};
use crate::git::{RebaseOutcome, VcsGateway};
use git2::build::CheckoutBuilder;
use git2::{BranchType, Oid, Repository, RepositoryState, Signature};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Version-control gateway backed by git2.
///
/// All operations work against one repository's working copy. Conflicts are
/// reported as `RebaseOutcome::Conflict`, never as errors.
pub struct GitRepository {
    repo: Repository,
    path: PathBuf,
    author_name: Option<String>,
    author_email: Option<String>,
}

impl GitRepository {
    /// Open a Git repository at the given path
    pub fn open(path: &Path) -> Result<Self> {
        let repo = Repository::discover(path)
            .map_err(|e| TrellisError::config(format!("Not a git repository: {e}")))?;

        let workdir = repo
            .workdir()
            .ok_or_else(|| TrellisError::config("Repository has no working directory"))?
            .to_path_buf();

        Ok(Self {
            repo,
            path: workdir,
            author_name: None,
            author_email: None,
        })
    }

    /// Use an explicit author identity instead of the repository's config
    pub fn with_author(mut self, name: Option<String>, email: Option<String>) -> Self {
        self.author_name = name;
        self.author_email = email;
        self
    }

    /// Get repository path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn signature(&self) -> Result<Signature<'static>> {
        if let (Some(name), Some(email)) = (&self.author_name, &self.author_email) {
            return Signature::now(name, email).map_err(TrellisError::Git);
        }
        match self.repo.signature() {
            Ok(sig) => Ok(sig),
            Err(_) => Signature::now("trellis", "trellis@localhost").map_err(TrellisError::Git),
        }
    }

    fn head_commit_id(&self) -> Result<String> {
        let head = self
            .repo
            .head()
            .map_err(|e| TrellisError::branch(format!("Could not get HEAD: {e}")))?;
        let commit = head
            .peel_to_commit()
            .map_err(|e| TrellisError::branch(format!("Could not get HEAD commit: {e}")))?;
        Ok(commit.id().to_string())
    }

    fn resolve_commit(&self, refspec: &str) -> Result<git2::Commit<'_>> {
        let obj = self
            .repo
            .revparse_single(refspec)
            .map_err(|e| TrellisError::branch(format!("Could not find '{refspec}': {e}")))?;
        obj.peel_to_commit()
            .map_err(|e| TrellisError::branch(format!("'{refspec}' is not a commit: {e}")))
    }

    fn annotated(&self, refspec: &str) -> Result<git2::AnnotatedCommit<'_>> {
        let commit = self.resolve_commit(refspec)?;
        self.repo
            .find_annotated_commit(commit.id())
            .map_err(TrellisError::Git)
    }

    fn conflicted_paths(&self) -> Result<Vec<String>> {
        let index = self.repo.index().map_err(TrellisError::Git)?;
        let mut files = Vec::new();
        for conflict in index.conflicts().map_err(TrellisError::Git)? {
            let conflict = conflict.map_err(TrellisError::Git)?;
            let entry = conflict.our.or(conflict.their).or(conflict.ancestor);
            if let Some(entry) = entry {
                if let Ok(path) = String::from_utf8(entry.path) {
                    files.push(path);
                }
            }
        }
        files.sort();
        files.dedup();
        Ok(files)
    }

    /// Drive the remaining operations of an open rebase to completion.
    /// Stops and reports on the first conflicted patch.
    fn drive_rebase(&self, rebase: &mut git2::Rebase<'_>) -> Result<RebaseOutcome> {
        let sig = self.signature()?;

        while let Some(op) = rebase.next() {
            op.map_err(TrellisError::Git)?;

            let index = self.repo.index().map_err(TrellisError::Git)?;
            if index.has_conflicts() {
                let files = self.conflicted_paths()?;
                debug!("rebase stopped on conflicts: {:?}", files);
                // The on-disk rebase state stays open for continue/abort.
                return Ok(RebaseOutcome::Conflict { files });
            }

            match rebase.commit(None, &sig, None) {
                Ok(_) => {}
                // Patch already present upstream; skip it
                Err(e) if e.code() == git2::ErrorCode::Applied => continue,
                Err(e) => return Err(TrellisError::Git(e)),
            }
        }

        rebase.finish(Some(&sig)).map_err(TrellisError::Git)?;
        let commit = self.head_commit_id()?;
        Ok(RebaseOutcome::Applied { commit })
    }
}

impl VcsGateway for GitRepository {
    fn current_branch(&self) -> Result<String> {
        let head = self
            .repo
            .head()
            .map_err(|e| TrellisError::branch(format!("Could not get HEAD: {e}")))?;

        if let Some(name) = head.shorthand() {
            Ok(name.to_string())
        } else {
            let commit = head
                .peel_to_commit()
                .map_err(|e| TrellisError::branch(format!("Could not get HEAD commit: {e}")))?;
            Ok(format!("HEAD@{}", commit.id()))
        }
    }

    fn create_branch(&self, name: &str, start_point: Option<&str>) -> Result<()> {
        let target = match start_point {
            Some(refspec) => self.resolve_commit(refspec)?,
            None => self
                .repo
                .head()
                .and_then(|h| h.peel_to_commit())
                .map_err(|e| TrellisError::branch(format!("Could not get HEAD commit: {e}")))?,
        };

        self.repo
            .branch(name, &target, false)
            .map_err(|e| TrellisError::branch(format!("Could not create branch '{name}': {e}")))?;

        debug!("Created branch '{}' at {}", name, target.id());
        Ok(())
    }

    fn checkout(&self, name: &str) -> Result<()> {
        let branch = self
            .repo
            .find_branch(name, BranchType::Local)
            .map_err(|e| TrellisError::branch(format!("Could not find branch '{name}': {e}")))?;

        let tree = branch.get().peel_to_tree().map_err(|e| {
            TrellisError::branch(format!("Could not get tree for branch '{name}': {e}"))
        })?;

        self.repo
            .checkout_tree(tree.as_object(), None)
            .map_err(|e| TrellisError::branch(format!("Could not checkout '{name}': {e}")))?;

        self.repo
            .set_head(&format!("refs/heads/{name}"))
            .map_err(|e| TrellisError::branch(format!("Could not update HEAD to '{name}': {e}")))?;

        debug!("Switched to branch '{}'", name);
        Ok(())
    }

    fn delete_branch(&self, name: &str, force: bool) -> Result<()> {
        if self.current_branch()? == name {
            return Err(TrellisError::branch(format!(
                "Cannot delete branch '{name}' while it is checked out; switch branches first"
            )));
        }

        let mut branch = self
            .repo
            .find_branch(name, BranchType::Local)
            .map_err(|e| TrellisError::branch(format!("Could not find branch '{name}': {e}")))?;

        if !force {
            let branch_oid = branch
                .get()
                .peel_to_commit()
                .map_err(TrellisError::Git)?
                .id();
            let head_oid = Oid::from_str(&self.head_commit_id()?).map_err(TrellisError::Git)?;
            let merged = self
                .repo
                .merge_base(branch_oid, head_oid)
                .map(|base| base == branch_oid)
                .unwrap_or(false);
            if !merged {
                return Err(TrellisError::branch(format!(
                    "Branch '{name}' is not merged; pass force to delete it anyway"
                )));
            }
        }

        branch
            .delete()
            .map_err(|e| TrellisError::branch(format!("Could not delete branch '{name}': {e}")))?;

        debug!("Deleted branch '{}'", name);
        Ok(())
    }

    fn commit(&self, message: &str, stage_all: bool, amend: bool) -> Result<String> {
        if stage_all {
            let mut index = self.repo.index().map_err(TrellisError::Git)?;
            index
                .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
                .map_err(TrellisError::Git)?;
            index.write().map_err(TrellisError::Git)?;
        }

        let sig = self.signature()?;
        let mut index = self.repo.index().map_err(TrellisError::Git)?;
        let tree_id = index.write_tree().map_err(TrellisError::Git)?;
        let tree = self.repo.find_tree(tree_id).map_err(TrellisError::Git)?;

        let head = self.repo.head().map_err(TrellisError::Git)?;
        let parent = head.peel_to_commit().map_err(TrellisError::Git)?;

        let commit_id = if amend {
            parent
                .amend(
                    Some("HEAD"),
                    Some(&sig),
                    Some(&sig),
                    None,
                    Some(message),
                    Some(&tree),
                )
                .map_err(TrellisError::Git)?
        } else {
            self.repo
                .commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])
                .map_err(TrellisError::Git)?
        };

        debug!("Created commit {} - {}", commit_id, message);
        Ok(commit_id.to_string())
    }

    fn rebase(&self, branch: &str, onto: &str, upstream: &str) -> Result<RebaseOutcome> {
        if self.has_uncommitted_changes()? {
            return Err(TrellisError::branch(
                "Working directory has uncommitted changes; commit or stash them before restacking",
            ));
        }

        let branch_ann = {
            let reference = self
                .repo
                .find_branch(branch, BranchType::Local)
                .map_err(|e| {
                    TrellisError::branch(format!("Could not find branch '{branch}': {e}"))
                })?;
            self.repo
                .reference_to_annotated_commit(reference.get())
                .map_err(TrellisError::Git)?
        };
        let upstream_ann = self.annotated(upstream)?;
        let onto_ann = self.annotated(onto)?;

        debug!("Rebasing '{}' onto {} (upstream {})", branch, onto, upstream);

        let mut rebase = self
            .repo
            .rebase(Some(&branch_ann), Some(&upstream_ann), Some(&onto_ann), None)
            .map_err(TrellisError::Git)?;

        self.drive_rebase(&mut rebase)
    }

    fn continue_rebase(&self) -> Result<RebaseOutcome> {
        if !self.is_rebase_in_progress()? {
            return Err(TrellisError::state_mismatch(
                "No rebase in progress; nothing to continue",
            ));
        }

        let index = self.repo.index().map_err(TrellisError::Git)?;
        if index.has_conflicts() {
            let files = self.conflicted_paths()?;
            return Ok(RebaseOutcome::Conflict { files });
        }

        let mut rebase = self.repo.open_rebase(None).map_err(TrellisError::Git)?;
        let sig = self.signature()?;

        // Commit the operation the user just resolved, then drain the rest.
        match rebase.commit(None, &sig, None) {
            Ok(_) => {}
            Err(e) if e.code() == git2::ErrorCode::Applied => {}
            Err(e) => return Err(TrellisError::Git(e)),
        }

        self.drive_rebase(&mut rebase)
    }

    fn abort_rebase(&self) -> Result<()> {
        let mut rebase = self.repo.open_rebase(None).map_err(|e| {
            TrellisError::state_mismatch(format!("No rebase in progress to abort: {e}"))
        })?;
        rebase.abort().map_err(TrellisError::Git)?;
        debug!("Aborted in-progress rebase");
        Ok(())
    }

    fn merge_base(&self, a: &str, b: &str) -> Result<String> {
        let commit_a = self.resolve_commit(a)?;
        let commit_b = self.resolve_commit(b)?;
        let base = self
            .repo
            .merge_base(commit_a.id(), commit_b.id())
            .map_err(|e| TrellisError::branch(format!("No merge base for '{a}' and '{b}': {e}")))?;
        Ok(base.to_string())
    }

    fn has_uncommitted_changes(&self) -> Result<bool> {
        let statuses = self.repo.statuses(None).map_err(TrellisError::Git)?;

        for status in statuses.iter() {
            if status.status().intersects(
                git2::Status::INDEX_MODIFIED
                    | git2::Status::INDEX_NEW
                    | git2::Status::INDEX_DELETED
                    | git2::Status::WT_MODIFIED
                    | git2::Status::WT_DELETED,
            ) {
                return Ok(true);
            }
        }

        Ok(false)
    }

    fn is_rebase_in_progress(&self) -> Result<bool> {
        Ok(matches!(
            self.repo.state(),
            RepositoryState::Rebase
                | RepositoryState::RebaseInteractive
                | RepositoryState::RebaseMerge
        ))
    }

    fn push(&self, branch: &str, remote: &str, force: bool) -> Result<()> {
        let mut remote = self
            .repo
            .find_remote(remote)
            .map_err(|e| TrellisError::gateway(format!("Could not find remote '{remote}': {e}")))?;

        let refspec = if force {
            format!("+refs/heads/{branch}:refs/heads/{branch}")
        } else {
            format!("refs/heads/{branch}:refs/heads/{branch}")
        };

        remote
            .push(&[refspec.as_str()], None)
            .map_err(|e| TrellisError::gateway(format!("Push of '{branch}' failed: {e}")))?;

        debug!("Pushed '{}' (force: {})", branch, force);
        Ok(())
    }

    fn fetch(&self, remote: &str) -> Result<()> {
        let mut remote = self
            .repo
            .find_remote(remote)
            .map_err(|e| TrellisError::gateway(format!("Could not find remote '{remote}': {e}")))?;

        remote
            .fetch(&[] as &[&str], None, None)
            .map_err(|e| TrellisError::gateway(format!("Fetch failed: {e}")))?;

        debug!("Fetched from '{}'", remote.name().unwrap_or("remote"));
        Ok(())
    }

    fn list_branches(&self) -> Result<Vec<String>> {
        let branches = self
            .repo
            .branches(Some(BranchType::Local))
            .map_err(TrellisError::Git)?;

        let mut names = Vec::new();
        for branch in branches {
            let (branch, _) = branch.map_err(TrellisError::Git)?;
            if let Some(name) = branch.name().map_err(TrellisError::Git)? {
                names.push(name.to_string());
            }
        }

        Ok(names)
    }

    fn branch_commit(&self, name: &str) -> Result<String> {
        Ok(self.resolve_commit(name)?.id().to_string())
    }

    fn fast_forward(&self, branch: &str, to: &str) -> Result<()> {
        let target = self.resolve_commit(to)?.id();
        let refname = format!("refs/heads/{branch}");
        let mut reference = self
            .repo
            .find_reference(&refname)
            .map_err(|e| TrellisError::branch(format!("Could not find branch '{branch}': {e}")))?;
        let current = reference.peel_to_commit().map_err(TrellisError::Git)?.id();

        if current == target {
            return Ok(());
        }

        let base = self
            .repo
            .merge_base(current, target)
            .map_err(TrellisError::Git)?;
        if base != current {
            return Err(TrellisError::branch(format!(
                "Branch '{branch}' has diverged from {to}; resolve it manually before syncing"
            )));
        }

        reference
            .set_target(target, "trellis: fast-forward")
            .map_err(TrellisError::Git)?;

        // Keep the working tree in step when the moved branch is checked out
        if self.current_branch()? == branch {
            self.repo
                .checkout_head(Some(CheckoutBuilder::new().force()))
                .map_err(TrellisError::Git)?;
        }

        debug!("Fast-forwarded '{}' to {}", branch, target);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn init_repo() -> (TempDir, GitRepository) {
        let tmp = TempDir::new().unwrap();
        let repo = Repository::init(tmp.path()).unwrap();
        let sig = Signature::now("test", "test@example.com").unwrap();

        fs::write(tmp.path().join("README"), "hello\n").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("README")).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
            .unwrap();
        drop(tree);

        let git = GitRepository::open(tmp.path())
            .unwrap()
            .with_author(Some("test".into()), Some("test@example.com".into()));
        (tmp, git)
    }

    fn write_and_commit(tmp: &TempDir, git: &GitRepository, file: &str, content: &str) -> String {
        fs::write(tmp.path().join(file), content).unwrap();
        git.commit(&format!("update {file}"), true, false).unwrap()
    }

    #[test]
    fn test_branch_lifecycle() {
        let (_tmp, git) = init_repo();
        let trunk = git.current_branch().unwrap();

        git.create_branch("feature", None).unwrap();
        assert!(git.list_branches().unwrap().contains(&"feature".to_string()));

        git.checkout("feature").unwrap();
        assert_eq!(git.current_branch().unwrap(), "feature");

        git.checkout(&trunk).unwrap();
        git.delete_branch("feature", false).unwrap();
        assert!(!git.list_branches().unwrap().contains(&"feature".to_string()));
    }

    #[test]
    fn test_delete_checked_out_branch_refused() {
        let (_tmp, git) = init_repo();
        let trunk = git.current_branch().unwrap();
        let result = git.delete_branch(&trunk, true);
        assert!(matches!(result, Err(TrellisError::Branch(_))));
    }

    #[test]
    fn test_commit_and_merge_base() {
        let (tmp, git) = init_repo();
        let trunk = git.current_branch().unwrap();
        let base = git.branch_commit(&trunk).unwrap();

        git.create_branch("feature", None).unwrap();
        git.checkout("feature").unwrap();
        let tip = write_and_commit(&tmp, &git, "feature.txt", "feature\n");

        assert_eq!(git.merge_base(&trunk, "feature").unwrap(), base);
        assert_eq!(git.branch_commit("feature").unwrap(), tip);
    }

    #[test]
    fn test_uncommitted_changes() {
        let (tmp, git) = init_repo();
        assert!(!git.has_uncommitted_changes().unwrap());

        fs::write(tmp.path().join("README"), "changed\n").unwrap();
        assert!(git.has_uncommitted_changes().unwrap());
    }

    #[test]
    fn test_fast_forward() {
        let (tmp, git) = init_repo();
        let trunk = git.current_branch().unwrap();

        git.create_branch("ahead", None).unwrap();
        git.checkout("ahead").unwrap();
        let tip = write_and_commit(&tmp, &git, "new.txt", "new\n");

        git.checkout(&trunk).unwrap();
        git.fast_forward(&trunk, "ahead").unwrap();
        assert_eq!(git.branch_commit(&trunk).unwrap(), tip);
    }

    #[test]
    fn test_fast_forward_diverged_fails() {
        let (tmp, git) = init_repo();
        let trunk = git.current_branch().unwrap();

        git.create_branch("other", None).unwrap();
        write_and_commit(&tmp, &git, "trunk.txt", "trunk\n");
        git.checkout("other").unwrap();
        write_and_commit(&tmp, &git, "other.txt", "other\n");
        git.checkout(&trunk).unwrap();

        let result = git.fast_forward(&trunk, "other");
        assert!(matches!(result, Err(TrellisError::Branch(_))));
    }

    #[test]
    fn test_rebase_applies_cleanly() {
        let (tmp, git) = init_repo();
        let trunk = git.current_branch().unwrap();
        let old_base = git.branch_commit(&trunk).unwrap();

        git.create_branch("feature", None).unwrap();
        git.checkout("feature").unwrap();
        write_and_commit(&tmp, &git, "feature.txt", "feature\n");

        git.checkout(&trunk).unwrap();
        write_and_commit(&tmp, &git, "trunk.txt", "trunk\n");
        let new_base = git.branch_commit(&trunk).unwrap();

        let outcome = git.rebase("feature", &new_base, &old_base).unwrap();
        match outcome {
            RebaseOutcome::Applied { commit } => {
                assert_eq!(git.branch_commit("feature").unwrap(), commit);
                assert_eq!(git.merge_base(&trunk, "feature").unwrap(), new_base);
            }
            other => panic!("expected clean rebase, got {other:?}"),
        }
        assert!(!git.is_rebase_in_progress().unwrap());
    }

    #[test]
    fn test_rebase_conflict_and_abort() {
        let (tmp, git) = init_repo();
        let trunk = git.current_branch().unwrap();
        let old_base = git.branch_commit(&trunk).unwrap();

        git.create_branch("feature", None).unwrap();
        git.checkout("feature").unwrap();
        write_and_commit(&tmp, &git, "README", "feature side\n");
        let feature_tip = git.branch_commit("feature").unwrap();

        git.checkout(&trunk).unwrap();
        write_and_commit(&tmp, &git, "README", "trunk side\n");
        let new_base = git.branch_commit(&trunk).unwrap();

        let outcome = git.rebase("feature", &new_base, &old_base).unwrap();
        match outcome {
            RebaseOutcome::Conflict { files } => {
                assert!(files.contains(&"README".to_string()));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert!(git.is_rebase_in_progress().unwrap());

        git.abort_rebase().unwrap();
        assert!(!git.is_rebase_in_progress().unwrap());
        assert_eq!(git.branch_commit("feature").unwrap(), feature_tip);
    }
}
