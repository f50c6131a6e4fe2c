use super::forest::Stack;
use crate::errors::{Result, TrellisError};
use crate::git::{RebaseOutcome, VcsGateway};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Which workflow an interrupted restack belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResumeOperation {
    Restack,
    Sync,
}

/// Persisted record of an interrupted restack.
///
/// Created the instant a rebase reports a conflict, deleted the instant a
/// resume completes the queue. Never persisted otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictCheckpoint {
    /// The branch whose rebase stopped on conflicts
    pub branch: String,
    /// The commit that branch was being rebased onto
    pub onto: String,
    /// Remaining queue, the conflicted branch first
    pub queue: Vec<String>,
    /// Conflicting paths as reported by the gateway
    pub files: Vec<String>,
    /// The operation to re-issue on resume
    pub operation: ResumeOperation,
    pub created_at: DateTime<Utc>,
}

/// One pending rebase step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestackTask {
    pub branch: String,
    /// Parent commit to rebase onto
    pub onto: String,
    /// Base commit being rebased away from; None before the first restack
    pub prior_base: Option<String>,
}

/// What a restack run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestackSummary {
    /// Branches that were rebased, in order
    pub rebased: Vec<String>,
    /// Branches skipped because they were already based on their parent
    pub skipped: Vec<String>,
}

/// Terminal state of one restack invocation
#[derive(Debug)]
pub enum RestackOutcome {
    Clean(RestackSummary),
    ConflictPaused {
        branch: String,
        files: Vec<String>,
        summary: RestackSummary,
    },
}

/// Re-applies upstream changes through every descendant, in dependency
/// order, pausing safely on conflict.
///
/// The engine mutates a transient [`Stack`]; persisting the result is the
/// caller's job, so a clean run and a paused run are both save-able.
pub struct RestackEngine<'a, G: VcsGateway> {
    gateway: &'a G,
}

impl<'a, G: VcsGateway> RestackEngine<'a, G> {
    pub fn new(gateway: &'a G) -> Self {
        Self { gateway }
    }

    /// Restack one branch and everything upstack of it
    pub fn restack(&self, stack: &mut Stack, start: &str) -> Result<RestackOutcome> {
        if let Some(cp) = &stack.checkpoint {
            return Err(TrellisError::restack_in_progress(&cp.branch));
        }
        let queue = self.plan_queue(stack, start)?;
        let mut summary = RestackSummary::default();
        self.drain(stack, queue, ResumeOperation::Restack, &mut summary)
    }

    /// Restack the whole forest: every tracked descendant of the trunk,
    /// each branch exactly once, always after its parent
    pub fn restack_forest(
        &self,
        stack: &mut Stack,
        operation: ResumeOperation,
    ) -> Result<RestackOutcome> {
        if let Some(cp) = &stack.checkpoint {
            return Err(TrellisError::restack_in_progress(&cp.branch));
        }
        let trunk = stack.trunk.clone();
        let queue: VecDeque<String> = stack
            .upstack_of(&trunk)?
            .into_iter()
            .filter(|b| b.tracked)
            .map(|b| b.name.clone())
            .collect();
        let mut summary = RestackSummary::default();
        self.drain(stack, queue, operation, &mut summary)
    }

    /// Resume an interrupted restack after the user resolved conflicts.
    ///
    /// Valid only when the repository really is mid-rebase; anything else
    /// is a state mismatch requiring an explicit abort.
    pub fn resume(&self, stack: &mut Stack) -> Result<RestackOutcome> {
        let cp = stack
            .checkpoint
            .clone()
            .ok_or_else(|| TrellisError::state_mismatch("no interrupted restack to resume"))?;

        if !self.gateway.is_rebase_in_progress()? {
            return Err(TrellisError::state_mismatch(format!(
                "checkpoint records a paused rebase of '{}' but the repository is not \
                 mid-rebase; abort the restack to discard the checkpoint",
                cp.branch
            )));
        }

        let mut summary = RestackSummary::default();

        match self.gateway.continue_rebase()? {
            RebaseOutcome::Conflict { files } => {
                warn!("resume of '{}' hit conflicts again: {:?}", cp.branch, files);
                let branch = cp.branch.clone();
                // Queue is unchanged; only the reported files move
                stack.checkpoint = Some(ConflictCheckpoint { files: files.clone(), ..cp });
                Ok(RestackOutcome::ConflictPaused {
                    branch,
                    files,
                    summary,
                })
            }
            RebaseOutcome::Applied { commit } => {
                info!("resumed rebase of '{}' at {}", cp.branch, commit);
                let mut queue: VecDeque<String> = cp.queue.clone().into_iter().collect();
                let front = queue.pop_front();
                if front.as_deref() != Some(cp.branch.as_str()) {
                    return Err(TrellisError::state_mismatch(format!(
                        "checkpoint queue does not start with '{}'",
                        cp.branch
                    )));
                }

                let branch = stack.get_mut(&cp.branch).ok_or_else(|| {
                    TrellisError::state_mismatch(format!(
                        "checkpointed branch '{}' is no longer tracked",
                        cp.branch
                    ))
                })?;
                branch.set_commit(commit);
                branch.set_parent_base(cp.onto.clone());
                summary.rebased.push(cp.branch.clone());

                stack.checkpoint = None;
                self.drain(stack, queue, cp.operation, &mut summary)
            }
        }
    }

    /// Abort an interrupted restack, discarding the checkpoint
    pub fn abort(&self, stack: &mut Stack) -> Result<()> {
        if stack.checkpoint.is_none() {
            return Err(TrellisError::state_mismatch(
                "no interrupted restack to abort",
            ));
        }
        if self.gateway.is_rebase_in_progress()? {
            self.gateway.abort_rebase()?;
        }
        stack.checkpoint = None;
        info!("aborted interrupted restack");
        Ok(())
    }

    /// Queue for one starting branch: itself plus its upstack, tracked only
    fn plan_queue(&self, stack: &Stack, start: &str) -> Result<VecDeque<String>> {
        let head = stack.get(start).ok_or_else(|| {
            TrellisError::validation(format!("branch '{start}' is not tracked"))
        })?;
        if start == stack.trunk {
            return Err(TrellisError::validation(
                "the trunk cannot be restacked; restack its children or run a sync",
            ));
        }

        let mut queue = VecDeque::new();
        if head.tracked {
            queue.push_back(start.to_string());
        }
        for branch in stack.upstack_of(start)? {
            if branch.tracked {
                queue.push_back(branch.name.clone());
            }
        }
        Ok(queue)
    }

    /// The pending task for one branch, or None when it is already based
    /// on its parent's current commit
    fn task_for(&self, stack: &Stack, name: &str) -> Result<Option<RestackTask>> {
        let branch = stack.get(name).ok_or_else(|| {
            TrellisError::gateway(format!(
                "branch '{name}' disappeared from the forest mid-restack"
            ))
        })?;
        let parent_name = branch.parent.as_deref().ok_or_else(|| {
            TrellisError::validation(format!("branch '{name}' has no parent to restack onto"))
        })?;
        let parent = stack.get(parent_name).ok_or_else(|| {
            TrellisError::validation(format!(
                "branch '{name}' references missing parent '{parent_name}'"
            ))
        })?;

        let onto = parent.commit.clone();
        if branch.parent_base.as_deref() == Some(onto.as_str()) {
            return Ok(None);
        }

        Ok(Some(RestackTask {
            branch: name.to_string(),
            onto,
            prior_base: branch.parent_base.clone(),
        }))
    }

    /// Process the queue front to back. Each rebase's input is the previous
    /// branch's output, so ordering is strict and sequential.
    fn drain(
        &self,
        stack: &mut Stack,
        mut queue: VecDeque<String>,
        operation: ResumeOperation,
        summary: &mut RestackSummary,
    ) -> Result<RestackOutcome> {
        while let Some(name) = queue.pop_front() {
            let Some(task) = self.task_for(stack, &name)? else {
                debug!("'{}' already based on its parent, skipping", name);
                summary.skipped.push(name);
                continue;
            };

            let upstream = match &task.prior_base {
                Some(base) => base.clone(),
                None => self.gateway.merge_base(&task.branch, &task.onto)?,
            };

            debug!("rebasing '{}' onto {}", task.branch, task.onto);
            match self.gateway.rebase(&task.branch, &task.onto, &upstream)? {
                RebaseOutcome::Applied { commit } => {
                    let branch = stack.get_mut(&name).ok_or_else(|| {
                        TrellisError::gateway(format!(
                            "branch '{name}' disappeared from the forest mid-restack"
                        ))
                    })?;
                    branch.set_commit(commit);
                    branch.set_parent_base(task.onto.clone());
                    summary.rebased.push(name);
                }
                RebaseOutcome::Conflict { files } => {
                    warn!("rebase of '{}' stopped on conflicts: {:?}", name, files);
                    // The failed branch is not resolved yet; it stays first
                    // in the persisted queue.
                    let mut remaining = vec![name.clone()];
                    remaining.extend(queue);
                    stack.checkpoint = Some(ConflictCheckpoint {
                        branch: name.clone(),
                        onto: task.onto,
                        queue: remaining,
                        files: files.clone(),
                        operation,
                        created_at: Utc::now(),
                    });
                    return Ok(RestackOutcome::ConflictPaused {
                        branch: name,
                        files,
                        summary: summary.clone(),
                    });
                }
            }
        }

        stack.checkpoint = None;
        Ok(RestackOutcome::Clean(summary.clone()))
    }
}
