use super::forest::Stack;
use super::restack::{RestackEngine, RestackOutcome, ResumeOperation};
use crate::config::Settings;
use crate::errors::{Result, TrellisError};
use crate::git::VcsGateway;
use crate::provider::ReviewProvider;
use crate::store::StateStore;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Where a sync run ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Fetching,
    TrunkUpdated,
    Restacking,
    Clean,
    ConflictPaused,
}

/// Conflict details when a sync pauses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConflict {
    pub branch: String,
    pub files: Vec<String>,
}

/// What one sync (or resume) did
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub phase: SyncPhase,
    /// Whether the trunk was fast-forwarded to the remote
    pub trunk_advanced: bool,
    /// Branches removed because their review requests merged, trunk-ward
    /// order
    pub pruned: Vec<String>,
    pub rebased: Vec<String>,
    pub skipped: Vec<String>,
    pub conflict: Option<SyncConflict>,
}

impl SyncReport {
    fn new() -> Self {
        Self {
            phase: SyncPhase::Idle,
            trunk_advanced: false,
            pruned: Vec::new(),
            rebased: Vec::new(),
            skipped: Vec::new(),
            conflict: None,
        }
    }
}

/// Reconciles the forest with the remote: fetch, advance the trunk, prune
/// merged branches, restack everything, persist once.
pub struct SyncCoordinator<'a, G: VcsGateway, P: ReviewProvider> {
    gateway: &'a G,
    provider: &'a P,
    store: &'a StateStore,
    settings: &'a Settings,
}

impl<'a, G: VcsGateway, P: ReviewProvider> SyncCoordinator<'a, G, P> {
    pub fn new(
        gateway: &'a G,
        provider: &'a P,
        store: &'a StateStore,
        settings: &'a Settings,
    ) -> Self {
        Self {
            gateway,
            provider,
            store,
            settings,
        }
    }

    pub async fn sync(&self, stack: &mut Stack) -> Result<SyncReport> {
        if let Some(cp) = &stack.checkpoint {
            return Err(TrellisError::restack_in_progress(&cp.branch));
        }

        let mut report = SyncReport::new();
        let remote = &self.settings.git.remote;

        report.phase = SyncPhase::Fetching;
        info!("fetching from '{}'", remote);
        self.gateway.fetch(remote)?;

        report.trunk_advanced = self.advance_trunk(stack)?;
        report.phase = SyncPhase::TrunkUpdated;

        report.pruned = self.prune_merged(stack).await?;

        report.phase = SyncPhase::Restacking;
        let engine = RestackEngine::new(self.gateway);
        let outcome = engine.restack_forest(stack, ResumeOperation::Sync);

        // One write covers clean and paused runs alike; an engine error
        // still persists the rebases that did land.
        self.store.save(stack)?;

        self.finish(stack, report, outcome?)
    }

    /// Resume a sync that paused on conflicts
    pub async fn resume(&self, stack: &mut Stack) -> Result<SyncReport> {
        let mut report = SyncReport::new();
        report.phase = SyncPhase::Restacking;

        let engine = RestackEngine::new(self.gateway);
        let outcome = engine.resume(stack);
        self.store.save(stack)?;

        self.finish(stack, report, outcome?)
    }

    /// Fast-forward the trunk to its remote counterpart. Divergence is
    /// reported, never resolved here.
    fn advance_trunk(&self, stack: &mut Stack) -> Result<bool> {
        let trunk = stack.trunk.clone();
        let remote_ref = format!("{}/{}", self.settings.git.remote, trunk);
        let remote_commit = self.gateway.branch_commit(&remote_ref)?;
        let local_commit = stack.trunk_branch()?.commit.clone();

        if remote_commit == local_commit {
            debug!("trunk '{}' already up to date", trunk);
            return Ok(false);
        }

        let base = self.gateway.merge_base(&trunk, &remote_ref)?;
        if base == remote_commit {
            debug!("remote '{}' is behind local trunk", remote_ref);
            return Ok(false);
        }
        if base != local_commit {
            return Err(TrellisError::branch(format!(
                "trunk '{trunk}' has diverged from '{remote_ref}'; reconcile it manually \
                 before syncing"
            )));
        }

        self.gateway.fast_forward(&trunk, &remote_commit)?;
        stack
            .get_mut(&trunk)
            .ok_or_else(|| TrellisError::corruption(format!("trunk '{trunk}' missing")))?
            .set_commit(remote_commit);
        info!("fast-forwarded trunk '{}'", trunk);
        Ok(true)
    }

    /// Remove branches whose review requests merged, shallowest first so
    /// chained merges collapse onto the nearest surviving ancestor.
    async fn prune_merged(&self, stack: &mut Stack) -> Result<Vec<String>> {
        let submitted: HashMap<String, String> = stack
            .branches
            .values()
            .filter(|b| b.tracked && !b.is_trunk())
            .filter_map(|b| b.request_id.clone().map(|id| (id, b.name.clone())))
            .collect();

        if submitted.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = submitted.keys().cloned().collect();
        let statuses = self.provider.status_for(&ids).await?;

        let mut merged: Vec<(usize, String)> = Vec::new();
        for (id, name) in &submitted {
            if statuses.get(id).is_some_and(|s| s.is_merged()) {
                merged.push((stack.depth_of(name)?, name.clone()));
            }
        }
        merged.sort();

        let mut pruned = Vec::new();
        for (_, name) in merged {
            info!("pruning merged branch '{}'", name);
            stack.remove_branch(&name)?;
            pruned.push(name);
        }
        Ok(pruned)
    }

    fn finish(
        &self,
        stack: &Stack,
        mut report: SyncReport,
        outcome: RestackOutcome,
    ) -> Result<SyncReport> {
        match outcome {
            RestackOutcome::Clean(summary) => {
                report.phase = SyncPhase::Clean;
                report.rebased = summary.rebased;
                report.skipped = summary.skipped;

                if self.settings.git.delete_merged_branches {
                    for name in &report.pruned {
                        if let Err(e) = self.gateway.delete_branch(name, true) {
                            warn!("could not delete merged branch '{}': {}", name, e);
                        }
                    }
                }
            }
            RestackOutcome::ConflictPaused {
                branch,
                files,
                summary,
            } => {
                report.phase = SyncPhase::ConflictPaused;
                report.rebased = summary.rebased;
                report.skipped = summary.skipped;
                report.conflict = Some(SyncConflict { branch, files });
                debug!(
                    "sync paused; checkpoint covers {} remaining branches",
                    stack.checkpoint.as_ref().map_or(0, |cp| cp.queue.len())
                );
            }
        }
        Ok(report)
    }
}
