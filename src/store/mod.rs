//! Durable state for the branch forest.
//!
//! One JSON document under the repository's data directory holds the whole
//! forest plus any interrupted-restack checkpoint. Loads rebuild a
//! [`Stack`] from scratch; saves replace the document atomically so a crash
//! mid-write can never leave a torn file behind.

use crate::errors::{Result, TrellisError};
use crate::git::VcsGateway;
use crate::stack::{Branch, ConflictCheckpoint, Stack};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Current on-disk document version
pub const SCHEMA_VERSION: u32 = 1;

/// File name of the forest document inside the data directory
pub const STATE_FILE: &str = "stack.json";

/// On-disk shape of the forest
#[derive(Debug, Serialize, Deserialize)]
struct StateDocument {
    schema_version: u32,
    trunk: String,
    current_branch: Option<String>,
    branches: BTreeMap<String, Branch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    checkpoint: Option<ConflictCheckpoint>,
}

/// Reads and writes the forest document
pub struct StateStore {
    data_dir: PathBuf,
}

impl StateStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn file_path(&self) -> PathBuf {
        self.data_dir.join(STATE_FILE)
    }

    pub fn exists(&self) -> bool {
        self.file_path().exists()
    }

    /// Create the initial document containing only the trunk
    pub fn init(&self, trunk: &str, trunk_commit: &str) -> Result<Stack> {
        if self.exists() {
            return Err(TrellisError::config(format!(
                "state file already exists at {}",
                self.file_path().display()
            )));
        }
        let stack = Stack::new(trunk, trunk_commit);
        self.save(&stack)?;
        info!("initialized stack state with trunk '{}'", trunk);
        Ok(stack)
    }

    /// Load the forest, validating it before handing it out.
    ///
    /// A missing file means the repository was never initialized; anything
    /// unreadable or structurally invalid is corruption and is never
    /// silently repaired.
    pub fn load(&self) -> Result<Stack> {
        let path = self.file_path();
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TrellisError::config(format!(
                    "no stack state at {}; initialize the repository first",
                    path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let doc: StateDocument = serde_json::from_str(&contents).map_err(|e| {
            TrellisError::corruption(format!(
                "state file {} is not valid JSON: {e}",
                path.display()
            ))
        })?;

        if doc.schema_version != SCHEMA_VERSION {
            return Err(TrellisError::corruption(format!(
                "state file {} has schema version {} but this build expects {}",
                path.display(),
                doc.schema_version,
                SCHEMA_VERSION
            )));
        }

        let stack = Stack {
            trunk: doc.trunk,
            current_branch: doc.current_branch,
            branches: doc.branches,
            checkpoint: doc.checkpoint,
        };

        let violations = stack.validate();
        if !violations.is_empty() {
            let joined = violations
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(TrellisError::corruption(format!(
                "state file {} describes an invalid forest: {joined}",
                path.display()
            )));
        }

        debug!("loaded {} branches from {}", stack.len(), path.display());
        Ok(stack)
    }

    /// Persist the forest atomically: write a sibling temp file, flush it to
    /// disk, then rename over the document.
    pub fn save(&self, stack: &Stack) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;

        let doc = StateDocument {
            schema_version: SCHEMA_VERSION,
            trunk: stack.trunk.clone(),
            current_branch: stack.current_branch.clone(),
            branches: stack.branches.clone(),
            checkpoint: stack.checkpoint.clone(),
        };
        let json = serde_json::to_string_pretty(&doc)?;

        let path = self.file_path();
        let tmp = self.data_dir.join(format!("{STATE_FILE}.tmp"));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        debug!("saved {} branches to {}", stack.len(), path.display());
        Ok(())
    }

    /// Rebuild a degraded document from the branches Git knows about.
    ///
    /// Parent links cannot be recovered, so every branch lands directly
    /// under the trunk and is marked untracked until the user re-parents
    /// it. Overwrites whatever document existed.
    pub fn reconstruct<G: VcsGateway>(&self, gateway: &G, trunk: &str) -> Result<Stack> {
        let trunk_commit = gateway.branch_commit(trunk)?;
        let mut stack = Stack::new(trunk, trunk_commit);

        for name in gateway.list_branches()? {
            if name == trunk {
                continue;
            }
            let commit = gateway.branch_commit(&name)?;
            let mut branch = Branch::new(&name, Some(trunk.to_string()), commit);
            branch.tracked = false;
            stack.insert_record(branch);
        }

        warn!(
            "reconstructed {} branches under '{}'; parent links need manual review",
            stack.len() - 1,
            trunk
        );
        self.save(&stack)?;
        Ok(stack)
    }

    /// A checkpoint with no live rebase behind it is stale: the user (or
    /// another tool) finished or aborted the rebase out of band.
    pub fn checkpoint_is_stale<G: VcsGateway>(&self, stack: &Stack, gateway: &G) -> Result<bool> {
        Ok(stack.checkpoint.is_some() && !gateway.is_rebase_in_progress()?)
    }
}

/// Check whether a directory contains a state file
pub fn has_state(data_dir: &Path) -> bool {
    data_dir.join(STATE_FILE).exists()
}
