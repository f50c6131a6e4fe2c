//! The branch forest and the engines that operate on it.
//!
//! [`Stack`] models every tracked branch rooted at one trunk,
//! [`RestackEngine`] re-applies upstream changes through descendants, and
//! [`SyncCoordinator`] reconciles the forest with the remote.

pub mod branch;
pub mod branch_name;
pub mod forest;
pub mod restack;
pub mod sync;

pub use branch::Branch;
pub use branch_name::{generate_branch_name, validate_branch_name, NameOptions, DEFAULT_TEMPLATE};
pub use forest::{Stack, Violation};
pub use restack::{
    ConflictCheckpoint, RestackEngine, RestackOutcome, RestackSummary, ResumeOperation,
};
pub use sync::{SyncConflict, SyncCoordinator, SyncPhase, SyncReport};
