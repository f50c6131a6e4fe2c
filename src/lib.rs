//! Trellis: an engine for stacks of dependent Git branches.
//!
//! A stack is a forest of branches rooted at a trunk. Trellis keeps the
//! forest durable across invocations, restacks descendants when an ancestor
//! moves (pausing safely on merge conflicts and resuming deterministically),
//! and drives the remote sync workflow: fetch, trunk fast-forward,
//! merged-request pruning, full-forest restack.
//!
//! The crate is a library; command-line parsing, terminal rendering, and
//! credential storage are the caller's concern.

pub mod config;
pub mod errors;
pub mod git;
pub mod provider;
pub mod stack;
pub mod store;

pub use errors::{Result, TrellisError};
