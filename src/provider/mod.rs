//! Review-service integration.
//!
//! [`ReviewProvider`] is the seam the sync workflow talks through;
//! [`ReviewClient`] is the Bitbucket-Server-dialect REST implementation.

pub mod client;
pub mod types;

use crate::errors::Result;
use async_trait::async_trait;
use std::collections::HashMap;

pub use client::ReviewClient;
pub use types::{
    CreateReviewRequest, ReviewRequest, ReviewState, ReviewStatus, UpdateReviewRequest,
};

/// Operations the engine needs from a review service
#[async_trait]
pub trait ReviewProvider: Send + Sync {
    async fn create(&self, request: CreateReviewRequest) -> Result<ReviewRequest>;

    async fn update(&self, id: &str, request: UpdateReviewRequest) -> Result<ReviewRequest>;

    async fn get(&self, id: &str) -> Result<ReviewRequest>;

    /// List review requests, optionally filtered by state
    async fn list(&self, state: Option<ReviewState>) -> Result<Vec<ReviewRequest>>;

    /// Batched status lookup keyed by request id
    async fn status_for(&self, ids: &[String]) -> Result<HashMap<String, ReviewStatus>>;
}
