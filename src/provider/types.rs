use serde::{Deserialize, Serialize};

/// Lifecycle state of a review request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReviewState {
    Open,
    Merged,
    Declined,
}

impl ReviewState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewState::Open => "OPEN",
            ReviewState::Merged => "MERGED",
            ReviewState::Declined => "DECLINED",
        }
    }
}

/// A review request as the engine sees it, independent of any provider's
/// wire format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewRequest {
    pub id: String,
    /// Provider-side optimistic-locking version, echoed back on updates
    pub version: u64,
    pub title: String,
    pub description: Option<String>,
    pub state: ReviewState,
    pub source_branch: String,
    pub target_branch: String,
    pub url: Option<String>,
}

/// Point-in-time status used for merged-branch detection and display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewStatus {
    pub state: ReviewState,
    /// None when the provider could not answer
    pub mergeable: Option<bool>,
    /// None when the provider exposes no check information
    pub checks_pass: Option<bool>,
    pub approved: bool,
}

impl ReviewStatus {
    pub fn is_merged(&self) -> bool {
        self.state == ReviewState::Merged
    }
}

/// Fields for creating a review request
#[derive(Debug, Clone)]
pub struct CreateReviewRequest {
    pub title: String,
    pub description: Option<String>,
    pub source_branch: String,
    pub target_branch: String,
}

/// Fields for updating a review request; None leaves a field unchanged
#[derive(Debug, Clone, Default)]
pub struct UpdateReviewRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub target_branch: Option<String>,
}
