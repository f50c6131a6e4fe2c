/// Trellis error types.
///
/// Every failure carries a machine-distinguishable kind; human messages name
/// the affected branch or operation and, where one exists, a concrete next
/// action.
#[derive(Debug, thiserror::Error)]
pub enum TrellisError {
    /// Git-related errors
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Branch management errors
    #[error("Branch error: {0}")]
    Branch(String),

    /// A version-control or review-service call failed
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// Network errors
    #[error("Network error: {0}")]
    Network(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parsing errors
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// The forest would become (or already is) structurally invalid
    #[error("Validation error: {0}")]
    Validation(String),

    /// State store unreadable or schema-invalid
    #[error("State corruption: {0}")]
    Corruption(String),

    /// Resume attempted when repository reality disagrees with the checkpoint
    #[error("State mismatch: {0}")]
    StateMismatch(String),

    /// A persisted conflict checkpoint blocks destructive operations
    #[error("Restack in progress: {0}")]
    RestackInProgress(String),
}

impl TrellisError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        TrellisError::Config(msg.into())
    }

    pub fn branch<S: Into<String>>(msg: S) -> Self {
        TrellisError::Branch(msg.into())
    }

    pub fn gateway<S: Into<String>>(msg: S) -> Self {
        TrellisError::Gateway(msg.into())
    }

    pub fn network<S: Into<String>>(msg: S) -> Self {
        TrellisError::Network(msg.into())
    }

    pub fn validation<S: Into<String>>(msg: S) -> Self {
        TrellisError::Validation(msg.into())
    }

    pub fn corruption<S: Into<String>>(msg: S) -> Self {
        TrellisError::Corruption(msg.into())
    }

    pub fn state_mismatch<S: Into<String>>(msg: S) -> Self {
        TrellisError::StateMismatch(msg.into())
    }

    pub fn restack_in_progress(branch: &str) -> Self {
        TrellisError::RestackInProgress(format!(
            "a restack is paused on branch '{branch}'; resume or abort it first"
        ))
    }

    pub fn review_api(status: u16, message: String) -> Self {
        TrellisError::Gateway(format!("review service error: {status} - {message}"))
    }
}

pub type Result<T> = std::result::Result<T, TrellisError>;
