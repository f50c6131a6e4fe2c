use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A tracked branch and its stack metadata.
///
/// Identity is the branch name; renames go through
/// [`Stack::rename_branch`](crate::stack::Stack::rename_branch) so parent
/// references stay consistent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    /// Git branch name
    pub name: String,
    /// Parent branch name (None only for the trunk)
    pub parent: Option<String>,
    /// Current commit id of the branch
    pub commit: String,
    /// Parent commit this branch was last restacked onto; None until the
    /// first restack records one
    pub parent_base: Option<String>,
    /// Review request id if submitted
    pub request_id: Option<String>,
    /// Review request URL if submitted
    pub request_url: Option<String>,
    /// When this branch was tracked
    pub created_at: DateTime<Utc>,
    /// When this record was last updated
    pub updated_at: DateTime<Utc>,
    /// A branch Git knows about but the engine is told to ignore when false
    pub tracked: bool,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Branch {
    /// Create a new tracked branch record
    pub fn new(name: impl Into<String>, parent: Option<String>, commit: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            parent,
            commit: commit.into(),
            parent_base: None,
            request_id: None,
            request_url: None,
            created_at: now,
            updated_at: now,
            tracked: true,
            metadata: BTreeMap::new(),
        }
    }

    /// Check if this is the trunk record (no parent)
    pub fn is_trunk(&self) -> bool {
        self.parent.is_none()
    }

    /// Check if the branch has been submitted for review
    pub fn is_submitted(&self) -> bool {
        self.request_id.is_some()
    }

    /// Record a new commit id
    pub fn set_commit(&mut self, commit: impl Into<String>) {
        self.commit = commit.into();
        self.updated_at = Utc::now();
    }

    /// Record the parent commit this branch now sits on
    pub fn set_parent_base(&mut self, base: impl Into<String>) {
        self.parent_base = Some(base.into());
        self.updated_at = Utc::now();
    }

    /// Associate a review request with this branch
    pub fn set_request(&mut self, id: impl Into<String>, url: impl Into<String>) {
        self.request_id = Some(id.into());
        self.request_url = Some(url.into());
        self.updated_at = Utc::now();
    }

    /// Short form of the commit id for display
    pub fn short_commit(&self) -> &str {
        if self.commit.len() >= 8 {
            &self.commit[..8]
        } else {
            &self.commit
        }
    }
}

impl std::fmt::Display for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.parent {
            Some(parent) => write!(f, "{} (parent: {parent})", self.name),
            None => write!(f, "{} (trunk)", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_branch() {
        let branch = Branch::new("feature", Some("main".to_string()), "abc123");
        assert_eq!(branch.name, "feature");
        assert_eq!(branch.parent.as_deref(), Some("main"));
        assert_eq!(branch.commit, "abc123");
        assert!(branch.parent_base.is_none());
        assert!(branch.tracked);
        assert!(!branch.is_trunk());
        assert!(!branch.is_submitted());
    }

    #[test]
    fn test_trunk_has_no_parent() {
        let trunk = Branch::new("main", None, "abc123");
        assert!(trunk.is_trunk());
    }

    #[test]
    fn test_set_request() {
        let mut branch = Branch::new("feature", Some("main".to_string()), "abc123");
        branch.set_request("42", "https://review.example.com/42");
        assert!(branch.is_submitted());
        assert_eq!(branch.request_id.as_deref(), Some("42"));
    }

    #[test]
    fn test_short_commit() {
        let branch = Branch::new("feature", None, "0123456789abcdef");
        assert_eq!(branch.short_commit(), "01234567");

        let short = Branch::new("feature", None, "abc");
        assert_eq!(short.short_commit(), "abc");
    }
}
