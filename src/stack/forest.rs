use super::branch::Branch;
use super::branch_name::validate_branch_name;
use super::restack::ConflictCheckpoint;
use crate::errors::{Result, TrellisError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};

/// A structural problem found by [`Stack::validate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// The trunk branch is not present in the forest
    MissingTrunk { trunk: String },
    /// The trunk record carries a parent reference
    TrunkHasParent { trunk: String, parent: String },
    /// A branch references a parent that is not in the forest
    DanglingParent { branch: String, parent: String },
    /// A branch is its own ancestor; `names` lists the cycle members
    Cycle { names: Vec<String> },
    /// A branch name violates Git ref naming rules
    IllegalName { branch: String, reason: String },
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Violation::MissingTrunk { trunk } => {
                write!(f, "trunk branch '{trunk}' is not in the forest")
            }
            Violation::TrunkHasParent { trunk, parent } => {
                write!(f, "trunk branch '{trunk}' has parent '{parent}'")
            }
            Violation::DanglingParent { branch, parent } => {
                write!(f, "branch '{branch}' references missing parent '{parent}'")
            }
            Violation::Cycle { names } => {
                write!(f, "cycle detected: {}", names.join(" -> "))
            }
            Violation::IllegalName { branch, reason } => {
                write!(f, "illegal branch name '{branch}': {reason}")
            }
        }
    }
}

/// The branch forest: every tracked branch, rooted at one trunk.
///
/// Rebuilt fresh from the state store at the start of each command and
/// discarded at the end; mutations happen on this transient copy and are
/// explicitly persisted. Derived views are recomputed on every call, never
/// cached across mutations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stack {
    /// Trunk branch name; the root all stacks target
    pub trunk: String,
    /// The branch checked out when the forest was loaded
    pub current_branch: Option<String>,
    /// All branch records keyed by name
    pub branches: BTreeMap<String, Branch>,
    /// Present only while a restack is interrupted; its presence is the
    /// sole source of truth for "restack in progress"
    pub checkpoint: Option<ConflictCheckpoint>,
}

impl Stack {
    /// Create a forest containing only the trunk
    pub fn new(trunk: impl Into<String>, trunk_commit: impl Into<String>) -> Self {
        let trunk = trunk.into();
        let mut branches = BTreeMap::new();
        branches.insert(trunk.clone(), Branch::new(trunk.clone(), None, trunk_commit));
        Self {
            trunk,
            current_branch: None,
            branches,
            checkpoint: None,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Branch> {
        self.branches.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Branch> {
        self.branches.get_mut(name)
    }

    /// The trunk's branch record
    pub fn trunk_branch(&self) -> Result<&Branch> {
        self.branches
            .get(&self.trunk)
            .ok_or_else(|| TrellisError::corruption(format!("trunk '{}' missing", self.trunk)))
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// Whether an interrupted restack blocks destructive operations
    pub fn is_restack_in_progress(&self) -> bool {
        self.checkpoint.is_some()
    }

    /// Track a new branch under `parent`. Rejected before any mutation when
    /// the name is illegal, already tracked, or the parent is unknown.
    pub fn add_branch(
        &mut self,
        name: &str,
        parent: &str,
        commit: impl Into<String>,
    ) -> Result<()> {
        validate_branch_name(name)?;
        if self.branches.contains_key(name) {
            return Err(TrellisError::validation(format!(
                "branch '{name}' is already tracked"
            )));
        }
        if !self.branches.contains_key(parent) {
            return Err(TrellisError::validation(format!(
                "parent branch '{parent}' is not tracked; track it first"
            )));
        }

        self.branches.insert(
            name.to_string(),
            Branch::new(name, Some(parent.to_string()), commit),
        );
        Ok(())
    }

    /// Insert a record as-is. Used by the store and degraded reconstruction;
    /// the caller is expected to validate the finished forest.
    pub fn insert_record(&mut self, branch: Branch) {
        self.branches.insert(branch.name.clone(), branch);
    }

    /// Remove a branch, reparenting its children onto its parent
    pub fn remove_branch(&mut self, name: &str) -> Result<Branch> {
        if name == self.trunk {
            return Err(TrellisError::validation("cannot remove the trunk branch"));
        }
        let removed = self.branches.remove(name).ok_or_else(|| {
            TrellisError::validation(format!("branch '{name}' is not tracked"))
        })?;

        let new_parent = removed.parent.clone();
        for branch in self.branches.values_mut() {
            if branch.parent.as_deref() == Some(name) {
                branch.parent = new_parent.clone();
                branch.updated_at = chrono::Utc::now();
            }
        }

        if self.current_branch.as_deref() == Some(name) {
            self.current_branch = None;
        }

        Ok(removed)
    }

    /// Rename a branch, updating every parent reference to it
    pub fn rename_branch(&mut self, old: &str, new: &str) -> Result<()> {
        if let Some(cp) = &self.checkpoint {
            return Err(TrellisError::restack_in_progress(&cp.branch));
        }
        validate_branch_name(new)?;
        if self.branches.contains_key(new) {
            return Err(TrellisError::validation(format!(
                "branch '{new}' already exists"
            )));
        }

        let mut branch = self.branches.remove(old).ok_or_else(|| {
            TrellisError::validation(format!("branch '{old}' is not tracked"))
        })?;
        branch.name = new.to_string();
        branch.updated_at = chrono::Utc::now();
        self.branches.insert(new.to_string(), branch);

        for other in self.branches.values_mut() {
            if other.parent.as_deref() == Some(old) {
                other.parent = Some(new.to_string());
                other.updated_at = chrono::Utc::now();
            }
        }

        if self.trunk == old {
            self.trunk = new.to_string();
        }
        if self.current_branch.as_deref() == Some(old) {
            self.current_branch = Some(new.to_string());
        }

        Ok(())
    }

    /// Direct children of a branch, ordered by creation time then name
    pub fn children_of(&self, name: &str) -> Vec<&Branch> {
        let mut children: Vec<&Branch> = self
            .branches
            .values()
            .filter(|b| b.parent.as_deref() == Some(name))
            .collect();
        children.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        children
    }

    /// Branches with no children
    pub fn leaves(&self) -> Vec<&Branch> {
        self.branches
            .values()
            .filter(|b| !self.branches.values().any(|c| c.parent.as_deref() == Some(b.name.as_str())))
            .collect()
    }

    /// Distance from the trunk (trunk itself is depth 0)
    pub fn depth_of(&self, name: &str) -> Result<usize> {
        Ok(self.downstack_of(name)?.len())
    }

    /// Strict ancestors of a branch, trunk-first.
    ///
    /// Walks parent links iteratively with a path set so malformed data
    /// terminates instead of recursing unbounded.
    pub fn downstack_of(&self, name: &str) -> Result<Vec<&Branch>> {
        let start = self.branches.get(name).ok_or_else(|| {
            TrellisError::validation(format!("branch '{name}' is not tracked"))
        })?;

        let mut seen: HashSet<&str> = HashSet::new();
        seen.insert(start.name.as_str());

        let mut ancestors = Vec::new();
        let mut cursor = start.parent.as_deref();
        while let Some(parent_name) = cursor {
            if !seen.insert(parent_name) {
                return Err(TrellisError::validation(format!(
                    "cycle detected while walking ancestors of '{name}'"
                )));
            }
            let parent = self.branches.get(parent_name).ok_or_else(|| {
                TrellisError::validation(format!(
                    "branch '{name}' has dangling ancestor '{parent_name}'"
                ))
            })?;
            ancestors.push(parent);
            cursor = parent.parent.as_deref();
        }

        ancestors.reverse();
        Ok(ancestors)
    }

    /// Path from the trunk to a branch, inclusive, trunk-first
    pub fn stack_for(&self, name: &str) -> Result<Vec<&Branch>> {
        let mut path = self.downstack_of(name)?;
        path.push(&self.branches[name]);
        Ok(path)
    }

    /// All descendants of a branch, parent-first (every branch appears
    /// after its parent); the branch itself is excluded
    pub fn upstack_of(&self, name: &str) -> Result<Vec<&Branch>> {
        if !self.branches.contains_key(name) {
            return Err(TrellisError::validation(format!(
                "branch '{name}' is not tracked"
            )));
        }

        let mut result = Vec::new();
        let mut visited: HashSet<&str> = HashSet::new();
        visited.insert(name);

        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(name);

        while let Some(current) = queue.pop_front() {
            for child in self.children_of(current) {
                if visited.insert(child.name.as_str()) {
                    result.push(child);
                    queue.push_back(child.name.as_str());
                }
            }
        }

        Ok(result)
    }

    /// Check the forest invariants, in order: trunk shape, parent
    /// resolution, acyclicity, name legality.
    pub fn validate(&self) -> Vec<Violation> {
        let mut violations = Vec::new();

        match self.branches.get(&self.trunk) {
            None => violations.push(Violation::MissingTrunk {
                trunk: self.trunk.clone(),
            }),
            Some(trunk) => {
                if let Some(parent) = &trunk.parent {
                    violations.push(Violation::TrunkHasParent {
                        trunk: self.trunk.clone(),
                        parent: parent.clone(),
                    });
                }
            }
        }

        for branch in self.branches.values() {
            if let Some(parent) = &branch.parent {
                if !self.branches.contains_key(parent) {
                    violations.push(Violation::DanglingParent {
                        branch: branch.name.clone(),
                        parent: parent.clone(),
                    });
                }
            }
        }

        violations.extend(self.find_cycles());

        for name in self.branches.keys() {
            if let Err(TrellisError::Validation(reason)) = validate_branch_name(name) {
                violations.push(Violation::IllegalName {
                    branch: name.clone(),
                    reason,
                });
            }
        }

        violations
    }

    /// Walk every parent chain once. A name reappearing on the current path
    /// is a cycle; the globally visited set keeps the whole pass linear in
    /// branch count even on pathological inputs.
    fn find_cycles(&self) -> Vec<Violation> {
        let mut violations = Vec::new();
        let mut cleared: HashSet<&str> = HashSet::new();
        let mut reported: HashSet<&str> = HashSet::new();

        for start in self.branches.keys() {
            if cleared.contains(start.as_str()) {
                continue;
            }

            let mut path: Vec<&str> = Vec::new();
            let mut on_path: HashSet<&str> = HashSet::new();
            let mut cursor: Option<&str> = Some(start.as_str());

            while let Some(name) = cursor {
                if cleared.contains(name) {
                    break;
                }
                if on_path.contains(name) {
                    // Cycle members are the path tail from the repeat point
                    let pos = path.iter().position(|&n| n == name).unwrap_or(0);
                    let mut names: Vec<String> =
                        path[pos..].iter().map(|n| n.to_string()).collect();
                    names.push(name.to_string());
                    if reported.insert(name) {
                        violations.push(Violation::Cycle { names });
                    }
                    break;
                }
                path.push(name);
                on_path.insert(name);
                cursor = self
                    .branches
                    .get(name)
                    .and_then(|b| b.parent.as_deref());
            }

            for name in path {
                cleared.insert(name);
            }
        }

        violations
    }

    /// Validation as a hard error, joined for display
    pub fn ensure_valid(&self) -> Result<()> {
        let violations = self.validate();
        if violations.is_empty() {
            return Ok(());
        }
        let joined = violations
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        Err(TrellisError::validation(joined))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_stack() -> Stack {
        // main -> a -> b -> c, plus main -> d
        let mut stack = Stack::new("main", "m0");
        stack.add_branch("a", "main", "a0").unwrap();
        stack.add_branch("b", "a", "b0").unwrap();
        stack.add_branch("c", "b", "c0").unwrap();
        stack.add_branch("d", "main", "d0").unwrap();
        stack
    }

    fn names(branches: &[&Branch]) -> Vec<String> {
        branches.iter().map(|b| b.name.clone()).collect()
    }

    #[test]
    fn test_stack_for_is_trunk_first_path() {
        let stack = sample_stack();
        let path = stack.stack_for("c").unwrap();
        assert_eq!(names(&path), vec!["main", "a", "b", "c"]);
        assert_eq!(path[0].name, stack.trunk);

        // Exactly the reverse of walking parent links from c to trunk
        let mut reversed: Vec<String> = Vec::new();
        let mut cursor = Some("c".to_string());
        while let Some(name) = cursor {
            reversed.push(name.clone());
            cursor = stack.get(&name).unwrap().parent.clone();
        }
        reversed.reverse();
        assert_eq!(names(&path), reversed);
    }

    #[test]
    fn test_upstack_excludes_self_and_orders_parent_first() {
        let stack = sample_stack();
        let upstack = names(&stack.upstack_of("a").unwrap());
        assert_eq!(upstack, vec!["b", "c"]);
        assert!(!upstack.contains(&"a".to_string()));

        let all = names(&stack.upstack_of("main").unwrap());
        for branch in &all {
            let parent = stack.get(branch).unwrap().parent.clone().unwrap();
            if parent != "main" {
                let parent_pos = all.iter().position(|n| *n == parent).unwrap();
                let child_pos = all.iter().position(|n| n == branch).unwrap();
                assert!(parent_pos < child_pos, "{parent} must precede {branch}");
            }
        }
    }

    #[test]
    fn test_downstack_is_trunk_first_ancestors() {
        let stack = sample_stack();
        assert_eq!(names(&stack.downstack_of("c").unwrap()), vec!["main", "a", "b"]);
        assert!(stack.downstack_of("main").unwrap().is_empty());
    }

    #[test]
    fn test_add_branch_rejects_duplicates_and_unknown_parent() {
        let mut stack = sample_stack();
        assert!(matches!(
            stack.add_branch("a", "main", "x"),
            Err(TrellisError::Validation(_))
        ));
        assert!(matches!(
            stack.add_branch("e", "ghost", "x"),
            Err(TrellisError::Validation(_))
        ));
        assert!(matches!(
            stack.add_branch("bad name", "main", "x"),
            Err(TrellisError::Validation(_))
        ));
        // Nothing was partially applied
        assert_eq!(stack.len(), 5);
    }

    #[test]
    fn test_remove_branch_reparents_children() {
        let mut stack = sample_stack();
        stack.remove_branch("a").unwrap();
        assert_eq!(stack.get("b").unwrap().parent.as_deref(), Some("main"));
        assert_eq!(stack.get("c").unwrap().parent.as_deref(), Some("b"));
        assert!(stack.remove_branch("main").is_err());
    }

    #[test]
    fn test_rename_updates_parent_references() {
        let mut stack = sample_stack();
        stack.rename_branch("a", "alpha").unwrap();
        assert!(stack.get("a").is_none());
        assert_eq!(stack.get("b").unwrap().parent.as_deref(), Some("alpha"));
        assert_eq!(
            names(&stack.stack_for("c").unwrap()),
            vec!["main", "alpha", "b", "c"]
        );
    }

    #[test]
    fn test_validate_clean_forest() {
        assert!(sample_stack().validate().is_empty());
    }

    #[test]
    fn test_validate_detects_cycle_with_both_names() {
        let mut stack = sample_stack();
        // Force a -> b while b -> a
        stack.get_mut("a").unwrap().parent = Some("b".to_string());

        let violations = stack.validate();
        let cycle = violations
            .iter()
            .find_map(|v| match v {
                Violation::Cycle { names } => Some(names.clone()),
                _ => None,
            })
            .expect("cycle violation expected");
        assert!(cycle.contains(&"a".to_string()));
        assert!(cycle.contains(&"b".to_string()));
    }

    #[test]
    fn test_validate_self_referential_parent_terminates() {
        let mut stack = sample_stack();
        stack.get_mut("d").unwrap().parent = Some("d".to_string());
        let violations = stack.validate();
        assert!(violations
            .iter()
            .any(|v| matches!(v, Violation::Cycle { names } if names.contains(&"d".to_string()))));
    }

    #[test]
    fn test_validate_detects_dangling_parent_and_trunk_shape() {
        let mut stack = sample_stack();
        stack.get_mut("d").unwrap().parent = Some("ghost".to_string());
        stack.get_mut("main").unwrap().parent = Some("a".to_string());

        let violations = stack.validate();
        assert!(violations
            .iter()
            .any(|v| matches!(v, Violation::DanglingParent { branch, parent }
                if branch == "d" && parent == "ghost")));
        assert!(violations
            .iter()
            .any(|v| matches!(v, Violation::TrunkHasParent { .. })));
    }

    #[test]
    fn test_long_chain_is_linear_and_terminates() {
        let mut stack = Stack::new("main", "m0");
        let mut parent = "main".to_string();
        for i in 0..500 {
            let name = format!("b{i}");
            stack.add_branch(&name, &parent, format!("c{i}")).unwrap();
            parent = name;
        }
        assert!(stack.validate().is_empty());
        assert_eq!(stack.upstack_of("main").unwrap().len(), 500);
        assert_eq!(stack.depth_of(&parent).unwrap(), 500);
    }

    #[test]
    fn test_leaves() {
        let stack = sample_stack();
        let mut leaf_names = names(&stack.leaves());
        leaf_names.sort();
        assert_eq!(leaf_names, vec!["c", "d"]);
    }
}
