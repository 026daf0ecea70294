// Subtree expansion over a flat, parent-pointer snapshot.
// The adjacency map lives for one traversal only.

use std::collections::{HashMap, HashSet};

use super::types::NodeExecution;
use crate::errors::{ExecutionError, ExecutionResult};

/// `parent_id -> children` index into a snapshot, built in one pass
pub struct ChildrenIndex<'a> {
    by_id: HashMap<&'a str, &'a NodeExecution>,
    children: HashMap<&'a str, Vec<&'a NodeExecution>>,
}

impl<'a> ChildrenIndex<'a> {
    pub fn build(snapshot: &'a [NodeExecution]) -> Self {
        let mut by_id = HashMap::with_capacity(snapshot.len());
        let mut children: HashMap<&str, Vec<&NodeExecution>> = HashMap::new();
        for node in snapshot {
            by_id.insert(node.id.as_str(), node);
            if let Some(parent_id) = node.parent_id.as_deref() {
                children.entry(parent_id).or_default().push(node);
            }
        }
        Self { by_id, children }
    }

    pub fn children_of(&self, parent_id: &str) -> &[&'a NodeExecution] {
        self.children
            .get(parent_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Depth-first descendants of `root_id`, root appended last when asked
    pub fn descendants(
        &self,
        root_id: &str,
        include_root: bool,
    ) -> ExecutionResult<Vec<NodeExecution>> {
        let mut found = Vec::new();
        let mut visited: HashSet<&str> = HashSet::new();
        visited.insert(root_id);

        let mut stack: Vec<&NodeExecution> = self.children_of(root_id).iter().rev().copied().collect();
        while let Some(node) = stack.pop() {
            // a malformed snapshot may contain a parent cycle
            if !visited.insert(node.id.as_str()) {
                continue;
            }
            found.push(node.clone());
            stack.extend(self.children_of(&node.id).iter().rev().copied());
        }

        if include_root {
            let root = self.by_id.get(root_id).ok_or_else(|| {
                ExecutionError::InternalInvariantViolation(format!(
                    "root node execution {root_id} missing from plan snapshot"
                ))
            })?;
            found.push((*root).clone());
        }
        Ok(found)
    }
}
