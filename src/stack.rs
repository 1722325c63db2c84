use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TurnError;
use crate::state::ROOT_COMPONENT;
use crate::tree::{NodeId, Tree};

/// How a focused node expects to be resumed on the next turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Condition,
    Followup,
    SlotFilling,
}

/// Persisted layout of the dialog-tree component's state slot. Extra keys
/// in the stored object are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct RootState {
    #[serde(default)]
    pub node_stack: Vec<(String, Transition)>,
}

/// View over the persisted ordered list of (label, transition) pairs
/// remembering which nodes await the next turn. A label appears at most
/// once; stale labels are garbage-collected at the start of every turn.
#[derive(Debug, Clone, Default)]
pub struct NodeStack {
    entries: Vec<(String, Transition)>,
}

impl NodeStack {
    /// Restore the stack from the component's state blob, dropping entries
    /// whose label no longer exists in the tree catalog. A malformed blob
    /// (including an unknown transition) is a non-recoverable turn error.
    pub fn restore(state: &Value, tree: &Tree) -> Result<Self, TurnError> {
        let root: RootState =
            serde_json::from_value(state.clone()).map_err(|e| TurnError::CorruptState {
                component: ROOT_COMPONENT.to_string(),
                reason: e.to_string(),
            })?;
        let mut stack = NodeStack { entries: root.node_stack };
        stack.gc(tree);
        Ok(stack)
    }

    pub fn persist(&self) -> Value {
        serde_json::to_value(RootState { node_stack: self.entries.clone() })
            .unwrap_or(Value::Null)
    }

    /// Focus a node: any existing entry for its label is removed first, so
    /// a label never appears twice.
    pub fn push(&mut self, tree: &Tree, node: NodeId, transition: Transition) {
        if let Some(label) = &tree.node_label(node) {
            self.entries.retain(|(l, _)| l != label);
            self.entries.push((label.clone(), transition));
        }
    }

    /// Resolve and remove the most recent entry.
    pub fn pop(&mut self, tree: &Tree) -> Option<(NodeId, Transition)> {
        while let Some((label, transition)) = self.entries.pop() {
            if let Some(id) = tree.lookup(&label) {
                return Some((id, transition));
            }
        }
        None
    }

    /// Resolve the most recent entry without removing it.
    pub fn peek(&self, tree: &Tree) -> Option<(NodeId, Transition)> {
        self.entries
            .last()
            .and_then(|(label, transition)| tree.lookup(label).map(|id| (id, *transition)))
    }

    /// Drop all entries for the node's label; reports whether any existed.
    pub fn remove(&mut self, tree: &Tree, node: NodeId) -> bool {
        match tree.node_label(node) {
            Some(label) => {
                let before = self.entries.len();
                self.entries.retain(|(l, _)| *l != label);
                before != self.entries.len()
            }
            None => false,
        }
    }

    pub fn contains(&self, tree: &Tree, node: NodeId) -> bool {
        match tree.node_label(node) {
            Some(label) => self.entries.iter().any(|(l, _)| *l == label),
            None => false,
        }
    }

    /// Silently drop entries whose label is absent from the catalog.
    pub fn gc(&mut self, tree: &Tree) {
        self.entries.retain(|(label, _)| tree.has_label(label));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(String, Transition)] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{ItemDef, NodeDef, TreeDef};
    use serde_json::json;

    fn tree(labels: &[&str]) -> Tree {
        let nodes = labels
            .iter()
            .map(|l| ItemDef::Node(NodeDef::new("true", json!("hi")).labelled(*l)))
            .collect();
        Tree::build(&TreeDef::from_nodes(nodes)).unwrap()
    }

    #[test]
    fn test_push_deduplicates_label() {
        let tree = tree(&["a", "b"]);
        let a = tree.lookup("a").unwrap();
        let b = tree.lookup("b").unwrap();

        let mut stack = NodeStack::default();
        stack.push(&tree, a, Transition::Condition);
        stack.push(&tree, b, Transition::Followup);
        stack.push(&tree, a, Transition::SlotFilling);

        assert_eq!(
            stack.entries(),
            &[
                ("b".to_string(), Transition::Followup),
                ("a".to_string(), Transition::SlotFilling)
            ]
        );
        assert_eq!(stack.peek(&tree), Some((a, Transition::SlotFilling)));
    }

    #[test]
    fn test_remove_reports_found() {
        let tree = tree(&["a", "b"]);
        let a = tree.lookup("a").unwrap();
        let b = tree.lookup("b").unwrap();

        let mut stack = NodeStack::default();
        stack.push(&tree, a, Transition::Followup);
        assert!(stack.remove(&tree, a));
        assert!(!stack.remove(&tree, a));
        assert!(!stack.remove(&tree, b));
        assert!(stack.is_empty());
    }

    #[test]
    fn test_restore_gc_and_round_trip() {
        let tree = tree(&["a"]);
        let state = json!({
            "node_stack": [["stale", "condition"], ["a", "followup"]],
            "unrelated": 7
        });

        let stack = NodeStack::restore(&state, &tree).unwrap();
        assert_eq!(stack.entries(), &[("a".to_string(), Transition::Followup)]);

        let persisted = stack.persist();
        assert_eq!(persisted, json!({"node_stack": [["a", "followup"]]}));
        let again = NodeStack::restore(&persisted, &tree).unwrap();
        assert_eq!(again.entries(), stack.entries());
    }

    #[test]
    fn test_restore_rejects_unknown_transition() {
        let tree = tree(&["a"]);
        let state = json!({"node_stack": [["a", "teleport"]]});
        let err = NodeStack::restore(&state, &tree).unwrap_err();
        assert!(matches!(err, TurnError::CorruptState { .. }));
    }
}
