use std::collections::HashMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declarative definition of a whole dialog tree: the root node list plus
/// the reusable subtrees referenced from it. This is what schema/config
/// loading hands the engine; [`crate::tree::Tree::build`] validates and
/// freezes it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct TreeDef {
    #[serde(default)]
    pub nodes: Vec<ItemDef>,
    /// name → subtree; each may be referenced at most once.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub subtrees: HashMap<String, SubtreeDef>,
}

impl TreeDef {
    /// Shorthand for trees without subtrees.
    pub fn from_nodes(nodes: Vec<ItemDef>) -> Self {
        TreeDef { nodes, subtrees: HashMap::new() }
    }
}

/// One entry in a node list: either an inline node or a reference to a
/// named subtree that gets resolved in place at build time.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum ItemDef {
    Subtree {
        subtree: String,
    },
    Node(NodeDef),
}

/// A scripted dialog node. The label is required as soon as the node keys
/// persisted state by it, i.e. when it has followup children or slots.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NodeDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Condition expression, interpreted by the external evaluator. A node
    /// without one never matches a scan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Response scenario, opaque to the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub followup: Vec<ItemDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub slots: Vec<SlotDef>,
    /// Answer tangential questions while this node collects slots.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handlers: Vec<HandlerDef>,
    /// Whether a failed digression may return to this node, and whether it
    /// is re-triggered when a digression resumes onto its followup focus.
    #[serde(default = "default_true")]
    pub allow_return: bool,
}

impl Default for NodeDef {
    fn default() -> Self {
        NodeDef {
            label: None,
            condition: None,
            response: None,
            followup: Vec::new(),
            slots: Vec::new(),
            handlers: Vec::new(),
            allow_return: true,
        }
    }
}

impl NodeDef {
    pub fn new(condition: impl Into<String>, response: Value) -> Self {
        NodeDef {
            condition: Some(condition.into()),
            response: Some(response),
            ..Default::default()
        }
    }

    pub fn labelled(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_followup(mut self, followup: Vec<ItemDef>) -> Self {
        self.followup = followup;
        self
    }

    pub fn with_slots(mut self, slots: Vec<SlotDef>) -> Self {
        self.slots = slots;
        self
    }

    pub fn never_return(mut self) -> Self {
        self.allow_return = false;
        self
    }
}

/// A reusable, guard-gated group of nodes. The guard gates the whole group
/// during branch iteration, not individual members. Members are inline
/// nodes; a subtree cannot reference another subtree.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SubtreeDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default)]
    pub nodes: Vec<NodeDef>,
}

/// One value a slot-filling node collects before its main response runs.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SlotDef {
    pub name: String,
    /// Expression whose truthy result fills the slot.
    pub check_for: String,
    /// Optional override for the stored value; defaults to the check_for
    /// result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Enabling condition; an absent condition means always enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub found: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_found: Option<Value>,
}

impl SlotDef {
    pub fn new(name: impl Into<String>, check_for: impl Into<String>) -> Self {
        SlotDef {
            name: name.into(),
            check_for: check_for.into(),
            value: None,
            condition: None,
            prompt: None,
            found: None,
            not_found: None,
        }
    }

    pub fn with_prompt(mut self, prompt: Value) -> Self {
        self.prompt = Some(prompt);
        self
    }
}

/// Condition + response pair answering a tangential question during slot
/// collection.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HandlerDef {
    pub condition: String,
    pub response: Value,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_def_from_json() {
        let def: NodeDef = serde_json::from_value(json!({
            "label": "greet",
            "condition": "true",
            "response": [{"text": "hello"}],
            "followup": [
                {"condition": "false", "response": [{"text": "never"}]},
                {"subtree": "smalltalk"}
            ]
        }))
        .unwrap();

        assert_eq!(def.label.as_deref(), Some("greet"));
        assert!(def.allow_return);
        assert_eq!(def.followup.len(), 2);
        assert!(matches!(def.followup[1], ItemDef::Subtree { .. }));
    }

    #[test]
    fn test_slot_def_defaults() {
        let def: SlotDef = serde_json::from_value(json!({
            "name": "date",
            "check_for": "false"
        }))
        .unwrap();
        assert!(def.prompt.is_none());
        assert!(def.condition.is_none());
    }

    #[test]
    fn test_tree_def_round_trip() {
        let def = TreeDef::from_nodes(vec![ItemDef::Node(
            NodeDef::new("true", json!("hi")).labelled("root1"),
        )]);
        let json = serde_json::to_value(&def).unwrap();
        let back: TreeDef = serde_json::from_value(json).unwrap();
        assert_eq!(back.nodes.len(), 1);
    }
}
