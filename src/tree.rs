use std::collections::{HashMap, HashSet};

use serde_json::Value;
use tracing::warn;

use crate::definition::{HandlerDef, ItemDef, NodeDef, SlotDef, TreeDef};
use crate::error::{TreeError, TurnError};
use crate::state::ROOT_COMPONENT;

/// Index of a node in the tree arena. Only valid for the tree that issued
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BranchId(pub(crate) usize);

/// Immutable per-node data, resolved from a [`NodeDef`] at build time.
#[derive(Debug)]
pub(crate) struct NodeData {
    pub label: Option<String>,
    pub condition: Option<String>,
    pub response: Option<Value>,
    pub followup: Option<BranchId>,
    pub slots: Vec<SlotDef>,
    pub handlers: Vec<HandlerDef>,
    pub allow_return: bool,
    pub parent: Option<NodeId>,
    owner: BranchId,
    item: usize,
    member: usize,
}

/// One entry of a branch: a direct node, or a resolved subtree whose guard
/// gates the whole group.
#[derive(Debug)]
pub(crate) enum BranchItem {
    Node(NodeId),
    Group {
        name: String,
        guard: Option<String>,
        members: Vec<NodeId>,
    },
}

#[derive(Debug)]
pub(crate) struct BranchData {
    items: Vec<BranchItem>,
}

/// The immutable dialog tree: node arena, label catalog and root branch.
/// Built once from definitions, validated at construction, read-only during
/// turns and shared across all dialogs.
#[derive(Debug)]
pub struct Tree {
    nodes: Vec<NodeData>,
    branches: Vec<BranchData>,
    catalog: HashMap<String, NodeId>,
    root: BranchId,
}

impl Tree {
    /// Recursively expand the definitions into nodes and resolved subtrees.
    /// Fatal on an unknown or reused subtree, a stateful node without a
    /// label, or a duplicate label; an unreferenced subtree only warns.
    pub fn build(def: &TreeDef) -> Result<Tree, TreeError> {
        let mut builder = Builder {
            subtrees: &def.subtrees,
            consumed: HashSet::new(),
            nodes: Vec::new(),
            branches: Vec::new(),
            catalog: HashMap::new(),
        };
        let root = builder.branch(&def.nodes, None)?;

        for name in def.subtrees.keys() {
            if !builder.consumed.contains(name) {
                warn!("subtree `{}` is defined but never referenced", name);
            }
        }

        Ok(Tree {
            nodes: builder.nodes,
            branches: builder.branches,
            catalog: builder.catalog,
            root,
        })
    }

    pub fn lookup(&self, label: &str) -> Option<NodeId> {
        self.catalog.get(label).copied()
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.catalog.contains_key(label)
    }

    pub fn node_label(&self, id: NodeId) -> Option<String> {
        self.node(id).label.clone()
    }

    /// Display name for logs and journal events.
    pub fn node_name(&self, id: NodeId) -> String {
        match &self.node(id).label {
            Some(label) => label.clone(),
            None => format!("#{}", id.0),
        }
    }

    pub(crate) fn node(&self, id: NodeId) -> &NodeData {
        &self.nodes[id.0]
    }

    pub(crate) fn root(&self) -> BranchId {
        self.root
    }

    pub(crate) fn branch(&self, id: BranchId) -> &BranchData {
        &self.branches[id.0]
    }

    /// Expand a branch into its ordered node sequence for one scan, asking
    /// `guard` once per subtree group and skipping groups whose guard does
    /// not hold. Declaration order is preserved; members are never
    /// reordered.
    pub(crate) fn expand<F>(&self, branch: BranchId, mut guard: F) -> Result<Vec<NodeId>, TurnError>
    where
        F: FnMut(&str) -> Result<bool, TurnError>,
    {
        let mut out = Vec::new();
        for item in &self.branch(branch).items {
            match item {
                BranchItem::Node(id) => out.push(*id),
                BranchItem::Group { guard: g, members, .. } => {
                    if Self::guard_holds(g.as_deref(), &mut guard)? {
                        out.extend(members.iter().copied());
                    }
                }
            }
        }
        Ok(out)
    }

    /// Expand `from` and its right siblings in document order. The
    /// remainder of `from`'s own group is included without re-evaluating
    /// its guard (the group was already active when `from` got focused);
    /// later groups evaluate theirs.
    pub(crate) fn expand_from<F>(&self, from: NodeId, mut guard: F) -> Result<Vec<NodeId>, TurnError>
    where
        F: FnMut(&str) -> Result<bool, TurnError>,
    {
        let data = self.node(from);
        let mut out = Vec::new();
        for (i, item) in self.branch(data.owner).items.iter().enumerate().skip(data.item) {
            match item {
                BranchItem::Node(id) => out.push(*id),
                BranchItem::Group { guard: g, members, .. } => {
                    if i == data.item {
                        out.extend(members[data.member..].iter().copied());
                    } else if Self::guard_holds(g.as_deref(), &mut guard)? {
                        out.extend(members.iter().copied());
                    }
                }
            }
        }
        Ok(out)
    }

    fn guard_holds<F>(guard: Option<&str>, eval: &mut F) -> Result<bool, TurnError>
    where
        F: FnMut(&str) -> Result<bool, TurnError>,
    {
        match guard {
            Some(expr) => eval(expr),
            None => Ok(true),
        }
    }
}

struct Builder<'d> {
    subtrees: &'d HashMap<String, crate::definition::SubtreeDef>,
    consumed: HashSet<String>,
    nodes: Vec<NodeData>,
    branches: Vec<BranchData>,
    catalog: HashMap<String, NodeId>,
}

impl Builder<'_> {
    fn branch(&mut self, items: &[ItemDef], parent: Option<NodeId>) -> Result<BranchId, TreeError> {
        let branch = BranchId(self.branches.len());
        self.branches.push(BranchData { items: Vec::new() });

        for (item, def) in items.iter().enumerate() {
            let entry = match def {
                ItemDef::Node(node) => {
                    let id = self.node(node, parent, branch, item, 0)?;
                    BranchItem::Node(id)
                }
                ItemDef::Subtree { subtree } => {
                    let resolved = self
                        .subtrees
                        .get(subtree)
                        .ok_or_else(|| TreeError::UnknownSubtree(subtree.clone()))?;
                    if !self.consumed.insert(subtree.clone()) {
                        return Err(TreeError::SubtreeReused(subtree.clone()));
                    }
                    let mut members = Vec::new();
                    for (member, node) in resolved.nodes.iter().enumerate() {
                        members.push(self.node(node, parent, branch, item, member)?);
                    }
                    BranchItem::Group {
                        name: subtree.clone(),
                        guard: resolved.condition.clone(),
                        members,
                    }
                }
            };
            self.branches[branch.0].items.push(entry);
        }
        Ok(branch)
    }

    fn node(
        &mut self,
        def: &NodeDef,
        parent: Option<NodeId>,
        owner: BranchId,
        item: usize,
        member: usize,
    ) -> Result<NodeId, TreeError> {
        if def.label.is_none() {
            if !def.slots.is_empty() {
                return Err(TreeError::MissingLabel("slots"));
            }
            if !def.followup.is_empty() {
                return Err(TreeError::MissingLabel("followup children"));
            }
        }

        let id = NodeId(self.nodes.len());
        if let Some(label) = &def.label {
            if label == ROOT_COMPONENT {
                return Err(TreeError::ReservedLabel(label.clone()));
            }
            if self.catalog.insert(label.clone(), id).is_some() {
                return Err(TreeError::DuplicateLabel(label.clone()));
            }
        }

        self.nodes.push(NodeData {
            label: def.label.clone(),
            condition: def.condition.clone(),
            response: def.response.clone(),
            followup: None,
            slots: def.slots.clone(),
            handlers: def.handlers.clone(),
            allow_return: def.allow_return,
            parent,
            owner,
            item,
            member,
        });

        if !def.followup.is_empty() {
            let followup = self.branch(&def.followup, Some(id))?;
            self.nodes[id.0].followup = Some(followup);
        }
        Ok(id)
    }
}
