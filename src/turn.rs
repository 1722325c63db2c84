use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::warn;

use crate::command::{JumpTransition, NodeCommand};
use crate::context::{truthy, EvalParams, TurnContext, TurnKind};
use crate::error::TurnError;
use crate::flow::{run_component, DigressionResult, Env, FlowModel, FlowResult};
use crate::journal::JournalEvent;
use crate::slots::SlotFlow;
use crate::stack::{NodeStack, Transition};
use crate::state::DialogState;
use crate::tree::{BranchId, NodeId, Tree};

/// The dialog tree as a flow model: restores the node stack from the ROOT
/// component state, runs one turn of the traversal state machine, persists
/// the stack back.
pub(crate) struct TreeFlow {
    tree: Arc<Tree>,
}

impl TreeFlow {
    pub fn new(tree: Arc<Tree>) -> Self {
        TreeFlow { tree }
    }
}

#[async_trait]
impl FlowModel for TreeFlow {
    async fn run(
        &self,
        ctx: &mut TurnContext,
        env: &Env,
        store: &mut DialogState,
        state: &mut Value,
        _digression: Option<DigressionResult>,
    ) -> Result<FlowResult, TurnError> {
        let tree = self.tree.as_ref();
        let stack = NodeStack::restore(state, tree)?;
        let mut turn = TreeTurn { tree, env, ctx, store, stack };
        let result = turn.entry().await?;
        debug_assert!(result != FlowResult::Digress, "digressions resolve inside the tree turn");
        if result == FlowResult::Done {
            debug_assert!(turn.stack.is_empty());
        }
        *state = turn.stack.persist();
        Ok(result)
    }
}

/// One turn of the dialog-tree state machine. Document order and
/// first-match-wins make every step deterministic; the only mutable
/// resources are the stack, the context and the component store, each
/// owned by this turn.
struct TreeTurn<'a> {
    tree: &'a Tree,
    env: &'a Env,
    ctx: &'a mut TurnContext,
    store: &'a mut DialogState,
    stack: NodeStack,
}

impl<'a> TreeTurn<'a> {
    /// Dispatch on the focused node, or fall back to the root scan.
    async fn entry(&mut self) -> Result<FlowResult, TurnError> {
        match self.stack.peek(self.tree) {
            Some((node, Transition::Followup)) => self.focus_followup(node).await,
            Some((node, Transition::SlotFilling)) => self.trigger(node, None).await,
            Some((node, Transition::Condition)) => self.focus_condition(node).await,
            None => self.root_nodes().await,
        }
    }

    /// First root node in document order whose condition holds.
    async fn root_nodes(&mut self) -> Result<FlowResult, TurnError> {
        let candidates = self.expand_branch(self.tree.root(), None)?;
        for node in candidates {
            if self.matches(node, None)? {
                return self.trigger(node, None).await;
            }
        }
        Ok(FlowResult::Done)
    }

    /// Scan the focused node and its right siblings for the first match.
    async fn focus_condition(&mut self, node: NodeId) -> Result<FlowResult, TurnError> {
        let candidates = self.expand_from(node, None)?;
        for candidate in candidates {
            if self.matches(candidate, None)? {
                self.stack.remove(self.tree, node);
                return self.trigger(candidate, None).await;
            }
        }
        if self.tree.node(node).parent.is_some() {
            return self.digression(node).await;
        }
        warn!("focused node `{}` no longer matches and has no parent", self.tree.node_name(node));
        match self.return_after_digression(DigressionResult::Found).await? {
            Some(result) => Ok(result),
            None => Ok(FlowResult::Done),
        }
    }

    /// First matching followup child of the focused node.
    async fn focus_followup(&mut self, node: NodeId) -> Result<FlowResult, TurnError> {
        if let Some(branch) = self.tree.node(node).followup {
            let children = self.expand_branch(branch, None)?;
            for child in children {
                if self.matches(child, None)? {
                    self.stack.remove(self.tree, node);
                    return self.trigger(child, None).await;
                }
            }
        }
        self.digression(node).await
    }

    /// The `followup` control command: evaluate the children immediately
    /// instead of waiting for the next turn.
    fn command_followup<'s>(&'s mut self, node: NodeId) -> BoxFuture<'s, Result<FlowResult, TurnError>> {
        Box::pin(async move {
            if let Some(branch) = self.tree.node(node).followup {
                let children = self.expand_branch(branch, None)?;
                for child in children {
                    if self.matches(child, None)? {
                        return self.trigger_maybe_digressed(child).await;
                    }
                }
            }
            warn!("followup command on `{}` matched no child", self.tree.node_name(node));
            Ok(FlowResult::Listen)
        })
    }

    /// The `listen` control command: focus the node's followup branch, or
    /// let an interrupted node resume first.
    fn command_listen<'s>(&'s mut self, node: NodeId) -> BoxFuture<'s, Result<FlowResult, TurnError>> {
        Box::pin(async move {
            if self.tree.node(node).followup.is_some() {
                self.stack.push(self.tree, node, Transition::Followup);
                return Ok(FlowResult::Listen);
            }
            match self.return_after_digression(DigressionResult::Found).await? {
                Some(result) => Ok(result),
                None => Ok(FlowResult::Listen),
            }
        })
    }

    /// The `end` control command: the conversation is over.
    fn command_end(&mut self) -> FlowResult {
        self.stack.clear();
        FlowResult::Done
    }

    fn command_jump_to<'s>(
        &'s mut self,
        label: &str,
        transition: JumpTransition,
    ) -> BoxFuture<'s, Result<FlowResult, TurnError>> {
        let label = label.to_string();
        Box::pin(async move {
            let target = self
                .tree
                .lookup(&label)
                .ok_or_else(|| TurnError::UnknownJumpTarget(label.clone()))?;
            match transition {
                JumpTransition::Response => self.trigger_maybe_digressed(target).await,
                JumpTransition::Listen => {
                    self.stack.push(self.tree, target, Transition::Condition);
                    Ok(FlowResult::Listen)
                }
                JumpTransition::Condition => {
                    let candidates = self.expand_from(target, None)?;
                    for candidate in candidates {
                        if self.matches(candidate, None)? {
                            return self.trigger_maybe_digressed(candidate).await;
                        }
                    }
                    warn!("jump_to `{}` with condition transition matched nothing", label);
                    match self.return_after_digression(DigressionResult::Found).await? {
                        Some(result) => Ok(result),
                        None => Ok(FlowResult::Done),
                    }
                }
            }
        })
    }

    /// A focused node got input it cannot handle: scan the root branch
    /// (never `from` itself) with the digressing flag set, and hand the
    /// turn to the first match.
    fn digression<'s>(&'s mut self, from: NodeId) -> BoxFuture<'s, Result<FlowResult, TurnError>> {
        Box::pin(async move {
            self.env.journal.record(
                self.ctx.turn_id(),
                JournalEvent::DigressionFrom { node: self.tree.node_name(from) },
            );
            let candidates = self.expand_branch(self.tree.root(), Some(true))?;
            for candidate in candidates {
                if candidate == from {
                    continue;
                }
                if self.matches(candidate, Some(true))? {
                    return self.trigger_maybe_digressed(candidate).await;
                }
            }
            if self.ctx.kind() == TurnKind::OutOfBand {
                // Nothing to say to a stray RPC turn; stay suspended.
                return Ok(FlowResult::Listen);
            }
            if self.tree.node(from).allow_return {
                match self.return_after_digression(DigressionResult::NotFound).await? {
                    Some(result) => Ok(result),
                    None => Ok(self.command_end()),
                }
            } else {
                warn!(
                    "digression from `{}` matched nothing and the node never returns; ending",
                    self.tree.node_name(from)
                );
                Ok(self.command_end())
            }
        })
    }

    /// Resume whatever the stack remembers, skipping entries that refuse
    /// or cannot take control back. `None` means the stack is exhausted.
    fn return_after_digression<'s>(
        &'s mut self,
        result: DigressionResult,
    ) -> BoxFuture<'s, Result<Option<FlowResult>, TurnError>> {
        Box::pin(async move {
            let Some((node, transition)) = self.stack.pop(self.tree) else {
                return Ok(None);
            };
            match transition {
                Transition::SlotFilling => self.trigger(node, Some(result)).await.map(Some),
                Transition::Followup => {
                    if self.tree.node(node).allow_return {
                        self.trigger(node, Some(result)).await.map(Some)
                    } else {
                        self.return_after_digression(result).await
                    }
                }
                Transition::Condition => self.return_after_digression(result).await,
            }
        })
    }

    /// Trigger a node that may itself be the interrupted one: if it is on
    /// the stack, this turn is its resumption.
    fn trigger_maybe_digressed<'s>(&'s mut self, node: NodeId) -> BoxFuture<'s, Result<FlowResult, TurnError>> {
        Box::pin(async move {
            if self.stack.contains(self.tree, node) {
                self.stack.remove(self.tree, node);
                self.trigger(node, Some(DigressionResult::Found)).await
            } else {
                self.trigger(node, None).await
            }
        })
    }

    /// Run the node: its slot-filling sub-flow first if it has one, then
    /// the response.
    fn trigger<'s>(
        &'s mut self,
        node: NodeId,
        digression: Option<DigressionResult>,
    ) -> BoxFuture<'s, Result<FlowResult, TurnError>> {
        Box::pin(async move {
            self.env.journal.record(
                self.ctx.turn_id(),
                JournalEvent::NodeTriggered {
                    node: self.tree.node_name(node),
                    digressing: digression.is_some(),
                },
            );
            if self.tree.node(node).slots.is_empty() {
                return self.response(node, digression).await;
            }

            // Slot collection runs as its own component, keyed by the
            // node's label.
            let label = self.tree.node_name(node);
            let flow = SlotFlow { tree: self.tree, node };
            let result =
                run_component(&label, &flow, self.ctx, self.env, self.store, digression).await?;
            match result {
                FlowResult::Done => {
                    self.stack.remove(self.tree, node);
                    self.response(node, digression).await
                }
                FlowResult::Listen => {
                    self.stack.push(self.tree, node, Transition::SlotFilling);
                    Ok(FlowResult::Listen)
                }
                FlowResult::Digress => self.digression(node).await,
            }
        })
    }

    /// Run the node's response scenario. The first control command
    /// dispatches and stops further processing; everything else is
    /// appended to the output in order.
    fn response<'s>(
        &'s mut self,
        node: NodeId,
        digression: Option<DigressionResult>,
    ) -> BoxFuture<'s, Result<FlowResult, TurnError>> {
        Box::pin(async move {
            let tree = self.tree;
            self.env
                .journal
                .record(self.ctx.turn_id(), JournalEvent::Response { node: tree.node_name(node) });

            if let Some(scenario) = &tree.node(node).response {
                let params = match digression {
                    Some(result) => EvalParams::resumed(result),
                    None => EvalParams::default(),
                };
                let commands = self.env.evaluator.scenario(scenario, self.ctx, &params).await?;
                for command in commands {
                    match NodeCommand::parse(&command)? {
                        Some(NodeCommand::JumpTo { node: target, transition }) => {
                            return self.command_jump_to(&target, transition).await;
                        }
                        Some(NodeCommand::Listen) => return self.command_listen(node).await,
                        Some(NodeCommand::End) => return Ok(self.command_end()),
                        Some(NodeCommand::Followup) => return self.command_followup(node).await,
                        None => self.ctx.emit(command),
                    }
                }
            }

            if tree.node(node).followup.is_some() {
                self.command_listen(node).await
            } else {
                match self.return_after_digression(DigressionResult::Found).await? {
                    Some(result) => Ok(result),
                    None => Ok(self.command_end()),
                }
            }
        })
    }

    fn matches(&self, node: NodeId, digressing: Option<bool>) -> Result<bool, TurnError> {
        let Some(expr) = &self.tree.node(node).condition else {
            return Ok(false);
        };
        let params = match digressing {
            Some(flag) => EvalParams::digressing(flag),
            None => EvalParams::default(),
        };
        Ok(truthy(&self.env.evaluator.condition(expr, self.ctx, &params)?))
    }

    fn expand_branch(
        &self,
        branch: BranchId,
        digressing: Option<bool>,
    ) -> Result<Vec<NodeId>, TurnError> {
        let eval = &self.env.evaluator;
        let ctx = &*self.ctx;
        self.tree.expand(branch, |guard| {
            let params = match digressing {
                Some(flag) => EvalParams::digressing(flag),
                None => EvalParams::default(),
            };
            Ok(truthy(&eval.condition(guard, ctx, &params)?))
        })
    }

    fn expand_from(
        &self,
        from: NodeId,
        digressing: Option<bool>,
    ) -> Result<Vec<NodeId>, TurnError> {
        let eval = &self.env.evaluator;
        let ctx = &*self.ctx;
        self.tree.expand_from(from, |guard| {
            let params = match digressing {
                Some(flag) => EvalParams::digressing(flag),
                None => EvalParams::default(),
            };
            Ok(truthy(&eval.condition(guard, ctx, &params)?))
        })
    }
}
