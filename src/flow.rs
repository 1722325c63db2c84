use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::context::{Evaluator, TurnContext};
use crate::error::TurnError;
use crate::journal::{Journal, JournalSink};
use crate::state::{DialogState, ROOT_COMPONENT};
use crate::tree::Tree;
use crate::turn::TreeFlow;

/// Outcome of one flow invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FlowResult {
    /// A nested flow is stuck and asks the dialog tree to try a digression.
    Digress,
    /// The flow suspends awaiting the next turn; its state must persist.
    Listen,
    /// The flow completed; its state slot is cleared.
    Done,
}

/// Whether a digression found a node to handle the turn, reported back to
/// the suspended position when control returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DigressionResult {
    Found,
    NotFound,
}

/// Shared per-flow collaborators: the external evaluator and the optional
/// journal side channel.
#[derive(Clone)]
pub struct Env {
    pub(crate) evaluator: Arc<dyn Evaluator>,
    pub(crate) journal: Journal,
}

/// A flow model the component glue can drive: the dialog tree itself, or a
/// node's slot-filling sub-flow. `state` is the model's own blob; `store`
/// is the whole per-dialog registry, so a model may run nested components.
#[async_trait]
pub trait FlowModel: Send + Sync {
    async fn run(
        &self,
        ctx: &mut TurnContext,
        env: &Env,
        store: &mut DialogState,
        state: &mut Value,
        digression: Option<DigressionResult>,
    ) -> Result<FlowResult, TurnError>;
}

/// Wrap one flow invocation in its named state slot: read the component's
/// state (default empty), run the model, clear the slot on DONE, persist
/// the mutated state otherwise.
pub async fn run_component<M>(
    name: &str,
    model: &M,
    ctx: &mut TurnContext,
    env: &Env,
    store: &mut DialogState,
    digression: Option<DigressionResult>,
) -> Result<FlowResult, TurnError>
where
    M: FlowModel + ?Sized,
{
    let mut state = store.component(name);
    let result = model.run(ctx, env, store, &mut state, digression).await?;
    if result == FlowResult::Done {
        store.clear(name);
    } else {
        store.put(name, state);
    }
    Ok(result)
}

/// What one turn produced: the terminal result, the ordered output command
/// list, and the runtime error if the turn was forced to DONE.
#[derive(Debug)]
pub struct TurnReport {
    pub result: FlowResult,
    pub output: Vec<Value>,
    pub error: Option<TurnError>,
}

impl TurnReport {
    pub fn is_done(&self) -> bool {
        self.result == FlowResult::Done
    }
}

/// Before/after-turn callbacks around the root component. A failing
/// before-turn hook aborts the turn like any runtime error; a failing
/// after-turn hook only logs.
#[async_trait]
pub trait TurnHook: Send + Sync {
    async fn before_turn(&self, _ctx: &mut TurnContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn after_turn(&self, _ctx: &TurnContext, _report: &TurnReport) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Outermost orchestrator for one dialog tree: runs the hooks, invokes the
/// root flow component, converts uncaught failures into a terminal DONE and
/// clears all persisted component state on completion.
pub struct DialogFlow {
    tree: Arc<Tree>,
    env: Env,
    hooks: Vec<Arc<dyn TurnHook>>,
}

impl DialogFlow {
    pub fn new(tree: Arc<Tree>, evaluator: Arc<dyn Evaluator>) -> Self {
        DialogFlow {
            tree,
            env: Env { evaluator, journal: Journal::default() },
            hooks: Vec::new(),
        }
    }

    pub fn with_journal(mut self, sink: Arc<dyn JournalSink>) -> Self {
        self.env.journal = Journal::sink(sink);
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn TurnHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Run one turn. The caller must serialize invocations per dialog key;
    /// the engine assumes at most one concurrent turn per dialog.
    pub async fn turn(&self, ctx: &mut TurnContext, state: &mut DialogState) -> TurnReport {
        let mut outcome = Ok(());
        for hook in &self.hooks {
            if let Err(e) = hook.before_turn(ctx).await {
                outcome = Err(TurnError::Hook(e));
                break;
            }
        }

        let outcome = match outcome {
            Ok(()) => {
                let model = TreeFlow::new(self.tree.clone());
                run_component(ROOT_COMPONENT, &model, ctx, &self.env, state, None).await
            }
            Err(e) => Err(e),
        };

        let report = match outcome {
            Ok(result) => {
                if result == FlowResult::Done {
                    state.clear_all();
                }
                TurnReport { result, output: ctx.take_output(), error: None }
            }
            Err(err) => {
                // A broken turn must never leave the conversation stuck.
                error!("turn {} failed: {err}; ending conversation", ctx.turn_id());
                state.clear_all();
                TurnReport { result: FlowResult::Done, output: ctx.take_output(), error: Some(err) }
            }
        };

        for hook in &self.hooks {
            if let Err(e) = hook.after_turn(ctx, &report).await {
                warn!("after-turn hook failed: {e}");
            }
        }
        report
    }
}

/// Concurrent registry of named dialog flows, for hosts serving several
/// assistants from one process.
#[derive(Clone, Default)]
pub struct DialogRegistry {
    flows: Arc<DashMap<String, Arc<DialogFlow>>>,
}

impl DialogRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, flow: Arc<DialogFlow>) {
        self.flows.insert(name.to_string(), flow);
        info!("Registered dialog flow: {}", name);
    }

    pub fn remove(&self, name: &str) {
        self.flows.remove(name);
        info!("Removed dialog flow: {}", name);
    }

    pub fn get(&self, name: &str) -> Option<Arc<DialogFlow>> {
        self.flows.get(name).map(|f| f.clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.flows.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::LiteralEvaluator;
    use crate::definition::{ItemDef, NodeDef, TreeDef};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn flow(def: TreeDef) -> DialogFlow {
        let tree = Arc::new(Tree::build(&def).unwrap());
        DialogFlow::new(tree, Arc::new(LiteralEvaluator))
    }

    #[derive(Default)]
    struct CountingHook {
        before: AtomicUsize,
        after: AtomicUsize,
    }

    #[async_trait]
    impl TurnHook for CountingHook {
        async fn before_turn(&self, _ctx: &mut TurnContext) -> anyhow::Result<()> {
            self.before.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn after_turn(&self, _ctx: &TurnContext, _report: &TurnReport) -> anyhow::Result<()> {
            self.after.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingHook;

    #[async_trait]
    impl TurnHook for FailingHook {
        async fn before_turn(&self, _ctx: &mut TurnContext) -> anyhow::Result<()> {
            anyhow::bail!("nope")
        }
    }

    #[tokio::test]
    async fn test_hooks_run_around_turn() {
        let hook = Arc::new(CountingHook::default());
        let flow = flow(TreeDef::from_nodes(vec![ItemDef::Node(NodeDef::new(
            "true",
            json!("hi"),
        ))]))
        .with_hook(hook.clone());

        let mut ctx = TurnContext::new(json!({}));
        let mut state = DialogState::new();
        let report = flow.turn(&mut ctx, &mut state).await;

        assert_eq!(report.result, FlowResult::Done);
        assert_eq!(hook.before.load(Ordering::SeqCst), 1);
        assert_eq!(hook.after.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_before_hook_forces_done_and_clears_state() {
        let flow = flow(TreeDef::from_nodes(vec![ItemDef::Node(
            NodeDef::new("true", json!("hi")).labelled("n"),
        )]))
        .with_hook(Arc::new(FailingHook));

        let mut ctx = TurnContext::new(json!({}));
        let mut state = DialogState::new();
        state.put("leftover", json!({"x": 1}));

        let report = flow.turn(&mut ctx, &mut state).await;
        assert_eq!(report.result, FlowResult::Done);
        assert!(matches!(report.error, Some(TurnError::Hook(_))));
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn test_registry_register_and_remove() {
        let registry = DialogRegistry::new();
        let f = Arc::new(flow(TreeDef::default()));
        registry.register("support", f);

        assert!(registry.get("support").is_some());
        assert_eq!(registry.names(), vec!["support".to_string()]);

        registry.remove("support");
        assert!(registry.get("support").is_none());
    }
}
