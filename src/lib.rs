//! convoflow is a stateful conversation-flow engine. A dialog is described
//! as a tree of condition-guarded nodes; each user turn walks the tree,
//! collects node slots, runs response scenarios and returns a terminal
//! result (`Listen`, `Done`) plus the ordered output command list. All
//! per-conversation state lives in one serializable [`state::DialogState`]
//! blob owned by the caller, so the engine itself is stateless between
//! turns.

pub mod command;
pub mod context;
pub mod definition;
pub mod error;
pub mod flow;
pub mod journal;
pub mod slots;
pub mod stack;
pub mod state;
pub mod tree;
mod turn;

pub use context::{Evaluator, EvalParams, LiteralEvaluator, TurnContext, TurnKind};
pub use definition::{HandlerDef, ItemDef, NodeDef, SlotDef, SubtreeDef, TreeDef};
pub use error::{EvalError, TreeError, TurnError};
pub use flow::{DialogFlow, DialogRegistry, DigressionResult, FlowResult, TurnHook, TurnReport};
pub use journal::{Journal, JournalEvent, JournalRecord, JournalSink};
pub use state::DialogState;
pub use tree::Tree;
