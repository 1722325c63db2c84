use thiserror::Error;

/// Structural errors raised while building a [`crate::tree::Tree`] from its
/// definitions. These are fatal: a tree that fails to build must not serve
/// turns.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("unknown subtree `{0}`")]
    UnknownSubtree(String),
    #[error("subtree `{0}` is referenced more than once")]
    SubtreeReused(String),
    #[error("node with {0} requires a label")]
    MissingLabel(&'static str),
    #[error("duplicate node label `{0}`")]
    DuplicateLabel(String),
    #[error("label `{0}` is reserved")]
    ReservedLabel(String),
}

/// Failure reported by the external condition/scenario evaluator.
#[derive(Debug, Clone, Error)]
#[error("evaluator error: {0}")]
pub struct EvalError(pub String);

impl EvalError {
    pub fn new(msg: impl Into<String>) -> Self {
        EvalError(msg.into())
    }
}

/// Runtime errors during a turn. The orchestrator catches these, records
/// them on the report and forces the turn to a terminal DONE with all
/// persisted component state cleared, so a broken turn never leaves a
/// conversation stuck.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error("jump_to target `{0}` does not exist")]
    UnknownJumpTarget(String),
    #[error("jump_to transition `{0}` is not one of response/condition/listen")]
    UnknownJumpTransition(String),
    #[error("command object mixes a control key with other keys: {0}")]
    AmbiguousCommand(String),
    #[error("malformed control command: {0}")]
    InvalidCommand(String),
    #[error("persisted state for `{component}` is corrupt: {reason}")]
    CorruptState { component: String, reason: String },
    #[error("before-turn hook failed: {0}")]
    Hook(#[source] anyhow::Error),
}
