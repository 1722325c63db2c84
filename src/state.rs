use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Name of the dialog-tree component's state slot. Node labels may not use
/// it; slot-filling components are keyed by their node's label.
pub const ROOT_COMPONENT: &str = "ROOT";

/// Per-dialog persisted state: a name-keyed registry of opaque JSON blobs,
/// one per flow component. The caller persists it after every turn and
/// hands it back on the next; the engine clears it entirely when a turn
/// ends the conversation. Unrecognised keys are carried along untouched,
/// never rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(transparent)]
pub struct DialogState(Map<String, Value>);

impl DialogState {
    pub fn new() -> Self {
        DialogState(Map::new())
    }

    /// The component's state blob, defaulting to an empty object for
    /// components that have not run yet.
    pub fn component(&self, name: &str) -> Value {
        self.0.get(name).cloned().unwrap_or_else(|| Value::Object(Map::new()))
    }

    pub fn put(&mut self, name: &str, state: Value) {
        self.0.insert(name.to_string(), state);
    }

    pub fn clear(&mut self, name: &str) {
        self.0.remove(name);
    }

    pub fn clear_all(&mut self) {
        self.0.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for DialogState {
    fn from(map: Map<String, Value>) -> Self {
        DialogState(map)
    }
}
