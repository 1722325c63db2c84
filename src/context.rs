use std::collections::HashMap;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EvalError;
use crate::flow::DigressionResult;

/// How the engine was invoked for this turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    /// A user message on the conversation channel.
    Message,
    /// An out-of-band request (RPC). A digression that matches nothing on
    /// such a turn suspends with state untouched instead of ending.
    OutOfBand,
}

/// Everything one turn works on: the incoming payload, the name-keyed
/// conversation variables, and the ordered output command list the turn
/// appends to. Owned exclusively by the running turn; the engine itself
/// performs no I/O through it.
#[derive(Debug, Clone)]
pub struct TurnContext {
    turn_id: String,
    kind: TurnKind,
    payload: Value,
    vars: HashMap<String, Value>,
    output: Vec<Value>,
}

impl TurnContext {
    pub fn new(payload: Value) -> Self {
        Self::with_kind(payload, TurnKind::Message)
    }

    /// Build a context for an out-of-band (RPC) turn.
    pub fn out_of_band(payload: Value) -> Self {
        Self::with_kind(payload, TurnKind::OutOfBand)
    }

    fn with_kind(payload: Value, kind: TurnKind) -> Self {
        Self {
            turn_id: uuid::Uuid::new_v4().to_string(),
            kind,
            payload,
            vars: HashMap::new(),
            output: Vec::new(),
        }
    }

    pub fn with_var(mut self, name: impl Into<String>, value: Value) -> Self {
        self.vars.insert(name.into(), value);
        self
    }

    pub fn turn_id(&self) -> &str {
        &self.turn_id
    }

    pub fn kind(&self) -> TurnKind {
        self.kind
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Look up a conversation variable. A known-but-absent name yields
    /// `None`, which every truthiness check treats as falsy.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    pub fn delete(&mut self, name: &str) {
        self.vars.remove(name);
    }

    pub fn vars(&self) -> &HashMap<String, Value> {
        &self.vars
    }

    /// Append a non-control command to the turn's output.
    pub fn emit(&mut self, command: Value) {
        self.output.push(command);
    }

    pub fn output(&self) -> &[Value] {
        &self.output
    }

    pub(crate) fn take_output(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.output)
    }
}

/// Extra parameters handed to the evaluator alongside the context. Only the
/// fields relevant to the call site are set.
#[derive(Debug, Clone, Default, Serialize, JsonSchema)]
pub struct EvalParams {
    /// Set while scanning root nodes for a digression.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digressing: Option<bool>,
    /// Set while resolving a slot's check_for: true only for the slot that
    /// was prompted last turn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot_in_focus: Option<bool>,
    /// Set when a node is re-triggered after a digression.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resumed: Option<DigressionResult>,
    /// Previous value of a just-filled slot, for its found scenario.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_value: Option<Value>,
    /// New value of a just-filled slot, for its found scenario.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_value: Option<Value>,
}

impl EvalParams {
    pub fn digressing(flag: bool) -> Self {
        EvalParams { digressing: Some(flag), ..Default::default() }
    }

    pub fn resumed(result: DigressionResult) -> Self {
        EvalParams { resumed: Some(result), ..Default::default() }
    }
}

/// The external expression/scenario evaluator the engine drives. Conditions
/// are pure with respect to engine state; scenarios may await network I/O.
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Evaluate a boolean-ish condition expression. The engine applies JSON
    /// truthiness to the result.
    fn condition(
        &self,
        expr: &str,
        ctx: &TurnContext,
        params: &EvalParams,
    ) -> Result<Value, EvalError>;

    /// Run a response scenario, producing an ordered list of single-key
    /// command objects.
    async fn scenario(
        &self,
        scenario: &Value,
        ctx: &TurnContext,
        params: &EvalParams,
    ) -> Result<Vec<Value>, EvalError>;

    /// Unwrap an entity/intent proxy produced by check_for into a plain
    /// value (a truthy intent coerces to `true`). The default is identity;
    /// evaluators with proxy types override it.
    fn unwrap_value(&self, value: Value) -> Value {
        value
    }
}

/// A minimal evaluator for tests and literal-scripted bots: conditions are
/// JSON literals (`"true"`, `"false"`, numbers, quoted strings), scenarios
/// are literal command arrays. A bare-string scenario becomes a single
/// `{"text": …}` command.
#[derive(Debug, Clone, Default)]
pub struct LiteralEvaluator;

#[async_trait]
impl Evaluator for LiteralEvaluator {
    fn condition(
        &self,
        expr: &str,
        _ctx: &TurnContext,
        _params: &EvalParams,
    ) -> Result<Value, EvalError> {
        serde_json::from_str(expr)
            .map_err(|e| EvalError::new(format!("`{}` is not a JSON literal: {}", expr, e)))
    }

    async fn scenario(
        &self,
        scenario: &Value,
        _ctx: &TurnContext,
        _params: &EvalParams,
    ) -> Result<Vec<Value>, EvalError> {
        match scenario {
            Value::Array(commands) => Ok(commands.clone()),
            Value::String(text) => Ok(vec![serde_json::json!({ "text": text })]),
            other => Ok(vec![other.clone()]),
        }
    }
}

/// JSON truthiness as the engine applies it to evaluator results: `null`,
/// `false`, `0`, `""`, `[]` and `{}` are falsy, everything else truthy.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truthiness() {
        assert!(!truthy(&json!(null)));
        assert!(!truthy(&json!(false)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&json!([])));
        assert!(!truthy(&json!({})));
        assert!(truthy(&json!(true)));
        assert!(truthy(&json!(1.5)));
        assert!(truthy(&json!("hi")));
        assert!(truthy(&json!(["x"])));
    }

    #[test]
    fn test_context_vars_and_output() {
        let mut ctx = TurnContext::new(json!({"text": "hello"}));
        assert!(ctx.get("city").is_none());

        ctx.set("city", json!("Ghent"));
        assert_eq!(ctx.get("city"), Some(&json!("Ghent")));

        ctx.delete("city");
        assert!(ctx.get("city").is_none());

        ctx.emit(json!({"text": "hi"}));
        assert_eq!(ctx.output(), &[json!({"text": "hi"})]);
        assert_eq!(ctx.take_output(), vec![json!({"text": "hi"})]);
        assert!(ctx.output().is_empty());
    }

    #[tokio::test]
    async fn test_literal_evaluator() {
        let eval = LiteralEvaluator;
        let ctx = TurnContext::new(json!({}));
        let params = EvalParams::default();

        assert_eq!(eval.condition("true", &ctx, &params).unwrap(), json!(true));
        assert_eq!(eval.condition("false", &ctx, &params).unwrap(), json!(false));
        assert!(eval.condition("not json", &ctx, &params).is_err());

        let cmds = eval
            .scenario(&json!([{ "text": "a" }, { "pause": 500 }]), &ctx, &params)
            .await
            .unwrap();
        assert_eq!(cmds.len(), 2);

        let cmds = eval.scenario(&json!("hello"), &ctx, &params).await.unwrap();
        assert_eq!(cmds, vec![json!({"text": "hello"})]);
    }
}
