use std::collections::HashSet;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::command::SlotCommand;
use crate::context::{truthy, EvalParams, Evaluator, TurnContext};
use crate::definition::SlotDef;
use crate::error::TurnError;
use crate::flow::{DigressionResult, Env, FlowModel, FlowResult};
use crate::journal::JournalEvent;
use crate::state::DialogState;
use crate::tree::{NodeId, Tree};

/// Persisted layout of a slot-filling component's state slot, keyed by the
/// owning node's label. Extra keys are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SlotState {
    #[serde(default)]
    pub slot_in_focus: Option<String>,
}

/// The nested flow a node invokes to collect its slot values before the
/// main response runs. One invocation per turn the node is triggered.
pub(crate) struct SlotFlow<'t> {
    pub tree: &'t Tree,
    pub node: NodeId,
}

struct FoundSlot {
    index: usize,
    previous: Option<Value>,
    current: Value,
}

#[async_trait]
impl FlowModel for SlotFlow<'_> {
    async fn run(
        &self,
        ctx: &mut TurnContext,
        env: &Env,
        _store: &mut DialogState,
        state: &mut Value,
        digression: Option<DigressionResult>,
    ) -> Result<FlowResult, TurnError> {
        let node = self.tree.node(self.node);
        let name = self.tree.node_name(self.node);
        let eval = env.evaluator.as_ref();

        let mut slot_state: SlotState =
            serde_json::from_value(state.clone()).map_err(|e| TurnError::CorruptState {
                component: name.clone(),
                reason: e.to_string(),
            })?;
        let focus = slot_state.slot_in_focus.clone();

        // Elicitation: every enabled slot gets to look at this turn's
        // input, with the in-focus hint set only for the slot prompted
        // last turn.
        let mut found = Vec::new();
        for (index, slot) in node.slots.iter().enumerate() {
            if !slot_enabled(eval, slot, ctx)? {
                continue;
            }
            let params = EvalParams {
                slot_in_focus: Some(focus.as_deref() == Some(slot.name.as_str())),
                ..Default::default()
            };
            let value = eval.condition(&slot.check_for, ctx, &params)?;
            if !truthy(&value) {
                continue;
            }
            let stored = match &slot.value {
                Some(expr) => eval.condition(expr, ctx, &params)?,
                None => value,
            };
            let stored = eval.unwrap_value(stored);
            let previous = ctx.get(&slot.name).cloned();
            ctx.set(slot.name.clone(), stored.clone());
            env.journal.record(
                ctx.turn_id(),
                JournalEvent::Assign { name: slot.name.clone(), value: stored.clone() },
            );
            env.journal.record(
                ctx.turn_id(),
                JournalEvent::Found {
                    slot: slot.name.clone(),
                    previous: previous.clone(),
                    current: stored.clone(),
                },
            );
            found.push(FoundSlot { index, previous, current: stored });
        }

        let mut early_response = false;
        let mut suppress_prompt: HashSet<String> = HashSet::new();

        for filled in &found {
            let slot = &node.slots[filled.index];
            let Some(scenario) = &slot.found else { continue };
            let params = EvalParams {
                previous_value: filled.previous.clone(),
                current_value: Some(filled.current.clone()),
                ..Default::default()
            };
            let commands = eval.scenario(scenario, ctx, &params).await?;
            match react(ctx, &commands)? {
                Some(SlotCommand::Response) => early_response = true,
                Some(SlotCommand::PromptAgain) => clear_slot(ctx, env, &slot.name),
                Some(SlotCommand::ListenAgain) => {
                    clear_slot(ctx, env, &slot.name);
                    suppress_prompt.insert(slot.name.clone());
                }
                Some(SlotCommand::MoveOn) | None => {}
            }
        }

        // A focused slot that got nothing this turn either hands the input
        // to a tangential handler, asks the tree for a digression, or (on
        // resume after a failed digression) runs its not_found scenario.
        if focus.is_some() && found.is_empty() {
            match digression {
                None => {
                    let mut handled = false;
                    for handler in &node.handlers {
                        if !truthy(&eval.condition(&handler.condition, ctx, &EvalParams::default())?) {
                            continue;
                        }
                        env.journal
                            .record(ctx.turn_id(), JournalEvent::SlotHandler { node: name.clone() });
                        let commands =
                            eval.scenario(&handler.response, ctx, &EvalParams::default()).await?;
                        if react(ctx, &commands)? == Some(SlotCommand::Response) {
                            early_response = true;
                        }
                        handled = true;
                        break;
                    }
                    if !handled {
                        debug!("slot filling on `{}` stuck, digressing", name);
                        return Ok(FlowResult::Digress);
                    }
                }
                Some(DigressionResult::NotFound) => {
                    let focused = node
                        .slots
                        .iter()
                        .find(|slot| focus.as_deref() == Some(slot.name.as_str()));
                    if let Some(slot) = focused {
                        env.journal
                            .record(ctx.turn_id(), JournalEvent::NotFound { slot: slot.name.clone() });
                        if let Some(scenario) = &slot.not_found {
                            let params = EvalParams::resumed(DigressionResult::NotFound);
                            let commands = eval.scenario(scenario, ctx, &params).await?;
                            match react(ctx, &commands)? {
                                Some(SlotCommand::Response) => early_response = true,
                                Some(SlotCommand::ListenAgain) | Some(SlotCommand::MoveOn) => {
                                    suppress_prompt.insert(slot.name.clone());
                                }
                                // prompt_again is the default: the slot stays
                                // unfilled and gets re-prompted below.
                                Some(SlotCommand::PromptAgain) | None => {}
                            }
                        }
                    }
                }
                Some(DigressionResult::Found) => {}
            }
        }

        let mut new_focus = None;
        if !early_response {
            for slot in &node.slots {
                if slot_filled(ctx, &slot.name) || suppress_prompt.contains(&slot.name) {
                    continue;
                }
                if !slot_enabled(eval, slot, ctx)? {
                    continue;
                }
                let Some(prompt) = &slot.prompt else { continue };
                env.journal
                    .record(ctx.turn_id(), JournalEvent::Prompt { slot: slot.name.clone() });
                let commands = eval.scenario(prompt, ctx, &EvalParams::default()).await?;
                match react(ctx, &commands)? {
                    Some(SlotCommand::MoveOn) => continue,
                    Some(SlotCommand::Response) => {
                        early_response = true;
                        break;
                    }
                    // listen_again is the default prompt reaction: stay
                    // focused on this slot and wait for the next turn.
                    Some(SlotCommand::PromptAgain) | Some(SlotCommand::ListenAgain) | None => {
                        new_focus = Some(slot.name.clone());
                        break;
                    }
                }
            }
        }

        if early_response {
            // An early response ends the collection outright, whatever is
            // still unfilled.
            slot_state.slot_in_focus = None;
            *state = serde_json::to_value(&slot_state).unwrap_or(Value::Null);
            return Ok(FlowResult::Done);
        }

        slot_state.slot_in_focus = new_focus;
        let result = if slot_state.slot_in_focus.is_none() {
            FlowResult::Done
        } else {
            FlowResult::Listen
        };
        *state = serde_json::to_value(&slot_state).unwrap_or(Value::Null);
        Ok(result)
    }
}

fn slot_enabled(
    eval: &dyn Evaluator,
    slot: &SlotDef,
    ctx: &TurnContext,
) -> Result<bool, TurnError> {
    match &slot.condition {
        Some(expr) => Ok(truthy(&eval.condition(expr, ctx, &EvalParams::default())?)),
        None => Ok(true),
    }
}

fn slot_filled(ctx: &TurnContext, name: &str) -> bool {
    ctx.get(name).map(|v| !v.is_null()).unwrap_or(false)
}

fn clear_slot(ctx: &mut TurnContext, env: &Env, name: &str) {
    ctx.delete(name);
    env.journal
        .record(ctx.turn_id(), JournalEvent::Delete { name: name.to_string() });
}

/// Append non-control commands to the output; the first slot-control
/// command dispatches and stops further processing.
fn react(ctx: &mut TurnContext, commands: &[Value]) -> Result<Option<SlotCommand>, TurnError> {
    for command in commands {
        if let Some(control) = SlotCommand::parse(command)? {
            return Ok(Some(control));
        }
        ctx.emit(command.clone());
    }
    Ok(None)
}
