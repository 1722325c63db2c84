use serde_json::Value;

use crate::error::TurnError;

/// Control command recognised in a node response scenario. Everything the
/// parsers below do not recognise is appended verbatim to the turn output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeCommand {
    JumpTo { node: String, transition: JumpTransition },
    Listen,
    End,
    Followup,
}

/// Where a jump_to lands on its target node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpTransition {
    /// Run the target's response directly.
    Response,
    /// Scan the target and its right siblings for the first match.
    Condition,
    /// Focus the target and suspend until the next turn.
    Listen,
}

/// Control command recognised while reacting to a slot scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotCommand {
    MoveOn,
    PromptAgain,
    ListenAgain,
    Response,
}

const NODE_KEYS: [&str; 4] = ["jump_to", "listen", "end", "followup"];
const SLOT_KEYS: [&str; 4] = ["move_on", "prompt_again", "listen_again", "response"];

/// Single-key objects whose key is in the vocabulary are control commands.
/// An object that mixes a control key with anything else is rejected: the
/// intended order would be undefined.
fn control_entry<'a>(
    command: &'a Value,
    vocabulary: &[&str],
) -> Result<Option<(&'a str, &'a Value)>, TurnError> {
    let Some(object) = command.as_object() else {
        return Ok(None);
    };
    let mut hit = None;
    for (key, value) in object {
        if vocabulary.contains(&key.as_str()) {
            hit = Some((key.as_str(), value));
        }
    }
    match hit {
        None => Ok(None),
        Some(_) if object.len() > 1 => Err(TurnError::AmbiguousCommand(command.to_string())),
        Some(entry) => Ok(Some(entry)),
    }
}

impl NodeCommand {
    pub fn parse(command: &Value) -> Result<Option<NodeCommand>, TurnError> {
        let Some((key, value)) = control_entry(command, &NODE_KEYS)? else {
            return Ok(None);
        };
        let parsed = match key {
            "listen" => NodeCommand::Listen,
            "end" => NodeCommand::End,
            "followup" => NodeCommand::Followup,
            "jump_to" => {
                let node = value
                    .get("node")
                    .and_then(Value::as_str)
                    .ok_or_else(|| TurnError::InvalidCommand(command.to_string()))?;
                let transition = match value.get("transition").and_then(Value::as_str) {
                    Some("response") => JumpTransition::Response,
                    Some("condition") | None => JumpTransition::Condition,
                    Some("listen") => JumpTransition::Listen,
                    Some(other) => return Err(TurnError::UnknownJumpTransition(other.to_string())),
                };
                NodeCommand::JumpTo { node: node.to_string(), transition }
            }
            _ => unreachable!("key checked against vocabulary"),
        };
        Ok(Some(parsed))
    }
}

impl SlotCommand {
    pub fn parse(command: &Value) -> Result<Option<SlotCommand>, TurnError> {
        let Some((key, _)) = control_entry(command, &SLOT_KEYS)? else {
            return Ok(None);
        };
        Ok(Some(match key {
            "move_on" => SlotCommand::MoveOn,
            "prompt_again" => SlotCommand::PromptAgain,
            "listen_again" => SlotCommand::ListenAgain,
            "response" => SlotCommand::Response,
            _ => unreachable!("key checked against vocabulary"),
        }))
    }
}
