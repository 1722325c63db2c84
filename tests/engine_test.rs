use std::sync::Arc;
use std::sync::Mutex;

use serde_json::{json, Value};

use convoflow::flow::{DialogFlow, FlowResult};
use convoflow::journal::{JournalRecord, JournalSink};
use convoflow::{
    DialogState, ItemDef, LiteralEvaluator, NodeDef, SlotDef, SubtreeDef, Tree, TreeDef,
    TurnContext,
};

/// Helper to build a flow over a list of root items with the literal
/// evaluator (conditions are JSON literals, string responses become one
/// text command). Engine logs honour RUST_LOG when a test runs alone.
fn make_flow(nodes: Vec<ItemDef>) -> DialogFlow {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let tree = Arc::new(Tree::build(&TreeDef::from_nodes(nodes)).unwrap());
    DialogFlow::new(tree, Arc::new(LiteralEvaluator))
}

fn texts(output: &[Value]) -> Vec<&str> {
    output.iter().filter_map(|v| v.get("text").and_then(Value::as_str)).collect()
}

#[derive(Debug, Default)]
struct CollectingSink(Mutex<Vec<JournalRecord>>);

impl JournalSink for CollectingSink {
    fn record(&self, record: JournalRecord) {
        self.0.lock().unwrap().push(record);
    }
}

#[tokio::test]
async fn test_single_node_triggers_and_completes() {
    let flow = make_flow(vec![ItemDef::Node(NodeDef::new("true", json!("triggered")))]);
    let mut ctx = TurnContext::new(json!({"input": "hello"}));
    let mut state = DialogState::new();

    let report = flow.turn(&mut ctx, &mut state).await;
    assert!(report.is_done());
    assert!(report.error.is_none());
    assert_eq!(texts(&report.output), ["triggered"]);
    assert!(state.is_empty());
}

#[tokio::test]
async fn test_followup_focus_across_two_turns() {
    let nodes = vec![ItemDef::Node(
        NodeDef::new("true", json!("root triggered"))
            .labelled("root1")
            .with_followup(vec![ItemDef::Node(NodeDef::new("true", json!("followup triggered")))]),
    )];
    let flow = make_flow(nodes);
    let mut state = DialogState::new();

    let mut ctx = TurnContext::new(json!({"input": "hi"}));
    let report = flow.turn(&mut ctx, &mut state).await;
    assert_eq!(report.result, FlowResult::Listen);
    assert_eq!(texts(&report.output), ["root triggered"]);
    assert_eq!(state.component("ROOT"), json!({"node_stack": [["root1", "followup"]]}));

    let mut ctx = TurnContext::new(json!({"input": "again"}));
    let report = flow.turn(&mut ctx, &mut state).await;
    assert!(report.is_done());
    assert_eq!(texts(&report.output), ["followup triggered"]);
    assert!(state.is_empty());
}

#[tokio::test]
async fn test_digression_runs_then_interrupted_node_resumes() {
    let nodes = vec![
        ItemDef::Node(
            NodeDef::new("true", json!("root triggered"))
                .labelled("root1")
                .with_followup(vec![ItemDef::Node(NodeDef::new("false", json!("never")))]),
        ),
        ItemDef::Node(NodeDef::new("true", json!("digression triggered"))),
    ];
    let flow = make_flow(nodes);
    let mut state = DialogState::new();
    state.put("ROOT", json!({"node_stack": [["root1", "followup"]]}));

    let mut ctx = TurnContext::new(json!({"input": "something else"}));
    let report = flow.turn(&mut ctx, &mut state).await;
    assert_eq!(report.result, FlowResult::Listen);
    // The digression answers first, then root1 takes the turn back and
    // re-prompts, so both responses land in order.
    assert_eq!(texts(&report.output), ["digression triggered", "root triggered"]);
    assert_eq!(state.component("ROOT"), json!({"node_stack": [["root1", "followup"]]}));
}

#[tokio::test]
async fn test_slot_prompt_suspends_with_focus() {
    let nodes = vec![ItemDef::Node(
        NodeDef::new("true", json!("all slots filled"))
            .labelled("collect")
            .with_slots(vec![SlotDef::new("slot1", "false").with_prompt(json!("prompt triggered"))]),
    )];
    let flow = make_flow(nodes);
    let mut state = DialogState::new();

    let mut ctx = TurnContext::new(json!({"input": "book a table"}));
    let report = flow.turn(&mut ctx, &mut state).await;
    assert_eq!(report.result, FlowResult::Listen);
    assert_eq!(texts(&report.output), ["prompt triggered"]);
    assert_eq!(state.component("ROOT"), json!({"node_stack": [["collect", "slot_filling"]]}));
    assert_eq!(state.component("collect"), json!({"slot_in_focus": "slot1"}));
    assert!(ctx.get("slot1").is_none());
}

#[tokio::test]
async fn test_unmatched_input_during_slot_filling_reprompts() {
    // The focused slot never fills and no root node can take the
    // digression, so the node resumes with NOT_FOUND and prompts again.
    let nodes = vec![ItemDef::Node(
        NodeDef::new("true", json!("all slots filled"))
            .labelled("collect")
            .with_slots(vec![SlotDef::new("slot1", "false").with_prompt(json!("prompt triggered"))]),
    )];
    let flow = make_flow(nodes);
    let mut state = DialogState::new();
    state.put("ROOT", json!({"node_stack": [["collect", "slot_filling"]]}));
    state.put("collect", json!({"slot_in_focus": "slot1"}));

    let mut ctx = TurnContext::new(json!({"input": "the weather is nice"}));
    let report = flow.turn(&mut ctx, &mut state).await;
    assert_eq!(report.result, FlowResult::Listen);
    assert_eq!(texts(&report.output), ["prompt triggered"]);
    assert_eq!(state.component("collect"), json!({"slot_in_focus": "slot1"}));
}

#[tokio::test]
async fn test_slot_fills_and_node_responds() {
    let nodes = vec![ItemDef::Node(
        NodeDef::new("true", json!("all slots filled"))
            .labelled("collect")
            .with_slots(vec![SlotDef::new("slot1", "\"tomorrow\"").with_prompt(json!("when?"))]),
    )];
    let flow = make_flow(nodes);
    let mut state = DialogState::new();
    state.put("ROOT", json!({"node_stack": [["collect", "slot_filling"]]}));
    state.put("collect", json!({"slot_in_focus": "slot1"}));

    let mut ctx = TurnContext::new(json!({"input": "tomorrow"}));
    let report = flow.turn(&mut ctx, &mut state).await;
    assert!(report.is_done());
    assert_eq!(texts(&report.output), ["all slots filled"]);
    assert_eq!(ctx.get("slot1"), Some(&json!("tomorrow")));
    assert!(state.is_empty());
}

#[tokio::test]
async fn test_jump_to_listen_focuses_target_for_next_turn() {
    let nodes = vec![
        ItemDef::Node(NodeDef::new(
            "true",
            json!([{ "jump_to": {"node": "target", "transition": "listen"} }]),
        )),
        ItemDef::Node(NodeDef::new("true", json!("target triggered")).labelled("target")),
    ];
    let flow = make_flow(nodes);
    let mut state = DialogState::new();

    let mut ctx = TurnContext::new(json!({"input": "start"}));
    let report = flow.turn(&mut ctx, &mut state).await;
    assert_eq!(report.result, FlowResult::Listen);
    assert!(report.output.is_empty());
    assert_eq!(state.component("ROOT"), json!({"node_stack": [["target", "condition"]]}));

    let mut ctx = TurnContext::new(json!({"input": "go on"}));
    let report = flow.turn(&mut ctx, &mut state).await;
    assert!(report.is_done());
    assert_eq!(texts(&report.output), ["target triggered"]);
    assert!(state.is_empty());
}

#[tokio::test]
async fn test_subtree_members_expand_in_document_order() {
    let mut def = TreeDef::from_nodes(vec![
        ItemDef::Node(NodeDef::new("false", json!("before"))),
        ItemDef::Subtree { subtree: "shared".to_string() },
        ItemDef::Node(NodeDef::new("true", json!("after"))),
    ]);
    def.subtrees.insert(
        "shared".to_string(),
        SubtreeDef {
            condition: Some("true".to_string()),
            nodes: vec![
                NodeDef::new("false", json!("shared a")),
                NodeDef::new("true", json!("shared b")),
            ],
        },
    );
    let tree = Arc::new(Tree::build(&def).unwrap());
    let flow = DialogFlow::new(tree, Arc::new(LiteralEvaluator));

    let mut ctx = TurnContext::new(json!({"input": "hi"}));
    let mut state = DialogState::new();
    let report = flow.turn(&mut ctx, &mut state).await;
    // "shared b" sits before "after" in document order.
    assert_eq!(texts(&report.output), ["shared b"]);
}

#[tokio::test]
async fn test_same_context_and_state_give_same_result() {
    let nodes = vec![
        ItemDef::Node(
            NodeDef::new("true", json!("root triggered"))
                .labelled("root1")
                .with_followup(vec![ItemDef::Node(NodeDef::new("false", json!("never")))]),
        ),
        ItemDef::Node(NodeDef::new("true", json!("digression triggered"))),
    ];
    let flow = make_flow(nodes);
    let start = json!({"node_stack": [["root1", "followup"]]});

    let mut outputs = Vec::new();
    for _ in 0..2 {
        let mut state = DialogState::new();
        state.put("ROOT", start.clone());
        let mut ctx = TurnContext::new(json!({"input": "same"}));
        let report = flow.turn(&mut ctx, &mut state).await;
        outputs.push((report.result, report.output, state.component("ROOT")));
    }
    assert_eq!(outputs[0], outputs[1]);
}

#[tokio::test]
async fn test_done_always_clears_all_component_state() {
    let flow = make_flow(vec![ItemDef::Node(NodeDef::new("true", json!("bye")))]);
    let mut state = DialogState::new();
    state.put("leftover", json!({"slot_in_focus": "stale"}));

    let mut ctx = TurnContext::new(json!({"input": "hello"}));
    let report = flow.turn(&mut ctx, &mut state).await;
    assert!(report.is_done());
    assert!(state.is_empty());
}

#[tokio::test]
async fn test_broken_scenario_forces_done_and_clears_state() {
    // "not json" fails to parse as a literal condition, which surfaces as
    // an evaluation error; the orchestrator must end the conversation.
    let flow = make_flow(vec![ItemDef::Node(NodeDef::new("not json", json!("never")))]);
    let mut state = DialogState::new();
    state.put("ROOT", json!({"node_stack": []}));

    let mut ctx = TurnContext::new(json!({"input": "hello"}));
    let report = flow.turn(&mut ctx, &mut state).await;
    assert!(report.is_done());
    assert!(report.error.is_some());
    assert!(state.is_empty());
}

#[tokio::test]
async fn test_journal_records_carry_the_turn_id() {
    let sink = Arc::new(CollectingSink::default());
    let tree = Arc::new(
        Tree::build(&TreeDef::from_nodes(vec![ItemDef::Node(NodeDef::new(
            "true",
            json!("triggered"),
        ))]))
        .unwrap(),
    );
    let flow =
        DialogFlow::new(tree, Arc::new(LiteralEvaluator)).with_journal(sink.clone());

    let mut ctx = TurnContext::new(json!({"input": "hello"}));
    let turn_id = ctx.turn_id().to_string();
    let mut state = DialogState::new();
    flow.turn(&mut ctx, &mut state).await;

    let records = sink.0.lock().unwrap();
    assert!(!records.is_empty());
    assert!(records.iter().all(|r| r.turn_id == turn_id));
}
