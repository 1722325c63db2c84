use std::fmt::Debug;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// One telemetry event emitted while a turn runs. Purely observational:
/// engine behaviour is identical with or without a sink attached.
#[derive(Debug, Clone, Serialize, JsonSchema)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JournalEvent {
    NodeTriggered { node: String, digressing: bool },
    Response { node: String },
    Found { slot: String, previous: Option<Value>, current: Value },
    NotFound { slot: String },
    Prompt { slot: String },
    SlotHandler { node: String },
    DigressionFrom { node: String },
    Assign { name: String, value: Value },
    Delete { name: String },
}

/// A timestamped journal record as handed to sinks.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct JournalRecord {
    pub turn_id: String,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: JournalEvent,
}

pub trait JournalSink: Send + Sync + Debug {
    fn record(&self, record: JournalRecord);
}

/// Sink that forwards every record to `tracing` at debug level.
#[derive(Debug, Clone, Default)]
pub struct TracingJournal;

impl JournalSink for TracingJournal {
    fn record(&self, record: JournalRecord) {
        match serde_json::to_string(&record) {
            Ok(json) => debug!(target: "convoflow::journal", "{}", json),
            Err(e) => debug!(target: "convoflow::journal", "unserialisable journal record: {}", e),
        }
    }
}

/// Optional journal handle carried through a turn. `Journal(None)` is a
/// no-op.
#[derive(Debug, Clone, Default)]
pub struct Journal(pub Option<Arc<dyn JournalSink>>);

impl Journal {
    pub fn sink(sink: Arc<dyn JournalSink>) -> Self {
        Journal(Some(sink))
    }

    pub fn record(&self, turn_id: &str, event: JournalEvent) {
        if let Some(sink) = &self.0 {
            sink.record(JournalRecord {
                turn_id: turn_id.to_string(),
                at: Utc::now(),
                event,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct CollectingSink(Mutex<Vec<JournalRecord>>);

    impl JournalSink for CollectingSink {
        fn record(&self, record: JournalRecord) {
            self.0.lock().unwrap().push(record);
        }
    }

    #[test]
    fn test_journal_records_through_sink() {
        let sink = Arc::new(CollectingSink::default());
        let journal = Journal::sink(sink.clone());

        journal.record("t1", JournalEvent::Prompt { slot: "date".into() });
        journal.record(
            "t1",
            JournalEvent::Assign { name: "date".into(), value: json!("tomorrow") },
        );

        let records = sink.0.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].turn_id, "t1");
    }

    #[test]
    fn test_absent_sink_is_noop() {
        let journal = Journal::default();
        journal.record("t1", JournalEvent::Delete { name: "x".into() });
    }

    #[test]
    fn test_event_serialisation_shape() {
        let record = JournalRecord {
            turn_id: "t".into(),
            at: Utc::now(),
            event: JournalEvent::NodeTriggered { node: "greet".into(), digressing: false },
        };
        let v = serde_json::to_value(&record).unwrap();
        assert_eq!(v["event"], json!("node_triggered"));
        assert_eq!(v["node"], json!("greet"));
    }
}
