//! Change feed emitted after each committed write.

use crate::policy::Mode;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

/// One row written by a graph
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeSummary {
    /// Path of the table the row belongs to
    pub path: String,
    pub mode: Mode,
    pub row: Map<String, Value>,
}

/// All changes of one committed write, in commit order
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeBatch {
    pub generation_id: Option<String>,
    pub changes: Vec<ChangeSummary>,
}

/// Receives one batch per committed write that changed something
pub trait ChangeSink: Send + Sync {
    fn emit(&self, batch: ChangeBatch);
}

/// Fans batches out to any number of subscribers
pub struct BroadcastSink {
    sender: broadcast::Sender<ChangeBatch>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeBatch> {
        self.sender.subscribe()
    }
}

impl ChangeSink for BroadcastSink {
    fn emit(&self, batch: ChangeBatch) {
        // no subscribers is not an error
        if let Err(e) = self.sender.send(batch) {
            debug!(changes = e.0.changes.len(), "change batch dropped without subscribers");
        }
    }
}

/// Keeps every batch in memory
#[derive(Default)]
pub struct MemorySink {
    batches: Mutex<Vec<ChangeBatch>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<ChangeBatch> {
        match self.batches.lock() {
            Ok(batches) => batches.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl ChangeSink for MemorySink {
    fn emit(&self, batch: ChangeBatch) {
        match self.batches.lock() {
            Ok(mut batches) => batches.push(batch),
            Err(poisoned) => poisoned.into_inner().push(batch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn batch() -> ChangeBatch {
        let mut row = Map::new();
        row.insert("id".to_string(), json!(1));
        ChangeBatch {
            generation_id: Some("g1".to_string()),
            changes: vec![ChangeSummary {
                path: "items".to_string(),
                mode: Mode::Insert,
                row,
            }],
        }
    }

    #[tokio::test]
    async fn test_broadcast_sink() {
        let sink = BroadcastSink::new(8);
        sink.emit(batch());

        let mut rx = sink.subscribe();
        sink.emit(batch());
        let received = rx.recv().await.unwrap();
        assert_eq!(received, batch());
    }

    #[test]
    fn test_memory_sink_and_serialization() {
        let sink = MemorySink::new();
        sink.emit(batch());
        assert_eq!(sink.batches().len(), 1);

        let json = serde_json::to_value(batch()).unwrap();
        assert_eq!(
            json,
            json!({
                "generationId": "g1",
                "changes": [{"path": "items", "mode": "insert", "row": {"id": 1}}]
            })
        );
    }
}
