//! Runtime event bus.
//!
//! The loop publishes typed events so outer surfaces (CLI, logging) can
//! observe progress without coupling to the loop itself. Events are
//! fire-and-forget over a broadcast channel; publishing with no
//! subscribers is fine.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    IterationStart,
    IterationEnd,
    ToolCallStart,
    ToolCallEnd,
    ProviderRequest,
    ProviderResponse,
    PolicyViolation,
    VerificationPass,
    VerificationFail,
    ContextPruned,
    MemoryArchived,
    SessionComplete,
    SessionError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeEvent {
    pub kind: EventKind,
    pub session_id: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RuntimeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, kind: EventKind, session_id: &str) {
        self.publish_with_data(kind, session_id, None);
    }

    pub fn publish_with_data(
        &self,
        kind: EventKind,
        session_id: &str,
        data: Option<serde_json::Value>,
    ) {
        // A send error only means nobody is listening.
        let _ = self.sender.send(RuntimeEvent {
            kind,
            session_id: session_id.to_string(),
            timestamp: crate::store::now_secs(),
            data,
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
