//! Event broadcaster.
//!
//! Fan-out of [`ProgressEvent`]s to any number of observers over a
//! `tokio::sync::broadcast` channel. Publishing never blocks: a subscriber
//! that falls more than `capacity` events behind loses the oldest ones and is
//! told how many it missed, after which it should resync through the
//! snapshot queries. There is no replay for late joiners.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Capture,
    Merge,
    Upscale,
    Export,
    Cover,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Status,
    Progress,
    Log,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Broadcaster-wide sequence number, strictly increasing.
    pub seq: u64,
    pub operation: Operation,
    pub kind: EventKind,
    pub payload: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    /// `payload["status"]` for status events.
    pub fn status(&self) -> Option<&str> {
        self.payload.get("status").and_then(Value::as_str)
    }

    pub fn progress(&self) -> Option<u64> {
        self.payload.get("progress").and_then(Value::as_u64)
    }

    pub fn job_id(&self) -> Option<&str> {
        self.payload.get("job_id").and_then(Value::as_str)
    }
}

/// Result of waiting on a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum EventRecv {
    Event(ProgressEvent),
    /// The subscriber fell behind; this many events were dropped.
    Lagged(u64),
    /// The broadcaster is gone.
    Closed,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProgressEvent>,
    seq: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Fire-and-forget publish. Returns the event as sent.
    pub fn publish(
        &self,
        operation: Operation,
        kind: EventKind,
        payload: Map<String, Value>,
    ) -> ProgressEvent {
        let event = ProgressEvent {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            operation,
            kind,
            payload,
            timestamp: Utc::now(),
        };
        // No receivers is fine.
        let _ = self.tx.send(event.clone());
        event
    }

    pub fn status(&self, operation: Operation, status: &str, mut fields: Map<String, Value>) {
        fields.insert("status".to_string(), Value::from(status));
        self.publish(operation, EventKind::Status, fields);
    }

    pub fn progress(&self, operation: Operation, progress: u8, mut fields: Map<String, Value>) {
        fields.insert("progress".to_string(), Value::from(progress));
        self.publish(operation, EventKind::Progress, fields);
    }

    pub fn log(&self, operation: Operation, message: &str, mut fields: Map<String, Value>) {
        fields.insert("message".to_string(), Value::from(message));
        self.publish(operation, EventKind::Log, fields);
    }
}

/// One observer's view of the bus. Dropping it unsubscribes.
pub struct EventSubscription {
    rx: broadcast::Receiver<ProgressEvent>,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> EventRecv {
        match self.rx.recv().await {
            Ok(event) => EventRecv::Event(event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Event subscriber lagged, {n} events dropped");
                EventRecv::Lagged(n)
            }
            Err(broadcast::error::RecvError::Closed) => EventRecv::Closed,
        }
    }

    /// Non-blocking variant; `None` when nothing is queued.
    pub fn try_recv(&mut self) -> Option<EventRecv> {
        match self.rx.try_recv() {
            Ok(event) => Some(EventRecv::Event(event)),
            Err(broadcast::error::TryRecvError::Empty) => None,
            Err(broadcast::error::TryRecvError::Lagged(n)) => Some(EventRecv::Lagged(n)),
            Err(broadcast::error::TryRecvError::Closed) => Some(EventRecv::Closed),
        }
    }
}

/// Build a payload map from `(key, value)` pairs.
#[macro_export]
macro_rules! payload {
    () => { ::serde_json::Map::new() };
    ($($key:literal => $value:expr),+ $(,)?) => {{
        let mut map = ::serde_json::Map::new();
        $( map.insert($key.to_string(), ::serde_json::json!($value)); )+
        map
    }};
}
