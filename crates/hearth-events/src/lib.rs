use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Event envelope published on the bus (RFC3339 time, millisecond precision).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Envelope {
    pub time: String,
    pub kind: String,
    pub payload: Value,
}

/// In-process broadcast bus for JSON-serializable events.
///
/// Publishing never blocks and never fails: slow subscribers lag and drop
/// the oldest envelopes, and publishing with no subscribers is a no-op.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Envelope>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Serialize `payload` and broadcast it under `kind`. A payload that fails
    /// to serialize is logged and dropped.
    pub fn publish<T: Serialize>(&self, kind: &str, payload: &T) {
        let payload = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(target: "hearth::events", kind, %err, "event payload not serializable");
                return;
            }
        };
        let envelope = Envelope {
            time: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            kind: kind.to_owned(),
            payload,
        };
        // No receivers is not an error.
        let _ = self.tx.send(envelope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_receive_published_envelopes() {
        let bus = Bus::new(8);
        let mut rx = bus.subscribe();
        bus.publish("queue.updated", &json!({"operations": 2}));
        let env = rx.recv().await.expect("envelope");
        assert_eq!(env.kind, "queue.updated");
        assert_eq!(env.payload["operations"], 2);
        assert!(env.time.ends_with('Z'));
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let bus = Bus::new(0);
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish("service.log", &json!({"line": "hello"}));
    }
}
