//! Broadcast event bus.
//!
//! Every mutating operation and each finalized connection publishes a small
//! `{topic, payload}` event here. Transports (WebSocket fan-out in the UI
//! deployment) subscribe and forward; the core only guarantees the events
//! exist. Publishing never blocks and events for absent subscribers are
//! dropped.

use log::trace;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    pub payload: Value,
}

#[derive(Clone)]
pub struct NotificationBus {
    sender: broadcast::Sender<Event>,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, topic: &str, payload: Value) {
        trace!("event {}: {}", topic, payload);
        let _ = self.sender.send(Event {
            topic: topic.to_string(),
            payload,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = NotificationBus::new();
        let mut receiver = bus.subscribe();
        bus.publish("rules.new", json!({"id": "abc"}));
        let event = receiver.recv().await.unwrap();
        assert_eq!(event.topic, "rules.new");
        assert_eq!(event.payload["id"], json!("abc"));
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let bus = NotificationBus::new();
        bus.publish("capture.stop", json!({}));
    }
}
