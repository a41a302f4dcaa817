use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;

use haven_core::realtime::{BROADCAST_TOPIC, RealtimeEvent, session_topic};

/// Per-topic fan-out capacity. Slow subscribers past this depth miss events
/// (Lagged) rather than blocking publishers.
const TOPIC_CAPACITY: usize = 256;

/// Topic-based publish/subscribe layer. Two topic shapes: `session:<id>`
/// and the single broadcast topic for supervisory observers.
///
/// Delivery contract: fire-and-forget, at-most-once, no persistence or
/// replay — a subscriber connecting after an event was published never
/// receives it. Ordering is preserved within one topic from one publisher;
/// none is implied across topics. The durable record of truth is always the
/// store, never the bus.
#[derive(Clone)]
pub struct EventBus {
    topics: Arc<RwLock<HashMap<String, broadcast::Sender<RealtimeEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Publish to a topic. A topic with no live subscribers has no channel,
    /// so the event is dropped — that is the at-most-once contract, not an
    /// error.
    pub fn publish(&self, topic: &str, event: RealtimeEvent) {
        let sender = {
            let topics = self.topics.read().expect("bus topic map poisoned");
            topics.get(topic).cloned()
        };

        let Some(sender) = sender else {
            return;
        };

        if sender.send(event).is_err() {
            // Last subscriber left; prune the topic
            let mut topics = self.topics.write().expect("bus topic map poisoned");
            if topics
                .get(topic)
                .is_some_and(|s| s.receiver_count() == 0)
            {
                topics.remove(topic);
            }
        }
    }

    pub fn publish_session(&self, session_id: &str, event: RealtimeEvent) {
        self.publish(&session_topic(session_id), event);
    }

    pub fn publish_broadcast(&self, event: RealtimeEvent) {
        self.publish(BROADCAST_TOPIC, event);
    }

    /// Attach a subscriber to a topic. Detach by dropping the receiver.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<RealtimeEvent> {
        let mut topics = self.topics.write().expect("bus topic map poisoned");
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    #[cfg(test)]
    fn topic_count(&self) -> usize {
        self.topics.read().expect("bus topic map poisoned").len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use haven_core::realtime::{RealtimeEvent, events};
    use serde_json::json;

    use super::EventBus;

    fn event(name: &str, n: i64) -> RealtimeEvent {
        RealtimeEvent::new(name, Some("sess_test"), json!({ "n": n }))
    }

    #[tokio::test]
    async fn subscriber_receives_published_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("session:sess_test");

        for n in 0..5 {
            bus.publish("session:sess_test", event(events::MESSAGES_NEW, n));
        }

        for n in 0..5 {
            let received = rx.recv().await.unwrap();
            assert_eq!(received.payload["n"], n);
        }
    }

    #[tokio::test]
    async fn publish_before_subscribe_delivers_nothing() {
        let bus = EventBus::new();
        bus.publish("session:sess_test", event(events::SESSION_CREATED, 1));

        let mut rx = bus.subscribe("session:sess_test");
        assert!(matches!(
            rx.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = EventBus::new();
        let mut session_rx = bus.subscribe("session:sess_a");
        let mut broadcast_rx = bus.subscribe(haven_core::realtime::BROADCAST_TOPIC);

        bus.publish_broadcast(event(events::SUPERVISOR_REVIEW_REQUIRED, 7));

        assert_eq!(broadcast_rx.recv().await.unwrap().payload["n"], 7);
        assert!(matches!(
            session_rx.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn all_broadcast_subscribers_receive_each_event() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe(haven_core::realtime::BROADCAST_TOPIC);
        let mut rx2 = bus.subscribe(haven_core::realtime::BROADCAST_TOPIC);

        bus.publish_broadcast(event(events::CRISIS_EMERGENCY, 42));

        assert_eq!(rx1.recv().await.unwrap().event, events::CRISIS_EMERGENCY);
        assert_eq!(rx2.recv().await.unwrap().event, events::CRISIS_EMERGENCY);
    }

    #[tokio::test]
    async fn abandoned_topics_are_pruned_on_publish() {
        let bus = EventBus::new();
        {
            let _rx = bus.subscribe("session:sess_gone");
        }
        assert_eq!(bus.topic_count(), 1);

        bus.publish("session:sess_gone", event(events::SESSION_STATUS, 0));
        assert_eq!(bus.topic_count(), 0);
    }
}
