//! Headless, typed, topic-based publish/subscribe bus.
//!
//! Uses [`tokio::sync::broadcast`] channels so every subscriber receives
//! every message and a slow subscriber never blocks the others.
//!
//! # Topics
//!
//! | Topic | Traffic |
//! |---|---|
//! | [`Topic::Intents`] | inbound [`Intent`]s addressed to device services |
//! | [`Topic::Events`] | outbound [`Event`] snapshots published by device services |

use tinkerbus_types::{Event, Intent};
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Default channel capacity (messages buffered before the oldest are
/// dropped for slow subscribers).
pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Intents,
    Events,
}

/// Shared bus. Clones share the same channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    intents: broadcast::Sender<Intent>,
    events: broadcast::Sender<Event>,
}

impl EventBus {
    /// `capacity` applies to each topic independently.
    pub fn new(capacity: usize) -> Self {
        let (intents, _) = broadcast::channel(capacity);
        let (events, _) = broadcast::channel(capacity);
        Self { intents, events }
    }

    /// Publish an intent. Returns how many subscribers got it; `0` when
    /// nobody listens, which is not an error.
    pub fn publish_intent(&self, intent: Intent) -> usize {
        let delivered = self.intents.send(intent).unwrap_or(0);
        trace!(topic = ?Topic::Intents, delivered, "published");
        delivered
    }

    pub fn publish_event(&self, event: Event) -> usize {
        let delivered = self.events.send(event).unwrap_or(0);
        trace!(topic = ?Topic::Events, delivered, "published");
        delivered
    }

    pub fn subscribe_intents(&self) -> TopicReceiver<Intent> {
        TopicReceiver {
            topic: Topic::Intents,
            receiver: self.intents.subscribe(),
        }
    }

    pub fn subscribe_events(&self) -> TopicReceiver<Event> {
        TopicReceiver {
            topic: Topic::Events,
            receiver: self.events.subscribe(),
        }
    }

    /// Events whose sender id starts with `prefix`, e.g.
    /// `"tinkerbus/ambient_light"`.
    pub fn subscribe_events_from(&self, prefix: impl Into<String>) -> EventSubscriber {
        EventSubscriber {
            prefix: prefix.into(),
            receiver: self.subscribe_events(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Receivers
// ─────────────────────────────────────────────────────────────────────────────

/// Async receiver bound to one [`Topic`].
#[derive(Debug)]
pub struct TopicReceiver<T> {
    topic: Topic,
    receiver: broadcast::Receiver<T>,
}

impl<T: Clone> TopicReceiver<T> {
    /// Next message; `None` once the bus is gone.
    ///
    /// Falling behind drops the oldest messages with a warning.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "bus subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}

/// Event receiver filtered by sender prefix.
#[derive(Debug)]
pub struct EventSubscriber {
    prefix: String,
    receiver: TopicReceiver<Event>,
}

impl EventSubscriber {
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            let event = self.receiver.recv().await?;
            if event.sender.starts_with(&self.prefix) {
                return Some(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tinkerbus_types::{DeviceContent, DeviceKind};

    fn event(sender: &str) -> Event {
        Event::new(DeviceContent::new("ab1", DeviceKind::AmbientLight), sender)
    }

    #[test]
    fn publishing_without_subscribers_is_not_an_error() {
        let bus = EventBus::default();
        assert_eq!(bus.publish_event(event("tinkerbus/ambient_light/ab1")), 0);
    }

    #[tokio::test]
    async fn every_subscriber_gets_the_event() {
        let bus = EventBus::default();
        let mut a = bus.subscribe_events();
        let mut b = bus.subscribe_events();

        let sent = event("tinkerbus/ambient_light/ab1");
        assert_eq!(bus.publish_event(sent.clone()), 2);

        assert_eq!(a.recv().await.unwrap().id, sent.id);
        assert_eq!(b.recv().await.unwrap().id, sent.id);
    }

    #[tokio::test]
    async fn topics_are_separate() {
        let bus = EventBus::default();
        let mut intents = bus.subscribe_intents();
        bus.publish_event(event("tinkerbus/ambient_light/ab1"));

        let result = tokio::time::timeout(Duration::from_millis(50), intents.recv()).await;
        assert!(result.is_err(), "intent subscriber must not see events");
    }

    #[tokio::test]
    async fn prefix_subscriber_filters_senders() {
        let bus = EventBus::default();
        let mut temperatures = bus.subscribe_events_from("tinkerbus/temperature");

        bus.publish_event(event("tinkerbus/ambient_light/ab1"));
        let wanted = event("tinkerbus/temperature/t1");
        bus.publish_event(wanted.clone());

        assert_eq!(temperatures.recv().await.unwrap().id, wanted.id);
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_ahead() {
        let bus = EventBus::new(4);
        let mut slow = bus.subscribe_events();

        let mut last = None;
        for _ in 0..10 {
            let e = event("tinkerbus/ambient_light/ab1");
            last = Some(e.id);
            bus.publish_event(e);
        }

        let mut received = Vec::new();
        while let Ok(Some(e)) = tokio::time::timeout(Duration::from_millis(20), slow.recv()).await {
            received.push(e.id);
        }
        assert_eq!(received.len(), 4);
        assert_eq!(received.last().copied(), last);
    }
}
