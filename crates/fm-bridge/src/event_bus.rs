use std::sync::{Arc, Mutex};

use crate::protocol::CoreEvent;

/// A broadcast-style event bus built on top of flume channels.
///
/// Each call to [`subscribe`](EventBus::subscribe) creates a new receiver
/// that sees every event published afterwards. Publishing is fire-and-forget:
/// a subscriber whose receiver has been dropped is pruned on the next
/// publish, and a slow subscriber never blocks the publisher (channels are
/// unbounded). The bus is cheap to clone; clones share the subscriber list.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<CoreEvent>>>>,
}

impl EventBus {
    /// Create a new, empty event bus with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a new subscriber and return its receiving end.
    pub fn subscribe(&self) -> flume::Receiver<CoreEvent> {
        let (tx, rx) = flume::unbounded();
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.push(tx);
        rx
    }

    /// Publish an event to all current subscribers.
    ///
    /// Disconnected subscribers are automatically pruned; the publisher
    /// never observes an error.
    pub fn publish(&self, event: CoreEvent) {
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Return the number of currently active subscribers.
    pub fn subscriber_count(&self) -> usize {
        let senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EventPayload;

    #[test]
    fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let rx1 = bus.subscribe();
        let rx2 = bus.subscribe();

        bus.publish(CoreEvent::Event(EventPayload::new("test", "hello")));

        for rx in [rx1, rx2] {
            match rx.try_recv().expect("event expected") {
                CoreEvent::Event(p) => assert_eq!(p.event_type, "test"),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(CoreEvent::Event(EventPayload::new("prune", "x")));
        assert_eq!(bus.subscriber_count(), 1);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn publish_with_no_subscribers_is_a_noop() {
        let bus = EventBus::new();
        bus.publish(CoreEvent::Event(EventPayload::new("nobody", "listening")));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn clones_share_subscribers() {
        let bus = EventBus::new();
        let clone = bus.clone();
        let rx = bus.subscribe();

        clone.publish(CoreEvent::Event(EventPayload::new("via_clone", "y")));
        assert!(rx.try_recv().is_ok());
    }
}
