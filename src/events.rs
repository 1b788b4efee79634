//! Fleet event stream: a bounded broadcast channel embedders can subscribe to.
//!
//! Spec §9's event-emitter redesign note: replace an ad hoc listener-list
//! pattern with a typed, bounded channel. A slow subscriber falls behind and
//! misses events rather than blocking producers; `dropped()` reports how many.

use crate::types::{Alert, ConnectionState};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum Event {
    UpstreamAdded { name: String },
    UpstreamRemoved { name: String },
    StateChanged { name: String, from: ConnectionState, to: ConnectionState },
    AlertRaised(Alert),
    MetricsSwept,
}

const CHANNEL_CAPACITY: usize = 1024;

/// Thin wrapper over `tokio::sync::broadcast` that also counts events dropped
/// because no receiver was registered (or all receivers lagged off the ring).
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx, dropped: AtomicU64::new(0) }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish an event. Returns the number of active subscribers it reached;
    /// zero is not an error — it just means nobody is currently listening,
    /// but it's still counted as a dropped event.
    pub fn publish(&self, event: Event) -> usize {
        match self.tx.send(event) {
            Ok(n) => n,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::SeqCst);
                0
            }
        }
    }

    /// Record `n` events a lagging subscriber missed off the ring. Callers
    /// drive this from their own `recv()` loop on `RecvError::Lagged(n)`,
    /// since only the subscriber side observes how far it fell behind.
    pub fn record_lagged(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::SeqCst);
    }

    /// Total events dropped so far: sends with no subscriber plus lag drops
    /// reported back via `record_lagged`.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Event::UpstreamAdded { name: "a".to_string() });
        let event = rx.recv().await.unwrap();
        matches!(event, Event::UpstreamAdded { name } if name == "a");
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(Event::MetricsSwept), 0);
    }

    #[test]
    fn publish_without_subscribers_counts_as_dropped() {
        let bus = EventBus::new();
        bus.publish(Event::MetricsSwept);
        bus.publish(Event::MetricsSwept);
        assert_eq!(bus.dropped(), 2);
    }

    #[test]
    fn record_lagged_accumulates_into_dropped() {
        let bus = EventBus::new();
        bus.record_lagged(3);
        bus.record_lagged(4);
        assert_eq!(bus.dropped(), 7);
    }
}
