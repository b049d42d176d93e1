//! Single-process event bus.
//!
//! One bounded broadcast channel fans session lifecycle events, bandwidth and
//! metrics snapshots, and settings changes out to subscribers. Delivery is
//! best-effort: a lagging subscriber skips the oldest messages rather than
//! blocking publishers, and per-topic order is preserved because each topic
//! has a single publisher.

use tokio::sync::broadcast;

use crate::config::Settings;
use crate::metrics::MetricsSnapshot;
use crate::stream::session::SessionSnapshot;

/// Queue depth before the oldest events are dropped for slow subscribers.
const BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum Event {
    StreamStarted { session: SessionSnapshot },
    StreamStopped { session: SessionSnapshot },
    BandwidthUpdate { sessions: Vec<SessionSnapshot> },
    SettingsChanged { settings: Settings },
    SettingsUpdated { settings: Settings },
    MetricsUpdate { snapshot: MetricsSnapshot },
}

impl Event {
    /// Topic name as exposed to subscribers and logs.
    pub fn topic(&self) -> &'static str {
        match self {
            Event::StreamStarted { .. } => "stream:started",
            Event::StreamStopped { .. } => "stream:stopped",
            Event::BandwidthUpdate { .. } => "streams:bandwidth:update",
            Event::SettingsChanged { .. } => "settings:changed",
            Event::SettingsUpdated { .. } => "settings:updated",
            Event::MetricsUpdate { .. } => "metrics:update",
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish to all current subscribers. Publishing with no subscribers is
    /// not an error; events are simply dropped.
    pub fn publish(&self, event: Event) {
        tracing::trace!(topic = event.topic(), "event published");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
