//! Dispatch lifecycle event stream
//!
//! Replaces ad-hoc pub/sub with a bounded broadcast channel: the dispatcher
//! and maintenance loop publish, consumers subscribe with
//! [`EventBus::subscribe`]. A slow or absent subscriber never blocks a
//! publisher; lagging receivers drop the oldest events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::registry::TrendAlert;

/// Default bound for the event channel
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// A lifecycle or monitoring event emitted by the dispatch layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchEvent {
    /// Event timestamp
    pub timestamp: DateTime<Utc>,
    /// Unique event ID
    pub event_id: Uuid,
    /// What happened
    pub kind: DispatchEventKind,
}

/// Event payloads
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum DispatchEventKind {
    /// A route's circuit breaker opened
    CircuitOpened { route_key: String },
    /// A route's circuit breaker closed after recovery
    CircuitClosed { route_key: String },
    /// Trend analysis detected a degrading route or request type
    TrendAlert {
        route_key: String,
        request_type: Option<String>,
        error_rate: f64,
        sample_count: usize,
    },
    /// A cache sweep removed expired entries
    CacheSwept { removed: usize },
    /// The dispatcher began shutting down
    ShutdownStarted,
}

impl DispatchEvent {
    pub fn new(kind: DispatchEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            event_id: Uuid::new_v4(),
            kind,
        }
    }

    pub fn trend_alert(alert: &TrendAlert) -> Self {
        Self::new(DispatchEventKind::TrendAlert {
            route_key: alert.route_key.clone(),
            request_type: alert.request_type.clone(),
            error_rate: alert.error_rate,
            sample_count: alert.sample_count,
        })
    }
}

/// Bounded broadcast bus for dispatch events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DispatchEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    /// Create a bus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; a send with no subscribers is not an error
    pub fn publish(&self, kind: DispatchEventKind) {
        let _ = self.sender.send(DispatchEvent::new(kind));
    }

    /// Publish a pre-built event
    pub fn publish_event(&self, event: DispatchEvent) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_published_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(DispatchEventKind::CircuitOpened {
            route_key: "translate:text".into(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event.kind,
            DispatchEventKind::CircuitOpened {
                route_key: "translate:text".into()
            }
        );
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new(8);
        bus.publish(DispatchEventKind::CacheSwept { removed: 3 });
    }

    #[tokio::test]
    async fn test_lagging_subscriber_drops_oldest() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..5 {
            bus.publish(DispatchEventKind::CacheSwept { removed: i });
        }
        // The receiver lagged; the next recv reports the gap rather than
        // blocking the publisher
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }
}
