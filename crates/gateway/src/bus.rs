//! Typed publish/subscribe channel for connection and gateway events.
//!
//! Publishing is synchronous: an event is queued on every live subscriber
//! before `publish` returns, so each subscriber observes events in the order
//! they were published and the socket loop never interleaves two events.

use std::sync::{Arc, Mutex, PoisonError};

use {
    castle_protocol::EventFrame,
    tokio::sync::mpsc,
    tracing::trace,
};

use crate::state::ConnectionState;

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    StateChange {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// Application event forwarded verbatim once the handshake completed.
    Gateway(EventFrame),
    PairingRequired(serde_json::Value),
    PairingApproved {
        device_id: Option<String>,
    },
    AuthError {
        message: String,
    },
}

impl GatewayEvent {
    /// The forwarded frame, if this is an application event named `name`.
    pub fn frame_named(&self, name: &str) -> Option<&EventFrame> {
        match self {
            Self::Gateway(frame) if frame.event == name => Some(frame),
            _ => None,
        }
    }
}

#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<GatewayEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        Subscription { rx }
    }

    /// Deliver `event` to every live subscriber. Dropped subscriptions are
    /// pruned on the way.
    pub fn publish(&self, event: GatewayEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        trace!(subscribers = subscribers.len(), ?event, "published gateway event");
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}

/// Receiving end of one subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<GatewayEvent>,
}

impl Subscription {
    /// Next event, or `None` once the bus and every publisher are gone.
    pub async fn recv(&mut self) -> Option<GatewayEvent> {
        self.rx.recv().await
    }

    /// Next already-queued event without waiting.
    pub fn try_recv(&mut self) -> Option<GatewayEvent> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(seq: u64) -> GatewayEvent {
        GatewayEvent::Gateway(EventFrame {
            event: "tick".into(),
            payload: serde_json::Value::Null,
            seq: Some(seq),
        })
    }

    #[tokio::test]
    async fn fans_out_in_order() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        for seq in 1..=3 {
            bus.publish(tick(seq));
        }
        for sub in [&mut a, &mut b] {
            for seq in 1..=3 {
                assert_eq!(sub.recv().await, Some(tick(seq)));
            }
            assert!(sub.try_recv().is_none());
        }
    }

    #[test]
    fn dropped_subscription_is_pruned() {
        let bus = EventBus::new();
        let keep = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.subscriber_count(), 1);
        bus.publish(tick(1));
        drop(keep);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn frame_named_matches_only_application_events() {
        assert!(tick(1).frame_named("tick").is_some());
        assert!(tick(1).frame_named("chat").is_none());
        let ev = GatewayEvent::AuthError {
            message: "nope".into(),
        };
        assert!(ev.frame_named("tick").is_none());
    }
}
