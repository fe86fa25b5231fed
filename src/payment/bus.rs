//! Lifecycle Bus
//!
//! Publishes payment notifications to subscribers over a tokio broadcast
//! channel. Dropping a [`Subscription`] unsubscribes it; closing the bus ends
//! every subscription at once.

use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::types::PaymentEvent;

/// Pub/sub for [`PaymentEvent`]s
pub struct LifecycleBus {
    /// `None` once closed
    sender: Mutex<Option<broadcast::Sender<PaymentEvent>>>,
}

impl LifecycleBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Subscribe to all future events. A closed bus yields an ended subscription.
    pub fn subscribe(&self) -> Subscription {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let receiver = match guard.as_ref() {
            Some(sender) => sender.subscribe(),
            None => {
                // Sender dropped immediately, so the receiver reports Closed
                let (sender, receiver) = broadcast::channel(1);
                drop(sender);
                receiver
            }
        };
        Subscription { receiver }
    }

    /// Publish to current subscribers; returns how many received it
    pub fn publish(&self, event: PaymentEvent) -> usize {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            // Send errors just mean nobody is listening
            Some(sender) => sender.send(event).unwrap_or(0),
            None => {
                debug!(target: "paywatch::payment", event = event.kind(), "bus closed, event dropped");
                0
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().map(|s| s.receiver_count()).unwrap_or(0)
    }

    /// Close the bus, ending every subscription. Idempotent.
    pub fn close(&self) {
        let mut guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        guard.take();
    }

    pub fn is_closed(&self) -> bool {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        guard.is_none()
    }
}

/// A subscriber's handle on the bus
pub struct Subscription {
    receiver: broadcast::Receiver<PaymentEvent>,
}

impl Subscription {
    /// Next event, or `None` once the bus is closed
    pub async fn recv(&mut self) -> Option<PaymentEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target: "paywatch::payment", skipped, "subscriber lagged, events skipped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<PaymentEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Stop receiving events
    pub fn unsubscribe(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_to_subscribers() {
        let bus = LifecycleBus::new(10);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        let delivered = bus.publish(PaymentEvent::Cancelled);
        assert_eq!(delivered, 2);

        assert_eq!(first.recv().await, Some(PaymentEvent::Cancelled));
        assert_eq!(second.recv().await, Some(PaymentEvent::Cancelled));
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = LifecycleBus::new(10);
        let subscription = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        subscription.unsubscribe();
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish(PaymentEvent::Cancelled), 0);
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let bus = LifecycleBus::new(10);
        let mut subscription = bus.subscribe();

        bus.publish(PaymentEvent::Cancelled);
        bus.close();
        bus.close();

        // Queued events are still delivered, then the stream ends
        assert_eq!(subscription.recv().await, Some(PaymentEvent::Cancelled));
        assert_eq!(subscription.recv().await, None);

        assert!(bus.is_closed());
        assert_eq!(bus.publish(PaymentEvent::Cancelled), 0);

        let mut late = bus.subscribe();
        assert_eq!(late.recv().await, None);
    }
}
