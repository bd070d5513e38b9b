use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use super::{Message, Topic};

/// Topic fan-out over bounded per-subscriber queues. Publishing never waits:
/// a full queue drops the message and bumps `event_bus.dropped`.
#[derive(Default)]
pub struct EventBus {
    subscribers: DashMap<Topic, Vec<mpsc::Sender<Arc<Message>>>>,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: Topic, capacity: usize) -> mpsc::Receiver<Arc<Message>> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribers.entry(topic).or_default().push(tx);
        debug!(topic = topic.as_str(), capacity, "event bus subscriber added");
        rx
    }

    /// Deliver to every subscriber of the message's topic. Returns how many
    /// queues accepted it.
    pub fn publish(&self, message: Message) -> usize {
        let topic = message.topic();
        let Some(senders) = self.subscribers.get(&topic) else {
            return 0;
        };
        let message = Arc::new(message);
        let mut delivered = 0;
        for tx in senders.iter() {
            match tx.try_send(Arc::clone(&message)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("event_bus.dropped", "topic" => topic.as_str()).increment(1);
                    warn!(topic = topic.as_str(), "event bus queue full, message dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(topic = topic.as_str(), "event bus subscriber gone");
                }
            }
        }
        delivered
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Drop every sender so consumers drain what is queued and then stop.
    pub fn close(&self) {
        self.subscribers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::models::Event;

    fn event(id: &str) -> Message {
        Message::Event(Event {
            id: id.into(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_fan_out_to_every_subscriber() {
        let bus = EventBus::new();
        let mut a = bus.subscribe(Topic::Event, 4);
        let mut b = bus.subscribe(Topic::Event, 4);
        let mut other = bus.subscribe(Topic::RequestContent, 4);

        assert_eq!(bus.publish(event("e1")), 2);
        assert!(matches!(&*a.recv().await.unwrap(), Message::Event(e) if e.id == "e1"));
        assert!(matches!(&*b.recv().await.unwrap(), Message::Event(e) if e.id == "e1"));
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(Topic::Event, 2);

        for i in 0..5 {
            bus.publish(event(&format!("e{i}")));
        }
        assert_eq!(bus.dropped(), 3);

        assert!(matches!(&*rx.recv().await.unwrap(), Message::Event(e) if e.id == "e0"));
        assert!(matches!(&*rx.recv().await.unwrap(), Message::Event(e) if e.id == "e1"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(Topic::Event, 2);
        bus.publish(event("e1"));
        bus.close();

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
        assert_eq!(bus.publish(event("e2")), 0);
    }
}
