//! In-process publish/subscribe hub keyed by channel name.
//!
//! Delivery is at-most-once: a subscriber that falls more than `capacity`
//! messages behind is told how many it missed and continues from the newest.
//! Publishing never blocks.

use std::collections::HashMap;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::StoreError;
use crate::gateway::Subscription;

/// Default per-channel buffer.
const DEFAULT_CAPACITY: usize = 256;

pub struct MessageBus {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    capacity: usize,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Open a subscription. Dropping the returned value releases it.
    pub fn subscribe(&self, channel: &str) -> Subscription {
        let rx = {
            let mut channels = self.channels.lock();
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe()
        };

        let stream = BroadcastStream::new(rx).map(|item| match item {
            Ok(payload) => Ok(payload),
            Err(BroadcastStreamRecvError::Lagged(n)) => Err(StoreError::Lagged(n)),
        });
        Subscription::new(channel, stream.boxed())
    }

    /// Fan a payload out to every live subscriber of `channel`.
    /// Returns how many subscribers it reached.
    pub fn publish(&self, channel: &str, payload: String) -> usize {
        let mut channels = self.channels.lock();
        let Some(tx) = channels.get(channel) else {
            return 0;
        };
        match tx.send(payload) {
            Ok(n) => n,
            Err(_) => {
                // Nobody listening any more.
                channels.remove(channel);
                0
            }
        }
    }

    /// Number of live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Drop a channel entirely; open subscriptions see end-of-stream.
    pub fn close(&self, channel: &str) -> bool {
        self.channels.lock().remove(channel).is_some()
    }

    /// Total live subscriptions across all channels.
    pub fn total_subscribers(&self) -> usize {
        self.channels
            .lock()
            .values()
            .map(broadcast::Sender::receiver_count)
            .sum()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = MessageBus::new();
        let mut sub = bus.subscribe("room:a");

        assert_eq!(bus.publish("room:a", "hello".into()), 1);
        let msg = sub.next_message().await.unwrap().unwrap();
        assert_eq!(msg, "hello");
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let bus = MessageBus::new();
        let mut a = bus.subscribe("room:a");
        let _b = bus.subscribe("room:b");

        bus.publish("room:b", "for b".into());
        bus.publish("room:a", "for a".into());

        assert_eq!(a.next_message().await.unwrap().unwrap(), "for a");
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let bus = MessageBus::new();
        assert_eq!(bus.publish("room:nobody", "x".into()), 0);
    }

    #[test]
    fn dropping_subscription_releases_it() {
        let bus = MessageBus::new();
        let sub = bus.subscribe("room:a");
        let sub2 = bus.subscribe("room:a");
        assert_eq!(bus.subscriber_count("room:a"), 2);

        drop(sub);
        assert_eq!(bus.subscriber_count("room:a"), 1);
        drop(sub2);
        assert_eq!(bus.subscriber_count("room:a"), 0);
        assert_eq!(bus.total_subscribers(), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_sees_lag() {
        let bus = MessageBus::with_capacity(2);
        let mut sub = bus.subscribe("room:a");

        for i in 0..5 {
            bus.publish("room:a", format!("m{i}"));
        }

        let first = sub.next_message().await.unwrap();
        assert!(matches!(first, Err(StoreError::Lagged(3))));
        assert_eq!(sub.next_message().await.unwrap().unwrap(), "m3");
        assert_eq!(sub.next_message().await.unwrap().unwrap(), "m4");
    }

    #[tokio::test]
    async fn close_ends_stream() {
        let bus = MessageBus::new();
        let mut sub = bus.subscribe("room:a");
        assert!(bus.close("room:a"));
        assert!(sub.next_message().await.is_none());
    }
}
