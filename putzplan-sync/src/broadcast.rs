//! Per-household fan-out of encoded feed frames.
//!
//! Every household gets one tokio broadcast channel. Frames are encoded once
//! and shared as `Arc<Vec<u8>>`; each subscriber holds an independent
//! receiver that buffers up to `capacity` frames before it starts lagging.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{FeedMessage, ProtocolError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub frames_published: u64,
    /// Frames subscribers skipped because they fell behind.
    pub frames_lagged: u64,
    pub subscribers: usize,
    /// Frames a subscriber may buffer before lagging.
    pub capacity: usize,
}

/// Counters updated without taking the subscriber lock.
#[derive(Default)]
struct AtomicChannelStats {
    frames_published: AtomicU64,
    frames_lagged: AtomicU64,
    /// Highest change sequence seen by `publish`.
    last_sequence: AtomicU64,
}

pub struct HouseholdChannel {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    subscribers: RwLock<HashSet<Uuid>>,
    capacity: usize,
    stats: AtomicChannelStats,
}

impl HouseholdChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            subscribers: RwLock::new(HashSet::new()),
            capacity,
            stats: AtomicChannelStats::default(),
        }
    }

    /// Register a subscriber and return its receiver.
    pub async fn add_subscriber(&self, subscriber_id: Uuid) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.subscribers.write().await.insert(subscriber_id);
        self.sender.subscribe()
    }

    pub async fn remove_subscriber(&self, subscriber_id: &Uuid) -> bool {
        self.subscribers.write().await.remove(subscriber_id)
    }

    /// Encode and publish a frame. Returns the number of receivers reached.
    pub fn publish(&self, msg: &FeedMessage) -> Result<usize, ProtocolError> {
        let encoded = Arc::new(msg.encode()?);
        self.stats.last_sequence.fetch_max(msg.sequence, Ordering::Relaxed);
        Ok(self.publish_raw(encoded))
    }

    /// Publish an already-encoded frame.
    pub fn publish_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.stats.frames_published.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_lag(&self, skipped: u64) {
        self.stats.frames_lagged.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn last_sequence(&self) -> u64 {
        self.stats.last_sequence.load(Ordering::Relaxed)
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn stats(&self) -> ChannelStats {
        ChannelStats {
            frames_published: self.stats.frames_published.load(Ordering::Relaxed),
            frames_lagged: self.stats.frames_lagged.load(Ordering::Relaxed),
            subscribers: self.subscriber_count().await,
            capacity: self.capacity,
        }
    }
}

/// Maps household ids to their channels.
pub struct ChannelRegistry {
    channels: RwLock<HashMap<Uuid, Arc<HouseholdChannel>>>,
    default_capacity: usize,
}

impl ChannelRegistry {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, household_id: Uuid) -> Arc<HouseholdChannel> {
        {
            let channels = self.channels.read().await;
            if let Some(channel) = channels.get(&household_id) {
                return channel.clone();
            }
        }

        let mut channels = self.channels.write().await;
        channels
            .entry(household_id)
            .or_insert_with(|| Arc::new(HouseholdChannel::new(self.default_capacity)))
            .clone()
    }

    pub async fn get(&self, household_id: &Uuid) -> Option<Arc<HouseholdChannel>> {
        self.channels.read().await.get(household_id).cloned()
    }

    /// Drop a channel nobody listens to anymore.
    pub async fn remove_if_empty(&self, household_id: &Uuid) -> bool {
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get(household_id) {
            if channel.subscriber_count().await == 0 {
                channels.remove(household_id);
                return true;
            }
        }
        false
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn active_households(&self) -> Vec<Uuid> {
        self.channels.read().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;

    #[tokio::test]
    async fn test_subscribers_add_remove() {
        let channel = HouseholdChannel::new(16);
        let id = Uuid::new_v4();

        let _rx = channel.add_subscriber(id).await;
        assert_eq!(channel.subscriber_count().await, 1);
        assert!(channel.remove_subscriber(&id).await);
        assert!(!channel.remove_subscriber(&id).await);
        assert_eq!(channel.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_publish_fans_out() {
        let channel = HouseholdChannel::new(16);
        let household = Uuid::new_v4();
        let mut rx1 = channel.add_subscriber(Uuid::new_v4()).await;
        let mut rx2 = channel.add_subscriber(Uuid::new_v4()).await;

        let count = channel.publish(&FeedMessage::ping(household)).unwrap();
        assert_eq!(count, 2);
        assert_eq!(channel.last_sequence(), 0);

        for rx in [&mut rx1, &mut rx2] {
            let frame = rx.recv().await.unwrap();
            let msg = FeedMessage::decode(&frame).unwrap();
            assert_eq!(msg.msg_type, MessageType::Ping);
            assert_eq!(msg.household_id, household);
        }
        assert_eq!(channel.stats().await.frames_published, 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let channel = HouseholdChannel::new(4);
        assert_eq!(channel.publish_raw(Arc::new(vec![1, 2, 3])), 0);
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let channel = HouseholdChannel::new(2);
        let mut rx = channel.add_subscriber(Uuid::new_v4()).await;
        for i in 0..5u8 {
            channel.publish_raw(Arc::new(vec![i]));
        }

        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => channel.record_lag(n),
            other => panic!("expected lag, got {other:?}"),
        }
        let stats = channel.stats().await;
        assert_eq!(stats.frames_lagged, 3);
        assert_eq!(stats.capacity, 2);
    }

    #[tokio::test]
    async fn test_registry_isolates_households() {
        let registry = ChannelRegistry::new(8);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let ch_a = registry.get_or_create(a).await;
        let ch_b = registry.get_or_create(b).await;
        assert!(!Arc::ptr_eq(&ch_a, &ch_b));
        assert!(Arc::ptr_eq(&ch_a, &registry.get_or_create(a).await));
        assert_eq!(registry.channel_count().await, 2);
        assert_eq!(ch_b.stats().await.capacity, 8);

        let mut rx_b = ch_b.add_subscriber(Uuid::new_v4()).await;
        ch_a.publish(&FeedMessage::ping(a)).unwrap();
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_registry_remove_if_empty() {
        let registry = ChannelRegistry::new(8);
        let household = Uuid::new_v4();
        let channel = registry.get_or_create(household).await;
        let subscriber = Uuid::new_v4();
        let _rx = channel.add_subscriber(subscriber).await;

        assert!(!registry.remove_if_empty(&household).await);
        channel.remove_subscriber(&subscriber).await;
        assert!(registry.remove_if_empty(&household).await);
        assert!(registry.get(&household).await.is_none());
        assert!(registry.active_households().await.is_empty());
    }
}
