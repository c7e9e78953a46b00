//! In-process remote store and change feed.
//!
//! `MemoryRemote` holds the canonical rows of every household, assigns ids
//! on insert and publishes a `Change` frame on the household's broadcast
//! channel for each accepted write. The same channels back its
//! [`RealtimeFeed`] implementation and can be served over WebSocket by
//! [`FeedServer`](crate::server::FeedServer).
//!
//! Faults are injected through [`MemoryRemote::set_offline`],
//! [`MemoryRemote::fail_next`] and [`MemoryRemote::fail_after`]; every call,
//! accepted or not, lands in the journal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broadcast::{ChannelRegistry, HouseholdChannel};
use crate::model::{Item, ItemId, ItemPatch, NewItem};
use crate::protocol::{FeedMessage, MessageType};
use crate::realtime::{ChangeEvent, FeedError, RealtimeFeed, Subscription, SubscriptionHandle};
use crate::remote::{RemoteError, RemoteStore};

/// A call as seen by the remote store.
#[derive(Debug, Clone, PartialEq)]
pub enum CallKind {
    Insert { household_id: Uuid, name: String },
    Update { id: Uuid, patch: ItemPatch },
    Delete { id: Uuid },
    SelectAll { household_id: Uuid },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCall {
    pub kind: CallKind,
    /// False when an injected fault rejected the call.
    pub accepted: bool,
}

#[derive(Debug, Default)]
struct FaultPlan {
    offline: bool,
    /// Calls to let through before `fail` applies.
    pass: u32,
    fail: u32,
}

impl FaultPlan {
    fn check(&mut self) -> Result<(), RemoteError> {
        if self.offline {
            return Err(RemoteError::Unreachable("remote offline".into()));
        }
        if self.pass > 0 {
            self.pass -= 1;
            return Ok(());
        }
        if self.fail > 0 {
            self.fail -= 1;
            return Err(RemoteError::Rejected("injected failure".into()));
        }
        Ok(())
    }
}

pub struct MemoryRemote {
    rows: RwLock<Vec<Item>>,
    channels: Arc<ChannelRegistry>,
    sequence: AtomicU64,
    faults: StdMutex<FaultPlan>,
    journal: Mutex<Vec<RemoteCall>>,
    subscriptions: Mutex<HashMap<SubscriptionHandle, (Uuid, JoinHandle<()>)>>,
    event_buffer: usize,
}

impl MemoryRemote {
    /// `broadcast_capacity` bounds the frames buffered per subscriber.
    pub fn new(broadcast_capacity: usize) -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
            channels: Arc::new(ChannelRegistry::new(broadcast_capacity)),
            sequence: AtomicU64::new(0),
            faults: StdMutex::new(FaultPlan::default()),
            journal: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(HashMap::new()),
            event_buffer: broadcast_capacity,
        }
    }

    /// Channels change frames are published on.
    pub fn channels(&self) -> Arc<ChannelRegistry> {
        self.channels.clone()
    }

    /// Current change sequence (number of published changes).
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// While offline, every call fails with `Unreachable`.
    pub fn set_offline(&self, offline: bool) {
        self.with_faults(|plan| plan.offline = offline);
    }

    /// Reject the next `count` calls.
    pub fn fail_next(&self, count: u32) {
        self.with_faults(|plan| {
            plan.pass = 0;
            plan.fail = count;
        });
    }

    /// Let `successes` calls through, then reject one.
    pub fn fail_after(&self, successes: u32) {
        self.with_faults(|plan| {
            plan.pass = successes;
            plan.fail = 1;
        });
    }

    pub async fn journal(&self) -> Vec<RemoteCall> {
        self.journal.lock().await.clone()
    }

    /// Rows of a household, bypassing fault injection and the journal.
    pub async fn rows(&self, household_id: Uuid) -> Vec<Item> {
        self.rows
            .read()
            .await
            .iter()
            .filter(|item| item.household_id == household_id)
            .cloned()
            .collect()
    }

    fn with_faults(&self, f: impl FnOnce(&mut FaultPlan)) {
        match self.faults.lock() {
            Ok(mut plan) => f(&mut *plan),
            Err(poisoned) => f(&mut *poisoned.into_inner()),
        }
    }

    /// Journal the call and apply the fault plan.
    async fn admit(&self, kind: CallKind) -> Result<(), RemoteError> {
        let mut verdict = Ok(());
        self.with_faults(|plan| verdict = plan.check());
        self.journal.lock().await.push(RemoteCall {
            kind,
            accepted: verdict.is_ok(),
        });
        verdict
    }

    async fn publish(&self, event: ChangeEvent) {
        let household_id = event.item.household_id;
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let Some(channel) = self.channels.get(&household_id).await else {
            return;
        };
        match FeedMessage::change(household_id, sequence, &event).and_then(|msg| channel.publish(&msg)) {
            Ok(receivers) => log::debug!("Change {sequence} for {household_id} sent to {receivers} subscribers"),
            Err(e) => log::error!("Failed to publish change {sequence} for {household_id}: {e}"),
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn insert(&self, household_id: Uuid, item: &NewItem) -> Result<Item, RemoteError> {
        self.admit(CallKind::Insert {
            household_id,
            name: item.name.clone(),
        })
        .await?;

        let row = Item::new(ItemId::Canonical(Uuid::new_v4()), household_id, item.name.clone());
        self.rows.write().await.push(row.clone());
        self.publish(ChangeEvent::insert(row.clone())).await;
        Ok(row)
    }

    async fn update(&self, id: Uuid, patch: &ItemPatch) -> Result<(), RemoteError> {
        self.admit(CallKind::Update {
            id,
            patch: patch.clone(),
        })
        .await?;

        let updated = {
            let mut rows = self.rows.write().await;
            rows.iter_mut()
                .find(|row| row.id == ItemId::Canonical(id))
                .map(|row| {
                    row.apply_patch(patch);
                    row.clone()
                })
        };
        match updated {
            Some(row) => self.publish(ChangeEvent::update(row)).await,
            None => log::debug!("Update of missing row {id} ignored"),
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), RemoteError> {
        self.admit(CallKind::Delete { id }).await?;

        let removed = {
            let mut rows = self.rows.write().await;
            rows.iter()
                .position(|row| row.id == ItemId::Canonical(id))
                .map(|index| rows.remove(index))
        };
        match removed {
            Some(row) => self.publish(ChangeEvent::delete(row)).await,
            None => log::debug!("Delete of missing row {id} ignored"),
        }
        Ok(())
    }

    async fn select_all(&self, household_id: Uuid) -> Result<Vec<Item>, RemoteError> {
        self.admit(CallKind::SelectAll { household_id }).await?;
        Ok(self.rows(household_id).await)
    }
}

#[async_trait]
impl RealtimeFeed for MemoryRemote {
    async fn subscribe(&self, household_id: Uuid) -> Result<Subscription, FeedError> {
        let handle = SubscriptionHandle::new();
        let channel = self.channels.get_or_create(household_id).await;
        let frames = channel.add_subscriber(handle.id()).await;
        let (tx, events) = mpsc::channel(self.event_buffer.max(1));

        let task = tokio::spawn(forward_changes(channel, frames, tx, household_id));
        self.subscriptions
            .lock()
            .await
            .insert(handle, (household_id, task));

        log::debug!("In-process subscription {handle} for household {household_id}");
        Ok(Subscription { handle, events })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        let Some((household_id, task)) = self.subscriptions.lock().await.remove(&handle) else {
            return;
        };
        task.abort();
        if let Some(channel) = self.channels.get(&household_id).await {
            channel.remove_subscriber(&handle.id()).await;
        }
        self.channels.remove_if_empty(&household_id).await;
    }
}

/// Decode broadcast frames and pass change events on until either side closes.
async fn forward_changes(
    channel: Arc<HouseholdChannel>,
    mut frames: broadcast::Receiver<Arc<Vec<u8>>>,
    events: mpsc::Sender<ChangeEvent>,
    household_id: Uuid,
) {
    loop {
        let frame = match frames.recv().await {
            Ok(frame) => frame,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("Subscriber for {household_id} lagged by {n} changes");
                channel.record_lag(n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let event = match FeedMessage::decode(&frame) {
            Ok(msg) if msg.msg_type == MessageType::Change && msg.household_id == household_id => {
                match msg.change_event() {
                    Ok(event) => event,
                    Err(e) => {
                        log::warn!("Malformed change frame for {household_id}: {e}");
                        continue;
                    }
                }
            }
            Ok(_) => continue,
            Err(e) => {
                log::warn!("Undecodable frame for {household_id}: {e}");
                continue;
            }
        };

        if events.send(event).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    fn new_item(name: &str) -> NewItem {
        NewItem { name: name.into() }
    }

    #[tokio::test]
    async fn test_insert_assigns_canonical_id() {
        let remote = MemoryRemote::new(8);
        let household = Uuid::new_v4();

        let row = remote.insert(household, &new_item("Milk")).await.unwrap();
        assert!(row.id.canonical().is_some());
        assert_eq!(row.household_id, household);
        assert_eq!(remote.select_all(household).await.unwrap(), vec![row]);
        assert!(remote.select_all(Uuid::new_v4()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_and_delete_missing_rows_are_noops() {
        let remote = MemoryRemote::new(8);
        let missing = Uuid::new_v4();
        let patch = ItemPatch {
            priority: Some(true),
            ..ItemPatch::default()
        };

        assert_eq!(remote.update(missing, &patch).await, Ok(()));
        assert_eq!(remote.delete(missing).await, Ok(()));
        assert_eq!(remote.sequence(), 0);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let remote = MemoryRemote::new(8);
        let household = Uuid::new_v4();

        remote.set_offline(true);
        assert!(matches!(
            remote.select_all(household).await,
            Err(RemoteError::Unreachable(_))
        ));
        remote.set_offline(false);

        remote.fail_next(2);
        assert!(remote.select_all(household).await.is_err());
        assert!(remote.select_all(household).await.is_err());
        assert!(remote.select_all(household).await.is_ok());

        remote.fail_after(1);
        assert!(remote.select_all(household).await.is_ok());
        assert!(matches!(
            remote.select_all(household).await,
            Err(RemoteError::Rejected(_))
        ));

        let accepted: Vec<bool> = remote.journal().await.iter().map(|c| c.accepted).collect();
        assert_eq!(accepted, vec![false, false, false, true, true, false]);
    }

    #[tokio::test]
    async fn test_feed_delivers_household_changes() {
        let remote = MemoryRemote::new(8);
        let household = Uuid::new_v4();
        let mut sub = remote.subscribe(household).await.unwrap();

        remote.insert(Uuid::new_v4(), &new_item("Elsewhere")).await.unwrap();
        let row = remote.insert(household, &new_item("Milk")).await.unwrap();
        let patch = ItemPatch {
            purchased: Some(true),
            ..ItemPatch::default()
        };
        remote.update(row.id.canonical().unwrap(), &patch).await.unwrap();

        let first = timeout(Duration::from_secs(1), sub.events.recv()).await.unwrap().unwrap();
        assert_eq!(first, ChangeEvent::insert(row.clone()));
        let second = timeout(Duration::from_secs(1), sub.events.recv()).await.unwrap().unwrap();
        assert_eq!(second.kind, crate::realtime::ChangeKind::Update);
        assert!(second.item.purchased);
    }

    #[tokio::test]
    async fn test_unsubscribe_releases_channel() {
        let remote = MemoryRemote::new(8);
        let household = Uuid::new_v4();
        let sub = remote.subscribe(household).await.unwrap();
        assert_eq!(remote.channels().channel_count().await, 1);

        remote.unsubscribe(sub.handle).await;
        assert_eq!(remote.channels().channel_count().await, 0);

        // Unknown handles are ignored.
        remote.unsubscribe(sub.handle).await;
    }
}
