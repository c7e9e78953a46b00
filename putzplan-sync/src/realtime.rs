//! Realtime change feed and the merge loop that folds it into the cache.
//!
//! ```text
//!  RealtimeFeed ──mpsc<ChangeEvent>──► merge loop ──lock──► ListState.cache
//! ```
//!
//! One merge loop per subscription. Events are idempotent: an insert for a
//! row the cache already holds (for instance our own confirmed create) is
//! dropped, and updates/deletes for unknown rows are ignored.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cache::LocalCache;
use crate::model::Item;
use crate::state::ListState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row-level change. `item` is the post-image, or the pre-image for deletes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub item: Item,
}

impl ChangeEvent {
    pub fn insert(item: Item) -> Self {
        Self { kind: ChangeKind::Insert, item }
    }

    pub fn update(item: Item) -> Self {
        Self { kind: ChangeKind::Update, item }
    }

    pub fn delete(item: Item) -> Self {
        Self { kind: ChangeKind::Delete, item }
    }
}

/// Opaque handle for releasing a feed subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(Uuid);

impl SubscriptionHandle {
    pub fn new() -> Self {
        SubscriptionHandle(Uuid::new_v4())
    }

    pub fn id(&self) -> Uuid {
        self.0
    }
}

impl Default for SubscriptionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub events: mpsc::Receiver<ChangeEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    #[error("feed connection failed: {0}")]
    Connection(String),
    #[error("feed handshake failed: {0}")]
    Handshake(String),
    #[error("feed handshake timed out")]
    Timeout,
    #[error("feed closed")]
    Closed,
}

/// Source of row-level change events for one household.
#[async_trait]
pub trait RealtimeFeed: Send + Sync {
    async fn subscribe(&self, household_id: Uuid) -> Result<Subscription, FeedError>;

    /// Release a subscription. Unknown handles are ignored.
    async fn unsubscribe(&self, handle: SubscriptionHandle);
}

/// What a single event did to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Replaced,
    Removed,
    Ignored,
}

/// Fold one change event into the cache.
pub fn merge_event(cache: &mut LocalCache, event: &ChangeEvent) -> MergeOutcome {
    let item = &event.item;
    if item.household_id != cache.household_id() || item.id.is_temporary() {
        return MergeOutcome::Ignored;
    }

    match event.kind {
        ChangeKind::Insert => {
            if cache.insert_if_absent(item.clone()) {
                MergeOutcome::Inserted
            } else {
                MergeOutcome::Ignored
            }
        }
        ChangeKind::Update => {
            if cache.contains(&item.id) {
                cache.apply(item.clone());
                MergeOutcome::Replaced
            } else {
                MergeOutcome::Ignored
            }
        }
        ChangeKind::Delete => match cache.remove(&item.id) {
            Some(_) => MergeOutcome::Removed,
            None => MergeOutcome::Ignored,
        },
    }
}

struct ActiveSubscription {
    handle: SubscriptionHandle,
    household_id: Uuid,
    merge_task: JoinHandle<()>,
}

/// Owns at most one feed subscription and its merge loop.
pub struct RealtimeListener {
    feed: Arc<dyn RealtimeFeed>,
    active: Mutex<Option<ActiveSubscription>>,
}

impl RealtimeListener {
    pub fn new(feed: Arc<dyn RealtimeFeed>) -> Self {
        Self {
            feed,
            active: Mutex::new(None),
        }
    }

    /// Subscribe to the state's current household, replacing any previous
    /// subscription.
    pub async fn subscribe(&self, state: Arc<Mutex<ListState>>) -> Result<SubscriptionHandle, FeedError> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            self.teardown(previous).await;
        }

        let household_id = state.lock().await.household_id();
        let Subscription { handle, mut events } = self.feed.subscribe(household_id).await?;

        let merge_task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let mut guard = state.lock().await;
                if guard.household_id() != household_id {
                    log::debug!("Dropping change for stale household {household_id}");
                    continue;
                }
                let outcome = merge_event(&mut guard.cache, &event);
                if outcome != MergeOutcome::Ignored {
                    guard.advance_remote_generation();
                }
                log::debug!("Merged {:?} for {}: {outcome:?}", event.kind, event.item.id);
            }
            log::debug!("Change stream for {household_id} ended");
        });

        log::info!("Subscribed to changes for household {household_id}");
        *active = Some(ActiveSubscription {
            handle,
            household_id,
            merge_task,
        });
        Ok(handle)
    }

    pub async fn unsubscribe(&self) {
        if let Some(previous) = self.active.lock().await.take() {
            self.teardown(previous).await;
        }
    }

    pub async fn is_subscribed(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Household of the active subscription, if any.
    pub async fn subscribed_household(&self) -> Option<Uuid> {
        self.active.lock().await.as_ref().map(|a| a.household_id)
    }

    async fn teardown(&self, subscription: ActiveSubscription) {
        self.feed.unsubscribe(subscription.handle).await;
        subscription.merge_task.abort();
        log::info!("Unsubscribed from household {}", subscription.household_id);
    }
}
