//! The shopping list as seen by the application.
//!
//! [`ShoppingList`] is an explicit context object: it owns the shared
//! [`ListState`], the sync engine and the realtime listener for one session,
//! and is cheap to clone. Mutations return as soon as the cache and queue
//! are updated; draining happens in the background.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cache::PurchasedOrder;
use crate::connectivity::Connectivity;
use crate::engine::{exhausted_entries, DrainOutcome, DrainReport, SyncEngine, DEFAULT_MAX_RETRIES};
use crate::model::{Item, ItemId};
use crate::mutator::{MutationError, OptimisticMutator};
use crate::queue::PendingMutation;
use crate::realtime::{FeedError, RealtimeFeed, RealtimeListener, SubscriptionHandle};
use crate::remote::{RemoteError, RemoteStore};
use crate::state::ListState;
use crate::storage::Storage;

/// Fetches a load repeats when remote-confirmed changes land meanwhile.
const MAX_LOAD_ATTEMPTS: u32 = 3;

/// Sync behaviour.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Failed attempts after which a mutation is no longer retried (default: 5)
    pub max_retries: u32,
    /// Drain in the background after every mutation while online (default: true)
    pub eager_sync: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            eager_sync: true,
        }
    }
}

impl SyncConfig {
    /// Config for testing: drains only when asked to.
    pub fn for_testing() -> Self {
        Self {
            eager_sync: false,
            ..Self::default()
        }
    }
}

/// Who is using the list, and which household's list it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub user_id: Uuid,
    pub household_id: Uuid,
}

struct Inner {
    config: SyncConfig,
    mutator: OptimisticMutator,
    state: Arc<Mutex<ListState>>,
    engine: SyncEngine,
    remote: Arc<dyn RemoteStore>,
    listener: RealtimeListener,
    connectivity: Connectivity,
    pending_rx: watch::Receiver<usize>,
    loading: AtomicBool,
    monitor: StdMutex<Option<JoinHandle<()>>>,
}

impl Inner {
    async fn drain(&self) -> DrainOutcome {
        self.engine.drain(&self.state, self.remote.as_ref()).await
    }
}

#[derive(Clone)]
pub struct ShoppingList {
    inner: Arc<Inner>,
}

impl ShoppingList {
    /// Restore the session's persisted cache and queue and start watching
    /// connectivity. Must be called inside a tokio runtime.
    pub async fn open(
        config: SyncConfig,
        session: Session,
        remote: Arc<dyn RemoteStore>,
        feed: Arc<dyn RealtimeFeed>,
        storage: Arc<dyn Storage>,
        connectivity: Connectivity,
    ) -> Self {
        let state = ListState::open(storage, session.household_id);
        let pending_rx = state.queue.subscribe_len();
        log::info!(
            "Opened shopping list for household {} ({} cached, {} pending)",
            session.household_id,
            state.cache.len(),
            state.queue.len()
        );

        let inner = Arc::new(Inner {
            engine: SyncEngine::new(config.max_retries),
            config,
            mutator: OptimisticMutator::new(session.user_id),
            state: Arc::new(Mutex::new(state)),
            remote,
            listener: RealtimeListener::new(feed),
            connectivity: connectivity.clone(),
            pending_rx,
            loading: AtomicBool::new(false),
            monitor: StdMutex::new(None),
        });

        let online_rx = connectivity.subscribe();
        let online = *online_rx.borrow();
        let monitor = tokio::spawn(watch_connectivity(Arc::downgrade(&inner), online_rx, online));
        if let Ok(mut slot) = inner.monitor.lock() {
            *slot = Some(monitor);
        }

        Self { inner }
    }

    /// Fetch the household's rows and rebase pending mutations on them.
    ///
    /// Rows fetched while the engine confirmed a mutation (or a change was
    /// merged) are stale; the fetch is repeated up to [`MAX_LOAD_ATTEMPTS`]
    /// times before the cache is kept as is. On failure the cache is left as
    /// it was. Returns the number of rows in the cache afterwards.
    pub async fn load_collection(&self) -> Result<usize, RemoteError> {
        self.inner.loading.store(true, Ordering::Release);
        let result = self.load_rows().await;
        self.inner.loading.store(false, Ordering::Release);

        let len = result?;
        self.schedule_sync();
        Ok(len)
    }

    async fn load_rows(&self) -> Result<usize, RemoteError> {
        for attempt in 1..=MAX_LOAD_ATTEMPTS {
            let (household_id, generation) = {
                let state = self.inner.state.lock().await;
                (state.household_id(), state.remote_generation())
            };

            let items = match self.inner.remote.select_all(household_id).await {
                Ok(items) => items,
                Err(e) => {
                    log::warn!("Loading household {household_id} failed, keeping cache: {e}");
                    return Err(e);
                }
            };

            let mut state = self.inner.state.lock().await;
            if state.household_id() != household_id {
                log::debug!("Household switched while loading {household_id}, discarding rows");
                return Ok(state.cache.len());
            }
            if state.remote_generation() != generation {
                log::debug!("Rows for {household_id} went stale during load (attempt {attempt})");
                continue;
            }
            state.rebase(items);
            let len = state.cache.len();
            log::debug!("Loaded {len} items for household {household_id}");
            return Ok(len);
        }

        let state = self.inner.state.lock().await;
        log::warn!(
            "Household {} kept changing while loading, keeping cache",
            state.household_id()
        );
        Ok(state.cache.len())
    }

    pub async fn create_item(&self, name: &str) -> Result<Item, MutationError> {
        let item = {
            let mut state = self.inner.state.lock().await;
            self.inner.mutator.create_item(&mut state, name)?
        };
        self.schedule_sync();
        Ok(item)
    }

    pub async fn toggle_priority(&self, id: &ItemId) -> Result<Item, MutationError> {
        let item = {
            let mut state = self.inner.state.lock().await;
            self.inner.mutator.toggle_priority(&mut state, id)?
        };
        self.schedule_sync();
        Ok(item)
    }

    pub async fn mark_purchased(&self, id: &ItemId) -> Result<Item, MutationError> {
        let item = {
            let mut state = self.inner.state.lock().await;
            self.inner.mutator.mark_purchased(&mut state, id)?
        };
        self.schedule_sync();
        Ok(item)
    }

    pub async fn mark_unpurchased(&self, id: &ItemId) -> Result<Item, MutationError> {
        let item = {
            let mut state = self.inner.state.lock().await;
            self.inner.mutator.mark_unpurchased(&mut state, id)?
        };
        self.schedule_sync();
        Ok(item)
    }

    pub async fn delete_item(&self, id: &ItemId) -> Result<Item, MutationError> {
        let item = {
            let mut state = self.inner.state.lock().await;
            self.inner.mutator.delete_item(&mut state, id)?
        };
        self.schedule_sync();
        Ok(item)
    }

    pub async fn has_pending_mutations(&self) -> bool {
        !self.inner.state.lock().await.queue.is_empty()
    }

    /// Number of queued mutations, updated on every queue change.
    pub fn pending_changes(&self) -> watch::Receiver<usize> {
        self.inner.pending_rx.clone()
    }

    pub async fn pending_mutations(&self) -> Vec<PendingMutation> {
        self.inner.state.lock().await.queue.iter().cloned().collect()
    }

    /// Mutations that reached the retry ceiling and are no longer attempted.
    pub async fn exhausted_mutations(&self) -> Vec<PendingMutation> {
        let state = self.inner.state.lock().await;
        exhausted_entries(&state, self.inner.engine.max_retries())
    }

    /// Start merging remote changes for the current household.
    pub async fn subscribe(&self) -> Result<SubscriptionHandle, FeedError> {
        self.inner.listener.subscribe(self.inner.state.clone()).await
    }

    pub async fn unsubscribe(&self) {
        self.inner.listener.unsubscribe().await;
    }

    pub async fn is_subscribed(&self) -> bool {
        self.inner.listener.is_subscribed().await
    }

    /// Drain the queue now and wait for the result.
    pub async fn sync_pending(&self) -> DrainOutcome {
        self.inner.drain().await
    }

    pub fn drain_reports(&self) -> watch::Receiver<Option<DrainReport>> {
        self.inner.engine.subscribe_reports()
    }

    pub async fn items(&self) -> Vec<Item> {
        self.inner.state.lock().await.cache.items().to_vec()
    }

    /// Unpurchased items, priority first, then by name.
    pub async fn unpurchased_items(&self) -> Vec<Item> {
        self.inner.state.lock().await.cache.unpurchased()
    }

    pub async fn purchased_items(&self, order: PurchasedOrder) -> Vec<Item> {
        self.inner.state.lock().await.cache.purchased(order)
    }

    pub async fn item(&self, id: &ItemId) -> Option<Item> {
        self.inner.state.lock().await.cache.get(id).cloned()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.loading.load(Ordering::Acquire)
    }

    pub async fn household_id(&self) -> Uuid {
        self.inner.state.lock().await.household_id()
    }

    /// Move to another household: drop the subscription, swap in that
    /// household's persisted cache and queue, reload, and resubscribe if a
    /// subscription was active.
    pub async fn switch_household(&self, household_id: Uuid) -> Result<usize, RemoteError> {
        let was_subscribed = self.is_subscribed().await;
        self.inner.listener.unsubscribe().await;

        {
            let mut state = self.inner.state.lock().await;
            log::info!("Switching household {} -> {household_id}", state.household_id());
            state.switch_household(household_id);
        }

        let loaded = self.load_collection().await;
        if was_subscribed {
            if let Err(e) = self.subscribe().await {
                log::warn!("Resubscribing to household {household_id} failed: {e}");
            }
        }
        loaded
    }

    /// Stop background work: the subscription and the connectivity monitor.
    pub async fn close(&self) {
        self.inner.listener.unsubscribe().await;
        if let Ok(mut slot) = self.inner.monitor.lock() {
            if let Some(monitor) = slot.take() {
                monitor.abort();
            }
        }
        log::info!("Closed shopping list");
    }

    fn schedule_sync(&self) {
        if !self.inner.config.eager_sync || !self.inner.connectivity.is_online() {
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.drain().await;
        });
    }
}

/// Drain on every offline → online transition while the list is alive.
async fn watch_connectivity(inner: Weak<Inner>, mut online_rx: watch::Receiver<bool>, mut online: bool) {
    while online_rx.changed().await.is_ok() {
        let now = *online_rx.borrow_and_update();
        if now && !online {
            let Some(inner) = inner.upgrade() else { break };
            log::info!("Connectivity restored, draining pending mutations");
            inner.drain().await;
        }
        online = now;
    }
}
