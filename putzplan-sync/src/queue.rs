//! Durable FIFO queue of mutations not yet confirmed by the remote store.
//!
//! Mirrors the cache's persistence discipline: every enqueue, dequeue and
//! failure record rewrites the queue snapshot before returning. The queue
//! length is published on a watch channel so callers can show a
//! "pending changes" indicator without polling.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::model::{ItemId, ItemPatch};
use crate::storage::{queue_key, snapshot, SnapshotKind, Storage};

/// Queue entry identifier: `<13-digit millis>-<16 hex random>`.
///
/// Lexicographic order follows creation time; the random suffix keeps ids
/// unique within a millisecond.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueId(String);

impl QueueId {
    pub fn generate() -> Self {
        let random = Uuid::new_v4().simple().to_string();
        QueueId(format!(
            "{:013}-{}",
            Utc::now().timestamp_millis(),
            &random[..16]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Operation kind, for logging and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// A write waiting to be applied remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    /// Create a new row. `temp_id` is the optimistic row to retire on success.
    Create { temp_id: ItemId, name: String },
    /// Apply a partial update to an existing canonical row.
    Update { target: ItemId, patch: ItemPatch },
    /// Delete an existing canonical row.
    Delete { target: ItemId },
}

impl Mutation {
    /// The item id this mutation is ordered against.
    pub fn item_id(&self) -> &ItemId {
        match self {
            Mutation::Create { temp_id, .. } => temp_id,
            Mutation::Update { target, .. } | Mutation::Delete { target } => target,
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            Mutation::Create { .. } => Operation::Create,
            Mutation::Update { .. } => Operation::Update,
            Mutation::Delete { .. } => Operation::Delete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub queue_id: QueueId,
    pub mutation: Mutation,
    /// Failed remote attempts so far. Only ever increases.
    pub retries: u32,
    pub last_error: Option<String>,
    /// Enqueue time (ordering/debugging only).
    pub timestamp: DateTime<Utc>,
}

impl PendingMutation {
    fn new(mutation: Mutation) -> Self {
        Self {
            queue_id: QueueId::generate(),
            mutation,
            retries: 0,
            last_error: None,
            timestamp: Utc::now(),
        }
    }
}

pub struct MutationQueue {
    household_id: Uuid,
    entries: VecDeque<PendingMutation>,
    storage: Arc<dyn Storage>,
    key: String,
    len_tx: watch::Sender<usize>,
}

impl MutationQueue {
    pub fn new(storage: Arc<dyn Storage>, household_id: Uuid) -> Self {
        let (len_tx, _) = watch::channel(0);
        Self {
            household_id,
            entries: VecDeque::new(),
            key: queue_key(household_id),
            storage,
            len_tx,
        }
    }

    /// Restore the queue persisted for `household_id`.
    pub fn load(storage: Arc<dyn Storage>, household_id: Uuid) -> Self {
        let mut queue = Self::new(storage, household_id);
        queue.entries = read_entries(queue.storage.as_ref(), household_id, &queue.key);
        queue.publish_len();
        queue
    }

    /// Switch to another household's persisted queue.
    ///
    /// Watch subscribers stay attached and see the new length.
    pub fn switch_scope(&mut self, household_id: Uuid) {
        self.household_id = household_id;
        self.key = queue_key(household_id);
        self.entries = read_entries(self.storage.as_ref(), household_id, &self.key);
        self.publish_len();
    }

    pub fn household_id(&self) -> Uuid {
        self.household_id
    }

    /// Append a mutation and persist. Returns the new entry's id.
    pub fn enqueue(&mut self, mutation: Mutation) -> QueueId {
        let pending = PendingMutation::new(mutation);
        let queue_id = pending.queue_id.clone();
        log::debug!(
            "Queued {:?} for {} as {queue_id}",
            pending.mutation.operation(),
            pending.mutation.item_id()
        );
        self.entries.push_back(pending);
        self.persist();
        self.publish_len();
        queue_id
    }

    /// Remove a confirmed mutation and persist.
    pub fn dequeue(&mut self, queue_id: &QueueId) -> Option<PendingMutation> {
        let index = self.entries.iter().position(|p| &p.queue_id == queue_id)?;
        let removed = self.entries.remove(index);
        self.persist();
        self.publish_len();
        removed
    }

    /// Count a failed remote attempt. Returns the new retry count.
    pub fn record_failure(&mut self, queue_id: &QueueId, error: impl Into<String>) -> Option<u32> {
        let pending = self.entries.iter_mut().find(|p| &p.queue_id == queue_id)?;
        pending.retries += 1;
        pending.last_error = Some(error.into());
        let retries = pending.retries;
        self.persist();
        Some(retries)
    }

    pub fn get(&self, queue_id: &QueueId) -> Option<&PendingMutation> {
        self.entries.iter().find(|p| &p.queue_id == queue_id)
    }

    /// Entries in FIFO order.
    pub fn iter(&self) -> impl Iterator<Item = &PendingMutation> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Observe the queue length.
    pub fn subscribe_len(&self) -> watch::Receiver<usize> {
        self.len_tx.subscribe()
    }

    fn publish_len(&self) {
        self.len_tx.send_replace(self.entries.len());
    }

    fn persist(&self) {
        let result = snapshot::encode(SnapshotKind::Queue, self.household_id, &self.entries)
            .and_then(|bytes| self.storage.write(&self.key, &bytes));
        if let Err(e) = result {
            log::warn!("Failed to persist mutation queue for {}: {e}", self.household_id);
        }
    }
}

fn read_entries(storage: &dyn Storage, household_id: Uuid, key: &str) -> VecDeque<PendingMutation> {
    match storage.read(key) {
        Ok(Some(bytes)) => {
            match snapshot::decode::<VecDeque<PendingMutation>>(SnapshotKind::Queue, household_id, &bytes) {
                Ok(entries) => {
                    if !entries.is_empty() {
                        log::info!("Restored {} pending mutations for {household_id}", entries.len());
                    }
                    entries
                }
                Err(e) => {
                    log::warn!("Discarding unreadable queue snapshot for {household_id}: {e}");
                    VecDeque::new()
                }
            }
        }
        Ok(None) => VecDeque::new(),
        Err(e) => {
            log::warn!("Failed to read queue snapshot for {household_id}: {e}");
            VecDeque::new()
        }
    }
}
