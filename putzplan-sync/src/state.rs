//! The cache + queue pair for one collection scope.
//!
//! `ListState` is shared between the caller-facing operations, the sync
//! engine and the realtime merge loop behind a single `tokio::sync::Mutex`.
//! Each of those locks it once per step and never across a remote call, so
//! every public operation is atomic from the others' point of view.

use std::sync::Arc;

use uuid::Uuid;

use crate::cache::LocalCache;
use crate::model::Item;
use crate::queue::{Mutation, MutationQueue};
use crate::storage::Storage;

pub struct ListState {
    pub cache: LocalCache,
    pub queue: MutationQueue,
    storage: Arc<dyn Storage>,
    remote_generation: u64,
}

impl ListState {
    /// Restore persisted state for `household_id`.
    pub fn open(storage: Arc<dyn Storage>, household_id: Uuid) -> Self {
        Self {
            cache: LocalCache::load(storage.clone(), household_id),
            queue: MutationQueue::load(storage.clone(), household_id),
            storage,
            remote_generation: 0,
        }
    }

    pub fn household_id(&self) -> Uuid {
        self.cache.household_id()
    }

    /// Bumped whenever remote-confirmed state lands in the cache: a dequeued
    /// mutation, a reconcile, a realtime merge. Rows fetched before a bump
    /// are stale and must not be rebased.
    pub fn remote_generation(&self) -> u64 {
        self.remote_generation
    }

    pub fn advance_remote_generation(&mut self) {
        self.remote_generation += 1;
    }

    /// Swap to another household's persisted cache and queue.
    pub fn switch_household(&mut self, household_id: Uuid) {
        self.cache = LocalCache::load(self.storage.clone(), household_id);
        self.queue.switch_scope(household_id);
        self.advance_remote_generation();
    }

    /// Replace the cache with freshly loaded remote rows, then replay the
    /// still-pending mutations on top so optimistic edits survive the load.
    pub fn rebase(&mut self, remote_items: Vec<Item>) {
        if self.queue.is_empty() {
            self.cache.replace_all(remote_items);
            return;
        }

        let mut items = remote_items;
        for pending in self.queue.iter() {
            match &pending.mutation {
                Mutation::Create { temp_id, .. } => {
                    if let Some(temp) = self.cache.get(temp_id) {
                        if !items.iter().any(|i| &i.id == temp_id) {
                            items.push(temp.clone());
                        }
                    }
                }
                Mutation::Update { target, patch } => {
                    if let Some(item) = items.iter_mut().find(|i| &i.id == target) {
                        item.apply_patch(patch);
                    }
                }
                Mutation::Delete { target } => items.retain(|i| &i.id != target),
            }
        }
        self.cache.replace_all(items);
    }
}
