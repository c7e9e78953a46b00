//! Optimistic mutations.
//!
//! Each operation validates first, then updates the cache and enqueues the
//! matching [`Mutation`] in one step. Nothing here talks to the network;
//! the sync engine picks the queue up later.
//!
//! Updates and deletes addressed to a temporary id are refused: the row
//! does not exist remotely yet, and the single-pass drain has no way to
//! hold an update back until its create is confirmed.

use chrono::Utc;
use uuid::Uuid;

use crate::model::{Item, ItemId, ItemPatch};
use crate::queue::Mutation;
use crate::state::ListState;

/// Validation failures. Reported synchronously, never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MutationError {
    #[error("item name must not be empty")]
    EmptyName,
    #[error("item {0} is not synchronized yet")]
    NotSynchronized(ItemId),
    #[error("item {0} not found")]
    NotFound(ItemId),
}

/// Applies user actions to a [`ListState`] on behalf of one user.
#[derive(Debug, Clone)]
pub struct OptimisticMutator {
    user_id: Uuid,
}

impl OptimisticMutator {
    pub fn new(user_id: Uuid) -> Self {
        Self { user_id }
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    /// Add a new item under a fresh temporary id.
    pub fn create_item(&self, state: &mut ListState, name: &str) -> Result<Item, MutationError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(MutationError::EmptyName);
        }

        let item = Item::new(ItemId::new_temporary(), state.household_id(), name);
        state.cache.apply(item.clone());
        state.queue.enqueue(Mutation::Create {
            temp_id: item.id.clone(),
            name: item.name.clone(),
        });
        Ok(item)
    }

    pub fn toggle_priority(&self, state: &mut ListState, id: &ItemId) -> Result<Item, MutationError> {
        let current = self.target(state, id)?;
        let patch = ItemPatch {
            priority: Some(!current.priority),
            ..ItemPatch::default()
        };
        Ok(self.update(state, current, patch))
    }

    /// Mark as purchased, computing the new count from the local row.
    ///
    /// Already purchased items are returned unchanged and nothing is queued,
    /// so the count only moves on the unpurchased → purchased transition.
    pub fn mark_purchased(&self, state: &mut ListState, id: &ItemId) -> Result<Item, MutationError> {
        let current = self.target(state, id)?;
        if current.purchased {
            log::debug!("Item {id} already purchased");
            return Ok(current);
        }
        let patch = ItemPatch {
            purchased: Some(true),
            priority: Some(false),
            purchase_count: Some(current.purchase_count + 1),
            last_purchased_at: Some(Utc::now()),
            last_purchased_by: Some(self.user_id),
        };
        Ok(self.update(state, current, patch))
    }

    /// Put a purchased item back on the list. The purchase count is kept.
    pub fn mark_unpurchased(&self, state: &mut ListState, id: &ItemId) -> Result<Item, MutationError> {
        let current = self.target(state, id)?;
        if !current.purchased {
            log::debug!("Item {id} already unpurchased");
            return Ok(current);
        }
        let patch = ItemPatch {
            purchased: Some(false),
            ..ItemPatch::default()
        };
        Ok(self.update(state, current, patch))
    }

    /// Remove an item. Returns the removed row.
    pub fn delete_item(&self, state: &mut ListState, id: &ItemId) -> Result<Item, MutationError> {
        let current = self.target(state, id)?;
        state.cache.remove(id);
        state.queue.enqueue(Mutation::Delete { target: id.clone() });
        Ok(current)
    }

    fn target(&self, state: &ListState, id: &ItemId) -> Result<Item, MutationError> {
        if id.is_temporary() {
            return Err(MutationError::NotSynchronized(id.clone()));
        }
        state
            .cache
            .get(id)
            .cloned()
            .ok_or_else(|| MutationError::NotFound(id.clone()))
    }

    fn update(&self, state: &mut ListState, mut item: Item, patch: ItemPatch) -> Item {
        item.apply_patch(&patch);
        state.cache.apply(item.clone());
        state.queue.enqueue(Mutation::Update {
            target: item.id.clone(),
            patch,
        });
        item
    }
}
