//! The authoritative store the queue drains into.

use async_trait::async_trait;
use uuid::Uuid;

use crate::model::{Item, ItemId, ItemPatch, NewItem};

/// Remote call failures. All of them are retryable from the queue's
/// point of view; none roll back optimistic state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("remote unreachable: {0}")]
    Unreachable(String),
    #[error("remote rejected the request: {0}")]
    Rejected(String),
    #[error("item {0} has no canonical id")]
    Unsynchronized(ItemId),
    #[error("remote call timed out")]
    Timeout,
}

/// Row-level access to the household's items.
///
/// `update` and `delete` of a row that no longer exists succeed as no-ops,
/// so replaying a mutation after a concurrent delete is harmless.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Insert a row and return it with its server-assigned id.
    async fn insert(&self, household_id: Uuid, item: &NewItem) -> Result<Item, RemoteError>;

    async fn update(&self, id: Uuid, patch: &ItemPatch) -> Result<(), RemoteError>;

    async fn delete(&self, id: Uuid) -> Result<(), RemoteError>;

    /// All rows for a household.
    async fn select_all(&self, household_id: Uuid) -> Result<Vec<Item>, RemoteError>;
}

/// Resolve the canonical id of a mutation target.
pub(crate) fn canonical_target(id: &ItemId) -> Result<Uuid, RemoteError> {
    id.canonical()
        .ok_or_else(|| RemoteError::Unsynchronized(id.clone()))
}
