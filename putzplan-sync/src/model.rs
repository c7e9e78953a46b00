//! Shopping list data model.
//!
//! An [`Item`] is addressed by an [`ItemId`] that is either a client-side
//! temporary placeholder or the canonical UUID assigned by the remote store.
//! Temporary ids carry the reserved `temp_` prefix so they can never be
//! confused with canonical ids once rendered as text.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reserved prefix for client-generated ids.
pub const TEMP_ID_PREFIX: &str = "temp_";

/// Identifier of a shopping item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ItemId {
    /// Client-generated placeholder (`temp_<millis>_<random>`), not yet
    /// confirmed by the remote store.
    Temporary(String),
    /// Server-assigned identifier.
    Canonical(Uuid),
}

impl ItemId {
    /// Allocate a fresh temporary id.
    ///
    /// The random part is a full v4 UUID, so ids allocated within the same
    /// millisecond still differ.
    pub fn new_temporary() -> Self {
        ItemId::Temporary(format!(
            "{TEMP_ID_PREFIX}{}_{}",
            Utc::now().timestamp_millis(),
            Uuid::new_v4().simple()
        ))
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, ItemId::Temporary(_))
    }

    /// The canonical UUID, if this id has one.
    pub fn canonical(&self) -> Option<Uuid> {
        match self {
            ItemId::Canonical(id) => Some(*id),
            ItemId::Temporary(_) => None,
        }
    }
}

impl From<Uuid> for ItemId {
    fn from(id: Uuid) -> Self {
        ItemId::Canonical(id)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemId::Temporary(raw) => f.write_str(raw),
            ItemId::Canonical(id) => write!(f, "{id}"),
        }
    }
}

/// Error returned when parsing an [`ItemId`] from text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid item id: {0}")]
pub struct ParseItemIdError(pub String);

impl FromStr for ItemId {
    type Err = ParseItemIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with(TEMP_ID_PREFIX) && s.len() > TEMP_ID_PREFIX.len() {
            return Ok(ItemId::Temporary(s.to_string()));
        }
        Uuid::parse_str(s)
            .map(ItemId::Canonical)
            .map_err(|_| ParseItemIdError(s.to_string()))
    }
}

/// One entry of a household's shopping list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub household_id: Uuid,
    pub name: String,
    pub purchased: bool,
    pub priority: bool,
    /// Number of times the item went from unpurchased to purchased.
    pub purchase_count: u32,
    pub last_purchased_at: Option<DateTime<Utc>>,
    pub last_purchased_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Item {
    /// A fresh, unpurchased item.
    pub fn new(id: ItemId, household_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            household_id,
            name: name.into(),
            purchased: false,
            priority: false,
            purchase_count: 0,
            last_purchased_at: None,
            last_purchased_by: None,
            created_at: Utc::now(),
        }
    }

    /// Apply a partial update in place. `id`, `household_id`, `name` and
    /// `created_at` are never touched.
    pub fn apply_patch(&mut self, patch: &ItemPatch) {
        if let Some(purchased) = patch.purchased {
            self.purchased = purchased;
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        if let Some(count) = patch.purchase_count {
            self.purchase_count = count;
        }
        if let Some(at) = patch.last_purchased_at {
            self.last_purchased_at = Some(at);
        }
        if let Some(by) = patch.last_purchased_by {
            self.last_purchased_by = Some(by);
        }
    }
}

/// Partial field set carried by an update mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemPatch {
    pub purchased: Option<bool>,
    pub priority: Option<bool>,
    pub purchase_count: Option<u32>,
    pub last_purchased_at: Option<DateTime<Utc>>,
    pub last_purchased_by: Option<Uuid>,
}

impl ItemPatch {
    pub fn is_empty(&self) -> bool {
        self == &ItemPatch::default()
    }
}

/// Fields sent to the remote store when creating an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewItem {
    pub name: String,
}
