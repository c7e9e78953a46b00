//! Local cache of a household's shopping list.
//!
//! Holds the last known state of every item (canonical rows plus optimistic
//! temporary rows) and derives the sorted views the UI renders. Every
//! mutating call writes the full snapshot through [`Storage`] before it
//! returns; a failed write is logged and the in-memory state stays
//! authoritative for the rest of the process lifetime.

use std::cmp::Ordering;
use std::sync::Arc;

use uuid::Uuid;

use crate::model::{Item, ItemId};
use crate::storage::{cache_key, snapshot, SnapshotKind, Storage};

/// Ordering for the purchased-items view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PurchasedOrder {
    /// Most recently purchased first.
    #[default]
    Recency,
    /// Most frequently purchased first, ties by recency.
    Frequency,
}

pub struct LocalCache {
    household_id: Uuid,
    items: Vec<Item>,
    storage: Arc<dyn Storage>,
    key: String,
}

impl LocalCache {
    /// Empty cache for `household_id`. Nothing is written until the first mutation.
    pub fn new(storage: Arc<dyn Storage>, household_id: Uuid) -> Self {
        Self {
            household_id,
            items: Vec::new(),
            key: cache_key(household_id),
            storage,
        }
    }

    /// Restore the cache persisted for `household_id`.
    ///
    /// A missing snapshot yields an empty cache; an unreadable one is logged
    /// and discarded.
    pub fn load(storage: Arc<dyn Storage>, household_id: Uuid) -> Self {
        let mut cache = Self::new(storage, household_id);
        match cache.storage.read(&cache.key) {
            Ok(Some(bytes)) => {
                match snapshot::decode::<Vec<Item>>(SnapshotKind::Cache, household_id, &bytes) {
                    Ok(items) => {
                        log::debug!("Restored {} cached items for {household_id}", items.len());
                        cache.items = items;
                    }
                    Err(e) => log::warn!("Discarding unreadable cache snapshot for {household_id}: {e}"),
                }
            }
            Ok(None) => {}
            Err(e) => log::warn!("Failed to read cache snapshot for {household_id}: {e}"),
        }
        cache
    }

    pub fn household_id(&self) -> Uuid {
        self.household_id
    }

    /// All items in insertion order.
    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn get(&self, id: &ItemId) -> Option<&Item> {
        self.items.iter().find(|item| &item.id == id)
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.position(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Unpurchased items: priority first, then by name.
    pub fn unpurchased(&self) -> Vec<Item> {
        let mut items: Vec<Item> = self.items.iter().filter(|i| !i.purchased).cloned().collect();
        items.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| compare_names(a, b)));
        items
    }

    /// Purchased items in the requested order.
    pub fn purchased(&self, order: PurchasedOrder) -> Vec<Item> {
        let mut items: Vec<Item> = self.items.iter().filter(|i| i.purchased).cloned().collect();
        match order {
            PurchasedOrder::Recency => items.sort_by(compare_recency),
            PurchasedOrder::Frequency => items.sort_by(|a, b| {
                b.purchase_count
                    .cmp(&a.purchase_count)
                    .then_with(|| compare_recency(a, b))
            }),
        }
        items
    }

    /// Insert or replace by id. Returns `true` if the item was new.
    pub fn apply(&mut self, item: Item) -> bool {
        let inserted = match self.position(&item.id) {
            Some(index) => {
                self.items[index] = item;
                false
            }
            None => {
                self.items.push(item);
                true
            }
        };
        self.persist();
        inserted
    }

    /// Insert only if no item with the same id exists.
    pub fn insert_if_absent(&mut self, item: Item) -> bool {
        if self.contains(&item.id) {
            return false;
        }
        self.apply(item)
    }

    pub fn remove(&mut self, id: &ItemId) -> Option<Item> {
        let index = self.position(id)?;
        let removed = self.items.remove(index);
        self.persist();
        Some(removed)
    }

    /// Replace the whole list (reconciliation after a reload).
    pub fn replace_all(&mut self, items: Vec<Item>) {
        self.items = items;
        self.persist();
    }

    /// Swap an optimistic row for its confirmed canonical row.
    ///
    /// Keeps the temporary row's position. If the canonical row already
    /// arrived (e.g. through realtime), the temporary row is dropped and the
    /// canonical row is refreshed in place instead.
    pub fn retire_temporary(&mut self, temp_id: &ItemId, confirmed: Item) {
        let temp_pos = self.position(temp_id);
        let canonical_pos = self.position(&confirmed.id);
        match (temp_pos, canonical_pos) {
            (Some(t), None) => self.items[t] = confirmed,
            (Some(t), Some(c)) => {
                self.items[c] = confirmed;
                self.items.remove(t);
            }
            (None, Some(c)) => self.items[c] = confirmed,
            (None, None) => self.items.push(confirmed),
        }
        self.persist();
    }

    fn position(&self, id: &ItemId) -> Option<usize> {
        self.items.iter().position(|item| &item.id == id)
    }

    fn persist(&self) {
        let result = snapshot::encode(SnapshotKind::Cache, self.household_id, &self.items)
            .and_then(|bytes| self.storage.write(&self.key, &bytes));
        if let Err(e) = result {
            log::warn!("Failed to persist cache for {}: {e}", self.household_id);
        }
    }
}

fn compare_names(a: &Item, b: &Item) -> Ordering {
    a.name
        .to_lowercase()
        .cmp(&b.name.to_lowercase())
        .then_with(|| a.name.cmp(&b.name))
}

/// Newest purchase first; never-purchased rows last.
fn compare_recency(a: &Item, b: &Item) -> Ordering {
    match (a.last_purchased_at, b.last_purchased_at) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| compare_names(a, b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use chrono::{Duration, Utc};

    fn cache() -> (Arc<MemoryStorage>, LocalCache) {
        let storage = Arc::new(MemoryStorage::new());
        let cache = LocalCache::new(storage.clone(), Uuid::new_v4());
        (storage, cache)
    }

    fn item(cache: &LocalCache, name: &str, priority: bool) -> Item {
        let mut item = Item::new(ItemId::Canonical(Uuid::new_v4()), cache.household_id(), name);
        item.priority = priority;
        item
    }

    #[test]
    fn test_unpurchased_sort_priority_then_name() {
        let (_, mut cache) = cache();
        let a = item(&cache, "Milk", false);
        let b = item(&cache, "Zest", true);
        let c = item(&cache, "Bread", false);
        cache.apply(a.clone());
        cache.apply(b.clone());
        cache.apply(c.clone());

        let ids: Vec<ItemId> = cache.unpurchased().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![b.id, c.id, a.id]);
    }

    #[test]
    fn test_unpurchased_sort_ignores_case() {
        let (_, mut cache) = cache();
        let lower = item(&cache, "apples", false);
        let upper = item(&cache, "Bananas", false);
        cache.apply(upper.clone());
        cache.apply(lower.clone());

        let names: Vec<String> = cache.unpurchased().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["apples", "Bananas"]);
    }

    #[test]
    fn test_purchased_orders() {
        let (_, mut cache) = cache();
        let now = Utc::now();

        let mut old_frequent = item(&cache, "Coffee", false);
        old_frequent.purchased = true;
        old_frequent.purchase_count = 9;
        old_frequent.last_purchased_at = Some(now - Duration::days(3));

        let mut recent_rare = item(&cache, "Basil", false);
        recent_rare.purchased = true;
        recent_rare.purchase_count = 1;
        recent_rare.last_purchased_at = Some(now);

        let mut unstamped = item(&cache, "Salt", false);
        unstamped.purchased = true;

        cache.apply(unstamped.clone());
        cache.apply(old_frequent.clone());
        cache.apply(recent_rare.clone());
        cache.apply(item(&cache, "Eggs", false));

        let by_recency: Vec<String> = cache
            .purchased(PurchasedOrder::Recency)
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(by_recency, vec!["Basil", "Coffee", "Salt"]);

        let by_frequency: Vec<String> = cache
            .purchased(PurchasedOrder::Frequency)
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(by_frequency, vec!["Coffee", "Basil", "Salt"]);
    }

    #[test]
    fn test_apply_replaces_by_id() {
        let (_, mut cache) = cache();
        let mut milk = item(&cache, "Milk", false);
        assert!(cache.apply(milk.clone()));

        milk.priority = true;
        assert!(!cache.apply(milk.clone()));
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&milk.id).unwrap().priority);
    }

    #[test]
    fn test_insert_if_absent() {
        let (_, mut cache) = cache();
        let milk = item(&cache, "Milk", false);
        assert!(cache.insert_if_absent(milk.clone()));

        let mut changed = milk.clone();
        changed.name = "Oat milk".into();
        assert!(!cache.insert_if_absent(changed));
        assert_eq!(cache.get(&milk.id).unwrap().name, "Milk");
    }

    #[test]
    fn test_remove() {
        let (_, mut cache) = cache();
        let milk = item(&cache, "Milk", false);
        cache.apply(milk.clone());
        assert_eq!(cache.remove(&milk.id).map(|i| i.name), Some("Milk".to_string()));
        assert!(cache.remove(&milk.id).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_retire_temporary_keeps_position() {
        let (_, mut cache) = cache();
        let temp = Item::new(ItemId::new_temporary(), cache.household_id(), "Milk");
        let other = item(&cache, "Bread", false);
        cache.apply(temp.clone());
        cache.apply(other.clone());

        let mut confirmed = temp.clone();
        confirmed.id = ItemId::Canonical(Uuid::new_v4());
        cache.retire_temporary(&temp.id, confirmed.clone());

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.items()[0].id, confirmed.id);
        assert!(!cache.contains(&temp.id));
    }

    #[test]
    fn test_retire_temporary_after_realtime_insert() {
        let (_, mut cache) = cache();
        let temp = Item::new(ItemId::new_temporary(), cache.household_id(), "Milk");
        cache.apply(temp.clone());

        // Realtime delivered the canonical row before the create confirmed.
        let mut canonical = temp.clone();
        canonical.id = ItemId::Canonical(Uuid::new_v4());
        cache.apply(canonical.clone());
        assert_eq!(cache.len(), 2);

        cache.retire_temporary(&temp.id, canonical.clone());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.items()[0].id, canonical.id);
    }

    #[test]
    fn test_every_mutation_persists() {
        let (storage, mut cache) = cache();
        let milk = item(&cache, "Milk", false);

        cache.apply(milk.clone());
        cache.remove(&milk.id);
        cache.replace_all(vec![milk]);
        assert_eq!(storage.write_count(), 3);
    }

    #[test]
    fn test_load_restores_snapshot() {
        let (storage, mut cache) = cache();
        let household = cache.household_id();
        let milk = item(&cache, "Milk", true);
        cache.apply(milk.clone());

        let restored = LocalCache::load(storage, household);
        assert_eq!(restored.items(), &[milk]);
    }

    #[test]
    fn test_load_discards_corrupt_snapshot() {
        let storage = Arc::new(MemoryStorage::new());
        let household = Uuid::new_v4();
        storage.put_raw(&cache_key(household), vec![1, 2, 3]);

        let cache = LocalCache::load(storage, household);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_persistence_failure_keeps_memory_state() {
        let (storage, mut cache) = cache();
        storage.set_fail_writes(true);

        let milk = item(&cache, "Milk", false);
        cache.apply(milk.clone());
        assert!(cache.contains(&milk.id));
        assert_eq!(storage.write_count(), 0);
    }
}
