//! Persistence integration tests.
//!
//! Verifies:
//! - Offline edits and their queue survive a restart (RocksDB)
//! - Retry counters survive a restart
//! - Corrupt or foreign snapshots are discarded, not trusted
//! - Household isolation on disk
//! - Snapshot compression on realistic lists

use std::path::Path;
use std::sync::Arc;

use putzplan_sync::storage::{cache_key, queue_key, snapshot};
use putzplan_sync::{
    Connectivity, DrainOutcome, Item, ItemId, MemoryRemote, MemoryStorage, RocksStorage, Session,
    ShoppingList, SnapshotKind, Storage, StoreConfig, SyncConfig,
};
use tempfile::tempdir;
use uuid::Uuid;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn open_rocks(path: &Path) -> Arc<RocksStorage> {
    Arc::new(RocksStorage::open(StoreConfig::for_testing(path)).unwrap())
}

async fn open_list(remote: &Arc<MemoryRemote>, storage: Arc<dyn Storage>, session: Session) -> ShoppingList {
    ShoppingList::open(
        SyncConfig::for_testing(),
        session,
        remote.clone(),
        remote.clone(),
        storage,
        Connectivity::new(false),
    )
    .await
}

fn session() -> Session {
    Session {
        user_id: Uuid::new_v4(),
        household_id: Uuid::new_v4(),
    }
}

// ─── Restart Recovery ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_offline_edits_survive_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("db");
    let remote = Arc::new(MemoryRemote::new(16));
    let session = session();

    // Phase 1: edit offline, then "crash"
    {
        remote.set_offline(true);
        let list = open_list(&remote, open_rocks(&db_path), session).await;
        assert!(list.load_collection().await.is_err());
        list.create_item("Milk").await.unwrap();
        list.create_item("Bread").await.unwrap();
        list.close().await;
    }

    // Phase 2: restart, still offline data intact
    let list = open_list(&remote, open_rocks(&db_path), session).await;
    let items = list.items().await;
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|i| i.id.is_temporary()));
    assert_eq!(list.pending_mutations().await.len(), 2);
    assert_eq!(*list.pending_changes().borrow(), 2);

    // Phase 3: network is back
    remote.set_offline(false);
    let report = match list.sync_pending().await {
        DrainOutcome::Completed(report) => report,
        DrainOutcome::Skipped => panic!("drain skipped"),
    };
    assert_eq!(report.applied, 2);
    assert!(report.reconciled);

    let names: Vec<String> = list.unpurchased_items().await.into_iter().map(|i| i.name).collect();
    assert_eq!(names, vec!["Bread", "Milk"]);
    assert!(list.items().await.iter().all(|i| !i.id.is_temporary()));
    assert_eq!(remote.rows(session.household_id).await.len(), 2);
    list.close().await;
}

#[tokio::test]
async fn test_retry_counts_survive_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("db");
    let remote = Arc::new(MemoryRemote::new(16));
    let session = session();

    {
        let list = open_list(&remote, open_rocks(&db_path), session).await;
        list.create_item("Milk").await.unwrap();
        remote.fail_next(2);
        list.sync_pending().await;
        list.sync_pending().await;
        list.close().await;
    }

    let list = open_list(&remote, open_rocks(&db_path), session).await;
    let pending = list.pending_mutations().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].retries, 2);
    assert_eq!(pending[0].last_error.as_deref(), Some("remote rejected the request: injected failure"));
    list.close().await;
}

// ─── Snapshot Integrity ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_corrupt_snapshot_is_discarded() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("db");
    let remote = Arc::new(MemoryRemote::new(16));
    let session = session();

    {
        let storage = open_rocks(&db_path);
        storage.write(&cache_key(session.household_id), b"definitely not a snapshot").unwrap();
        storage.write(&queue_key(session.household_id), &[1, 2, 3]).unwrap();
    }

    let storage = open_rocks(&db_path);
    let list = open_list(&remote, storage.clone(), session).await;
    assert!(list.items().await.is_empty());
    assert!(!list.has_pending_mutations().await);

    // The next mutation rewrites a valid snapshot.
    list.create_item("Milk").await.unwrap();
    let bytes = storage.read(&cache_key(session.household_id)).unwrap().unwrap();
    let items: Vec<Item> = snapshot::decode(SnapshotKind::Cache, session.household_id, &bytes).unwrap();
    assert_eq!(items.len(), 1);
    list.close().await;
}

#[tokio::test]
async fn test_foreign_snapshot_is_not_loaded() {
    let storage = Arc::new(MemoryStorage::new());
    let remote = Arc::new(MemoryRemote::new(16));
    let alice = session();
    let bob = session();

    let list = open_list(&remote, storage.clone(), alice).await;
    list.create_item("Milk").await.unwrap();
    list.close().await;

    // Copy alice's cache under bob's key.
    let bytes = storage.read(&cache_key(alice.household_id)).unwrap().unwrap();
    storage.put_raw(&cache_key(bob.household_id), bytes);

    let list = open_list(&remote, storage, bob).await;
    assert!(list.items().await.is_empty());
    list.close().await;
}

#[tokio::test]
async fn test_households_isolated_on_disk() {
    let dir = tempdir().unwrap();
    let storage = open_rocks(&dir.path().join("db"));
    let remote = Arc::new(MemoryRemote::new(16));
    let first = session();
    let second = Uuid::new_v4();

    let list = open_list(&remote, storage.clone(), first).await;
    list.create_item("Milk").await.unwrap();

    remote.set_offline(true);
    assert!(list.switch_household(second).await.is_err());
    assert!(list.items().await.is_empty());
    list.create_item("Soap").await.unwrap();

    assert!(list.switch_household(first.household_id).await.is_err());
    let items = list.items().await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].name, "Milk");
    assert_eq!(list.pending_mutations().await.len(), 1);
    list.close().await;
}

#[tokio::test]
async fn test_persistence_failure_does_not_block_mutations() {
    let storage = Arc::new(MemoryStorage::new());
    let remote = Arc::new(MemoryRemote::new(16));
    let list = open_list(&remote, storage.clone(), session()).await;

    storage.set_fail_writes(true);
    let item = list.create_item("Milk").await.unwrap();
    assert!(list.item(&item.id).await.is_some());
    assert_eq!(list.pending_mutations().await.len(), 1);
    assert_eq!(storage.write_count(), 0);

    storage.set_fail_writes(false);
    list.sync_pending().await;
    assert!(!list.has_pending_mutations().await);
    assert!(storage.write_count() > 0);
    list.close().await;
}

// ─── Compression ─────────────────────────────────────────────────────────────

#[test]
fn test_snapshot_compresses_realistic_list() {
    let household = Uuid::new_v4();
    let items: Vec<Item> = (0..1_000)
        .map(|i| Item::new(ItemId::Canonical(Uuid::new_v4()), household, format!("Grocery item {i}")))
        .collect();

    let raw = bincode::serde::encode_to_vec(&items, bincode::config::standard()).unwrap();
    let encoded = snapshot::encode(SnapshotKind::Cache, household, &items).unwrap();
    assert!(
        encoded.len() < raw.len(),
        "snapshot {} bytes vs raw {} bytes",
        encoded.len(),
        raw.len()
    );

    let decoded: Vec<Item> = snapshot::decode(SnapshotKind::Cache, household, &encoded).unwrap();
    assert_eq!(decoded, items);
}
