//! # putzplan-sync: Offline-tolerant shopping list synchronization
//!
//! Keeps a household's shopping list usable without a network: every edit
//! lands in a persisted local cache at once and is queued for the remote
//! store, which the queue is drained into whenever it is reachable.
//!
//! ## Architecture
//!
//! ```text
//!   ShoppingList (per session)
//!        │ create / toggle / purchase / delete
//!        ▼
//! ┌──────────────────┐   drain (FIFO)   ┌──────────────┐
//! │ ListState        │ ───────────────► │ RemoteStore  │
//! │  LocalCache      │ ◄─────────────── │ (authority)  │
//! │  MutationQueue   │   reconcile      └──────┬───────┘
//! └────────┬─────────┘                         │ changes
//!          │ snapshots                         ▼
//!          ▼                           ┌──────────────┐
//! ┌──────────────────┐   merge loop    │ RealtimeFeed │
//! │ Storage          │ ◄── (cache) ─── │ (WS or mem)  │
//! │ (RocksDB / mem)  │                 └──────────────┘
//! └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`model`]: Items, item ids (temporary vs canonical), patches
//! - [`storage`]: Snapshot codec and key/value backends
//! - [`cache`]: Local item cache with list orderings
//! - [`queue`]: Durable FIFO of pending mutations
//! - [`mutator`]: Optimistic mutations
//! - [`engine`]: Queue drain and reconciliation
//! - [`realtime`]: Change events and the merge loop
//! - [`list`]: The per-session context tying it together
//! - [`memory`], [`server`], [`client`]: In-process remote and the WebSocket feed

pub mod broadcast;
pub mod cache;
pub mod client;
pub mod connectivity;
pub mod engine;
pub mod list;
pub mod memory;
pub mod model;
pub mod mutator;
pub mod protocol;
pub mod queue;
pub mod realtime;
pub mod remote;
pub mod server;
pub mod state;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{ChannelRegistry, ChannelStats, HouseholdChannel};
pub use cache::{LocalCache, PurchasedOrder};
pub use client::{ClientConfig, WsFeed};
pub use connectivity::Connectivity;
pub use engine::{DrainOutcome, DrainReport, SyncEngine, DEFAULT_MAX_RETRIES};
pub use list::{Session, ShoppingList, SyncConfig};
pub use memory::{CallKind, MemoryRemote, RemoteCall};
pub use model::{Item, ItemId, ItemPatch, NewItem, ParseItemIdError, TEMP_ID_PREFIX};
pub use mutator::{MutationError, OptimisticMutator};
pub use protocol::{FeedMessage, MessageType, ProtocolError};
pub use queue::{Mutation, MutationQueue, Operation, PendingMutation, QueueId};
pub use realtime::{
    merge_event, ChangeEvent, ChangeKind, FeedError, MergeOutcome, RealtimeFeed,
    RealtimeListener, Subscription, SubscriptionHandle,
};
pub use remote::{RemoteError, RemoteStore};
pub use server::{FeedServer, ServerConfig, ServerStats};
pub use state::ListState;
pub use storage::{MemoryStorage, RocksStorage, SnapshotKind, Storage, StoreConfig, StoreError};
