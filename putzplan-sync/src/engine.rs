//! Queue drain: replays pending mutations against the remote store.
//!
//! ```text
//!   Idle ──trigger──► Draining ──queue walked──► Reconcile? ──► Idle
//!                        │  ▲
//!                        └──┘ one mutation at a time, FIFO
//! ```
//!
//! Only one drain runs at a time; a trigger that arrives while a drain is
//! active returns [`DrainOutcome::Skipped`]. The running drain re-reads the
//! queue after every step, so anything enqueued meanwhile is still picked up.
//!
//! Per-item ordering: once a mutation for an item fails (or is exhausted),
//! later mutations for the same item are deferred for the rest of the cycle.
//! The remote store therefore never sees a later mutation of an item before
//! an earlier one.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::model::{Item, ItemId, NewItem};
use crate::queue::{Mutation, PendingMutation, QueueId};
use crate::remote::{canonical_target, RemoteError, RemoteStore};
use crate::state::ListState;

/// Default retry ceiling for a single mutation.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Summary of one drain cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Monotonic cycle number, starting at 1.
    pub cycle: u64,
    pub applied: usize,
    pub failed: usize,
    /// Skipped because an earlier mutation of the same item did not go through.
    pub deferred: usize,
    /// Skipped because the retry ceiling was reached. Kept in the queue.
    pub exhausted: usize,
    /// Queue length when the cycle ended.
    pub remaining: usize,
    /// The cache was replaced with a fresh remote load.
    pub reconciled: bool,
    pub reload_error: Option<String>,
    /// The household changed mid-drain; later results were not applied.
    pub interrupted: bool,
}

impl DrainReport {
    fn attempted(&self) -> bool {
        self.applied + self.failed > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Another drain was already running.
    Skipped,
    Completed(DrainReport),
}

/// Resets the draining flag on every exit path.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncEngine {
    max_retries: u32,
    draining: AtomicBool,
    cycles: AtomicU64,
    reports: watch::Sender<Option<DrainReport>>,
}

impl SyncEngine {
    pub fn new(max_retries: u32) -> Self {
        let (reports, _) = watch::channel(None);
        Self {
            max_retries,
            draining: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
            reports,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Observe the report of the most recent completed drain.
    pub fn subscribe_reports(&self) -> watch::Receiver<Option<DrainReport>> {
        self.reports.subscribe()
    }

    /// Walk the queue once and push every eligible mutation to `remote`.
    ///
    /// The state lock is taken per step and released before each remote call.
    pub async fn drain(&self, state: &Mutex<ListState>, remote: &dyn RemoteStore) -> DrainOutcome {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("Drain already running, skipping trigger");
            return DrainOutcome::Skipped;
        }
        let _guard = DrainGuard(&self.draining);

        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let household_id = state.lock().await.household_id();
        let mut report = DrainReport {
            cycle,
            ..DrainReport::default()
        };

        let mut visited: HashSet<QueueId> = HashSet::new();
        let mut blocked: HashSet<ItemId> = HashSet::new();

        loop {
            let next = {
                let guard = state.lock().await;
                if guard.household_id() != household_id {
                    report.interrupted = true;
                    break;
                }
                let pending = guard
                    .queue
                    .iter()
                    .find(|p| !visited.contains(&p.queue_id))
                    .cloned();
                pending
            };
            let Some(pending) = next else { break };
            visited.insert(pending.queue_id.clone());

            let item_id = pending.mutation.item_id().clone();
            if pending.retries >= self.max_retries {
                log::debug!("Mutation {} exhausted after {} retries", pending.queue_id, pending.retries);
                report.exhausted += 1;
                blocked.insert(item_id);
                continue;
            }
            if blocked.contains(&item_id) {
                report.deferred += 1;
                continue;
            }

            let result = apply_remote(remote, household_id, &pending.mutation).await;

            let mut guard = state.lock().await;
            if guard.household_id() != household_id {
                log::info!("Household switched during drain {cycle}, dropping result");
                report.interrupted = true;
                break;
            }
            match result {
                Ok(confirmed) => {
                    guard.queue.dequeue(&pending.queue_id);
                    guard.advance_remote_generation();
                    if let (Mutation::Create { temp_id, .. }, Some(item)) = (&pending.mutation, confirmed) {
                        log::debug!("Create {temp_id} confirmed as {}", item.id);
                        guard.cache.retire_temporary(temp_id, item);
                    }
                    report.applied += 1;
                }
                Err(e) => {
                    let retries = guard.queue.record_failure(&pending.queue_id, e.to_string());
                    log::warn!(
                        "Mutation {} for {item_id} failed (retries: {}): {e}",
                        pending.queue_id,
                        retries.unwrap_or(pending.retries + 1)
                    );
                    report.failed += 1;
                    blocked.insert(item_id);
                }
            }
        }

        if !report.interrupted {
            self.reconcile(state, remote, household_id, &mut report).await;
        }
        report.remaining = state.lock().await.queue.len();

        log::info!(
            "Drain {cycle} finished: {} applied, {} failed, {} deferred, {} exhausted, {} remaining",
            report.applied,
            report.failed,
            report.deferred,
            report.exhausted,
            report.remaining
        );
        self.reports.send_replace(Some(report.clone()));
        DrainOutcome::Completed(report)
    }

    /// Replace the cache with the remote rows once the queue is empty.
    async fn reconcile(
        &self,
        state: &Mutex<ListState>,
        remote: &dyn RemoteStore,
        household_id: Uuid,
        report: &mut DrainReport,
    ) {
        if !report.attempted() || !state.lock().await.queue.is_empty() {
            return;
        }

        match remote.select_all(household_id).await {
            Ok(items) => {
                let mut guard = state.lock().await;
                if guard.household_id() != household_id {
                    report.interrupted = true;
                } else if guard.queue.is_empty() {
                    guard.cache.replace_all(items);
                    guard.advance_remote_generation();
                    report.reconciled = true;
                } else {
                    log::debug!("New mutations queued during reload, keeping optimistic view");
                }
            }
            Err(e) => {
                log::warn!("Reload after drain {} failed: {e}", report.cycle);
                report.reload_error = Some(e.to_string());
            }
        }
    }
}

/// Issue the remote call for one mutation. Creates return the confirmed row.
async fn apply_remote(
    remote: &dyn RemoteStore,
    household_id: Uuid,
    mutation: &Mutation,
) -> Result<Option<Item>, RemoteError> {
    match mutation {
        Mutation::Create { name, .. } => {
            let item = NewItem { name: name.clone() };
            remote.insert(household_id, &item).await.map(Some)
        }
        Mutation::Update { target, patch } => {
            remote.update(canonical_target(target)?, patch).await?;
            Ok(None)
        }
        Mutation::Delete { target } => {
            remote.delete(canonical_target(target)?).await?;
            Ok(None)
        }
    }
}

/// Entries the next drain will leave untouched.
pub fn exhausted_entries(state: &ListState, max_retries: u32) -> Vec<PendingMutation> {
    state
        .queue
        .iter()
        .filter(|p| p.retries >= max_retries)
        .cloned()
        .collect()
}
