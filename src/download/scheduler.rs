//! Admission control for the transfer pool.
//!
//! Draws from `queued` items across all subscriptions, oldest queued-since
//! first, holding the pool at `max_concurrent_downloads` with a
//! per-subscription fairness cap so one prolific channel cannot starve the
//! rest. Every admitted item gets exactly one transfer task, tracked here so
//! cancellation (unsubscribe, user delete, shutdown) can tear it down
//! deterministically.

use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::transfer::{self, TransferError};
use crate::config::Config;
use crate::events::{EngineEvent, Events};
use crate::library::Library;
use crate::store::{Database, Item, ItemEvent, ItemState, TransitionError};

/// How many queued rows one admission pass examines. Large enough that a
/// fairness-capped subscription can't hide other channels' work behind it.
const ADMISSION_WINDOW: i64 = 64;

struct ActiveTransfer {
    subscription_id: i64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct DownloadScheduler {
    db: Database,
    client: reqwest::Client,
    config: Arc<Config>,
    events: Events,
    library: Arc<Library>,
    /// Live transfers by item id. The 1:1 binding between an item in
    /// `downloading` and its task lives here and only here.
    active: Mutex<HashMap<i64, ActiveTransfer>>,
}

impl DownloadScheduler {
    pub fn new(
        db: Database,
        client: reqwest::Client,
        config: Arc<Config>,
        events: Events,
        library: Arc<Library>,
    ) -> Self {
        Self {
            db,
            client,
            config,
            events,
            library,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Run admission passes until cancelled, then tear down every live
    /// transfer before returning.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let tick = self.config.scheduler_tick();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(tick) => {
                    if let Err(e) = self.admit().await {
                        tracing::error!(error = %e, "Download admission pass failed");
                    }
                }
            }
        }
        self.cancel_all().await;
        tracing::debug!("Download scheduler stopped");
    }

    /// One admission pass: promote freshly discovered items into the queue,
    /// then fill free pool slots in FIFO order under the fairness cap.
    /// Returns the number of transfers started.
    pub async fn admit(self: &Arc<Self>) -> Result<usize> {
        // discovered -> queued. Stamps queued_at, which fixes FIFO position.
        for item_id in self.db.discovered_item_ids(256).await? {
            match self.db.transition(item_id, ItemEvent::Admit).await {
                Ok(_) => self.events.emit(EngineEvent::StateChanged {
                    item_id,
                    state: ItemState::Queued,
                }),
                Err(TransitionError::InvalidEdge { .. }) => {} // raced, fine
                Err(TransitionError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let now = Utc::now().timestamp();
        let cap = self.config.fairness_cap();
        let mut started = 0;

        loop {
            let (free, per_sub) = {
                let active = self.active.lock().unwrap();
                let mut per_sub: HashMap<i64, usize> = HashMap::new();
                for transfer in active.values() {
                    *per_sub.entry(transfer.subscription_id).or_default() += 1;
                }
                (
                    self.config.max_concurrent_downloads.saturating_sub(active.len()),
                    per_sub,
                )
            };
            if free == 0 {
                break;
            }

            let candidates = self.db.queued_ready(now, ADMISSION_WINDOW).await?;
            let active_ids: Vec<i64> = {
                let active = self.active.lock().unwrap();
                active.keys().copied().collect()
            };
            let candidates: Vec<Item> = candidates
                .into_iter()
                .filter(|c| !active_ids.contains(&c.id))
                .collect();
            if candidates.is_empty() {
                break;
            }

            // FIFO, but skip subscriptions already holding their fair share
            // of slots while other channels are waiting. When every waiting
            // channel is at its cap there is no one to be fair to — plain
            // FIFO applies.
            let pick = candidates
                .iter()
                .find(|c| per_sub.get(&c.subscription_id).copied().unwrap_or(0) < cap)
                .or_else(|| candidates.first());

            let Some(item) = pick.cloned() else {
                break;
            };
            if self.start_transfer(item).await? {
                started += 1;
            }
        }

        Ok(started)
    }

    /// Claim a pool slot for one item and spawn its transfer task.
    /// Returns false if the item refused the `start` edge (raced away).
    async fn start_transfer(self: &Arc<Self>, item: Item) -> Result<bool> {
        let item = match self.db.transition(item.id, ItemEvent::Start).await {
            Ok(item) => item,
            Err(TransitionError::InvalidEdge { .. }) | Err(TransitionError::NotFound { .. }) => {
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        self.events.emit(EngineEvent::StateChanged {
            item_id: item.id,
            state: ItemState::Downloading,
        });

        let cancel = CancellationToken::new();
        let this = Arc::clone(self);
        let task_cancel = cancel.clone();
        let task_item = item.clone();
        // The task must not outrun its own registration in `active`, or a
        // fast completion would remove the entry before it exists and leave
        // a ghost transfer behind. It waits for the go signal sent below.
        let (registered_tx, registered_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _ = registered_rx.await;
            let temp_path = this.library.temp_path(task_item.id);
            let final_path = this.library.final_path(&task_item);
            let result = transfer::run(
                &this.client,
                &this.db,
                &this.events,
                &task_item,
                &temp_path,
                &final_path,
                &task_cancel,
            )
            .await;

            if let Err(e) = this.finish(&task_item, result).await {
                tracing::error!(item_id = task_item.id, error = %e, "Failed to record transfer outcome");
            }
            this.active.lock().unwrap().remove(&task_item.id);
        });

        {
            let mut active = self.active.lock().unwrap();
            active.insert(
                item.id,
                ActiveTransfer {
                    subscription_id: item.subscription_id,
                    cancel,
                    handle,
                },
            );
            tracing::debug!(
                item_id = item.id,
                subscription_id = item.subscription_id,
                active = active.len(),
                "Transfer started"
            );
        }
        let _ = registered_tx.send(());
        Ok(true)
    }

    /// Record a transfer outcome as the item's next lifecycle step.
    ///
    /// Every path here is a guarded transition: if the row was deleted
    /// (unsubscribe) or already moved (completion vs. cancellation race),
    /// the losing side quietly stands down — the winner's state stays.
    async fn finish(
        &self,
        item: &Item,
        result: Result<transfer::CompletedTransfer, TransferError>,
    ) -> Result<()> {
        match result {
            Ok(completed) => {
                let event = ItemEvent::Complete {
                    file_path: completed.file_path.to_string_lossy().into_owned(),
                    file_size: completed.file_size as i64,
                };
                match self.db.transition(item.id, event).await {
                    Ok(_) => {
                        tracing::info!(
                            item_id = item.id,
                            bytes = completed.file_size,
                            "Download complete"
                        );
                        self.events.emit(EngineEvent::StateChanged {
                            item_id: item.id,
                            state: ItemState::Downloaded,
                        });
                        // A finished download may push usage over budget
                        self.library.enforce_budget(Some(item.id)).await?;
                        if let Some(sub) =
                            self.db.get_subscription(item.subscription_id).await?
                        {
                            self.library.apply_retention(&sub).await?;
                        }
                    }
                    Err(e) => {
                        // The row moved or vanished under us; the published
                        // file belongs to no committed item. Remove it.
                        tracing::warn!(item_id = item.id, error = %e, "Completion lost a race");
                        crate::library::remove_file_quietly(&completed.file_path).await;
                    }
                }
            }
            Err(TransferError::Cancelled) => {
                match self.db.transition(item.id, ItemEvent::Interrupt).await {
                    Ok(_) => {
                        tracing::debug!(item_id = item.id, "Transfer cancelled, item requeued");
                        self.events.emit(EngineEvent::StateChanged {
                            item_id: item.id,
                            state: ItemState::Queued,
                        });
                    }
                    // Unsubscribed mid-flight or already moved; nothing to do
                    Err(TransitionError::NotFound { .. })
                    | Err(TransitionError::InvalidEdge { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Err(error) => {
                let attempts_after = item.attempts + 1;
                let budget = self.config.download_retry_budget as i64;
                let event = if error.is_retryable() && attempts_after < budget {
                    let backoff = self.config.download_backoff_base_secs as i64
                        * (1i64 << (attempts_after - 1).clamp(0, 16));
                    tracing::warn!(
                        item_id = item.id,
                        attempt = attempts_after,
                        backoff_secs = backoff,
                        error = %error,
                        "Transfer failed, will retry"
                    );
                    ItemEvent::RetryableFailure {
                        error: error.to_string(),
                        retry_at: Utc::now().timestamp() + backoff,
                    }
                } else {
                    tracing::warn!(
                        item_id = item.id,
                        attempts = attempts_after,
                        error = %error,
                        "Transfer failed permanently"
                    );
                    ItemEvent::Fail {
                        error: error.to_string(),
                    }
                };
                let target = event.target();

                match self.db.transition(item.id, event).await {
                    Ok(_) => self.events.emit(EngineEvent::StateChanged {
                        item_id: item.id,
                        state: target,
                    }),
                    Err(TransitionError::NotFound { .. })
                    | Err(TransitionError::InvalidEdge { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// Cancel one item's transfer if it is live. Waits for the teardown to
    /// finish, so on return there is no writer and no temp file.
    pub async fn cancel_item(&self, item_id: i64) -> bool {
        let entry = self.active.lock().unwrap().remove(&item_id);
        match entry {
            Some(transfer) => {
                transfer.cancel.cancel();
                let _ = transfer.handle.await;
                true
            }
            None => false,
        }
    }

    /// Cancel every live transfer belonging to one subscription.
    /// Idempotent; safe to race with completions (the store's guarded
    /// transitions arbitrate).
    pub async fn cancel_subscription(&self, subscription_id: i64) -> usize {
        let entries: Vec<ActiveTransfer> = {
            let mut active = self.active.lock().unwrap();
            let ids: Vec<i64> = active
                .iter()
                .filter(|(_, t)| t.subscription_id == subscription_id)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| active.remove(&id)).collect()
        };

        let count = entries.len();
        for transfer in entries {
            transfer.cancel.cancel();
            let _ = transfer.handle.await;
        }
        count
    }

    /// Tear down everything (engine shutdown).
    pub async fn cancel_all(&self) {
        let entries: Vec<ActiveTransfer> = {
            let mut active = self.active.lock().unwrap();
            let ids: Vec<i64> = active.keys().copied().collect();
            ids.into_iter().filter_map(|id| active.remove(&id)).collect()
        };
        for transfer in entries {
            transfer.cancel.cancel();
            let _ = transfer.handle.await;
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    /// Test/one-shot helper: block until the pool has drained.
    pub async fn wait_idle(&self) {
        loop {
            if self.active.lock().unwrap().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Test/one-shot helper: keep admitting until the queue and pool are
    /// both empty (downloads may re-queue themselves through retries that
    /// are not yet due — those are left waiting).
    pub async fn drain(self: &Arc<Self>) -> Result<()> {
        loop {
            let started = self.admit().await?;
            if started == 0 && self.active_count() == 0 {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
