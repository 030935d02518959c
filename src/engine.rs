//! The engine facade: the single API surface the UI, playback, directory,
//! and sharing collaborators talk to.
//!
//! Composes the store, poll scheduler, download scheduler, and library, and
//! publishes every observable change on the [`Events`] stream. Holds no
//! global state — multiple engines over separate databases and library
//! directories coexist freely (the test suites do exactly that).

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::Config;
use crate::download::DownloadScheduler;
use crate::events::{EngineEvent, Events};
use crate::library::{Library, ReconcileReport};
use crate::poll::{PollScheduler, PollSummary};
use crate::store::{
    Database, Item, ItemEvent, ItemFilter, ItemState, LedgerSnapshot, RetentionPolicy,
    Subscription, SubscriptionUsage, TransitionError,
};

pub struct Engine {
    config: Arc<Config>,
    db: Database,
    events: Events,
    library: Arc<Library>,
    poll: Arc<PollScheduler>,
    downloads: Arc<DownloadScheduler>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Build an engine over an open database and a library directory.
    ///
    /// The caller owns path resolution (the CLI resolves them from config;
    /// tests point at `:memory:` and a temp dir).
    pub async fn new(config: Config, db: Database, library_root: PathBuf) -> Result<Arc<Self>> {
        let config = Arc::new(config.sanitized());
        let events = Events::new();

        let client = reqwest::Client::builder()
            .user_agent(concat!("telecast/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(15))
            .build()
            .context("Failed to build HTTP client")?;

        let library = Arc::new(Library::new(
            db.clone(),
            library_root,
            config.storage_budget_bytes,
            events.clone(),
        ));
        library.ensure_layout().await?;

        let poll = Arc::new(PollScheduler::new(
            db.clone(),
            client.clone(),
            Arc::clone(&config),
            events.clone(),
        ));
        let downloads = Arc::new(DownloadScheduler::new(
            db.clone(),
            client,
            Arc::clone(&config),
            events.clone(),
            Arc::clone(&library),
        ));

        Ok(Arc::new(Self {
            config,
            db,
            events,
            library,
            poll,
            downloads,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Subscribe to the change-notification stream.
    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Reconcile persisted state with the filesystem, then start the poll
    /// and download loops. Idempotent start is not supported; call once.
    pub async fn start(self: &Arc<Self>) -> Result<ReconcileReport> {
        let report = self.library.reconcile().await?;

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(tokio::spawn(
            Arc::clone(&self.poll).run(self.shutdown.clone()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&self.downloads).run(self.shutdown.clone()),
        ));
        tracing::info!("Engine started");
        Ok(report)
    }

    /// Stop the schedulers and tear down all live transfers.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!("Engine stopped");
    }

    // ========================================================================
    // Subscription Management
    // ========================================================================

    /// Track a new feed source. The first poll happens on the next scheduler
    /// tick (or via [`Engine::poll_subscription`] for an immediate fetch).
    pub async fn subscribe(&self, url: &str) -> Result<Subscription> {
        let parsed = Url::parse(url).with_context(|| format!("Invalid feed URL: {url}"))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            bail!("Unsupported feed URL scheme '{}'", parsed.scheme());
        }

        let id = self.db.insert_subscription(url, "").await?;
        self.events.emit(EngineEvent::SubscriptionAdded {
            subscription_id: id,
            url: url.to_string(),
        });
        tracing::info!(subscription_id = id, url = %url, "Subscribed");

        self.db
            .get_subscription(id)
            .await?
            .context("subscription vanished after insert")
    }

    /// Remove a subscription: cancel its in-flight transfers, delete its
    /// item rows, and delete its files — except files the user pinned,
    /// which stay on disk (they just leave the registry and the ledger).
    pub async fn unsubscribe(&self, subscription_id: i64) -> Result<()> {
        let cancelled = self.downloads.cancel_subscription(subscription_id).await;
        if cancelled > 0 {
            tracing::debug!(
                subscription_id,
                cancelled,
                "Cancelled in-flight transfers for unsubscribe"
            );
        }

        let materialized = self
            .db
            .list_items(&ItemFilter {
                subscription_id: Some(subscription_id),
                states: Some(vec![ItemState::Downloaded, ItemState::Watched]),
                ..Default::default()
            })
            .await?;

        let removed_items = self.db.delete_subscription(subscription_id).await?;

        for item in materialized {
            if item.pinned {
                continue;
            }
            if let Some(path) = &item.file_path {
                crate::library::remove_file_quietly(std::path::Path::new(path)).await;
            }
        }

        self.events.emit(EngineEvent::SubscriptionRemoved { subscription_id });
        tracing::info!(subscription_id, removed_items, "Unsubscribed");
        Ok(())
    }

    pub async fn subscriptions(&self) -> Result<Vec<Subscription>> {
        self.db.list_subscriptions().await
    }

    pub async fn set_retention(
        &self,
        subscription_id: i64,
        policy: RetentionPolicy,
    ) -> Result<bool> {
        if !self.db.set_retention(subscription_id, policy).await? {
            return Ok(false);
        }
        // Apply the tightened policy right away instead of waiting for the
        // next poll of this subscription.
        if let Some(sub) = self.db.get_subscription(subscription_id).await? {
            self.library.apply_retention(&sub).await?;
        }
        Ok(true)
    }

    // ========================================================================
    // Item Operations
    // ========================================================================

    pub async fn list_items(&self, filter: &ItemFilter) -> Result<Vec<Item>> {
        self.db.list_items(filter).await
    }

    pub async fn get_item(&self, item_id: i64) -> Result<Option<Item>> {
        self.db.get_item(item_id).await
    }

    /// Playback signal from the UI collaborator.
    pub async fn mark_watched(&self, item_id: i64) -> Result<Item, TransitionError> {
        let item = self.db.transition(item_id, ItemEvent::MarkWatched).await?;
        self.events.emit(EngineEvent::StateChanged {
            item_id,
            state: ItemState::Watched,
        });
        Ok(item)
    }

    /// User delete: cancels a live transfer if there is one, then evicts the
    /// item (file removed, metadata retained so the feed won't re-create
    /// it). Overrides pinning — an explicit delete is the user speaking.
    /// Returns false if the item doesn't exist or was already evicted.
    pub async fn delete_item(&self, item_id: i64) -> Result<bool> {
        self.downloads.cancel_item(item_id).await;

        let Some(item) = self.db.get_item(item_id).await? else {
            return Ok(false);
        };
        if item.state == ItemState::Evicted {
            return Ok(false);
        }
        Ok(self.library.evict(&item).await?.is_some())
    }

    /// User retry of a failed item: back into the queue with a fresh
    /// attempt budget.
    pub async fn retry_item(&self, item_id: i64) -> Result<Item, TransitionError> {
        let item = self.db.transition(item_id, ItemEvent::Retry).await?;
        self.events.emit(EngineEvent::StateChanged {
            item_id,
            state: ItemState::Queued,
        });
        Ok(item)
    }

    /// Pin ("keep") an item: exempt from eviction and retention.
    pub async fn pin_item(&self, item_id: i64, pinned: bool) -> Result<bool> {
        self.db.set_pinned(item_id, pinned).await
    }

    // ========================================================================
    // Scheduling Hooks
    // ========================================================================

    /// Poll every due subscription immediately.
    pub async fn poll_now(&self) -> Result<PollSummary> {
        self.poll.poll_due().await
    }

    /// Manually refresh one subscription regardless of its schedule.
    pub async fn poll_subscription(&self, subscription_id: i64) -> Result<usize> {
        self.poll.poll_subscription(subscription_id).await
    }

    /// One synchronous engine cycle: poll everything due, then drain the
    /// download queue. Used by the CLI's one-shot mode and by tests that
    /// want determinism instead of ticks.
    pub async fn run_once(self: &Arc<Self>) -> Result<PollSummary> {
        let summary = self.poll.poll_due().await?;
        self.downloads.drain().await?;
        Ok(summary)
    }

    pub fn active_downloads(&self) -> usize {
        self.downloads.active_count()
    }

    // ========================================================================
    // Ledger
    // ========================================================================

    pub async fn ledger(&self) -> Result<LedgerSnapshot> {
        self.db.ledger_total().await
    }

    pub async fn ledger_by_subscription(&self) -> Result<Vec<SubscriptionUsage>> {
        self.db.ledger_by_subscription().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn engine() -> (Arc<Engine>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(":memory:").await.unwrap();
        let engine = Engine::new(Config::default(), db, dir.path().join("library"))
            .await
            .unwrap();
        (engine, dir)
    }

    #[tokio::test]
    async fn test_subscribe_rejects_non_http_urls() {
        let (engine, _dir) = engine().await;
        assert!(engine.subscribe("file:///etc/passwd").await.is_err());
        assert!(engine.subscribe("not a url").await.is_err());
        assert!(engine
            .subscribe("https://example.com/feed.xml")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_subscribe_emits_event() {
        let (engine, _dir) = engine().await;
        let mut rx = engine.events();

        let sub = engine.subscribe("https://example.com/feed.xml").await.unwrap();
        match rx.recv().await.unwrap() {
            EngineEvent::SubscriptionAdded {
                subscription_id,
                url,
            } => {
                assert_eq!(subscription_id, sub.id);
                assert_eq!(url, "https://example.com/feed.xml");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_mark_watched_requires_downloaded() {
        let (engine, _dir) = engine().await;
        let err = engine.mark_watched(42).await.unwrap_err();
        assert!(matches!(err, TransitionError::NotFound { item_id: 42 }));
    }

    #[tokio::test]
    async fn test_start_then_shutdown() {
        let (engine, _dir) = engine().await;
        engine.start().await.unwrap();
        engine.shutdown().await;
        assert_eq!(engine.active_downloads(), 0);
    }
}
