//! Poll scheduling: decides when each subscription's feed is fetched and
//! runs the bounded concurrent fetch pass.
//!
//! Backoff is per subscription: the base interval on success, doubled per
//! consecutive failure up to a ceiling, reset on the next success. A 304
//! from cached validators counts as success. Fetch and format errors are
//! recorded on the subscription and delay its next attempt — they never
//! touch items and never block sibling subscriptions.

use anyhow::{Context, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::events::{EngineEvent, Events};
use crate::feed::{fetch_feed, parse_feed, FetchOutcome};
use crate::store::{Database, Subscription};

/// Outcome of polling one subscription.
#[derive(Debug)]
enum PollOutcome {
    /// Fresh document parsed and merged; carries the created-item count.
    Fetched { new_items: usize },
    /// 304 — success for backoff purposes, nothing to parse.
    NotModified,
    /// Fetch or format error, recorded on the subscription.
    SoftFailure,
}

/// Counts for one full poll pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub polled: usize,
    pub new_items: usize,
    pub failures: usize,
}

pub struct PollScheduler {
    db: Database,
    client: reqwest::Client,
    config: Arc<Config>,
    events: Events,
}

impl PollScheduler {
    pub fn new(db: Database, client: reqwest::Client, config: Arc<Config>, events: Events) -> Self {
        Self {
            db,
            client,
            config,
            events,
        }
    }

    /// Run the scheduler until cancelled, sweeping for due subscriptions
    /// every tick.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let tick = self.config.scheduler_tick();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(tick) => {
                    if let Err(e) = self.poll_due().await {
                        tracing::error!(error = %e, "Poll pass failed");
                    }
                }
            }
        }
        tracing::debug!("Poll scheduler stopped");
    }

    /// Poll every subscription that is due right now.
    ///
    /// Due subscriptions are ordered FIFO by due time; at most
    /// `max_concurrent_polls` fetches run at once and the stream admits them
    /// in order, so subscriptions beyond the limit wait their turn. Each
    /// subscription appears at most once per pass, which is what bounds it
    /// to one outstanding fetch.
    pub async fn poll_due(&self) -> Result<PollSummary> {
        let now = Utc::now().timestamp();
        let due = self
            .db
            .due_subscriptions(
                now,
                self.config.poll_interval().as_secs(),
                self.config.poll_backoff_ceiling().as_secs(),
            )
            .await?;

        if due.is_empty() {
            return Ok(PollSummary::default());
        }
        tracing::debug!(due = due.len(), "Starting poll pass");

        let outcomes: Vec<Result<PollOutcome>> = stream::iter(due.into_iter())
            .map(|sub| async move { self.poll_one(&sub).await })
            .buffer_unordered(self.config.max_concurrent_polls)
            .collect()
            .await;

        let mut summary = PollSummary::default();
        for outcome in outcomes {
            summary.polled += 1;
            match outcome? {
                PollOutcome::Fetched { new_items } => summary.new_items += new_items,
                PollOutcome::NotModified => {}
                PollOutcome::SoftFailure => summary.failures += 1,
            }
        }
        Ok(summary)
    }

    /// Manually refresh one subscription regardless of its schedule.
    /// Returns the number of newly discovered items.
    pub async fn poll_subscription(&self, subscription_id: i64) -> Result<usize> {
        let sub = self
            .db
            .get_subscription(subscription_id)
            .await?
            .with_context(|| format!("subscription {subscription_id} not found"))?;

        match self.poll_one(&sub).await? {
            PollOutcome::Fetched { new_items } => Ok(new_items),
            PollOutcome::NotModified | PollOutcome::SoftFailure => Ok(0),
        }
    }

    /// Fetch, parse, and merge one subscription's feed. Soft failures are
    /// recorded on the subscription here; only store-level errors propagate.
    async fn poll_one(&self, sub: &Subscription) -> Result<PollOutcome> {
        let fetched = match fetch_feed(&self.client, &sub.url, &sub.validators).await {
            Ok(FetchOutcome::NotModified) => {
                self.db
                    .record_poll_success(sub.id, &Default::default(), None, None)
                    .await?;
                self.events.emit(EngineEvent::PollCompleted {
                    subscription_id: sub.id,
                    new_items: 0,
                    not_modified: true,
                });
                return Ok(PollOutcome::NotModified);
            }
            Ok(FetchOutcome::Fetched { bytes, validators }) => (bytes, validators),
            Err(e) => {
                return self.record_soft_failure(sub, &e.to_string()).await;
            }
        };
        let (bytes, validators) = fetched;

        let parsed = match parse_feed(&bytes) {
            Ok(parsed) => parsed,
            Err(e) => {
                return self.record_soft_failure(sub, &e.to_string()).await;
            }
        };

        let descriptors: Vec<_> = parsed.items().collect();
        let skipped = parsed.entry_count() - descriptors.len();
        if skipped > 0 {
            tracing::warn!(
                subscription_id = sub.id,
                url = %sub.url,
                skipped = skipped,
                "Entries without usable enclosures skipped"
            );
        }

        let outcome = self.db.upsert_items(sub.id, &descriptors).await?;
        self.db
            .record_poll_success(sub.id, &validators, Some(parsed.kind()), parsed.title())
            .await?;

        for item_id in &outcome.created {
            if let Some(item) = self.db.get_item(*item_id).await? {
                self.events.emit(EngineEvent::ItemDiscovered {
                    item_id: item.id,
                    subscription_id: sub.id,
                    title: item.title,
                });
            }
        }
        self.events.emit(EngineEvent::PollCompleted {
            subscription_id: sub.id,
            new_items: outcome.created.len(),
            not_modified: false,
        });

        tracing::info!(
            subscription_id = sub.id,
            url = %sub.url,
            new_items = outcome.created.len(),
            updated = outcome.updated,
            "Poll completed"
        );

        Ok(PollOutcome::Fetched {
            new_items: outcome.created.len(),
        })
    }

    async fn record_soft_failure(&self, sub: &Subscription, error: &str) -> Result<PollOutcome> {
        let failures = self.db.record_poll_failure(sub.id, error).await?;
        tracing::warn!(
            subscription_id = sub.id,
            url = %sub.url,
            failures = failures,
            error = %error,
            "Poll failed, backing off"
        );
        self.events.emit(EngineEvent::PollFailed {
            subscription_id: sub.id,
            error: error.to_string(),
        });
        Ok(PollOutcome::SoftFailure)
    }
}
