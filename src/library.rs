//! Library directory layout, storage budget, and eviction.
//!
//! Finished downloads live at `<root>/<subscription_id>/<name>`; in-flight
//! transfers write to `<root>/.incoming/<item_id>.part` and are renamed into
//! place on completion, so playback never observes a partially-written file
//! under its final name.
//!
//! Eviction policy: watched items go before downloaded-but-unwatched ones,
//! oldest publish time first within a tier, discovery order as the
//! tie-break. Pinned items and live transfers are never evicted. When
//! eviction cannot free enough space the engine reports a soft over-budget
//! condition instead of deleting anything it shouldn't.

use anyhow::{Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};

use crate::events::{EngineEvent, Events};
use crate::store::{Database, Item, ItemEvent, ItemFilter, ItemState, Subscription};

/// Subdirectory for in-flight transfer temp files.
const INCOMING_DIR: &str = ".incoming";
/// Extension used when neither the enclosure URL nor its mime type gives us
/// a usable one.
const FALLBACK_EXTENSION: &str = "bin";

/// What startup reconciliation found and fixed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Items whose library file had disappeared, reset for re-download.
    pub requeued: usize,
    /// Items stuck in `downloading` with no live transfer, re-queued.
    pub interrupted: usize,
    /// Orphan temp files removed from `.incoming/`.
    pub purged_temps: usize,
}

pub struct Library {
    db: Database,
    root: PathBuf,
    budget_bytes: u64,
    events: Events,
}

impl Library {
    pub fn new(db: Database, root: PathBuf, budget_bytes: u64, events: Events) -> Self {
        Self {
            db,
            root,
            budget_bytes,
            events,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the library root and the `.incoming/` staging area.
    pub async fn ensure_layout(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.incoming_dir())
            .await
            .with_context(|| format!("Failed to create library at {}", self.root.display()))?;
        Ok(())
    }

    pub fn incoming_dir(&self) -> PathBuf {
        self.root.join(INCOMING_DIR)
    }

    /// Temp path for an item's in-flight transfer.
    pub fn temp_path(&self, item_id: i64) -> PathBuf {
        self.incoming_dir().join(format!("{item_id}.part"))
    }

    /// Final library path for an item's enclosure.
    pub fn final_path(&self, item: &Item) -> PathBuf {
        let name = format!(
            "{}-{}.{}",
            sanitize_stem(&item.title),
            item.id,
            enclosure_extension(item)
        );
        self.root.join(item.subscription_id.to_string()).join(name)
    }

    // ========================================================================
    // Budget Enforcement
    // ========================================================================

    /// Bring usage back under the budget by evicting candidates in policy
    /// order. `just_completed` keeps the download that triggered this pass
    /// out of its own enforcement — a finished file is never deleted in the
    /// same breath it was published.
    pub async fn enforce_budget(&self, just_completed: Option<i64>) -> Result<()> {
        if self.budget_bytes == 0 {
            return Ok(());
        }

        loop {
            let snapshot = self.db.ledger_total().await?;
            if snapshot.total_bytes as u64 <= self.budget_bytes {
                return Ok(());
            }

            let candidates = self.db.eviction_candidates(just_completed, 16).await?;
            let mut reclaimed_any = false;
            for item in &candidates {
                if self.evict(item).await?.is_some() {
                    reclaimed_any = true;
                }
                let snapshot = self.db.ledger_total().await?;
                if snapshot.total_bytes as u64 <= self.budget_bytes {
                    return Ok(());
                }
            }

            if !reclaimed_any {
                // Nothing left to reclaim (everything is pinned, in flight,
                // or the download that just finished). Report and stop.
                tracing::warn!(
                    usage = snapshot.total_bytes,
                    budget = self.budget_bytes,
                    "Over storage budget with no eviction candidates"
                );
                self.events.emit(EngineEvent::OverBudget {
                    usage_bytes: snapshot.total_bytes as u64,
                    budget_bytes: self.budget_bytes,
                });
                return Ok(());
            }
        }
    }

    /// Evict one item: transition first (the row is the authority), then
    /// delete the file. Returns the bytes reclaimed, or `None` if the item
    /// refused the transition (lost a race with another lifecycle event).
    pub async fn evict(&self, item: &Item) -> Result<Option<u64>> {
        let file_path = item.file_path.clone();
        let reclaimed = item.file_size.unwrap_or(0).max(0) as u64;

        match self.db.transition(item.id, ItemEvent::Evict).await {
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(item_id = item.id, error = %e, "Eviction transition refused");
                return Ok(None);
            }
        }

        if let Some(path) = file_path {
            remove_file_quietly(Path::new(&path)).await;
        }

        tracing::info!(item_id = item.id, reclaimed = reclaimed, "Evicted item");
        self.events.emit(EngineEvent::ItemEvicted {
            item_id: item.id,
            reclaimed_bytes: reclaimed,
        });
        self.events.emit(EngineEvent::StateChanged {
            item_id: item.id,
            state: ItemState::Evicted,
        });
        Ok(Some(reclaimed))
    }

    /// Apply one subscription's retention policy through the eviction path.
    /// Returns the number of items evicted.
    pub async fn apply_retention(&self, sub: &Subscription) -> Result<usize> {
        if sub.retention.is_unlimited() {
            return Ok(0);
        }

        let published_before = sub
            .retention
            .max_age_days
            .map(|days| Utc::now().timestamp() - (days as i64) * 86_400);
        let candidates = self
            .db
            .retention_candidates(sub.id, sub.retention.max_items, published_before)
            .await?;

        let mut evicted = 0;
        for item in candidates {
            if self.evict(&item).await?.is_some() {
                evicted += 1;
            }
        }
        if evicted > 0 {
            tracing::info!(
                subscription_id = sub.id,
                evicted = evicted,
                "Retention applied"
            );
        }
        Ok(evicted)
    }

    // ========================================================================
    // Startup Reconciliation
    // ========================================================================

    /// Reconcile the database against the filesystem after a restart.
    ///
    /// - `downloading` rows have no live transfer anymore → back to `queued`.
    /// - `downloaded`/`watched` rows whose file is gone → back to `queued`.
    /// - Everything in `.incoming/` is an orphan now → purged. Resume state
    ///   is carried by the temp file itself, so purging also resets resume.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for item_id in self.db.downloading_item_ids().await? {
            match self.db.transition(item_id, ItemEvent::Interrupt).await {
                Ok(_) => report.interrupted += 1,
                Err(e) => {
                    tracing::warn!(item_id, error = %e, "Failed to requeue stale transfer")
                }
            }
        }

        let materialized = self
            .db
            .list_items(&ItemFilter {
                states: Some(vec![ItemState::Downloaded, ItemState::Watched]),
                ..Default::default()
            })
            .await?;
        for item in materialized {
            let missing = match &item.file_path {
                Some(path) => !Path::new(path).exists(),
                None => true,
            };
            if missing {
                match self.db.transition(item.id, ItemEvent::FileMissing).await {
                    Ok(_) => {
                        tracing::warn!(
                            item_id = item.id,
                            path = item.file_path.as_deref().unwrap_or("<none>"),
                            "Library file missing, requeued for download"
                        );
                        report.requeued += 1;
                    }
                    Err(e) => {
                        tracing::warn!(item_id = item.id, error = %e, "Failed to requeue missing file")
                    }
                }
            }
        }

        let incoming = self.incoming_dir();
        if incoming.is_dir() {
            let mut entries = tokio::fs::read_dir(&incoming)
                .await
                .with_context(|| format!("Failed to scan {}", incoming.display()))?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                    remove_file_quietly(&entry.path()).await;
                    report.purged_temps += 1;
                }
            }
        }

        if report != ReconcileReport::default() {
            tracing::info!(
                requeued = report.requeued,
                interrupted = report.interrupted,
                purged_temps = report.purged_temps,
                "Startup reconciliation complete"
            );
        }
        Ok(report)
    }
}

/// Delete a file, logging instead of failing — eviction and cleanup must
/// proceed even when the filesystem disagrees about what exists.
pub async fn remove_file_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove file");
        }
    }
}

/// Reduce a title to a filesystem-safe stem.
fn sanitize_stem(title: &str) -> String {
    let mut stem: String = title
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    // Collapse runs of dashes left by punctuation
    while stem.contains("--") {
        stem = stem.replace("--", "-");
    }
    let stem = stem.trim_matches('-');
    let stem = if stem.is_empty() { "item" } else { stem };
    stem.chars().take(64).collect()
}

/// Pick a file extension from the enclosure URL path, falling back to the
/// declared mime subtype.
fn enclosure_extension(item: &Item) -> String {
    if let Ok(url) = url::Url::parse(&item.enclosure.url) {
        if let Some(ext) = Path::new(url.path()).extension().and_then(|e| e.to_str()) {
            if !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()) {
                return ext.to_ascii_lowercase();
            }
        }
    }
    if let Some(mime) = &item.enclosure.mime_type {
        if let Some(subtype) = mime.split('/').nth(1) {
            let subtype = subtype.split(';').next().unwrap_or(subtype).trim();
            if !subtype.is_empty() && subtype.chars().all(|c| c.is_ascii_alphanumeric()) {
                return subtype.to_ascii_lowercase();
            }
        }
    }
    FALLBACK_EXTENSION.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Enclosure, ItemDescriptor, Validators};
    use pretty_assertions::assert_eq;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn descriptor(key: &str, published: i64) -> ItemDescriptor {
        ItemDescriptor {
            dedup_key: key.to_string(),
            title: format!("Episode {key}"),
            published: Some(published),
            enclosures: vec![Enclosure {
                url: format!("https://cdn.example.com/{key}.mp4"),
                length: None,
                mime_type: Some("video/mp4".into()),
            }],
            validators: Validators::default(),
        }
    }

    async fn library(db: &Database, budget: u64) -> (Library, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let lib = Library::new(db.clone(), dir.path().to_path_buf(), budget, Events::new());
        lib.ensure_layout().await.unwrap();
        (lib, dir)
    }

    /// Materialize an item with a real file of `size` bytes.
    async fn materialize(db: &Database, lib: &Library, id: i64, size: usize) -> PathBuf {
        db.transition(id, ItemEvent::Admit).await.unwrap();
        db.transition(id, ItemEvent::Start).await.unwrap();
        let item = db.get_item(id).await.unwrap().unwrap();
        let path = lib.final_path(&item);
        tokio::fs::create_dir_all(path.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&path, vec![0u8; size]).await.unwrap();
        db.transition(
            id,
            ItemEvent::Complete {
                file_path: path.to_string_lossy().into_owned(),
                file_size: size as i64,
            },
        )
        .await
        .unwrap();
        path
    }

    #[test]
    fn test_sanitize_stem() {
        assert_eq!(sanitize_stem("Episode 1: The Pilot!"), "episode-1-the-pilot");
        assert_eq!(sanitize_stem("///"), "item");
        assert!(sanitize_stem(&"x".repeat(200)).len() <= 64);
    }

    #[tokio::test]
    async fn test_final_path_extension_from_url_then_mime() {
        let db = test_db().await;
        let sub = db
            .insert_subscription("https://example.com/feed", "Feed")
            .await
            .unwrap();
        let id = db
            .upsert_items(sub, &[descriptor("ep1", 1)])
            .await
            .unwrap()
            .created[0];
        let (lib, _dir) = library(&db, 0).await;

        let item = db.get_item(id).await.unwrap().unwrap();
        let path = lib.final_path(&item);
        assert!(path.to_string_lossy().ends_with(&format!("episode-ep1-{id}.mp4")));
        assert!(path.starts_with(lib.root().join(sub.to_string())));

        // URL without extension falls back to the mime subtype
        let mut item = item;
        item.enclosure.url = "https://cdn.example.com/stream".into();
        item.enclosure.mime_type = Some("video/webm".into());
        assert!(lib
            .final_path(&item)
            .to_string_lossy()
            .ends_with(".webm"));
    }

    #[tokio::test]
    async fn test_budget_evicts_oldest_until_under() {
        let db = test_db().await;
        let sub = db
            .insert_subscription("https://example.com/feed", "Feed")
            .await
            .unwrap();
        let ids = db
            .upsert_items(
                sub,
                &[descriptor("a", 100), descriptor("b", 200), descriptor("c", 300)],
            )
            .await
            .unwrap()
            .created;

        let (lib, _dir) = library(&db, 250).await;
        let path_a = materialize(&db, &lib, ids[0], 100).await;
        materialize(&db, &lib, ids[1], 100).await;
        materialize(&db, &lib, ids[2], 100).await;

        lib.enforce_budget(Some(ids[2])).await.unwrap();

        // Oldest-published unwatched item went first; one eviction suffices
        let a = db.get_item(ids[0]).await.unwrap().unwrap();
        assert_eq!(a.state, ItemState::Evicted);
        assert!(!path_a.exists());
        let snapshot = db.ledger_total().await.unwrap();
        assert_eq!(snapshot.total_bytes, 200);
    }

    #[tokio::test]
    async fn test_pinned_survives_and_over_budget_reported() {
        let db = test_db().await;
        let sub = db
            .insert_subscription("https://example.com/feed", "Feed")
            .await
            .unwrap();
        let ids = db
            .upsert_items(sub, &[descriptor("a", 100), descriptor("b", 200)])
            .await
            .unwrap()
            .created;

        let events = Events::new();
        let dir = tempfile::tempdir().unwrap();
        let lib = Library::new(db.clone(), dir.path().to_path_buf(), 50, events.clone());
        lib.ensure_layout().await.unwrap();
        let mut rx = events.subscribe();

        let path_a = materialize(&db, &lib, ids[0], 100).await;
        db.set_pinned(ids[0], true).await.unwrap();

        // The only materialized item is pinned — nothing may be reclaimed.
        lib.enforce_budget(Some(ids[1])).await.unwrap();

        let a = db.get_item(ids[0]).await.unwrap().unwrap();
        assert_eq!(a.state, ItemState::Downloaded, "pinned item never evicted");
        assert!(path_a.exists());

        let mut saw_over_budget = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, EngineEvent::OverBudget { .. }) {
                saw_over_budget = true;
            }
        }
        assert!(saw_over_budget, "soft over-budget condition reported");
    }

    #[tokio::test]
    async fn test_watched_evicted_before_unwatched() {
        let db = test_db().await;
        let sub = db
            .insert_subscription("https://example.com/feed", "Feed")
            .await
            .unwrap();
        let ids = db
            .upsert_items(sub, &[descriptor("old", 100), descriptor("new", 200)])
            .await
            .unwrap()
            .created;

        let (lib, _dir) = library(&db, 100).await;
        materialize(&db, &lib, ids[0], 100).await;
        materialize(&db, &lib, ids[1], 100).await;
        // The newer item was watched; policy prefers reclaiming it over the
        // older unwatched one.
        db.transition(ids[1], ItemEvent::MarkWatched).await.unwrap();

        lib.enforce_budget(None).await.unwrap();

        assert_eq!(
            db.get_item(ids[1]).await.unwrap().unwrap().state,
            ItemState::Evicted
        );
        assert_eq!(
            db.get_item(ids[0]).await.unwrap().unwrap().state,
            ItemState::Downloaded
        );
    }

    #[tokio::test]
    async fn test_retention_max_items() {
        let db = test_db().await;
        let sub_id = db
            .insert_subscription("https://example.com/feed", "Feed")
            .await
            .unwrap();
        db.set_retention(
            sub_id,
            crate::store::RetentionPolicy {
                max_items: Some(1),
                max_age_days: None,
            },
        )
        .await
        .unwrap();

        let ids = db
            .upsert_items(sub_id, &[descriptor("a", 100), descriptor("b", 200)])
            .await
            .unwrap()
            .created;
        let (lib, _dir) = library(&db, 0).await;
        materialize(&db, &lib, ids[0], 10).await;
        materialize(&db, &lib, ids[1], 10).await;

        let sub = db.get_subscription(sub_id).await.unwrap().unwrap();
        let evicted = lib.apply_retention(&sub).await.unwrap();
        assert_eq!(evicted, 1);

        assert_eq!(
            db.get_item(ids[0]).await.unwrap().unwrap().state,
            ItemState::Evicted,
            "older item evicted by retention"
        );
        assert_eq!(
            db.get_item(ids[1]).await.unwrap().unwrap().state,
            ItemState::Downloaded
        );
    }

    #[tokio::test]
    async fn test_reconcile_missing_file_and_orphan_temps() {
        let db = test_db().await;
        let sub = db
            .insert_subscription("https://example.com/feed", "Feed")
            .await
            .unwrap();
        let ids = db
            .upsert_items(sub, &[descriptor("a", 100), descriptor("b", 200)])
            .await
            .unwrap()
            .created;

        let (lib, _dir) = library(&db, 0).await;
        let path_a = materialize(&db, &lib, ids[0], 10).await;
        materialize(&db, &lib, ids[1], 10).await;

        // Lose a's file behind the engine's back; strand an orphan temp and
        // a stale downloading row.
        tokio::fs::remove_file(&path_a).await.unwrap();
        tokio::fs::write(lib.temp_path(999), b"partial").await.unwrap();

        let report = lib.reconcile().await.unwrap();
        assert_eq!(
            report,
            ReconcileReport {
                requeued: 1,
                interrupted: 0,
                purged_temps: 1,
            }
        );

        let a = db.get_item(ids[0]).await.unwrap().unwrap();
        assert_eq!(a.state, ItemState::Queued);
        assert!(a.file_path.is_none());
        assert!(!lib.temp_path(999).exists());

        // b untouched
        assert_eq!(
            db.get_item(ids[1]).await.unwrap().unwrap().state,
            ItemState::Downloaded
        );

        // Ledger matches the surviving on-disk state
        assert_eq!(db.ledger_total().await.unwrap().total_bytes, 10);
    }

    #[tokio::test]
    async fn test_reconcile_requeues_stale_downloading() {
        let db = test_db().await;
        let sub = db
            .insert_subscription("https://example.com/feed", "Feed")
            .await
            .unwrap();
        let id = db
            .upsert_items(sub, &[descriptor("a", 100)])
            .await
            .unwrap()
            .created[0];
        db.transition(id, ItemEvent::Admit).await.unwrap();
        db.transition(id, ItemEvent::Start).await.unwrap();

        let (lib, _dir) = library(&db, 0).await;
        let report = lib.reconcile().await.unwrap();
        assert_eq!(report.interrupted, 1);
        assert_eq!(
            db.get_item(id).await.unwrap().unwrap().state,
            ItemState::Queued
        );
    }
}
