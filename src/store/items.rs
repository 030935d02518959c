use anyhow::Result;
use chrono::Utc;
use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{
    Item, ItemDescriptor, ItemEvent, ItemFilter, ItemRow, TransitionError, UpsertOutcome,
    ITEM_COLUMNS,
};

impl Database {
    // ========================================================================
    // Item Discovery (upsert)
    // ========================================================================

    /// Merge parsed descriptors into the item table for one subscription.
    ///
    /// Items are keyed by `(subscription_id, dedup_key)`. Known items get
    /// their mutable fields refreshed (title, publish-time corrections,
    /// declared enclosure metadata, validators) — lifecycle state, file
    /// fields, and retry bookkeeping are never touched, so re-polling a feed
    /// can never duplicate an item or knock one out of its lifecycle.
    ///
    /// Returns the created row ids in feed document order plus the count of
    /// refreshed rows.
    pub async fn upsert_items(
        &self,
        subscription_id: i64,
        descriptors: &[ItemDescriptor],
    ) -> Result<UpsertOutcome> {
        let now = Utc::now().timestamp();
        let mut outcome = UpsertOutcome::default();
        if descriptors.is_empty() {
            return Ok(outcome);
        }

        let mut tx = self.pool.begin().await?;

        for descriptor in descriptors {
            let existing: Option<i64> = sqlx::query_scalar(
                "SELECT id FROM items WHERE subscription_id = ? AND dedup_key = ?",
            )
            .bind(subscription_id)
            .bind(&descriptor.dedup_key)
            .fetch_optional(&mut *tx)
            .await?;

            let primary = descriptor.primary_enclosure();
            let alternates = serde_json::to_string(&descriptor.enclosures[1..])?;

            match existing {
                Some(id) => {
                    sqlx::query(
                        r#"
                        UPDATE items
                        SET title = ?,
                            published = COALESCE(?, published),
                            enclosure_url = ?,
                            enclosure_size = COALESCE(?, enclosure_size),
                            enclosure_mime = COALESCE(?, enclosure_mime),
                            alternate_enclosures = ?,
                            etag = COALESCE(?, etag),
                            last_modified = COALESCE(?, last_modified)
                        WHERE id = ?
                    "#,
                    )
                    .bind(&descriptor.title)
                    .bind(descriptor.published)
                    .bind(&primary.url)
                    .bind(primary.length)
                    .bind(&primary.mime_type)
                    .bind(&alternates)
                    .bind(&descriptor.validators.etag)
                    .bind(&descriptor.validators.last_modified)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                    outcome.updated += 1;
                }
                None => {
                    let id: i64 = sqlx::query_scalar(
                        r#"
                        INSERT INTO items (
                            subscription_id, dedup_key, title, published,
                            enclosure_url, enclosure_size, enclosure_mime,
                            alternate_enclosures, discovered_at, etag, last_modified
                        )
                        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                        RETURNING id
                    "#,
                    )
                    .bind(subscription_id)
                    .bind(&descriptor.dedup_key)
                    .bind(&descriptor.title)
                    .bind(descriptor.published)
                    .bind(&primary.url)
                    .bind(primary.length)
                    .bind(&primary.mime_type)
                    .bind(&alternates)
                    .bind(now)
                    .bind(&descriptor.validators.etag)
                    .bind(&descriptor.validators.last_modified)
                    .fetch_one(&mut *tx)
                    .await?;
                    outcome.created.push(id);
                }
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    // ========================================================================
    // Lifecycle Transitions
    // ========================================================================

    /// Apply one state-machine event to an item.
    ///
    /// Implemented as a guarded `UPDATE ... WHERE state IN (sources)` so the
    /// check and the write are a single atomic statement: two racing events
    /// serialize through SQLite, exactly one wins the edge, and the loser
    /// gets a `TransitionError` instead of silently double-transitioning.
    /// The event's payload fields are written in the same statement.
    pub async fn transition(
        &self,
        item_id: i64,
        event: ItemEvent,
    ) -> Result<Item, TransitionError> {
        let now = Utc::now().timestamp();
        // Source states come from the event table, never from input — safe to
        // inline as literals.
        let sources = event
            .sources()
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");

        let affected = match &event {
            ItemEvent::Admit => {
                sqlx::query(&format!(
                    "UPDATE items
                     SET state = 'queued', queued_at = ?, retry_at = NULL
                     WHERE id = ? AND state IN ({sources})"
                ))
                .bind(now)
                .bind(item_id)
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
            ItemEvent::Start => {
                sqlx::query(&format!(
                    "UPDATE items
                     SET state = 'downloading'
                     WHERE id = ? AND state IN ({sources})"
                ))
                .bind(item_id)
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
            ItemEvent::Complete {
                file_path,
                file_size,
            } => {
                sqlx::query(&format!(
                    "UPDATE items
                     SET state = 'downloaded', downloaded_at = ?, file_path = ?,
                         file_size = ?, bytes_downloaded = ?, retry_at = NULL,
                         last_failure = NULL
                     WHERE id = ? AND state IN ({sources})"
                ))
                .bind(now)
                .bind(file_path)
                .bind(file_size)
                .bind(file_size)
                .bind(item_id)
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
            ItemEvent::RetryableFailure { error, retry_at } => {
                sqlx::query(&format!(
                    "UPDATE items
                     SET state = 'queued', attempts = attempts + 1,
                         retry_at = ?, last_failure = ?
                     WHERE id = ? AND state IN ({sources})"
                ))
                .bind(retry_at)
                .bind(error)
                .bind(item_id)
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
            ItemEvent::Interrupt => {
                sqlx::query(&format!(
                    "UPDATE items
                     SET state = 'queued', retry_at = NULL
                     WHERE id = ? AND state IN ({sources})"
                ))
                .bind(item_id)
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
            ItemEvent::Fail { error } => {
                sqlx::query(&format!(
                    "UPDATE items
                     SET state = 'failed', attempts = attempts + 1,
                         retry_at = NULL, last_failure = ?
                     WHERE id = ? AND state IN ({sources})"
                ))
                .bind(error)
                .bind(item_id)
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
            ItemEvent::MarkWatched => {
                sqlx::query(&format!(
                    "UPDATE items
                     SET state = 'watched', watched_at = ?
                     WHERE id = ? AND state IN ({sources})"
                ))
                .bind(now)
                .bind(item_id)
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
            ItemEvent::Evict => {
                sqlx::query(&format!(
                    "UPDATE items
                     SET state = 'evicted', file_path = NULL, file_size = NULL,
                         bytes_downloaded = 0, retry_at = NULL
                     WHERE id = ? AND state IN ({sources})"
                ))
                .bind(item_id)
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
            ItemEvent::Retry => {
                sqlx::query(&format!(
                    "UPDATE items
                     SET state = 'queued', queued_at = ?, attempts = 0,
                         retry_at = NULL, last_failure = NULL
                     WHERE id = ? AND state IN ({sources})"
                ))
                .bind(now)
                .bind(item_id)
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
            ItemEvent::FileMissing => {
                sqlx::query(&format!(
                    "UPDATE items
                     SET state = 'queued', queued_at = ?, file_path = NULL,
                         file_size = NULL, bytes_downloaded = 0, retry_at = NULL
                     WHERE id = ? AND state IN ({sources})"
                ))
                .bind(now)
                .bind(item_id)
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
        };

        if affected == 0 {
            // Distinguish a missing row from an invalid edge for diagnosis.
            let state: Option<String> =
                sqlx::query_scalar("SELECT state FROM items WHERE id = ?")
                    .bind(item_id)
                    .fetch_optional(&self.pool)
                    .await?;
            return match state {
                None => Err(TransitionError::NotFound { item_id }),
                Some(s) => Err(TransitionError::InvalidEdge {
                    item_id,
                    state: s.parse().map_err(|_| TransitionError::NotFound { item_id })?,
                    event: event.name(),
                }),
            };
        }

        let row: ItemRow = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE id = ?"
        ))
        .bind(item_id)
        .fetch_one(&self.pool)
        .await?;

        row.into_item()
            .map_err(|_| TransitionError::NotFound { item_id })
    }

    // ========================================================================
    // Item Queries
    // ========================================================================

    pub async fn get_item(&self, item_id: i64) -> Result<Option<Item>> {
        let row: Option<ItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE id = ?"
        ))
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ItemRow::into_item).transpose()
    }

    /// List items newest-published first, optionally filtered by subscription
    /// and/or states.
    pub async fn list_items(&self, filter: &ItemFilter) -> Result<Vec<Item>> {
        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new(format!("SELECT {ITEM_COLUMNS} FROM items WHERE 1=1"));

        if let Some(subscription_id) = filter.subscription_id {
            builder.push(" AND subscription_id = ");
            builder.push_bind(subscription_id);
        }
        if let Some(states) = &filter.states {
            if states.is_empty() {
                return Ok(Vec::new());
            }
            builder.push(" AND state IN (");
            let mut separated = builder.separated(", ");
            for state in states {
                separated.push_bind(state.as_str());
            }
            separated.push_unseparated(")");
        }
        builder.push(" ORDER BY published DESC, discovered_at DESC, id DESC");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ");
            builder.push_bind(limit);
        }

        let rows: Vec<ItemRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(ItemRow::into_item).collect()
    }

    /// Newly discovered items awaiting admission, in discovery order.
    pub async fn discovered_item_ids(&self, limit: i64) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT id FROM items WHERE state = 'discovered' ORDER BY id LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Queued items whose backoff deadline (if any) has passed, FIFO by
    /// queued-since time with id as the deterministic tie-break.
    pub async fn queued_ready(&self, now: i64, limit: i64) -> Result<Vec<Item>> {
        let rows: Vec<ItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM items
             WHERE state = 'queued' AND (retry_at IS NULL OR retry_at <= ?)
             ORDER BY queued_at, id
             LIMIT ?"
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ItemRow::into_item).collect()
    }

    /// Items stuck in `downloading` (no live transfer can exist for them at
    /// startup).
    pub async fn downloading_item_ids(&self) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT id FROM items WHERE state = 'downloading' ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Record transfer progress for resume and UI display. Deliberately not a
    /// lifecycle transition — progress is advisory.
    pub async fn update_transfer_progress(&self, item_id: i64, bytes: i64) -> Result<()> {
        sqlx::query("UPDATE items SET bytes_downloaded = ? WHERE id = ?")
            .bind(bytes)
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Toggle the user "keep" flag. Returns false if the item is gone.
    pub async fn set_pinned(&self, item_id: i64, pinned: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE items SET pinned = ? WHERE id = ?")
            .bind(pinned)
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
