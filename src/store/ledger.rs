use anyhow::Result;
use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{Item, ItemRow, ITEM_COLUMNS};

/// Aggregate of bytes occupied by materialized items.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub total_bytes: i64,
    pub item_count: i64,
}

/// Per-subscription ledger partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionUsage {
    pub subscription_id: i64,
    pub total_bytes: i64,
    pub item_count: i64,
}

impl Database {
    // ========================================================================
    // Storage Ledger
    // ========================================================================

    /// Total bytes held by items in `downloaded`/`watched` states.
    ///
    /// `file_size` is written only by the `complete` transition and cleared
    /// by `evict`, so this sum is the on-disk footprint by construction.
    pub async fn ledger_total(&self) -> Result<LedgerSnapshot> {
        let row: (Option<i64>, i64) = sqlx::query_as(
            r#"
            SELECT SUM(file_size), COUNT(*)
            FROM items
            WHERE state IN ('downloaded', 'watched')
        "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(LedgerSnapshot {
            total_bytes: row.0.unwrap_or(0),
            item_count: row.1,
        })
    }

    /// Ledger partitioned by subscription, largest consumers first.
    pub async fn ledger_by_subscription(&self) -> Result<Vec<SubscriptionUsage>> {
        let rows: Vec<(i64, Option<i64>, i64)> = sqlx::query_as(
            r#"
            SELECT subscription_id, SUM(file_size), COUNT(*)
            FROM items
            WHERE state IN ('downloaded', 'watched')
            GROUP BY subscription_id
            ORDER BY SUM(file_size) DESC
        "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(subscription_id, total, count)| SubscriptionUsage {
                subscription_id,
                total_bytes: total.unwrap_or(0),
                item_count: count,
            })
            .collect())
    }

    /// Eviction candidates in policy order: watched before
    /// downloaded-but-unwatched, oldest publish time first within a tier,
    /// item id (discovery order) as the deterministic tie-break.
    ///
    /// Pinned items never appear. Items with live transfers can't appear
    /// either — only `downloaded`/`watched` rows hold files. `exclude` keeps
    /// a just-finished download out of its own budget pass.
    pub async fn eviction_candidates(
        &self,
        exclude: Option<i64>,
        limit: i64,
    ) -> Result<Vec<Item>> {
        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(format!(
            "SELECT {ITEM_COLUMNS} FROM items
             WHERE state IN ('downloaded', 'watched') AND pinned = 0"
        ));
        if let Some(exclude) = exclude {
            builder.push(" AND id != ");
            builder.push_bind(exclude);
        }
        builder.push(
            " ORDER BY CASE state WHEN 'watched' THEN 0 ELSE 1 END,
                   COALESCE(published, discovered_at), id
              LIMIT ",
        );
        builder.push_bind(limit);

        let rows: Vec<ItemRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(ItemRow::into_item).collect()
    }

    /// Materialized, unpinned items of one subscription that fall outside its
    /// retention window: beyond the newest `max_items` by publish time,
    /// and/or published before `published_before`. Ordered oldest-first.
    pub async fn retention_candidates(
        &self,
        subscription_id: i64,
        max_items: Option<u32>,
        published_before: Option<i64>,
    ) -> Result<Vec<Item>> {
        let mut out = Vec::new();

        if let Some(max_items) = max_items {
            // Everything past the newest max_items
            let rows: Vec<ItemRow> = sqlx::query_as(&format!(
                "SELECT {ITEM_COLUMNS} FROM items
                 WHERE subscription_id = ? AND state IN ('downloaded', 'watched')
                       AND pinned = 0
                 ORDER BY COALESCE(published, discovered_at) DESC, id DESC
                 LIMIT -1 OFFSET ?"
            ))
            .bind(subscription_id)
            .bind(max_items as i64)
            .fetch_all(&self.pool)
            .await?;
            out.extend(rows);
        }

        if let Some(cutoff) = published_before {
            let rows: Vec<ItemRow> = sqlx::query_as(&format!(
                "SELECT {ITEM_COLUMNS} FROM items
                 WHERE subscription_id = ? AND state IN ('downloaded', 'watched')
                       AND pinned = 0 AND COALESCE(published, discovered_at) < ?
                 ORDER BY COALESCE(published, discovered_at), id"
            ))
            .bind(subscription_id)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
            out.extend(rows);
        }

        let mut items: Vec<Item> = out
            .into_iter()
            .map(ItemRow::into_item)
            .collect::<Result<Vec<_>>>()?;

        // The two queries can overlap; evict each item once, oldest first.
        items.sort_by_key(|i| (i.published.unwrap_or(i.discovered_at), i.id));
        items.dedup_by_key(|i| i.id);
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::{Enclosure, ItemDescriptor, ItemEvent, Validators};
    use pretty_assertions::assert_eq;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn descriptor(key: &str, published: i64) -> ItemDescriptor {
        ItemDescriptor {
            dedup_key: key.to_string(),
            title: key.to_string(),
            published: Some(published),
            enclosures: vec![Enclosure {
                url: format!("https://cdn.example.com/{key}.mp4"),
                length: None,
                mime_type: Some("video/mp4".into()),
            }],
            validators: Validators::default(),
        }
    }

    /// Drive an item straight to `downloaded` with the given size.
    async fn materialize(db: &Database, id: i64, size: i64) {
        db.transition(id, ItemEvent::Admit).await.unwrap();
        db.transition(id, ItemEvent::Start).await.unwrap();
        db.transition(
            id,
            ItemEvent::Complete {
                file_path: format!("/library/{id}.mp4"),
                file_size: size,
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_ledger_tracks_materialized_bytes() {
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

        assert_eq!(db.ledger_total().await.unwrap(), LedgerSnapshot::default());

        materialize(&db, ids[0], 1000).await;
        materialize(&db, ids[1], 500).await;

        let snapshot = db.ledger_total().await.unwrap();
        assert_eq!(snapshot.total_bytes, 1500);
        assert_eq!(snapshot.item_count, 2);

        // Watching keeps the file in the ledger
        db.transition(ids[0], ItemEvent::MarkWatched).await.unwrap();
        assert_eq!(db.ledger_total().await.unwrap().total_bytes, 1500);

        // Eviction removes it
        db.transition(ids[0], ItemEvent::Evict).await.unwrap();
        let snapshot = db.ledger_total().await.unwrap();
        assert_eq!(snapshot.total_bytes, 500);
        assert_eq!(snapshot.item_count, 1);
    }

    #[tokio::test]
    async fn test_ledger_partitioned_by_subscription() {
        let db = test_db().await;
        let sub_a = db.insert_subscription("https://a.example/feed", "A").await.unwrap();
        let sub_b = db.insert_subscription("https://b.example/feed", "B").await.unwrap();

        let a = db.upsert_items(sub_a, &[descriptor("a", 1)]).await.unwrap().created[0];
        let b = db.upsert_items(sub_b, &[descriptor("b", 2)]).await.unwrap().created[0];
        materialize(&db, a, 300).await;
        materialize(&db, b, 700).await;

        let usage = db.ledger_by_subscription().await.unwrap();
        assert_eq!(usage.len(), 2);
        assert_eq!(usage[0].subscription_id, sub_b);
        assert_eq!(usage[0].total_bytes, 700);
        assert_eq!(usage[1].total_bytes, 300);
    }

    #[tokio::test]
    async fn test_eviction_order_watched_then_oldest() {
        let db = test_db().await;
        let sub = db
            .insert_subscription("https://example.com/feed", "Feed")
            .await
            .unwrap();
        let ids = db
            .upsert_items(
                sub,
                &[
                    descriptor("old-unwatched", 100),
                    descriptor("new-watched", 300),
                    descriptor("old-watched", 200),
                ],
            )
            .await
            .unwrap()
            .created;

        for id in &ids {
            materialize(&db, *id, 10).await;
        }
        db.transition(ids[1], ItemEvent::MarkWatched).await.unwrap();
        db.transition(ids[2], ItemEvent::MarkWatched).await.unwrap();

        let candidates = db.eviction_candidates(None, 10).await.unwrap();
        let order: Vec<i64> = candidates.iter().map(|i| i.id).collect();
        // watched tier first (oldest published of the watched pair first),
        // then the unwatched one
        assert_eq!(order, vec![ids[2], ids[1], ids[0]]);
    }

    #[tokio::test]
    async fn test_eviction_skips_pinned_and_excluded() {
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
        materialize(&db, ids[0], 10).await;
        materialize(&db, ids[1], 10).await;

        db.set_pinned(ids[0], true).await.unwrap();
        let candidates = db.eviction_candidates(None, 10).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, ids[1]);

        let candidates = db.eviction_candidates(Some(ids[1]), 10).await.unwrap();
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn test_retention_candidates_max_items_and_age() {
        let db = test_db().await;
        let sub = db
            .insert_subscription("https://example.com/feed", "Feed")
            .await
            .unwrap();
        let ids = db
            .upsert_items(
                sub,
                &[
                    descriptor("d1", 1000),
                    descriptor("d2", 2000),
                    descriptor("d3", 3000),
                ],
            )
            .await
            .unwrap()
            .created;
        for id in &ids {
            materialize(&db, *id, 10).await;
        }

        // Keep the newest 1 → the two oldest fall out, oldest first
        let out = db.retention_candidates(sub, Some(1), None).await.unwrap();
        let out_ids: Vec<i64> = out.iter().map(|i| i.id).collect();
        assert_eq!(out_ids, vec![ids[0], ids[1]]);

        // Age cutoff overlapping with max_items must not double-report
        let out = db
            .retention_candidates(sub, Some(1), Some(2500))
            .await
            .unwrap();
        let out_ids: Vec<i64> = out.iter().map(|i| i.id).collect();
        assert_eq!(out_ids, vec![ids[0], ids[1]]);

        // Pinned exempt
        db.set_pinned(ids[0], true).await.unwrap();
        let out = db.retention_candidates(sub, Some(1), None).await.unwrap();
        let out_ids: Vec<i64> = out.iter().map(|i| i.id).collect();
        assert_eq!(out_ids, vec![ids[1]]);

        // Unlimited policy yields nothing
        let out = db.retention_candidates(sub, None, None).await.unwrap();
        assert!(out.is_empty());
    }
}
