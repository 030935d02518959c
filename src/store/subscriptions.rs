use anyhow::Result;
use chrono::Utc;

use super::schema::Database;
use super::types::{RetentionPolicy, Subscription, SubscriptionRow, Validators};

impl Database {
    // ========================================================================
    // Subscription Registry
    // ========================================================================

    /// Insert a subscription, or refresh its title if the URL is already
    /// tracked. Returns the subscription id either way.
    pub async fn insert_subscription(&self, url: &str, title: &str) -> Result<i64> {
        let now = Utc::now().timestamp();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO subscriptions (url, title, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET title = excluded.title
            RETURNING id
        "#,
        )
        .bind(url)
        .bind(title)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Delete a subscription. Item rows cascade. Returns the number of item
    /// rows that went with it.
    pub async fn delete_subscription(&self, subscription_id: i64) -> Result<u64> {
        let items: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM items WHERE subscription_id = ?")
                .bind(subscription_id)
                .fetch_one(&self.pool)
                .await?;

        let result = sqlx::query("DELETE FROM subscriptions WHERE id = ?")
            .bind(subscription_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Ok(0);
        }
        Ok(items as u64)
    }

    pub async fn get_subscription(&self, subscription_id: i64) -> Result<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT id, url, title, kind, poll_interval_secs, last_polled,
                   consecutive_failures, last_error, etag, last_modified,
                   retention_max_items, retention_max_age_days, created_at
            FROM subscriptions
            WHERE id = ?
        "#,
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(SubscriptionRow::into_subscription))
    }

    pub async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT id, url, title, kind, poll_interval_secs, last_polled,
                   consecutive_failures, last_error, etag, last_modified,
                   retention_max_items, retention_max_age_days, created_at
            FROM subscriptions
            ORDER BY created_at, id
        "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(SubscriptionRow::into_subscription)
            .collect())
    }

    /// Subscriptions eligible to poll at `now`, FIFO by their due time.
    ///
    /// Due time is computed in Rust (`Subscription::next_poll_at`) — the
    /// doubling arithmetic is clearer there than in SQL, and the registry is
    /// small enough that a full scan per pass is cheap.
    pub async fn due_subscriptions(
        &self,
        now: i64,
        default_interval_secs: u64,
        ceiling_secs: u64,
    ) -> Result<Vec<Subscription>> {
        let mut due: Vec<(i64, Subscription)> = self
            .list_subscriptions()
            .await?
            .into_iter()
            .filter_map(|s| {
                let at = s.next_poll_at(default_interval_secs, ceiling_secs);
                (at <= now).then_some((at, s))
            })
            .collect();

        due.sort_by_key(|(at, s)| (*at, s.id));
        Ok(due.into_iter().map(|(_, s)| s).collect())
    }

    /// Record a successful poll: clears error state, resets the backoff
    /// counter, stores fresh validators and the detected dialect, and adopts
    /// the feed's title if we don't have one yet.
    pub async fn record_poll_success(
        &self,
        subscription_id: i64,
        validators: &Validators,
        kind: Option<&str>,
        feed_title: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET last_polled = ?,
                consecutive_failures = 0,
                last_error = NULL,
                etag = COALESCE(?, etag),
                last_modified = COALESCE(?, last_modified),
                kind = COALESCE(?, kind),
                title = CASE WHEN title = '' THEN COALESCE(?, title) ELSE title END
            WHERE id = ?
        "#,
        )
        .bind(now)
        .bind(&validators.etag)
        .bind(&validators.last_modified)
        .bind(kind)
        .bind(feed_title)
        .bind(subscription_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failed poll: stores the error, stamps the attempt time (the
    /// backoff window starts from the failure, not the last success), and
    /// bumps the failure counter. Returns the new counter value.
    pub async fn record_poll_failure(&self, subscription_id: i64, error: &str) -> Result<i64> {
        let now = Utc::now().timestamp();
        let failures: i64 = sqlx::query_scalar(
            r#"
            UPDATE subscriptions
            SET last_polled = ?,
                consecutive_failures = consecutive_failures + 1,
                last_error = ?
            WHERE id = ?
            RETURNING consecutive_failures
        "#,
        )
        .bind(now)
        .bind(error)
        .bind(subscription_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(failures)
    }

    /// Update the retention policy. Returns false if the subscription is gone.
    pub async fn set_retention(
        &self,
        subscription_id: i64,
        policy: RetentionPolicy,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET retention_max_items = ?, retention_max_age_days = ?
            WHERE id = ?
        "#,
        )
        .bind(policy.max_items.map(|v| v as i64))
        .bind(policy.max_age_days.map(|v| v as i64))
        .bind(subscription_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Override the base poll interval for one subscription (0 = engine
    /// default).
    pub async fn set_poll_interval(
        &self,
        subscription_id: i64,
        interval_secs: i64,
    ) -> Result<bool> {
        let result =
            sqlx::query("UPDATE subscriptions SET poll_interval_secs = ? WHERE id = ?")
                .bind(interval_secs.max(0))
                .bind(subscription_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_insert_is_idempotent_by_url() {
        let db = test_db().await;

        let a = db
            .insert_subscription("https://example.com/feed.xml", "Old")
            .await
            .unwrap();
        let b = db
            .insert_subscription("https://example.com/feed.xml", "New")
            .await
            .unwrap();
        assert_eq!(a, b);

        let subs = db.list_subscriptions().await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].title, "New");
    }

    #[tokio::test]
    async fn test_poll_bookkeeping_round_trip() {
        let db = test_db().await;
        let id = db
            .insert_subscription("https://example.com/feed.xml", "Feed")
            .await
            .unwrap();

        let failures = db.record_poll_failure(id, "connection refused").await.unwrap();
        assert_eq!(failures, 1);
        let failures = db.record_poll_failure(id, "connection refused").await.unwrap();
        assert_eq!(failures, 2);

        let sub = db.get_subscription(id).await.unwrap().unwrap();
        assert_eq!(sub.consecutive_failures, 2);
        assert_eq!(sub.last_error.as_deref(), Some("connection refused"));
        assert!(sub.last_polled.is_some());

        let validators = Validators {
            etag: Some("\"abc\"".into()),
            last_modified: None,
        };
        db.record_poll_success(id, &validators, Some("rss"), Some("Example Show"))
            .await
            .unwrap();

        let sub = db.get_subscription(id).await.unwrap().unwrap();
        assert_eq!(sub.consecutive_failures, 0);
        assert!(sub.last_error.is_none());
        assert_eq!(sub.validators.etag.as_deref(), Some("\"abc\""));
        assert_eq!(sub.kind, "rss");
    }

    #[tokio::test]
    async fn test_success_does_not_clobber_existing_title() {
        let db = test_db().await;
        let id = db
            .insert_subscription("https://example.com/feed.xml", "User's Name")
            .await
            .unwrap();

        db.record_poll_success(id, &Validators::default(), Some("atom"), Some("Feed Title"))
            .await
            .unwrap();

        let sub = db.get_subscription(id).await.unwrap().unwrap();
        assert_eq!(sub.title, "User's Name");
    }

    #[tokio::test]
    async fn test_due_subscriptions_fifo_by_due_time() {
        let db = test_db().await;
        let a = db.insert_subscription("https://a.example/feed", "A").await.unwrap();
        let b = db.insert_subscription("https://b.example/feed", "B").await.unwrap();
        let c = db.insert_subscription("https://c.example/feed", "C").await.unwrap();

        // a polled long ago, b recently, c never
        sqlx::query("UPDATE subscriptions SET last_polled = 1000 WHERE id = ?")
            .bind(a)
            .execute(&db.pool)
            .await
            .unwrap();
        let now = Utc::now().timestamp();
        sqlx::query("UPDATE subscriptions SET last_polled = ? WHERE id = ?")
            .bind(now)
            .bind(b)
            .execute(&db.pool)
            .await
            .unwrap();

        let due = db.due_subscriptions(now, 3600, 86_400).await.unwrap();
        let ids: Vec<i64> = due.iter().map(|s| s.id).collect();
        // c (never polled, due at 0) before a (due at 1000+3600); b not due
        assert_eq!(ids, vec![c, a]);
    }

    #[tokio::test]
    async fn test_set_retention() {
        let db = test_db().await;
        let id = db
            .insert_subscription("https://example.com/feed.xml", "Feed")
            .await
            .unwrap();

        let policy = RetentionPolicy {
            max_items: Some(10),
            max_age_days: Some(30),
        };
        assert!(db.set_retention(id, policy).await.unwrap());

        let sub = db.get_subscription(id).await.unwrap().unwrap();
        assert_eq!(sub.retention, policy);

        assert!(!db.set_retention(9999, policy).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_reports_cascaded_items() {
        let db = test_db().await;
        let id = db
            .insert_subscription("https://example.com/feed.xml", "Feed")
            .await
            .unwrap();
        assert_eq!(db.delete_subscription(id).await.unwrap(), 0);
        assert_eq!(db.delete_subscription(id).await.unwrap(), 0);
        assert!(db.get_subscription(id).await.unwrap().is_none());
    }
}
