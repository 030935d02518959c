use anyhow::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::StoreError;

// ============================================================================
// Database
// ============================================================================

/// Cloneable handle over the engine's SQLite pool. Query methods live in the
/// sibling modules (`subscriptions`, `items`, `ledger`) as `impl Database`
/// blocks.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection and run migrations
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InstanceLocked` if another instance of telecast
    /// has the database locked (SQLITE_BUSY, SQLITE_LOCKED, SQLITE_CANTOPEN).
    /// Returns `StoreError::Other` for other database errors.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // Restrict the database file to the owning user before the pool
        // touches it; subscriptions and watch history are private.
        #[cfg(unix)]
        if path != ":memory:" {
            use std::os::unix::fs::PermissionsExt;
            let db_path = std::path::Path::new(path);
            if db_path.exists() {
                let perms = std::fs::Permissions::from_mode(0o600);
                if let Err(e) = std::fs::set_permissions(path, perms) {
                    tracing::warn!(path = %path, error = %e, "Failed to set database file permissions");
                }
            }
        }

        // busy_timeout=5000: SQLite waits up to 5 seconds for locks to release
        // before returning SQLITE_BUSY. Handles transient contention between
        // the poll pass, transfer completions, and facade queries. Using
        // pragma() ensures all pool connections inherit the setting.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(StoreError::from_sqlx)?
            .pragma("busy_timeout", "5000");
        // SQLite is single-writer; 5 connections covers peak concurrent
        // readers (poll pass + transfer progress + facade queries).
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(StoreError::from_sqlx)?;
        let db = Self { pool };
        db.migrate().await.map_err(|e| {
            let error_string = e.to_string().to_lowercase();
            if error_string.contains("database is locked")
                || error_string.contains("database table is locked")
                || error_string.contains("sqlite_busy")
                || error_string.contains("sqlite_locked")
            {
                StoreError::InstanceLocked
            } else {
                StoreError::Migration(e.to_string())
            }
        })?;
        Ok(db)
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// All schema changes are wrapped in a single transaction so a failure
    /// mid-migration (disk full, power loss) rolls back to the previous
    /// consistent state. All statements use `IF NOT EXISTS` for idempotency.
    async fn migrate(&self) -> Result<()> {
        // Enable foreign keys (per-connection setting, outside the transaction)
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&self.pool)
            .await?;

        sqlx::query("PRAGMA busy_timeout = 5000")
            .execute(&self.pool)
            .await?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS subscriptions (
                id INTEGER PRIMARY KEY,
                url TEXT UNIQUE NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                kind TEXT NOT NULL DEFAULT 'unknown',
                poll_interval_secs INTEGER NOT NULL DEFAULT 0,
                last_polled INTEGER,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                etag TEXT,
                last_modified TEXT,
                retention_max_items INTEGER,
                retention_max_age_days INTEGER,
                created_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS items (
                id INTEGER PRIMARY KEY,
                subscription_id INTEGER NOT NULL REFERENCES subscriptions(id) ON DELETE CASCADE,
                dedup_key TEXT NOT NULL,
                title TEXT NOT NULL,
                published INTEGER,
                enclosure_url TEXT NOT NULL,
                enclosure_size INTEGER,
                enclosure_mime TEXT,
                alternate_enclosures TEXT NOT NULL DEFAULT '[]',
                state TEXT NOT NULL DEFAULT 'discovered',
                discovered_at INTEGER NOT NULL,
                queued_at INTEGER,
                downloaded_at INTEGER,
                watched_at INTEGER,
                file_path TEXT,
                file_size INTEGER,
                bytes_downloaded INTEGER NOT NULL DEFAULT 0,
                attempts INTEGER NOT NULL DEFAULT 0,
                retry_at INTEGER,
                last_failure TEXT,
                pinned INTEGER NOT NULL DEFAULT 0,
                etag TEXT,
                last_modified TEXT,
                UNIQUE(subscription_id, dedup_key)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Admission order scan: queued items by queue time
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_items_queued
             ON items(queued_at, id) WHERE state = 'queued'",
        )
        .execute(&mut *tx)
        .await?;

        // Per-subscription state listings (facade filters, retention)
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_items_sub_state ON items(subscription_id, state)",
        )
        .execute(&mut *tx)
        .await?;

        // Ledger aggregation and eviction candidate scans over materialized items
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_items_materialized
             ON items(state, published) WHERE file_size IS NOT NULL",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }
}
