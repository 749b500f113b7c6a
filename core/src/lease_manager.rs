/// SQLite-backed implementation of the LeaseStore trait
/// Shares one lease between every process pointing at the same database file.

use crate::errors::{StoreError, StoreResult};
use crate::lease::{Lease, LeaseStore};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration as StdDuration;
use tracing::{debug, info, warn};

/// SQLite-backed lease store
pub struct SqliteLeaseStore {
    /// Connection pool to SQLite database
    pool: SqlitePool,

    /// Path to the SQLite database file
    db_path: PathBuf,
}

impl SqliteLeaseStore {
    /// Open (creating if needed) the database at `db_path`
    pub async fn new(db_path: PathBuf) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let connect_options = SqliteConnectOptions::from_str(db_path.to_string_lossy().as_ref())
            .map_err(|e| StoreError::DatabaseError(format!("Failed to parse database path: {}", e)))?
            .create_if_missing(true)
            .busy_timeout(StdDuration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(connect_options)
            .await
            .map_err(|e| StoreError::DatabaseError(format!("Failed to create database pool: {}", e)))?;

        Ok(SqliteLeaseStore { pool, db_path })
    }

    /// Open the database and make sure the schema exists
    pub async fn open(db_path: PathBuf) -> StoreResult<Self> {
        let store = Self::new(db_path).await?;
        store.initialize().await?;
        Ok(store)
    }

    /// Initialize the database schema
    pub async fn initialize(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS leases (
                key TEXT PRIMARY KEY NOT NULL,
                holder TEXT NOT NULL,
                acquired_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed to create leases table: {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS lease_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT NOT NULL,
                holder TEXT NOT NULL,
                event_type TEXT NOT NULL,
                event_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_lease_history_key ON lease_history(key, event_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| {
            StoreError::DatabaseError(format!("Failed to create lease_history table: {}", e))
        })?;

        info!("Lease database ready at {:?}", self.db_path);
        Ok(())
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Most recent lease events for `key`, newest first
    pub async fn history(&self, key: &str, limit: u32) -> StoreResult<Vec<(String, String, DateTime<Utc>)>> {
        let rows = sqlx::query(
            "SELECT holder, event_type, event_at FROM lease_history WHERE key = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(key)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let holder: String = row.get("holder");
                let event_type: String = row.get("event_type");
                let event_at: i64 = row.get("event_at");
                (holder, event_type, from_millis(event_at))
            })
            .collect())
    }

    /// Append a history row. The lease change it describes has already
    /// committed, so a failed write is logged and not returned.
    async fn record(&self, key: &str, holder: &str, event_type: &str) {
        let result = sqlx::query(
            "INSERT INTO lease_history (key, holder, event_type, event_at) VALUES (?, ?, ?, ?)",
        )
        .bind(key)
        .bind(holder)
        .bind(event_type)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!(key, holder, event_type, "Failed to record lease history: {}", e);
        }
    }
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default()
}

#[async_trait]
impl LeaseStore for SqliteLeaseStore {
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Utc::now();
        let expires_at = now + ttl;

        // Single statement: inserts when absent, takes over only when the existing lease expired.
        let result = sqlx::query(
            r#"
            INSERT INTO leases (key, holder, acquired_at, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                holder = excluded.holder,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
            WHERE leases.expires_at <= excluded.acquired_at
            "#,
        )
        .bind(key)
        .bind(holder)
        .bind(now.timestamp_millis())
        .bind(expires_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        let acquired = result.rows_affected() == 1;
        if acquired {
            debug!(key, holder, "Lease acquired");
            self.record(key, holder, "acquired").await;
        }
        Ok(acquired)
    }

    async fn release(&self, key: &str, holder: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM leases WHERE key = ? AND holder = ?")
            .bind(key)
            .bind(holder)
            .execute(&self.pool)
            .await?;

        let released = result.rows_affected() == 1;
        if released {
            debug!(key, holder, "Lease released");
            self.record(key, holder, "released").await;
        }
        Ok(released)
    }

    async fn current(&self, key: &str) -> StoreResult<Option<Lease>> {
        let row = sqlx::query(
            "SELECT key, holder, acquired_at, expires_at FROM leases WHERE key = ? AND expires_at > ?",
        )
        .bind(key)
        .bind(Utc::now().timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let acquired_at: i64 = row.get("acquired_at");
            let expires_at: i64 = row.get("expires_at");
            Lease {
                key: row.get("key"),
                holder: row.get("holder"),
                acquired_at: from_millis(acquired_at),
                expires_at: from_millis(expires_at),
            }
        }))
    }

    async fn force_release(&self, key: &str) -> StoreResult<bool> {
        let holder = self.current(key).await?.map(|l| l.holder);
        let result = sqlx::query("DELETE FROM leases WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;

        let removed = result.rows_affected() == 1;
        if removed {
            self.record(key, holder.as_deref().unwrap_or("-"), "force_released")
                .await;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store() -> (SqliteLeaseStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = SqliteLeaseStore::open(dir.path().join("leases.db"))
            .await
            .unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let (store, _dir) = store().await;
        assert!(store.try_acquire("lock", "a", Duration::seconds(60)).await.unwrap());
        assert!(!store.try_acquire("lock", "b", Duration::seconds(60)).await.unwrap());
        assert_eq!(store.current("lock").await.unwrap().unwrap().holder, "a");
    }

    #[tokio::test]
    async fn test_release_is_compare_and_delete() {
        let (store, _dir) = store().await;
        store.try_acquire("lock", "a", Duration::seconds(60)).await.unwrap();

        assert!(!store.release("lock", "b").await.unwrap());
        assert!(store.release("lock", "a").await.unwrap());
        assert!(store.current("lock").await.unwrap().is_none());
        assert!(store.try_acquire("lock", "b", Duration::seconds(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let (store, _dir) = store().await;
        store.try_acquire("lock", "slow", Duration::milliseconds(-10)).await.unwrap();
        assert!(store.current("lock").await.unwrap().is_none());

        assert!(store.try_acquire("lock", "fresh", Duration::seconds(60)).await.unwrap());
        assert!(!store.release("lock", "slow").await.unwrap());
        assert_eq!(store.current("lock").await.unwrap().unwrap().holder, "fresh");
    }

    #[tokio::test]
    async fn test_history_is_recorded() {
        let (store, _dir) = store().await;
        store.try_acquire("lock", "a", Duration::seconds(60)).await.unwrap();
        store.release("lock", "a").await.unwrap();

        let history = store.history("lock", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].1, "released");
        assert_eq!(history[1].1, "acquired");
    }

    #[tokio::test]
    async fn test_history_failure_does_not_strand_the_lease() {
        let (store, _dir) = store().await;
        sqlx::query("DROP TABLE lease_history")
            .execute(&store.pool)
            .await
            .unwrap();

        assert!(store.try_acquire("lock", "a", Duration::seconds(60)).await.unwrap());
        assert_eq!(store.current("lock").await.unwrap().unwrap().holder, "a");
        assert!(store.release("lock", "a").await.unwrap());
        assert!(store.current("lock").await.unwrap().is_none());
        assert!(store.try_acquire("lock", "b", Duration::seconds(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_two_handles_share_the_lease() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shared.db");
        let first = SqliteLeaseStore::open(path.clone()).await.unwrap();
        let second = SqliteLeaseStore::open(path).await.unwrap();

        assert!(first.try_acquire("lock", "a", Duration::seconds(60)).await.unwrap());
        assert!(!second.try_acquire("lock", "b", Duration::seconds(60)).await.unwrap());
        assert!(second.force_release("lock").await.unwrap());
        assert!(second.try_acquire("lock", "b", Duration::seconds(60)).await.unwrap());
    }
}
