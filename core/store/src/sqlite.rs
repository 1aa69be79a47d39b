//! SQLite-backed store.
//!
//! Lets several processes on one host share a queue and locks through a
//! single database file.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

use rdmsync_common::{Error, Result};

use crate::store::KeyValueStore;

/// Key-value store persisted in SQLite.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

fn store_err(err: rusqlite::Error) -> Error {
    Error::Store(err.to_string())
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| now_millis() + ttl.as_millis() as i64)
}

impl SqliteStore {
    /// Create or open a store database.
    ///
    /// # Errors
    /// - Database creation or schema failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(store_err)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(store_err)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS lists (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                list TEXT NOT NULL,
                value TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_lists_list ON lists(list, seq);
            "#,
        )
        .map_err(store_err)?;

        info!("Store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| Error::Store("sqlite connection poisoned".to_string()))?;
            f(&guard).map_err(store_err)
        })
        .await
        .map_err(|e| Error::Store(format!("sqlite task failed: {}", e)))?
    }

    /// Drop expired rows.
    pub async fn purge_expired(&self) -> Result<usize> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now_millis()],
            )
        })
        .await
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT value FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, now_millis()],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
                "#,
                params![key, value, expiry(ttl)],
            )
            .map(|_| ())
        })
        .await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let (key, value) = (key.to_string(), value.to_string());
        self.with_conn(move |conn| {
            // Only an expired row may be overwritten.
            let changed = conn.execute(
                r#"
                INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
                WHERE kv.expires_at IS NOT NULL AND kv.expires_at <= ?4
                "#,
                params![key, value, expiry(ttl), now_millis()],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            conn.execute("DELETE FROM lists WHERE list = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    async fn push(&self, list: &str, value: &str) -> Result<()> {
        let (list, value) = (list.to_string(), value.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO lists (list, value) VALUES (?1, ?2)",
                params![list, value],
            )
            .map(|_| ())
        })
        .await
    }

    async fn pop(&self, list: &str) -> Result<Option<String>> {
        let list = list.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                r#"
                DELETE FROM lists
                WHERE seq = (SELECT MIN(seq) FROM lists WHERE list = ?1)
                RETURNING value
                "#,
                params![list],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn len(&self, list: &str) -> Result<usize> {
        let list = list.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM lists WHERE list = ?1",
                params![list],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as usize)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_set_get_and_ttl() {
        let store = SqliteStore::in_memory().unwrap();
        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        store
            .set("short", "v", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.get("short").await.unwrap().is_none());
        assert_eq!(store.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_set_nx_respects_live_and_expired_rows() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.set_nx("lock: a", "1", None).await.unwrap());
        assert!(!store.set_nx("lock: a", "2", None).await.unwrap());

        store
            .set("lock: b", "1", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.set_nx("lock: b", "2", None).await.unwrap());
        assert_eq!(store.get("lock: b").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_fifo_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.push("jobs", "first").await.unwrap();
            store.push("jobs", "second").await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.len("jobs").await.unwrap(), 2);
        assert_eq!(store.pop("jobs").await.unwrap().as_deref(), Some("first"));
        assert_eq!(store.pop("jobs").await.unwrap().as_deref(), Some("second"));
        assert!(store.pop("jobs").await.unwrap().is_none());
    }
}
