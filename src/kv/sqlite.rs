//! SQLite-backed [`KvStore`] adapter (§4.6 "pluggable remote adapter").
//!
//! Grounded in the donor's `database.rs` functional-core/imperative-shell
//! split: a plain connection pool plus free functions that take `&SqlitePool`
//! and do one thing, with `sqlx::migrate!` run once at startup.

use super::{KvRecord, KvStore};
use crate::error::CoreError;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// A [`KvStore`] backed by a SQLite database, for deployments that want
/// durability without running a separate service.
pub struct SqliteKvStore {
    pool: SqlitePool,
}

impl SqliteKvStore {
    /// Opens (creating if absent) the database at `path`, applies pending
    /// migrations, and returns a ready store.
    ///
    /// # Errors
    /// Returns [`CoreError::Storage`] if the connection cannot be
    /// established, or [`CoreError::Migration`] if migrations fail.
    pub async fn connect(path: &str) -> Result<Self, CoreError> {
        let options = SqliteConnectOptions::from_str(path)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(num_cpus::get() as u32)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!(path, "sqlite kv store ready");
        Ok(Self { pool })
    }

    /// Wraps an already-open pool (used by tests against an in-memory
    /// database).
    #[must_use]
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, CoreError> {
        let row: Option<(String, Option<i64>)> = sqlx::query_as(
            "SELECT value, exp FROM kv_entries WHERE ns = ?1 AND k = ?2",
        )
        .bind(namespace)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        let Some((value, exp)) = row else {
            return Ok(None);
        };
        if super::is_expired(exp, now_millis()) {
            self.delete(namespace, key).await?;
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&value)?))
    }

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: Value,
        ttl_ms: Option<u64>,
    ) -> Result<(), CoreError> {
        let exp = ttl_ms.map(|ttl| now_millis() + ttl as i64);
        let encoded = serde_json::to_string(&value)?;
        sqlx::query(
            "INSERT INTO kv_entries (ns, k, value, exp) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(ns, k) DO UPDATE SET value = excluded.value, exp = excluded.exp",
        )
        .bind(namespace)
        .bind(key)
        .bind(encoded)
        .bind(exp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM kv_entries WHERE ns = ?1 AND k = ?2")
            .bind(namespace)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<String>, CoreError> {
        let now = now_millis();
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT k FROM kv_entries WHERE ns = ?1 AND (exp IS NULL OR exp > ?2)",
        )
        .bind(namespace)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(k,)| k).collect())
    }

    async fn snapshot(&self) -> Result<(), CoreError> {
        // SQLite is already the durable store; nothing to flush.
        Ok(())
    }

    async fn restore(&self) -> Result<(), CoreError> {
        // Rows persist across restarts already; nothing to load.
        Ok(())
    }
}

/// Converts rows back into [`KvRecord`]s, used by administrative tooling
/// that wants a full dump rather than a per-namespace read.
pub async fn dump_all(pool: &SqlitePool) -> Result<Vec<KvRecord>, CoreError> {
    let rows: Vec<(String, String, String, Option<i64>)> =
        sqlx::query_as("SELECT ns, k, value, exp FROM kv_entries").fetch_all(pool).await?;
    rows.into_iter()
        .map(|(ns, k, value, exp)| {
            Ok(KvRecord {
                ns,
                k,
                v: serde_json::from_str(&value)?,
                exp,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_store() -> SqliteKvStore {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite pool");
        sqlx::migrate!("./migrations").run(&pool).await.expect("migrations apply");
        SqliteKvStore::from_pool(pool)
    }

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let store = test_store().await;
        store.set("workflows", "wf-1", json!({"stage": "pricing"}), None).await.unwrap();
        assert_eq!(store.get("workflows", "wf-1").await.unwrap(), Some(json!({"stage": "pricing"})));
    }

    #[tokio::test]
    async fn upsert_replaces_existing_value() {
        let store = test_store().await;
        store.set("workflows", "wf-1", json!(1), None).await.unwrap();
        store.set("workflows", "wf-1", json!(2), None).await.unwrap();
        assert_eq!(store.get("workflows", "wf-1").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn expired_rows_read_as_absent_and_get_deleted() {
        let store = test_store().await;
        store.set("dlq", "msg-1", json!("x"), Some(0)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(store.get("dlq", "msg-1").await.unwrap(), None);
        assert!(store.keys("dlq").await.unwrap().is_empty());
    }
}
