//! Pluggable key-value persistence (§4.6).
//!
//! The donor's `AgentStorage` split (`storage.rs` vs `storage/mod.rs`, two
//! incompatible traits) is collapsed here into one async [`KvStore`] trait
//! with a namespace/key/value/ttl contract. Every piece of durable state
//! (`workflows/`, `workflows/audit/`, `agents/state/`, `dlq/`) is a namespace
//! under this one store rather than a bespoke table.

pub mod memory;
pub mod sqlite;

use crate::error::CoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single stored record, as persisted to ndjson snapshots and SQLite rows
/// alike (§6 "Persisted state layout").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvRecord {
    /// Namespace the record lives in (e.g. `"workflows"`).
    pub ns: String,
    /// Key within the namespace.
    pub k: String,
    /// The stored value.
    pub v: Value,
    /// Optional expiry, as unix millis. Expired records read as absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

/// Generic namespaced key-value persistence, backing every durable
/// component of the fabric.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Reads `key` from `namespace`. Returns `None` if absent or expired.
    ///
    /// # Errors
    /// Returns [`CoreError::Storage`] on a backend I/O failure.
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, CoreError>;

    /// Writes `key` in `namespace`, with an optional TTL in milliseconds.
    ///
    /// # Errors
    /// Returns [`CoreError::Storage`] on a backend I/O failure.
    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: Value,
        ttl_ms: Option<u64>,
    ) -> Result<(), CoreError>;

    /// Removes `key` from `namespace`, if present.
    ///
    /// # Errors
    /// Returns [`CoreError::Storage`] on a backend I/O failure.
    async fn delete(&self, namespace: &str, key: &str) -> Result<(), CoreError>;

    /// Lists every non-expired key in `namespace`.
    ///
    /// # Errors
    /// Returns [`CoreError::Storage`] on a backend I/O failure.
    async fn keys(&self, namespace: &str) -> Result<Vec<String>, CoreError>;

    /// Writes every record to a snapshot the backend can later [`restore`]
    /// from (ndjson for the in-memory backend, a no-op for SQLite, which is
    /// already durable).
    ///
    /// [`restore`]: KvStore::restore
    ///
    /// # Errors
    /// Returns [`CoreError::Storage`] if the snapshot could not be written.
    async fn snapshot(&self) -> Result<(), CoreError>;

    /// Restores state from the backend's durable store at startup.
    ///
    /// # Errors
    /// Returns [`CoreError::Storage`] if the restore could not be completed.
    async fn restore(&self) -> Result<(), CoreError>;
}

pub(crate) fn is_expired(exp: Option<i64>, now_millis: i64) -> bool {
    exp.is_some_and(|exp| now_millis >= exp)
}
