//! In-memory [`KvStore`] reference backend, durable via periodic ndjson
//! snapshots (§6 "Persisted state layout").
//!
//! Grounded in the donor's `InMemoryAgentStorage` (`storage.rs`), generalized
//! from per-agent records to arbitrary namespaced key-value pairs, and from
//! a one-shot dump to a snapshot/restore pair so a process restart can
//! recover workflow and audit state.

use super::{is_expired, KvRecord, KvStore};
use crate::error::CoreError;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// An in-process, `DashMap`-backed store. Snapshots to a single ndjson file
/// (one [`KvRecord`] per line, per §6's documented format); a fresh process
/// calls [`MemoryKvStore::restore`] at startup to repopulate from that file.
pub struct MemoryKvStore {
    data: DashMap<(String, String), KvRecord>,
    snapshot_path: PathBuf,
}

impl MemoryKvStore {
    /// Builds a store backed by the ndjson snapshot file at `snapshot_path`.
    /// The file need not exist yet; [`restore`] treats a missing file as an
    /// empty store.
    ///
    /// [`restore`]: MemoryKvStore::restore
    #[must_use]
    pub fn new(snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            data: DashMap::new(),
            snapshot_path: snapshot_path.into(),
        }
    }

    fn read_live(&self, namespace: &str, key: &str) -> Option<Value> {
        let entry = self.data.get(&(namespace.to_string(), key.to_string()))?;
        if is_expired(entry.exp, now_millis()) {
            drop(entry);
            self.data.remove(&(namespace.to_string(), key.to_string()));
            None
        } else {
            Some(entry.v.clone())
        }
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, CoreError> {
        Ok(self.read_live(namespace, key))
    }

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: Value,
        ttl_ms: Option<u64>,
    ) -> Result<(), CoreError> {
        let exp = ttl_ms.map(|ttl| now_millis() + ttl as i64);
        self.data.insert(
            (namespace.to_string(), key.to_string()),
            KvRecord {
                ns: namespace.to_string(),
                k: key.to_string(),
                v: value,
                exp,
            },
        );
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), CoreError> {
        self.data.remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<String>, CoreError> {
        let now = now_millis();
        Ok(self
            .data
            .iter()
            .filter(|entry| entry.key().0 == namespace && !is_expired(entry.exp, now))
            .map(|entry| entry.key().1.clone())
            .collect())
    }

    async fn snapshot(&self) -> Result<(), CoreError> {
        let tmp_path = tmp_snapshot_path(&self.snapshot_path);
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        for entry in self.data.iter() {
            let line = serde_json::to_string(entry.value())?;
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
        }
        file.flush().await?;
        tokio::fs::rename(&tmp_path, &self.snapshot_path).await?;
        info!(path = %self.snapshot_path.display(), "kv snapshot written");
        Ok(())
    }

    async fn restore(&self) -> Result<(), CoreError> {
        if !self.snapshot_path.exists() {
            return Ok(());
        }
        let file = tokio::fs::File::open(&self.snapshot_path).await?;
        let mut lines = BufReader::new(file).lines();
        let now = now_millis();
        let mut restored = 0usize;
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let record: KvRecord = match serde_json::from_str(&line) {
                Ok(record) => record,
                Err(e) => {
                    warn!(error = %e, "skipping malformed kv snapshot line");
                    continue;
                }
            };
            if is_expired(record.exp, now) {
                continue;
            }
            self.data.insert((record.ns.clone(), record.k.clone()), record);
            restored += 1;
        }
        info!(restored, path = %self.snapshot_path.display(), "kv snapshot restored");
        Ok(())
    }
}

fn tmp_snapshot_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let store = MemoryKvStore::new("/tmp/does-not-matter.ndjson");
        store.set("workflows", "wf-1", json!({"stage": "pricing"}), None).await.unwrap();
        let value = store.get("workflows", "wf-1").await.unwrap();
        assert_eq!(value, Some(json!({"stage": "pricing"})));
    }

    #[tokio::test]
    async fn expired_entries_read_as_absent() {
        let store = MemoryKvStore::new("/tmp/does-not-matter.ndjson");
        store.set("dlq", "msg-1", json!("x"), Some(0)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(store.get("dlq", "msg-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn snapshot_then_restore_into_fresh_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.ndjson");
        let store = MemoryKvStore::new(&path);
        store.set("workflows", "wf-1", json!({"stage": "pricing"}), None).await.unwrap();
        store.set("agents/state", "sales-1", json!({"busy": true}), None).await.unwrap();
        store.snapshot().await.unwrap();

        let restored = MemoryKvStore::new(&path);
        restored.restore().await.unwrap();
        assert_eq!(restored.get("workflows", "wf-1").await.unwrap(), Some(json!({"stage": "pricing"})));
        assert_eq!(restored.get("agents/state", "sales-1").await.unwrap(), Some(json!({"busy": true})));
    }

    #[tokio::test]
    async fn keys_lists_only_live_entries_in_namespace() {
        let store = MemoryKvStore::new("/tmp/does-not-matter.ndjson");
        store.set("workflows", "wf-1", json!(1), None).await.unwrap();
        store.set("workflows", "wf-2", json!(2), None).await.unwrap();
        store.set("dlq", "msg-1", json!(3), None).await.unwrap();
        let mut keys = store.keys("workflows").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["wf-1", "wf-2"]);
    }
}
