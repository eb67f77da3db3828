//! In-process durable backend.
//!
//! Keeps records in a lock-protected map, sweeps expired entries every 30
//! seconds, and can mirror its contents to a JSON snapshot file. With
//! auto-save enabled the snapshot is rewritten atomically (temp file +
//! rename) on every mutation.

use super::{DurableStore, QueryFilter, Record};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

struct Inner {
    records: RwLock<HashMap<String, Record>>,
    snapshot_path: Option<PathBuf>,
    auto_save: bool,
}

/// In-process local store. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<Inner>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::build(None, false)
    }

    /// Store mirrored to a JSON snapshot file. Existing contents are loaded;
    /// with `auto_save` every mutation rewrites the file.
    pub fn with_snapshot(path: impl AsRef<Path>, auto_save: bool) -> Result<Self> {
        let store = Self::build(Some(path.as_ref().to_path_buf()), auto_save);
        if path.as_ref().exists() {
            store.load_from_disk()?;
        }
        Ok(store)
    }

    fn build(snapshot_path: Option<PathBuf>, auto_save: bool) -> Self {
        let inner = Arc::new(Inner {
            records: RwLock::new(HashMap::new()),
            snapshot_path,
            auto_save,
        });
        // The sweeper holds a weak handle so dropping the last store stops it.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let weak: Weak<Inner> = Arc::downgrade(&inner);
            handle.spawn(async move {
                let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let Some(inner) = weak.upgrade() else { break };
                    let mut records = inner.records.write();
                    let before = records.len();
                    records.retain(|_, record| !record.is_expired());
                    let removed = before - records.len();
                    if removed > 0 {
                        tracing::debug!(removed, "swept expired records");
                    }
                }
            });
        }
        Self { inner }
    }

    fn load_from_disk(&self) -> Result<()> {
        let Some(path) = &self.inner.snapshot_path else {
            return Err(EngineError::Unsupported("store has no snapshot file".into()));
        };
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Transport(format!("read snapshot: {e}")))?;
        if content.trim().is_empty() {
            return Ok(());
        }
        let loaded: HashMap<String, Record> = serde_json::from_str(&content)?;
        *self.inner.records.write() = loaded;
        Ok(())
    }

    fn write_to_disk(&self) -> Result<()> {
        let Some(path) = &self.inner.snapshot_path else {
            return Err(EngineError::Unsupported("store has no snapshot file".into()));
        };
        let serialized = {
            let records = self.inner.records.read();
            serde_json::to_string_pretty(&*records)?
        };
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serialized)
            .map_err(|e| EngineError::Transport(format!("write snapshot: {e}")))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| EngineError::Transport(format!("replace snapshot: {e}")))?;
        Ok(())
    }

    fn after_mutation(&self) -> Result<()> {
        if self.inner.auto_save && self.inner.snapshot_path.is_some() {
            self.write_to_disk()?;
        }
        Ok(())
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for LocalStore {
    async fn get(&self, key: &str) -> Result<Value> {
        let expired = {
            let records = self.inner.records.read();
            match records.get(key) {
                None => return Err(EngineError::NotFound(format!("key '{key}'"))),
                Some(record) if record.is_expired() => true,
                Some(record) => return Ok(record.value.clone()),
            }
        };
        if expired {
            self.inner.records.write().remove(key);
            let _ = self.after_mutation();
        }
        Err(EngineError::NotFound(format!("key '{key}' has expired")))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        self.inner
            .records
            .write()
            .insert(key.to_string(), Record::new(key, value, ttl));
        self.after_mutation()
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.records.write().remove(key);
        self.after_mutation()
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let records = self.inner.records.read();
        let mut keys: Vec<String> = records
            .values()
            .filter(|record| !record.is_expired() && record.key.starts_with(prefix))
            .map(|record| record.key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn query(&self, filter: &QueryFilter) -> Result<Vec<Value>> {
        let values: Vec<Value> = {
            let records = self.inner.records.read();
            records
                .values()
                .filter(|record| !record.is_expired())
                .map(|record| record.value.clone())
                .collect()
        };
        Ok(filter.apply(values))
    }

    async fn batch_write(&self, items: Vec<(String, Value)>) -> Result<usize> {
        let total = items.len();
        // Chunking is a formality here, but it keeps the backends uniform.
        for chunk in items.chunks(self.batch_ceiling()) {
            let mut records = self.inner.records.write();
            for (key, value) in chunk {
                records.insert(key.clone(), Record::new(key.clone(), value.clone(), None));
            }
        }
        self.after_mutation()?;
        Ok(total)
    }

    fn batch_ceiling(&self) -> usize {
        100
    }

    async fn save_snapshot(&self) -> Result<()> {
        self.write_to_disk()
    }

    async fn load_snapshot(&self) -> Result<()> {
        self.load_from_disk()
    }
}
