//! Redis-backed durable adapter.
//!
//! Each record is one JSON document under `<prefix>:<key>` carrying its own
//! numeric expiry attribute, compared to now at read time so behavior matches
//! the other backends exactly (the server's native expiry is not used).
//! Batch writes are chunked 25 records per pipeline.

use super::{DurableStore, QueryFilter, Record};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use redis::{Commands, Connection};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const BATCH_CEILING: usize = 25;

pub struct RedisStore {
    connection: Arc<Mutex<Connection>>,
    prefix: String,
}

impl RedisStore {
    pub fn new(redis_url: &str) -> Result<Self> {
        Self::with_prefix(redis_url, "driftflow")
    }

    pub fn with_prefix(redis_url: &str, prefix: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| EngineError::Transport(format!("redis open: {e}")))?;
        let connection = client
            .get_connection()
            .map_err(|e| EngineError::Transport(format!("redis connect: {e}")))?;
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
            prefix: prefix.to_string(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    fn strip_prefix(&self, full_key: &str) -> Option<String> {
        full_key
            .strip_prefix(&format!("{}:", self.prefix))
            .map(str::to_string)
    }

    fn with_connection<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> std::result::Result<R, redis::RedisError>,
    {
        let mut conn = self
            .connection
            .lock()
            .map_err(|e| EngineError::Invariant(format!("redis lock poisoned: {e}")))?;
        f(&mut conn).map_err(|e| EngineError::Transport(format!("redis: {e}")))
    }

    fn read_record(&self, key: &str) -> Result<Option<Record>> {
        let full_key = self.full_key(key);
        let raw: Option<String> = self.with_connection(|conn| conn.get(&full_key))?;
        match raw {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    fn write_record(&self, record: &Record) -> Result<()> {
        let full_key = self.full_key(&record.key);
        let payload = serde_json::to_string(record)?;
        self.with_connection(|conn| {
            let _: () = conn.set(&full_key, &payload)?;
            Ok(())
        })
    }

    fn all_records(&self) -> Result<Vec<Record>> {
        let pattern = format!("{}:*", self.prefix);
        let full_keys: Vec<String> = self.with_connection(|conn| conn.keys(&pattern))?;
        let mut records = Vec::with_capacity(full_keys.len());
        for full_key in full_keys {
            let raw: Option<String> = self.with_connection(|conn| conn.get(&full_key))?;
            if let Some(text) = raw {
                match serde_json::from_str::<Record>(&text) {
                    Ok(record) if !record.is_expired() => records.push(record),
                    Ok(_) | Err(_) => {}
                }
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl DurableStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Value> {
        match self.read_record(key)? {
            None => Err(EngineError::NotFound(format!("key '{key}'"))),
            Some(record) if record.is_expired() => {
                self.delete(key).await?;
                Err(EngineError::NotFound(format!("key '{key}' has expired")))
            }
            Some(record) => Ok(record.value),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        self.write_record(&Record::new(key, value, ttl))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let full_key = self.full_key(key);
        self.with_connection(|conn| {
            let _: u32 = conn.del(&full_key)?;
            Ok(())
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .all_records()?
            .into_iter()
            .filter(|record| record.key.starts_with(prefix))
            .map(|record| record.key)
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn query(&self, filter: &QueryFilter) -> Result<Vec<Value>> {
        let values: Vec<Value> = self
            .all_records()?
            .into_iter()
            .map(|record| record.value)
            .collect();
        Ok(filter.apply(values))
    }

    async fn batch_write(&self, items: Vec<(String, Value)>) -> Result<usize> {
        let total = items.len();
        for chunk in items.chunks(self.batch_ceiling()) {
            let mut pipe = redis::pipe();
            for (key, value) in chunk {
                let record = Record::new(key.clone(), value.clone(), None);
                let payload = serde_json::to_string(&record)?;
                pipe.set(self.full_key(key), payload).ignore();
            }
            self.with_connection(|conn| pipe.query::<()>(conn))?;
        }
        Ok(total)
    }

    fn batch_ceiling(&self) -> usize {
        BATCH_CEILING
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // These tests require a redis server on localhost:6379.
    // Run: docker run --rm -p 6379:6379 redis:latest

    fn setup() -> Result<RedisStore> {
        RedisStore::with_prefix("redis://127.0.0.1:6379/", "driftflow_test")
    }

    #[tokio::test]
    #[ignore] // Requires redis server
    async fn basic_operations() -> Result<()> {
        let store = setup()?;
        for key in store.list("").await? {
            store.delete(&key).await?;
        }

        store.set("k", json!({"n": 1}), None).await?;
        assert_eq!(store.get("k").await?, json!({"n": 1}));
        store.delete("k").await?;
        assert!(store.get("k").await.is_err());
        Ok(())
    }

    #[tokio::test]
    #[ignore] // Requires redis server
    async fn ttl_expiry() -> Result<()> {
        let store = setup()?;
        store
            .set("short", json!(1), Some(Duration::from_secs(1)))
            .await?;
        assert_eq!(store.get("short").await?, json!(1));
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(matches!(
            store.get("short").await,
            Err(EngineError::NotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    #[ignore] // Requires redis server
    async fn batch_write_chunks_transparently() -> Result<()> {
        let store = setup()?;
        let items: Vec<(String, Value)> = (0..60)
            .map(|i| (format!("bulk:{i}"), json!({"i": i})))
            .collect();
        assert_eq!(store.batch_write(items).await?, 60);
        assert_eq!(store.list("bulk:").await?.len(), 60);
        Ok(())
    }
}
