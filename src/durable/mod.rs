//! Durable key-value adapters.
//!
//! One contract, several backends: the in-process [`LocalStore`] (always
//! available), a redis-backed document store (`storage-redis`), and a
//! relational store via SeaORM (`storage-database`). Backends are
//! functionally indistinguishable for the shared operations; only batch-write
//! chunking ceilings and durability differ.
//!
//! Records carry `{key, value, ttl?, created_at}`. A `get` of a missing or
//! expired key is a [`EngineError::NotFound`]. Query filters support the
//! `$eq, $ne, $gt, $gte, $lt, $lte, $in, $contains` operators, an optional
//! sort key (`-` prefix for descending), and a limit.

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::time::Duration;

mod memory;
pub use memory::LocalStore;

#[cfg(feature = "storage-redis")]
mod redis;
#[cfg(feature = "storage-redis")]
pub use redis::RedisStore;

#[cfg(feature = "storage-database")]
mod database;
#[cfg(feature = "storage-database")]
pub use database::DatabaseStore;

/// One persisted record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub value: Value,
    /// Absolute expiry as epoch seconds; `None` never expires.
    pub ttl: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Record {
    pub fn new(key: impl Into<String>, value: Value, ttl: Option<Duration>) -> Self {
        Self {
            key: key.into(),
            value,
            ttl: ttl.map(|d| Utc::now().timestamp() + d.as_secs() as i64),
            created_at: Utc::now(),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.ttl.is_some_and(|expiry| expiry <= Utc::now().timestamp())
    }
}

/// Filter document applied to record values.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub conditions: Map<String, Value>,
    /// Sort field; `-field` sorts descending.
    pub sort: Option<String>,
    pub limit: Option<usize>,
}

impl QueryFilter {
    pub fn new(conditions: Map<String, Value>) -> Self {
        Self {
            conditions,
            sort: None,
            limit: None,
        }
    }

    pub fn from_parts(
        filter: Option<&Value>,
        sort: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Self> {
        let conditions = match filter {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(other) => {
                return Err(EngineError::Parameter(format!(
                    "query filter must be a mapping, got {other}"
                )));
            }
        };
        Ok(Self {
            conditions,
            sort: sort.map(str::to_string),
            limit,
        })
    }

    /// Whether a record value satisfies every condition.
    pub fn matches(&self, value: &Value) -> bool {
        self.conditions.iter().all(|(field, expected)| {
            let actual = lookup_path(value, field);
            match expected {
                Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => ops
                    .iter()
                    .all(|(op, operand)| apply_operator(op, actual, operand)),
                _ => apply_operator("$eq", actual, expected),
            }
        })
    }

    /// Filter, sort, and truncate a value set in one pass.
    pub fn apply(&self, values: Vec<Value>) -> Vec<Value> {
        let mut matched: Vec<Value> = values.into_iter().filter(|v| self.matches(v)).collect();
        if let Some(sort) = &self.sort {
            let (field, descending) = match sort.strip_prefix('-') {
                Some(rest) => (rest, true),
                None => (sort.as_str(), false),
            };
            matched.sort_by(|a, b| {
                let ordering = compare_values(lookup_path(a, field), lookup_path(b, field));
                if descending { ordering.reverse() } else { ordering }
            });
        }
        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }
        matched
    }
}

fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn apply_operator(op: &str, actual: Option<&Value>, operand: &Value) -> bool {
    match op {
        "$eq" => actual.is_some_and(|a| loose_equal(a, operand)),
        "$ne" => !actual.is_some_and(|a| loose_equal(a, operand)),
        "$gt" => matches!(
            actual.map(|a| compare_values(Some(a), Some(operand))),
            Some(Ordering::Greater)
        ),
        "$gte" => matches!(
            actual.map(|a| compare_values(Some(a), Some(operand))),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        "$lt" => matches!(
            actual.map(|a| compare_values(Some(a), Some(operand))),
            Some(Ordering::Less)
        ),
        "$lte" => matches!(
            actual.map(|a| compare_values(Some(a), Some(operand))),
            Some(Ordering::Less | Ordering::Equal)
        ),
        "$in" => match (actual, operand) {
            (Some(a), Value::Array(items)) => items.iter().any(|item| loose_equal(a, item)),
            _ => false,
        },
        "$contains" => match actual {
            Some(Value::String(haystack)) => operand
                .as_str()
                .is_some_and(|needle| haystack.contains(needle)),
            Some(Value::Array(items)) => items.iter().any(|item| loose_equal(item, operand)),
            _ => false,
        },
        _ => false,
    }
}

fn loose_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => match (a.as_str(), b.as_str()) {
                (Some(x), Some(y)) => x.cmp(y),
                _ => a.to_string().cmp(&b.to_string()),
            },
        },
    }
}

/// The durable adapter contract consumed by kernels, the registry, and the
/// scheduler. Safe for concurrent callers.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Fetch a record's value. Missing or expired keys are `NotFound`.
    async fn get(&self, key: &str) -> Result<Value>;

    /// Insert or replace a record, optionally with a time-to-live.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Keys with the given prefix (empty prefix lists everything).
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Record values matching a filter, sorted and truncated per the filter.
    async fn query(&self, filter: &QueryFilter) -> Result<Vec<Value>>;

    /// Insert many records, transparently chunked at [`DurableStore::batch_ceiling`].
    /// Returns the number written.
    async fn batch_write(&self, items: Vec<(String, Value)>) -> Result<usize>;

    /// Largest batch accepted per underlying write call.
    fn batch_ceiling(&self) -> usize {
        100
    }

    /// Raw SQL passthrough; only the relational backend supports this.
    async fn execute_sql(&self, _sql: &str) -> Result<Value> {
        Err(EngineError::Unsupported(
            "execute: backend has no SQL surface".into(),
        ))
    }

    /// Run several SQL statements atomically; relational backend only.
    async fn execute_transaction(&self, _statements: Vec<String>) -> Result<Value> {
        Err(EngineError::Unsupported(
            "transaction: backend has no SQL surface".into(),
        ))
    }

    /// Force a snapshot write; local backend only.
    async fn save_snapshot(&self) -> Result<()> {
        Err(EngineError::Unsupported("save: backend has no snapshot".into()))
    }

    /// Reload state from the snapshot; local backend only.
    async fn load_snapshot(&self) -> Result<()> {
        Err(EngineError::Unsupported("load: backend has no snapshot".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filter_operators() {
        let filter = QueryFilter::new(
            json!({
                "age": {"$gte": 18, "$lt": 65},
                "role": "admin",
            })
            .as_object()
            .cloned()
            .unwrap(),
        );
        assert!(filter.matches(&json!({"age": 30, "role": "admin"})));
        assert!(!filter.matches(&json!({"age": 70, "role": "admin"})));
        assert!(!filter.matches(&json!({"age": 30, "role": "viewer"})));
        assert!(!filter.matches(&json!({"role": "admin"})));
    }

    #[test]
    fn in_and_contains() {
        let filter = QueryFilter::new(
            json!({"status": {"$in": ["new", "open"]}})
                .as_object()
                .cloned()
                .unwrap(),
        );
        assert!(filter.matches(&json!({"status": "open"})));
        assert!(!filter.matches(&json!({"status": "closed"})));

        let contains = QueryFilter::new(
            json!({"tags": {"$contains": "urgent"}, "title": {"$contains": "fail"}})
                .as_object()
                .cloned()
                .unwrap(),
        );
        assert!(contains.matches(&json!({
            "tags": ["urgent", "infra"],
            "title": "deploy failure",
        })));
        assert!(!contains.matches(&json!({"tags": ["infra"], "title": "deploy failure"})));
    }

    #[test]
    fn ne_matches_missing_fields() {
        let filter = QueryFilter::new(
            json!({"state": {"$ne": "done"}}).as_object().cloned().unwrap(),
        );
        assert!(filter.matches(&json!({"state": "open"})));
        assert!(filter.matches(&json!({})));
        assert!(!filter.matches(&json!({"state": "done"})));
    }

    #[test]
    fn sort_and_limit() {
        let mut filter = QueryFilter::default();
        filter.sort = Some("-score".to_string());
        filter.limit = Some(2);
        let out = filter.apply(vec![
            json!({"id": "a", "score": 10}),
            json!({"id": "b", "score": 30}),
            json!({"id": "c", "score": 20}),
        ]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["id"], json!("b"));
        assert_eq!(out[1]["id"], json!("c"));
    }

    #[test]
    fn dotted_paths_reach_nested_fields() {
        let filter = QueryFilter::new(
            json!({"meta.owner": "ops"}).as_object().cloned().unwrap(),
        );
        assert!(filter.matches(&json!({"meta": {"owner": "ops"}})));
        assert!(!filter.matches(&json!({"meta": {"owner": "dev"}})));
    }

    #[test]
    fn record_expiry() {
        let fresh = Record::new("k", json!(1), Some(Duration::from_secs(60)));
        assert!(!fresh.is_expired());
        let mut stale = Record::new("k", json!(1), Some(Duration::from_secs(60)));
        stale.ttl = Some(Utc::now().timestamp() - 10);
        assert!(stale.is_expired());
        let eternal = Record::new("k", json!(1), None);
        assert!(!eternal.is_expired());
    }
}
