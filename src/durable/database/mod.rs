//! Relational durable adapter via SeaORM.
//!
//! Records live in a `flow_records` table with a JSON value column and a
//! nullable `ttl` timestamp (indexed). The table is auto-created on connect.
//! Expiry is enforced in every read path by a `ttl IS NULL OR ttl > now`
//! condition; query operators are evaluated over the fetched JSON values so
//! their semantics match the other backends on every supported database.
//!
//! This is also the only backend with a SQL surface: `execute_sql` runs one
//! raw statement, `execute_transaction` runs several atomically.

use super::{DurableStore, QueryFilter};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use chrono::Utc;
use sea_orm::ActiveValue::Set;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, Database, DatabaseConnection,
    EntityTrait, QueryFilter as _, Statement, TransactionTrait,
};
use sea_orm_migration::MigratorTrait;
use serde_json::{Value, json};
use std::time::Duration;

mod entity;
mod migration;

use entity::{ActiveModel, Column, Entity as FlowRecords};
use migration::Migrator;

pub struct DatabaseStore {
    connection: DatabaseConnection,
}

impl DatabaseStore {
    /// Connect and auto-create the schema.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let connection = Database::connect(database_url)
            .await
            .map_err(|e| EngineError::Transport(format!("database connect: {e}")))?;
        Migrator::up(&connection, None)
            .await
            .map_err(|e| EngineError::Transport(format!("database migrate: {e}")))?;
        Ok(Self { connection })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }

    fn live_condition() -> Condition {
        Condition::any()
            .add(Column::Ttl.is_null())
            .add(Column::Ttl.gt(Utc::now()))
    }
}

#[async_trait]
impl DurableStore for DatabaseStore {
    async fn get(&self, key: &str) -> Result<Value> {
        let found = FlowRecords::find_by_id(key)
            .filter(Self::live_condition())
            .one(&self.connection)
            .await
            .map_err(|e| EngineError::Transport(format!("database get: {e}")))?;
        found
            .map(|model| model.value)
            .ok_or_else(|| EngineError::NotFound(format!("key '{key}'")))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        let ttl_at = ttl.map(|d| Utc::now() + chrono::Duration::seconds(d.as_secs() as i64));
        let existing = FlowRecords::find_by_id(key)
            .one(&self.connection)
            .await
            .map_err(|e| EngineError::Transport(format!("database set: {e}")))?;
        match existing {
            Some(model) => {
                let mut active: ActiveModel = model.into();
                active.value = Set(value);
                active.ttl = Set(ttl_at);
                active
                    .update(&self.connection)
                    .await
                    .map_err(|e| EngineError::Transport(format!("database update: {e}")))?;
            }
            None => {
                let record = ActiveModel {
                    key: Set(key.to_string()),
                    value: Set(value),
                    ttl: Set(ttl_at),
                    created_at: Set(Utc::now()),
                };
                record
                    .insert(&self.connection)
                    .await
                    .map_err(|e| EngineError::Transport(format!("database insert: {e}")))?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        FlowRecords::delete_by_id(key)
            .exec(&self.connection)
            .await
            .map_err(|e| EngineError::Transport(format!("database delete: {e}")))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut query = FlowRecords::find().filter(Self::live_condition());
        if !prefix.is_empty() {
            query = query.filter(Column::Key.starts_with(prefix));
        }
        let records = query
            .all(&self.connection)
            .await
            .map_err(|e| EngineError::Transport(format!("database list: {e}")))?;
        let mut keys: Vec<String> = records.into_iter().map(|m| m.key).collect();
        keys.sort();
        Ok(keys)
    }

    async fn query(&self, filter: &QueryFilter) -> Result<Vec<Value>> {
        let records = FlowRecords::find()
            .filter(Self::live_condition())
            .all(&self.connection)
            .await
            .map_err(|e| EngineError::Transport(format!("database query: {e}")))?;
        let values: Vec<Value> = records.into_iter().map(|m| m.value).collect();
        Ok(filter.apply(values))
    }

    async fn batch_write(&self, items: Vec<(String, Value)>) -> Result<usize> {
        let total = items.len();
        for chunk in items.chunks(self.batch_ceiling()) {
            for (key, value) in chunk {
                self.set(key, value.clone(), None).await?;
            }
        }
        Ok(total)
    }

    fn batch_ceiling(&self) -> usize {
        100
    }

    async fn execute_sql(&self, sql: &str) -> Result<Value> {
        let backend = self.connection.get_database_backend();
        let result = self
            .connection
            .execute(Statement::from_string(backend, sql.to_string()))
            .await
            .map_err(|e| EngineError::Transport(format!("execute: {e}")))?;
        Ok(json!({"rows_affected": result.rows_affected()}))
    }

    async fn execute_transaction(&self, statements: Vec<String>) -> Result<Value> {
        let backend = self.connection.get_database_backend();
        let txn = self
            .connection
            .begin()
            .await
            .map_err(|e| EngineError::Transport(format!("begin: {e}")))?;
        let mut rows_affected = 0u64;
        for sql in &statements {
            let result = txn
                .execute(Statement::from_string(backend, sql.clone()))
                .await
                .map_err(|e| EngineError::Transport(format!("transaction: {e}")))?;
            rows_affected += result.rows_affected();
        }
        txn.commit()
            .await
            .map_err(|e| EngineError::Transport(format!("commit: {e}")))?;
        Ok(json!({
            "ok": true,
            "statements": statements.len(),
            "rows_affected": rows_affected,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn setup() -> DatabaseStore {
        DatabaseStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn set_get_delete_round_trip() {
        let store = setup().await;
        store.set("k", json!({"n": 1}), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), json!({"n": 1}));

        // Overwrite keeps a single row.
        store.set("k", json!({"n": 2}), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), json!({"n": 2}));

        store.delete("k").await.unwrap();
        assert!(matches!(
            store.get("k").await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn expired_rows_are_invisible() {
        let store = setup().await;
        store
            .set("short", json!(1), Some(Duration::from_secs(0)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.get("short").await.is_err());
        assert!(store.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn query_filters_match_other_backends() {
        let store = setup().await;
        for (key, score) in [("a", 1), ("b", 5), ("c", 9)] {
            store
                .set(key, json!({"key": key, "score": score}), None)
                .await
                .unwrap();
        }
        let mut filter = QueryFilter::new(
            json!({"score": {"$gte": 5}}).as_object().cloned().unwrap(),
        );
        filter.sort = Some("-score".to_string());
        let out = store.query(&filter).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["key"], json!("c"));
    }

    #[tokio::test]
    async fn raw_sql_and_transactions() {
        let store = setup().await;
        store.set("k", json!(1), None).await.unwrap();
        let out = store
            .execute_sql("DELETE FROM flow_records")
            .await
            .unwrap();
        assert_eq!(out["rows_affected"], json!(1));

        let out = store
            .execute_transaction(vec![
                "INSERT INTO flow_records (key, value, created_at) VALUES ('t1', '1', CURRENT_TIMESTAMP)".to_string(),
                "INSERT INTO flow_records (key, value, created_at) VALUES ('t2', '2', CURRENT_TIMESTAMP)".to_string(),
            ])
            .await
            .unwrap();
        assert_eq!(out["statements"], json!(2));
        assert_eq!(store.list("t").await.unwrap().len(), 2);
    }
}
