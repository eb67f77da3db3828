//! Key-value store kernel over the durable adapter.
//!
//! One kernel, one `operation` param: `get`, `set`, `delete`, `list`,
//! `query`, `increment`, `append`, `batch_write`, plus `execute` /
//! `transaction` on SQL-capable backends and `save` / `load` on the local
//! backend. Backends reject what they cannot do with an unsupported-operation
//! error rather than silently degrading.

use crate::context::SharedContext;
use crate::durable::{DurableStore, QueryFilter};
use crate::error::{EngineError, Result};
use crate::kernel::{Kernel, KernelFactory, RunOutput};
use crate::params::Params;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;

pub struct StoreKernel {
    durable: Arc<dyn DurableStore>,
}

impl StoreKernel {
    pub fn new(durable: Arc<dyn DurableStore>) -> Self {
        Self { durable }
    }
}

#[async_trait]
impl Kernel for StoreKernel {
    fn tag(&self) -> &str {
        "store"
    }

    async fn run(&self, _shared: &mut SharedContext, params: &Params) -> Result<RunOutput> {
        let operation = params.require_str("operation")?;
        let value = match operation {
            "get" => {
                let key = params.require_str("key")?;
                self.durable.get(key).await?
            }
            "set" => {
                let key = params.require_str("key")?;
                let value = params
                    .get_value("value")
                    .cloned()
                    .ok_or_else(|| EngineError::Parameter("set requires 'value'".into()))?;
                let ttl = params.get_duration("ttl")?;
                self.durable.set(key, value, ttl).await?;
                json!({"ok": true, "key": key})
            }
            "delete" => {
                let key = params.require_str("key")?;
                self.durable.delete(key).await?;
                json!({"ok": true, "key": key})
            }
            "list" => {
                let prefix = params.get_str("prefix").unwrap_or("");
                Value::Array(
                    self.durable
                        .list(prefix)
                        .await?
                        .into_iter()
                        .map(Value::String)
                        .collect(),
                )
            }
            "query" => {
                let filter = QueryFilter::from_parts(
                    params.get_value("filter"),
                    params.get_str("sort"),
                    params.get_u64("limit").map(|n| n as usize),
                )?;
                Value::Array(self.durable.query(&filter).await?)
            }
            "increment" => {
                let key = params.require_str("key")?;
                let amount = params.get_f64("amount").unwrap_or(1.0);
                let current = match self.durable.get(key).await {
                    Ok(value) => value.as_f64().ok_or_else(|| {
                        EngineError::Parameter(format!("key '{key}' holds a non-numeric value"))
                    })?,
                    Err(EngineError::NotFound(_)) => 0.0,
                    Err(e) => return Err(e),
                };
                let next = current + amount;
                let next_value = if next.fract() == 0.0 {
                    json!(next as i64)
                } else {
                    json!(next)
                };
                self.durable.set(key, next_value.clone(), None).await?;
                next_value
            }
            "append" => {
                let key = params.require_str("key")?;
                let item = params
                    .get_value("value")
                    .cloned()
                    .ok_or_else(|| EngineError::Parameter("append requires 'value'".into()))?;
                let mut list = match self.durable.get(key).await {
                    Ok(Value::Array(items)) => items,
                    Ok(other) => {
                        return Err(EngineError::Parameter(format!(
                            "key '{key}' holds a non-list value: {other}"
                        )));
                    }
                    Err(EngineError::NotFound(_)) => Vec::new(),
                    Err(e) => return Err(e),
                };
                list.push(item);
                let value = Value::Array(list);
                self.durable.set(key, value.clone(), None).await?;
                value
            }
            "batch_write" => {
                let items = params
                    .get_value("items")
                    .and_then(Value::as_object)
                    .ok_or_else(|| {
                        EngineError::Parameter("batch_write requires an 'items' mapping".into())
                    })?;
                let pairs: Vec<(String, Value)> = items
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                let written = self.durable.batch_write(pairs).await?;
                json!({"written": written})
            }
            "execute" => {
                let sql = params.require_str("sql")?;
                self.durable.execute_sql(sql).await?
            }
            "transaction" => {
                let statements: Vec<String> = params
                    .get::<Vec<String>>("statements")
                    .ok_or_else(|| {
                        EngineError::Parameter(
                            "transaction requires a 'statements' list".into(),
                        )
                    })?;
                self.durable.execute_transaction(statements).await?
            }
            "save" => {
                self.durable.save_snapshot().await?;
                json!({"ok": true})
            }
            "load" => {
                self.durable.load_snapshot().await?;
                json!({"ok": true})
            }
            other => {
                return Err(EngineError::Parameter(format!(
                    "unknown store operation '{other}'"
                )));
            }
        };
        Ok(RunOutput::default_action(value))
    }
}

pub struct StoreFactory {
    durable: Arc<dyn DurableStore>,
}

impl StoreFactory {
    pub fn new(durable: Arc<dyn DurableStore>) -> Self {
        Self { durable }
    }
}

impl KernelFactory for StoreFactory {
    fn kind(&self) -> &str {
        "store"
    }

    fn configure(&self, _params: &Params) -> Result<Arc<dyn Kernel>> {
        Ok(Arc::new(StoreKernel::new(self.durable.clone())))
    }
}
