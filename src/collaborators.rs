//! Contracts for external collaborators consumed by the core.
//!
//! The gateway, tenant service, flow registry, secret vault, and execution
//! store live outside this crate; the engine only sees the narrow traits
//! here. In-memory implementations ship alongside so the engine runs without
//! external services, which is also how the test suite drives it.

use crate::error::{EngineError, Result};
use crate::registry::{ExecutionLog, ExecutionStatus};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// A stored flow definition: id plus the YAML body.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowSource {
    pub id: String,
    pub yaml: String,
}

/// Read access to tenant flow definitions.
#[async_trait]
pub trait FlowRegistry: Send + Sync {
    async fn get_flow(&self, account_id: &str, flow_id: &str) -> Result<FlowSource>;
}

/// Read access to tenant secrets. Returned values must never reach logs.
#[async_trait]
pub trait SecretVault: Send + Sync {
    async fn get(&self, account_id: &str, name: &str) -> Result<String>;
}

/// Durable persistence for execution status and logs. All writes are
/// best-effort from the engine's perspective.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn save_execution(&self, status: &ExecutionStatus) -> Result<()>;
    async fn get_execution(&self, execution_id: &str) -> Result<ExecutionStatus>;
    async fn list_executions(&self, account_id: &str) -> Result<Vec<ExecutionStatus>>;
    async fn save_execution_log(&self, execution_id: &str, log: &ExecutionLog) -> Result<()>;
    async fn get_execution_logs(&self, execution_id: &str) -> Result<Vec<ExecutionLog>>;
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

/// Flow registry backed by a map of `(account, flow-id) → yaml`.
#[derive(Default)]
pub struct InMemoryFlowRegistry {
    flows: RwLock<HashMap<(String, String), String>>,
}

impl InMemoryFlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_flow(&self, account_id: &str, flow_id: &str, yaml: &str) {
        self.flows.write().insert(
            (account_id.to_string(), flow_id.to_string()),
            yaml.to_string(),
        );
    }
}

#[async_trait]
impl FlowRegistry for InMemoryFlowRegistry {
    async fn get_flow(&self, account_id: &str, flow_id: &str) -> Result<FlowSource> {
        let flows = self.flows.read();
        flows
            .get(&(account_id.to_string(), flow_id.to_string()))
            .map(|yaml| FlowSource {
                id: flow_id.to_string(),
                yaml: yaml.clone(),
            })
            .ok_or_else(|| {
                EngineError::NotFound(format!("flow '{flow_id}' for account '{account_id}'"))
            })
    }
}

/// Secret vault backed by a per-account map.
#[derive(Default)]
pub struct InMemorySecretVault {
    secrets: RwLock<HashMap<(String, String), String>>,
}

impl InMemorySecretVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_secret(&self, account_id: &str, name: &str, value: &str) {
        self.secrets.write().insert(
            (account_id.to_string(), name.to_string()),
            value.to_string(),
        );
    }
}

#[async_trait]
impl SecretVault for InMemorySecretVault {
    async fn get(&self, account_id: &str, name: &str) -> Result<String> {
        let secrets = self.secrets.read();
        secrets
            .get(&(account_id.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| {
                EngineError::NotFound(format!("secret '{name}' for account '{account_id}'"))
            })
    }
}

/// Execution store keeping statuses and append-only logs in memory.
#[derive(Default)]
pub struct InMemoryExecutionStore {
    executions: RwLock<HashMap<String, ExecutionStatus>>,
    logs: RwLock<HashMap<String, Vec<ExecutionLog>>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn save_execution(&self, status: &ExecutionStatus) -> Result<()> {
        self.executions
            .write()
            .insert(status.id.clone(), status.clone());
        Ok(())
    }

    async fn get_execution(&self, execution_id: &str) -> Result<ExecutionStatus> {
        self.executions
            .read()
            .get(execution_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("execution '{execution_id}'")))
    }

    async fn list_executions(&self, account_id: &str) -> Result<Vec<ExecutionStatus>> {
        Ok(self
            .executions
            .read()
            .values()
            .filter(|status| status.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn save_execution_log(&self, execution_id: &str, log: &ExecutionLog) -> Result<()> {
        self.logs
            .write()
            .entry(execution_id.to_string())
            .or_default()
            .push(log.clone());
        Ok(())
    }

    async fn get_execution_logs(&self, execution_id: &str) -> Result<Vec<ExecutionLog>> {
        Ok(self
            .logs
            .read()
            .get(execution_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn flow_registry_lookup() {
        let registry = InMemoryFlowRegistry::new();
        registry.put_flow("acct", "f1", "nodes: {}");
        let source = registry.get_flow("acct", "f1").await.unwrap();
        assert_eq!(source.id, "f1");
        assert!(registry.get_flow("acct", "missing").await.is_err());
        assert!(registry.get_flow("other", "f1").await.is_err());
    }

    #[tokio::test]
    async fn vault_is_account_scoped() {
        let vault = InMemorySecretVault::new();
        vault.put_secret("acct", "API_KEY", "abc");
        assert_eq!(vault.get("acct", "API_KEY").await.unwrap(), "abc");
        assert!(vault.get("intruder", "API_KEY").await.is_err());
    }
}
