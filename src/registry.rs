//! Execution registry: live status, logs, subscribers, cancellation.
//!
//! Every running execution has a handle here carrying its status record, its
//! cancel token, and its log subscribers. Terminal statuses are written once
//! and never regress; after termination the execution leaves the active map
//! and is served from the durable execution store, when one is configured.
//!
//! Log fan-out is best-effort: a subscriber whose buffer is full loses the
//! message rather than blocking the producer. Persistence of statuses and
//! logs is equally best-effort; a failing store is logged and ignored.

use crate::collaborators::ExecutionStore;
use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Buffered log entries per subscriber before drops begin.
const LOG_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle state of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Running,
    Completed,
    Failed,
    Canceled,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionState::Running)
    }
}

/// Externally visible status record for one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub id: String,
    pub flow_id: String,
    pub account_id: String,
    pub status: ExecutionState,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// 0..=100; reaches 100 exactly when the execution completes.
    pub progress: u8,
    pub current_node: Option<String>,
    pub results: Value,
}

/// Severity of one execution log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// One append-only log record scoped to an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub timestamp: DateTime<Utc>,
    pub node_id: Option<String>,
    pub level: LogLevel,
    pub message: String,
    pub data: Option<Value>,
}

impl ExecutionLog {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            node_id: None,
            level,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Live state for one execution: status record, cancel token, subscribers.
pub struct ExecutionHandle {
    status: RwLock<ExecutionStatus>,
    cancel: CancellationToken,
    subscribers: Mutex<Vec<mpsc::Sender<ExecutionLog>>>,
}

impl ExecutionHandle {
    fn new(id: &str, flow_id: &str, account_id: &str) -> Self {
        Self {
            status: RwLock::new(ExecutionStatus {
                id: id.to_string(),
                flow_id: flow_id.to_string(),
                account_id: account_id.to_string(),
                status: ExecutionState::Running,
                start_time: Utc::now(),
                end_time: None,
                error: None,
                progress: 0,
                current_node: None,
                results: Value::Null,
            }),
            cancel: CancellationToken::new(),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> String {
        self.status.read().id.clone()
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status.read().clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn set_current_node(&self, node_id: &str) {
        self.status.write().current_node = Some(node_id.to_string());
    }

    /// Advance progress monotonically; terminal transitions pin it.
    pub fn set_progress(&self, progress: u8) {
        let mut status = self.status.write();
        if !status.status.is_terminal() && progress > status.progress {
            status.progress = progress.min(99);
        }
    }

    /// Write a terminal state once. Returns false if already terminal.
    fn transition(
        &self,
        state: ExecutionState,
        error: Option<String>,
        results: Option<Value>,
    ) -> bool {
        let mut status = self.status.write();
        if status.status.is_terminal() {
            return false;
        }
        status.status = state;
        status.end_time = Some(Utc::now());
        status.error = error;
        status.current_node = None;
        if state == ExecutionState::Completed {
            status.progress = 100;
        }
        if let Some(results) = results {
            status.results = results;
        }
        true
    }

    fn fan_out(&self, log: &ExecutionLog) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sender| match sender.try_send(log.clone()) {
            Ok(()) => true,
            // Slow subscriber: drop the message, keep the channel.
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    fn close_subscribers(&self) {
        self.subscribers.lock().clear();
    }
}

/// Tracks every active execution and serves status/log reads.
pub struct ExecutionRegistry {
    active: RwLock<HashMap<String, Arc<ExecutionHandle>>>,
    store: Option<Arc<dyn ExecutionStore>>,
}

impl ExecutionRegistry {
    pub fn new(store: Option<Arc<dyn ExecutionStore>>) -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Register a new running execution and return its handle.
    pub fn begin(&self, id: &str, flow_id: &str, account_id: &str) -> Arc<ExecutionHandle> {
        let handle = Arc::new(ExecutionHandle::new(id, flow_id, account_id));
        self.active.write().insert(id.to_string(), handle.clone());
        self.persist_status(&handle.status());
        handle
    }

    /// Live status if active, else the durable record.
    pub async fn get(&self, execution_id: &str) -> Result<ExecutionStatus> {
        if let Some(handle) = self.active.read().get(execution_id) {
            return Ok(handle.status());
        }
        match &self.store {
            Some(store) => store.get_execution(execution_id).await,
            None => Err(EngineError::NotFound(format!("execution '{execution_id}'"))),
        }
    }

    /// Persisted logs; empty when no store is configured.
    pub async fn get_logs(&self, execution_id: &str) -> Result<Vec<ExecutionLog>> {
        match &self.store {
            Some(store) => store.get_execution_logs(execution_id).await,
            None => Ok(Vec::new()),
        }
    }

    /// Bounded channel receiving subsequent log entries. Closed when the
    /// execution terminates.
    pub fn subscribe(&self, execution_id: &str) -> Result<mpsc::Receiver<ExecutionLog>> {
        let active = self.active.read();
        let handle = active
            .get(execution_id)
            .filter(|handle| !handle.status.read().status.is_terminal())
            .ok_or_else(|| EngineError::NotActive(format!("execution '{execution_id}'")))?;
        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        handle.subscribers.lock().push(tx);
        Ok(rx)
    }

    /// Record one log entry: fan out to subscribers, persist best-effort.
    pub async fn log(&self, handle: &ExecutionHandle, log: ExecutionLog) {
        handle.fan_out(&log);
        if let Some(store) = &self.store {
            let id = handle.id();
            if let Err(e) = store.save_execution_log(&id, &log).await {
                tracing::warn!(execution_id = %id, error = %e, "failed to persist execution log");
            }
        }
    }

    /// Signal cancellation. Fails with "not active" when the execution is
    /// unknown or already terminal.
    pub fn cancel(&self, execution_id: &str, reason: &str) -> Result<()> {
        let handle = {
            let active = self.active.read();
            active.get(execution_id).cloned()
        }
        .ok_or_else(|| EngineError::NotActive(format!("execution '{execution_id}'")))?;

        if !handle.transition(ExecutionState::Canceled, Some(reason.to_string()), None) {
            return Err(EngineError::NotActive(format!("execution '{execution_id}'")));
        }
        handle.cancel.cancel();
        self.persist_status(&handle.status());
        Ok(())
    }

    /// Terminal transition driven by the execution's worker. Safe to call
    /// after an external cancel; the first terminal state wins.
    pub async fn finish(
        &self,
        handle: &Arc<ExecutionHandle>,
        state: ExecutionState,
        error: Option<String>,
        results: Option<Value>,
    ) {
        handle.transition(state, error, results);
        let status = handle.status();
        handle.close_subscribers();
        // With no durable store the record stays in the map so status reads
        // keep working; otherwise the durable copy takes over.
        if let Some(store) = &self.store {
            if let Err(e) = store.save_execution(&status).await {
                tracing::warn!(execution_id = %status.id, error = %e, "failed to persist execution status");
            }
            self.active.write().remove(&status.id);
        }
    }

    /// Union of active and durable records for one account, deduplicated by
    /// id with the live record winning.
    pub async fn list(&self, account_id: &str) -> Result<Vec<ExecutionStatus>> {
        let mut by_id: HashMap<String, ExecutionStatus> = HashMap::new();
        if let Some(store) = &self.store {
            for status in store.list_executions(account_id).await? {
                by_id.insert(status.id.clone(), status);
            }
        }
        for handle in self.active.read().values() {
            let status = handle.status();
            if status.account_id == account_id {
                by_id.insert(status.id.clone(), status);
            }
        }
        let mut all: Vec<ExecutionStatus> = by_id.into_values().collect();
        all.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(all)
    }

    fn persist_status(&self, status: &ExecutionStatus) {
        if let Some(store) = &self.store {
            let store = store.clone();
            let status = status.clone();
            if tokio::runtime::Handle::try_current().is_ok() {
                tokio::spawn(async move {
                    if let Err(e) = store.save_execution(&status).await {
                        tracing::warn!(execution_id = %status.id, error = %e, "failed to persist execution status");
                    }
                });
            }
        }
    }
}
