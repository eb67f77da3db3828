//! Cron scheduler: persistent jobs that re-enter the engine on a schedule.
//!
//! Jobs live in the durable adapter under `cron:job:<id>`; per-job execution
//! history is a bounded list (last 100 entries) under `cron:executions:<id>`.
//! On startup the scheduler loads every persisted job and resumes it. On fire
//! it records `last_run_time`, computes and persists the strictly-later
//! `next_run_time`, appends to the history, and triggers the engine through
//! the [`FlowTrigger`] seam (the engine implements it; the indirection keeps
//! the scheduler constructible first).
//!
//! Cron expressions are parsed with `croner`, 5- and 6-field forms.

use crate::durable::DurableStore;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use croner::Cron;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Durable key namespace for job records.
pub const JOB_PREFIX: &str = "cron:job:";
/// Durable key namespace for per-job execution history.
pub const HISTORY_PREFIX: &str = "cron:executions:";
/// History entries retained per job.
const HISTORY_LIMIT: usize = 100;
/// Upper bound on one scheduler sleep; keeps clock drift observable.
const MAX_IDLE_SLEEP: Duration = Duration::from_secs(60);

/// One persistent scheduled job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: String,
    pub schedule: String,
    pub account_id: String,
    pub flow_id: String,
    pub node_id: Option<String>,
    pub payload: Value,
    pub next_run_time: DateTime<Utc>,
    pub last_run_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// The engine seam the scheduler fires into.
#[async_trait]
pub trait FlowTrigger: Send + Sync {
    /// Start an execution; returns the execution id.
    async fn trigger_flow(&self, account_id: &str, flow_id: &str, input: Value) -> Result<String>;
}

/// Parse a 5- or 6-field cron expression.
pub fn parse_schedule(expression: &str) -> Result<Cron> {
    Cron::new(expression)
        .with_seconds_optional()
        .parse()
        .map_err(|e| EngineError::Parameter(format!("invalid cron expression '{expression}': {e}")))
}

/// Next fire time strictly after `after`.
pub fn next_occurrence(expression: &str, after: &DateTime<Utc>) -> Result<DateTime<Utc>> {
    let cron = parse_schedule(expression)?;
    cron.find_next_occurrence(after, false)
        .map_err(|e| EngineError::Parameter(format!("no next occurrence for '{expression}': {e}")))
}

pub struct Scheduler {
    durable: Arc<dyn DurableStore>,
    trigger: RwLock<Option<Arc<dyn FlowTrigger>>>,
    jobs: RwLock<HashMap<String, CronJob>>,
    wake: Notify,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(durable: Arc<dyn DurableStore>) -> Arc<Self> {
        Arc::new(Self {
            durable,
            trigger: RwLock::new(None),
            jobs: RwLock::new(HashMap::new()),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Bind the engine after construction; must happen before jobs fire.
    pub fn set_trigger(&self, trigger: Arc<dyn FlowTrigger>) {
        *self.trigger.write() = Some(trigger);
    }

    /// Load persisted jobs and start the run loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        for key in self.durable.list(JOB_PREFIX).await? {
            match self.durable.get(&key).await {
                Ok(value) => match serde_json::from_value::<CronJob>(value) {
                    Ok(job) => {
                        self.jobs.write().insert(job.id.clone(), job);
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "skipping malformed cron job record");
                    }
                },
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "failed to load cron job");
                }
            }
        }
        let count = self.jobs.read().len();
        if count > 0 {
            tracing::info!(jobs = count, "scheduler resumed persisted jobs");
        }

        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.run_loop().await });
        Ok(())
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Create, persist, and activate a job.
    pub async fn schedule(
        &self,
        account_id: &str,
        flow_id: &str,
        node_id: Option<&str>,
        schedule: &str,
        payload: Value,
    ) -> Result<CronJob> {
        let next_run_time = next_occurrence(schedule, &Utc::now())?;
        let job = CronJob {
            id: uuid::Uuid::new_v4().to_string(),
            schedule: schedule.to_string(),
            account_id: account_id.to_string(),
            flow_id: flow_id.to_string(),
            node_id: node_id.map(str::to_string),
            payload,
            next_run_time,
            last_run_time: None,
            created_at: Utc::now(),
        };
        self.persist_job(&job).await?;
        self.jobs.write().insert(job.id.clone(), job.clone());
        self.wake.notify_one();
        tracing::info!(job_id = %job.id, schedule = %job.schedule, "scheduled cron job");
        Ok(job)
    }

    pub fn list(&self) -> Vec<CronJob> {
        let mut jobs: Vec<CronJob> = self.jobs.read().values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    pub fn get(&self, job_id: &str) -> Result<CronJob> {
        self.jobs
            .read()
            .get(job_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("cron job '{job_id}'")))
    }

    pub async fn delete(&self, job_id: &str) -> Result<()> {
        if self.jobs.write().remove(job_id).is_none() {
            return Err(EngineError::NotFound(format!("cron job '{job_id}'")));
        }
        self.durable.delete(&format!("{JOB_PREFIX}{job_id}")).await?;
        self.wake.notify_one();
        Ok(())
    }

    /// History of recent fires for a job, oldest first.
    pub async fn history(&self, job_id: &str) -> Result<Vec<Value>> {
        match self.durable.get(&format!("{HISTORY_PREFIX}{job_id}")).await {
            Ok(Value::Array(entries)) => Ok(entries),
            Ok(_) => Ok(Vec::new()),
            Err(EngineError::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn persist_job(&self, job: &CronJob) -> Result<()> {
        self.durable
            .set(
                &format!("{JOB_PREFIX}{}", job.id),
                serde_json::to_value(job)?,
                None,
            )
            .await
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            let now = Utc::now();
            let due: Vec<CronJob> = {
                let jobs = self.jobs.read();
                jobs.values()
                    .filter(|job| job.next_run_time <= now)
                    .cloned()
                    .collect()
            };
            for job in due {
                self.fire(job).await;
            }

            let sleep = {
                let jobs = self.jobs.read();
                jobs.values()
                    .map(|job| job.next_run_time)
                    .min()
                    .map(|next| {
                        (next - Utc::now())
                            .to_std()
                            .unwrap_or(Duration::ZERO)
                            .min(MAX_IDLE_SLEEP)
                    })
                    .unwrap_or(MAX_IDLE_SLEEP)
            };
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(sleep) => {}
            }
        }
    }

    async fn fire(&self, mut job: CronJob) {
        let fired_at = Utc::now();
        job.last_run_time = Some(fired_at);
        // Recomputed from now, so successive values are strictly increasing.
        match next_occurrence(&job.schedule, &fired_at) {
            Ok(next) => job.next_run_time = next,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "cannot advance cron schedule, removing job");
                self.jobs.write().remove(&job.id);
                let _ = self.durable.delete(&format!("{JOB_PREFIX}{}", job.id)).await;
                return;
            }
        }
        if let Err(e) = self.persist_job(&job).await {
            tracing::warn!(job_id = %job.id, error = %e, "failed to persist cron job after fire");
        }
        self.jobs.write().insert(job.id.clone(), job.clone());

        let trigger = self.trigger.read().clone();
        let outcome = match trigger {
            Some(trigger) => {
                let mut input = job.payload.clone();
                if let Value::Object(map) = &mut input {
                    if let Some(node_id) = &job.node_id {
                        map.insert("node_id".to_string(), json!(node_id));
                    }
                }
                trigger
                    .trigger_flow(&job.account_id, &job.flow_id, input)
                    .await
            }
            None => Err(EngineError::Invariant("scheduler has no trigger bound".into())),
        };

        let entry = match &outcome {
            Ok(execution_id) => json!({
                "fired_at": fired_at.to_rfc3339(),
                "execution_id": execution_id,
            }),
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "cron fire failed");
                json!({
                    "fired_at": fired_at.to_rfc3339(),
                    "error": e.summary(),
                })
            }
        };
        if let Err(e) = self.append_history(&job.id, entry).await {
            tracing::warn!(job_id = %job.id, error = %e, "failed to record cron history");
        }
    }

    async fn append_history(&self, job_id: &str, entry: Value) -> Result<()> {
        let key = format!("{HISTORY_PREFIX}{job_id}");
        let mut entries = match self.durable.get(&key).await {
            Ok(Value::Array(entries)) => entries,
            Ok(_) | Err(EngineError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        entries.push(entry);
        if entries.len() > HISTORY_LIMIT {
            let excess = entries.len() - HISTORY_LIMIT;
            entries.drain(..excess);
        }
        self.durable.set(&key, Value::Array(entries), None).await
    }
}
