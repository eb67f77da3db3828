//! Cron kernel: flow-level access to the scheduler.
//!
//! Operations: `schedule` (create a persistent job firing this account's
//! target flow), `list`, `get`, and `delete`. The account id comes from the
//! execution's `_execution` annotation so a tenant can only schedule its own
//! flows.

use crate::context::SharedContext;
use crate::error::{EngineError, Result};
use crate::kernel::{Kernel, KernelFactory, RunOutput};
use crate::params::Params;
use crate::scheduler::Scheduler;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;

pub struct CronKernel {
    scheduler: Arc<Scheduler>,
}

impl CronKernel {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }
}

fn account_of(shared: &SharedContext) -> Result<String> {
    shared
        .execution_meta()
        .and_then(|meta| meta.get("account_id"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| EngineError::Invariant("execution has no account annotation".into()))
}

#[async_trait]
impl Kernel for CronKernel {
    fn tag(&self) -> &str {
        "cron"
    }

    async fn run(&self, shared: &mut SharedContext, params: &Params) -> Result<RunOutput> {
        let operation = params.require_str("operation")?;
        let value = match operation {
            "schedule" => {
                let schedule = params.require_str("schedule")?;
                let flow_id = params.require_str("flow_id")?;
                let node_id = params.get_str("node_id");
                let payload = params.get_value("payload").cloned().unwrap_or(json!({}));
                let account_id = account_of(shared)?;
                let job = self
                    .scheduler
                    .schedule(&account_id, flow_id, node_id, schedule, payload)
                    .await?;
                serde_json::to_value(job)?
            }
            "list" => serde_json::to_value(self.scheduler.list())?,
            "get" => {
                let job_id = params.require_str("job_id")?;
                serde_json::to_value(self.scheduler.get(job_id)?)?
            }
            "delete" => {
                let job_id = params.require_str("job_id")?;
                self.scheduler.delete(job_id).await?;
                json!({"ok": true, "job_id": job_id})
            }
            other => {
                return Err(EngineError::Parameter(format!(
                    "unknown cron operation '{other}'"
                )));
            }
        };
        Ok(RunOutput::default_action(value))
    }
}

pub struct CronFactory {
    scheduler: Arc<Scheduler>,
}

impl CronFactory {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }
}

impl KernelFactory for CronFactory {
    fn kind(&self) -> &str {
        "cron"
    }

    fn configure(&self, _params: &Params) -> Result<Arc<dyn Kernel>> {
        Ok(Arc::new(CronKernel::new(self.scheduler.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::LocalStore;

    fn fixture() -> (CronKernel, SharedContext) {
        let scheduler = Scheduler::new(Arc::new(LocalStore::new()));
        let mut shared = SharedContext::new();
        shared.set_execution_meta("e1", "f1", "acct");
        (CronKernel::new(scheduler), shared)
    }

    #[tokio::test]
    async fn schedule_then_get_then_delete() {
        let (kernel, mut shared) = fixture();
        let params = Params::from_value(json!({
            "operation": "schedule",
            "schedule": "0 6 * * *",
            "flow_id": "nightly",
            "payload": {"mode": "full"},
        }));
        let out = kernel.run(&mut shared, &params).await.unwrap();
        let job_id = out.value["id"].as_str().unwrap().to_string();
        assert_eq!(out.value["account_id"], json!("acct"));

        let got = kernel
            .run(
                &mut shared,
                &Params::from_value(json!({"operation": "get", "job_id": job_id})),
            )
            .await
            .unwrap();
        assert_eq!(got.value["flow_id"], json!("nightly"));

        let listed = kernel
            .run(&mut shared, &Params::from_value(json!({"operation": "list"})))
            .await
            .unwrap();
        assert_eq!(listed.value.as_array().unwrap().len(), 1);

        kernel
            .run(
                &mut shared,
                &Params::from_value(json!({"operation": "delete", "job_id": job_id})),
            )
            .await
            .unwrap();
        let listed = kernel
            .run(&mut shared, &Params::from_value(json!({"operation": "list"})))
            .await
            .unwrap();
        assert!(listed.value.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn bad_schedule_is_rejected() {
        let (kernel, mut shared) = fixture();
        let params = Params::from_value(json!({
            "operation": "schedule",
            "schedule": "whenever",
            "flow_id": "nightly",
        }));
        assert!(matches!(
            kernel.run(&mut shared, &params).await,
            Err(EngineError::Parameter(_))
        ));
    }

    #[tokio::test]
    async fn missing_account_annotation_is_invariant_error() {
        let scheduler = Scheduler::new(Arc::new(LocalStore::new()));
        let kernel = CronKernel::new(scheduler);
        let mut shared = SharedContext::new();
        let params = Params::from_value(json!({
            "operation": "schedule",
            "schedule": "* * * * *",
            "flow_id": "f",
        }));
        assert!(matches!(
            kernel.run(&mut shared, &params).await,
            Err(EngineError::Invariant(_))
        ));
    }
}
