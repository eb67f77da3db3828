//! Scheduler end-to-end: a persisted cron job re-enters the engine.

use driftflow::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn cron_job_fires_the_target_flow() {
    let flows = Arc::new(InMemoryFlowRegistry::new());
    flows.put_flow(
        "acct",
        "tick",
        r#"
nodes:
  start:
    type: transform
    params:
      script: "merge(input, { ticked: true })"
"#,
    );

    let durable: Arc<dyn DurableStore> = Arc::new(LocalStore::new());
    let scheduler = Scheduler::new(durable.clone());
    let kernels = KernelRegistry::with_builtins(durable.clone(), scheduler.clone());
    let engine = Engine::builder(flows, Arc::new(InMemorySecretVault::new()), Arc::new(kernels))
        .execution_store(Arc::new(InMemoryExecutionStore::new()))
        .build();
    scheduler.set_trigger(Arc::new(engine.clone()));
    scheduler.start().await.unwrap();

    // Six-field expression: every second.
    let job = scheduler
        .schedule("acct", "tick", None, "* * * * * *", json!({"source": "cron"}))
        .await
        .unwrap();

    // Wait for at least one fire.
    let mut history = Vec::new();
    for _ in 0..60 {
        history = scheduler.history(&job.id).await.unwrap();
        if !history.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    scheduler.shutdown();
    assert!(!history.is_empty(), "cron job never fired");
    let execution_id = history[0]["execution_id"].as_str().unwrap().to_string();

    // The triggered execution ran the flow with the job payload as input.
    let status = loop {
        let status = engine.get_status(&execution_id).await.unwrap();
        if status.status.is_terminal() {
            break status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(status.status, ExecutionState::Completed);
    assert_eq!(status.results["result"]["source"], json!("cron"));
    assert_eq!(status.results["result"]["ticked"], json!(true));

    // The job record advanced.
    let updated = scheduler.get(&job.id).unwrap();
    assert!(updated.last_run_time.is_some());
    assert!(updated.next_run_time > updated.last_run_time.unwrap());

    let listed = engine.list_executions("acct").await.unwrap();
    assert!(listed.iter().any(|s| s.id == execution_id));
}

#[tokio::test]
async fn cron_kernel_schedules_jobs_from_a_flow() {
    let flows = Arc::new(InMemoryFlowRegistry::new());
    flows.put_flow(
        "acct",
        "installer",
        r#"
nodes:
  start:
    type: cron
    params:
      operation: schedule
      schedule: "0 3 * * *"
      flow_id: nightly-report
      payload: {scope: "all"}
"#,
    );

    let durable: Arc<dyn DurableStore> = Arc::new(LocalStore::new());
    let scheduler = Scheduler::new(durable.clone());
    let kernels = KernelRegistry::with_builtins(durable, scheduler.clone());
    let engine = Engine::builder(flows, Arc::new(InMemorySecretVault::new()), Arc::new(kernels))
        .build();

    let id = engine.execute("acct", "installer", json!({})).await.unwrap();
    let status = loop {
        let status = engine.get_status(&id).await.unwrap();
        if status.status.is_terminal() {
            break status;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    assert_eq!(status.status, ExecutionState::Completed);
    let jobs = scheduler.list();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].flow_id, "nightly-report");
    assert_eq!(jobs[0].account_id, "acct");
    assert_eq!(jobs[0].payload, json!({"scope": "all"}));
}
