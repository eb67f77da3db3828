//! TTL expiry semantics across durable backends, and the store kernel
//! driven through a flow.

use driftflow::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn local_backend_expires_keys() {
    let store = LocalStore::new();
    store
        .set("session", json!({"user": "ada"}), Some(Duration::from_millis(40)))
        .await
        .unwrap();
    assert!(store.get("session").await.is_ok());
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(matches!(
        store.get("session").await,
        Err(EngineError::NotFound(_))
    ));
}

#[cfg(feature = "storage-database")]
#[tokio::test]
async fn database_backend_expires_keys() {
    let store = DatabaseStore::connect("sqlite::memory:").await.unwrap();
    store
        .set("session", json!({"user": "ada"}), Some(Duration::from_secs(1)))
        .await
        .unwrap();
    assert!(store.get("session").await.is_ok());
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(matches!(
        store.get("session").await,
        Err(EngineError::NotFound(_))
    ));
}

#[cfg(feature = "storage-redis")]
#[tokio::test]
#[ignore] // Requires redis server on localhost:6379
async fn redis_backend_expires_keys() {
    let store = RedisStore::with_prefix("redis://127.0.0.1:6379/", "driftflow_ttl_test").unwrap();
    store
        .set("session", json!({"user": "ada"}), Some(Duration::from_secs(1)))
        .await
        .unwrap();
    assert!(store.get("session").await.is_ok());
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(matches!(
        store.get("session").await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn store_kernel_flow_set_increment_query() {
    let flows = Arc::new(InMemoryFlowRegistry::new());
    flows.put_flow(
        "acct",
        "bookkeeping",
        r#"
nodes:
  start:
    type: store
    params:
      operation: set
      key: "orders:1"
      value: {status: "open", total: 40}
    next:
      default: bump
  bump:
    type: store
    params:
      operation: increment
      key: "counters:orders"
    next:
      default: find
  find:
    type: store
    params:
      operation: query
      filter:
        status: "open"
        total: {"$gte": 10}
"#,
    );
    let durable: Arc<dyn DurableStore> = Arc::new(LocalStore::new());
    let scheduler = Scheduler::new(durable.clone());
    let kernels = KernelRegistry::with_builtins(durable.clone(), scheduler);
    let engine = Engine::builder(flows, Arc::new(InMemorySecretVault::new()), Arc::new(kernels))
        .build();

    let id = engine.execute("acct", "bookkeeping", json!({})).await.unwrap();
    let status = loop {
        let status = engine.get_status(&id).await.unwrap();
        if status.status.is_terminal() {
            break status;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    assert_eq!(status.status, ExecutionState::Completed);
    let rows = status.results["result"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["status"], json!("open"));
    // The kernel's writes went through the shared durable handle.
    assert_eq!(durable.get("counters:orders").await.unwrap(), json!(1));
}
