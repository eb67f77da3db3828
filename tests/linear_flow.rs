//! End-to-end: a linear http → transform flow.

use driftflow::prelude::*;
use serde_json::json;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

fn engine_with_flow(flow_id: &str, yaml: &str) -> Engine {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let flows = Arc::new(InMemoryFlowRegistry::new());
    flows.put_flow("acct", flow_id, yaml);
    let durable: Arc<dyn DurableStore> = Arc::new(LocalStore::new());
    let scheduler = Scheduler::new(durable.clone());
    let kernels = KernelRegistry::with_builtins(durable, scheduler);
    Engine::builder(flows, Arc::new(InMemorySecretVault::new()), Arc::new(kernels))
        .execution_store(Arc::new(InMemoryExecutionStore::new()))
        .build()
}

async fn wait_terminal(engine: &Engine, id: &str) -> ExecutionStatus {
    for _ in 0..400 {
        let status = engine.get_status(id).await.unwrap();
        if status.status.is_terminal() {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("execution {id} did not terminate");
}

/// Loopback server answering `count` requests with one canned JSON response.
fn serve_json(count: usize, body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        for _ in 0..count {
            let Ok((mut stream, _)) = listener.accept() else { break };
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf);
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes());
        }
    });
    format!("http://{addr}/")
}

#[tokio::test]
async fn linear_http_then_transform() {
    let url = serve_json(1, r#"{"n": 2}"#);
    let yaml = format!(
        r#"
metadata:
  name: linear
nodes:
  start:
    type: http
    params:
      url: "{url}"
    next:
      success: end
  end:
    type: transform
    params:
      script: "input.body.n * 21"
"#
    );
    let engine = engine_with_flow("linear", &yaml);
    let id = engine.execute("acct", "linear", json!({})).await.unwrap();
    let status = wait_terminal(&engine, &id).await;

    assert_eq!(status.status, ExecutionState::Completed);
    assert_eq!(status.progress, 100);
    assert!(status.end_time.is_some());
    assert_eq!(status.results["result"], json!(42));
    // The http node's own output stays addressable.
    assert_eq!(status.results["http_result"]["status_code"], json!(200));

    let logs = engine.get_logs(&id).await.unwrap();
    assert!(logs.iter().any(|l| l.message.contains("execution started")));
    assert!(logs.iter().any(|l| l.node_id.as_deref() == Some("end")));
}

#[tokio::test]
async fn non_parallel_flows_are_deterministic() {
    let yaml = r#"
nodes:
  start:
    type: transform
    params:
      script: "let base = { n: input.seed * 3 }; merge(base, { tag: \"fixed\" })"
    next:
      default: shape
  shape:
    type: transform
    params:
      script: "{ doubled: input.n * 2, tag: input.tag }"
"#;
    let engine = engine_with_flow("det", yaml);

    let first = {
        let id = engine.execute("acct", "det", json!({"seed": 7})).await.unwrap();
        wait_terminal(&engine, &id).await.results
    };
    let second = {
        let id = engine.execute("acct", "det", json!({"seed": 7})).await.unwrap();
        wait_terminal(&engine, &id).await.results
    };
    assert_eq!(first, second);
    assert_eq!(first["result"], json!({"doubled": 42, "tag": "fixed"}));
}

#[tokio::test]
async fn templates_and_secrets_resolve_in_params() {
    let url_base = serve_json(1, r#"{"ok": true}"#);
    let yaml = r#"
nodes:
  start:
    type: transform
    params:
      script: "{ path: \"health\" }"
    next:
      default: fetch
  fetch:
    type: http
    params:
      url: "{{base}}{{result.path}}"
      headers:
        x-api-key: "${SERVICE_KEY}"
"#;
    let flows = Arc::new(InMemoryFlowRegistry::new());
    flows.put_flow("acct", "templated", yaml);
    let secrets = Arc::new(InMemorySecretVault::new());
    secrets.put_secret("acct", "SERVICE_KEY", "shh");
    let durable: Arc<dyn DurableStore> = Arc::new(LocalStore::new());
    let scheduler = Scheduler::new(durable.clone());
    let kernels = KernelRegistry::with_builtins(durable, scheduler);
    let engine = Engine::builder(flows, secrets, Arc::new(kernels)).build();

    let id = engine
        .execute("acct", "templated", json!({"base": url_base}))
        .await
        .unwrap();
    let status = wait_terminal(&engine, &id).await;
    assert_eq!(status.status, ExecutionState::Completed);
    assert_eq!(status.results["http_result"]["status_code"], json!(200));
}

#[tokio::test]
async fn missing_secret_fails_with_resolution_error() {
    let yaml = r#"
nodes:
  start:
    type: http
    params:
      url: "http://127.0.0.1:1/"
      headers:
        authorization: "Bearer ${NO_SUCH_SECRET}"
"#;
    let engine = engine_with_flow("sec", yaml);
    let id = engine.execute("acct", "sec", json!({})).await.unwrap();
    let status = wait_terminal(&engine, &id).await;
    assert_eq!(status.status, ExecutionState::Failed);
    let error = status.error.unwrap();
    assert!(error.contains("NO_SUCH_SECRET"));
    // The secret value cannot leak; only its name may appear.
    assert!(!error.contains("shh"));
}
