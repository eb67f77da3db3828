//! Execution engine: walks compiled graphs on behalf of tenant accounts.
//!
//! `execute` fetches the flow, compiles it (compiled graphs are cached by
//! body hash and shared across executions), registers the execution as
//! running, and walks the graph on a background task. Each step resolves
//! templates and secrets in the node's params, invokes the kernel under the
//! retry/timeout envelope, commits outputs to the shared context, consults
//! `post`, and follows the successor edge named by the action. An action with
//! no matching edge terminates the branch normally.
//!
//! Fan-out nodes run each successor branch concurrently against a snapshot of
//! the shared context; branch results are merged into `_parallel_results` in
//! declaration order and everything else a branch wrote is discarded
//! (single-writer invariant). The successor wired to the `join` action, when
//! present, continues the walk after the merge.

use crate::collaborators::{ExecutionStore, FlowRegistry, SecretVault};
use crate::compiler::{FlowCompiler, FlowGraph};
use crate::context::SharedContext;
use crate::envelope::Envelope;
use crate::error::{EngineError, Result};
use crate::kernel::KernelRegistry;
use crate::registry::{
    ExecutionHandle, ExecutionLog, ExecutionRegistry, ExecutionState, ExecutionStatus, LogLevel,
};
use crate::scheduler::FlowTrigger;
use crate::template::{self, TemplateScope};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

/// Edge name that continues the walk after a fan-out section.
const JOIN_EDGE: &str = "join";
/// Default per-execution step budget; bounds cycles without recursion limits.
const DEFAULT_MAX_STEPS: usize = 1000;

/// Builder for [`Engine`].
pub struct EngineBuilder {
    flows: Arc<dyn FlowRegistry>,
    secrets: Arc<dyn SecretVault>,
    kernels: Arc<KernelRegistry>,
    execution_store: Option<Arc<dyn ExecutionStore>>,
    max_steps: usize,
}

impl EngineBuilder {
    pub fn execution_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.execution_store = Some(store);
        self
    }

    pub fn max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn build(self) -> Engine {
        Engine {
            inner: Arc::new(EngineInner {
                flows: self.flows,
                secrets: self.secrets,
                registry: Arc::new(ExecutionRegistry::new(self.execution_store)),
                compiler: FlowCompiler::new(self.kernels),
                cache: Mutex::new(HashMap::new()),
                max_steps: self.max_steps,
            }),
        }
    }
}

/// The flow execution engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    flows: Arc<dyn FlowRegistry>,
    secrets: Arc<dyn SecretVault>,
    registry: Arc<ExecutionRegistry>,
    compiler: FlowCompiler,
    cache: Mutex<HashMap<[u8; 32], Arc<FlowGraph>>>,
    max_steps: usize,
}

impl Engine {
    pub fn builder(
        flows: Arc<dyn FlowRegistry>,
        secrets: Arc<dyn SecretVault>,
        kernels: Arc<KernelRegistry>,
    ) -> EngineBuilder {
        EngineBuilder {
            flows,
            secrets,
            kernels,
            execution_store: None,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    /// Start an execution; returns its id immediately, the walk runs in the
    /// background.
    pub async fn execute(&self, account_id: &str, flow_id: &str, input: Value) -> Result<String> {
        let source = self.inner.flows.get_flow(account_id, flow_id).await?;
        let graph = self.inner.compile_cached(&source.yaml)?;

        let execution_id = uuid::Uuid::new_v4().to_string();
        let handle = self
            .inner
            .registry
            .begin(&execution_id, flow_id, account_id);

        let mut shared = SharedContext::from_input(input);
        shared.set_execution_meta(&execution_id, flow_id, account_id);

        let inner = self.inner.clone();
        let account = account_id.to_string();
        tokio::spawn(async move {
            inner.run_execution(graph, shared, handle, account).await;
        });
        Ok(execution_id)
    }

    pub async fn get_status(&self, execution_id: &str) -> Result<ExecutionStatus> {
        self.inner.registry.get(execution_id).await
    }

    pub async fn get_logs(&self, execution_id: &str) -> Result<Vec<ExecutionLog>> {
        self.inner.registry.get_logs(execution_id).await
    }

    pub fn subscribe_to_logs(&self, execution_id: &str) -> Result<mpsc::Receiver<ExecutionLog>> {
        self.inner.registry.subscribe(execution_id)
    }

    pub fn cancel(&self, execution_id: &str, reason: &str) -> Result<()> {
        self.inner.registry.cancel(execution_id, reason)
    }

    pub async fn list_executions(&self, account_id: &str) -> Result<Vec<ExecutionStatus>> {
        self.inner.registry.list(account_id).await
    }

    /// Compile-check a flow document without executing it.
    pub fn validate_flow(&self, yaml: &str) -> Result<Vec<String>> {
        self.inner.compiler.validate(yaml)
    }
}

#[async_trait]
impl FlowTrigger for Engine {
    async fn trigger_flow(&self, account_id: &str, flow_id: &str, input: Value) -> Result<String> {
        self.execute(account_id, flow_id, input).await
    }
}

impl EngineInner {
    fn compile_cached(&self, yaml: &str) -> Result<Arc<FlowGraph>> {
        let digest: [u8; 32] = Sha256::digest(yaml.as_bytes()).into();
        if let Some(graph) = self.cache.lock().get(&digest) {
            return Ok(graph.clone());
        }
        let compiled = self.compiler.compile(yaml)?;
        for warning in &compiled.warnings {
            tracing::warn!(flow = %compiled.graph.metadata.name, "{warning}");
        }
        self.cache.lock().insert(digest, compiled.graph.clone());
        Ok(compiled.graph)
    }

    async fn run_execution(
        self: Arc<Self>,
        graph: Arc<FlowGraph>,
        shared: SharedContext,
        handle: Arc<ExecutionHandle>,
        account_id: String,
    ) {
        let execution_id = handle.id();
        self.registry
            .log(
                &handle,
                ExecutionLog::new(LogLevel::Info, "execution started")
                    .with_data(json!({"flow": graph.metadata.name, "start": graph.start})),
            )
            .await;

        let cancel = handle.cancel_token();
        let steps = Arc::new(AtomicUsize::new(0));
        let start = graph.start.clone();
        let (shared, outcome) = Self::walk(
            self.clone(),
            graph,
            shared,
            start,
            handle.clone(),
            Arc::new(account_id),
            cancel,
            steps,
        )
        .await;

        match outcome {
            Ok(()) => {
                self.registry
                    .log(&handle, ExecutionLog::new(LogLevel::Info, "execution completed"))
                    .await;
                self.registry
                    .finish(
                        &handle,
                        ExecutionState::Completed,
                        None,
                        Some(shared.into_results()),
                    )
                    .await;
                tracing::info!(execution_id = %execution_id, "execution completed");
            }
            Err(EngineError::Canceled) => {
                self.registry
                    .log(&handle, ExecutionLog::new(LogLevel::Warning, "execution canceled"))
                    .await;
                self.registry
                    .finish(
                        &handle,
                        ExecutionState::Canceled,
                        Some("execution canceled".into()),
                        None,
                    )
                    .await;
            }
            Err(error) => {
                self.registry
                    .log(
                        &handle,
                        ExecutionLog::new(LogLevel::Error, error.to_string()),
                    )
                    .await;
                self.registry
                    .finish(&handle, ExecutionState::Failed, Some(error.summary()), None)
                    .await;
                tracing::warn!(execution_id = %execution_id, error = %error, "execution failed");
            }
        }
    }

    /// Walk the graph from `current` until a branch terminates. Owned-in /
    /// owned-out so fan-out branches can run as independent tasks.
    #[allow(clippy::too_many_arguments)]
    fn walk(
        inner: Arc<Self>,
        graph: Arc<FlowGraph>,
        mut shared: SharedContext,
        mut current: String,
        handle: Arc<ExecutionHandle>,
        account_id: Arc<String>,
        cancel: CancellationToken,
        steps: Arc<AtomicUsize>,
    ) -> BoxFuture<'static, (SharedContext, Result<()>)> {
        Box::pin(async move {
            loop {
                if cancel.is_cancelled() {
                    return (shared, Err(EngineError::Canceled));
                }
                let executed = steps.fetch_add(1, Ordering::SeqCst) + 1;
                if executed > inner.max_steps {
                    return (
                        shared,
                        Err(EngineError::Kernel(format!(
                            "maximum execution steps exceeded: {}",
                            inner.max_steps
                        ))),
                    );
                }

                let Some(node) = graph.node(&current) else {
                    return (
                        shared,
                        Err(EngineError::Invariant(format!(
                            "walk reached undeclared node '{current}'"
                        ))),
                    );
                };
                handle.set_current_node(&node.id);
                handle.set_progress(
                    ((executed * 100 / graph.nodes.len().max(1)).min(99)) as u8,
                );
                inner
                    .registry
                    .log(
                        &handle,
                        ExecutionLog::new(LogLevel::Debug, format!("running node '{}'", node.id))
                            .with_node(&node.id),
                    )
                    .await;

                let params = match inner
                    .resolve_params(&shared, &node.params, &account_id)
                    .await
                {
                    Ok(params) => params,
                    Err(e) => return (shared, Err(e)),
                };

                let envelope = Envelope::new(node.retry.max_retries, node.retry.wait)
                    .with_timeout(node.retry.timeout);
                let output = match envelope
                    .invoke(node.kernel.as_ref(), &mut shared, &params, &cancel)
                    .await
                {
                    Ok(output) => output,
                    Err(e) => {
                        if !matches!(e, EngineError::Canceled) {
                            inner
                                .registry
                                .log(
                                    &handle,
                                    ExecutionLog::new(
                                        LogLevel::Error,
                                        format!("node '{}' failed: {e}", node.id),
                                    )
                                    .with_node(&node.id),
                                )
                                .await;
                        }
                        return (shared, Err(e));
                    }
                };

                // Outputs are committed before any successor can observe them.
                shared.commit_result(&node.id, node.kernel.tag(), output.value.clone());

                let action = match node
                    .kernel
                    .post(&mut shared, &params, &output.value)
                    .await
                {
                    Ok(Some(action)) => action,
                    Ok(None) => output.action,
                    Err(e) => return (shared, Err(e)),
                };

                if node.kernel.fan_out() {
                    let branches: Vec<String> = node
                        .successors
                        .iter()
                        .filter(|(edge, _)| edge.as_str() != JOIN_EDGE)
                        .map(|(_, target)| target.clone())
                        .collect();
                    let join_target = node.successor(JOIN_EDGE).map(str::to_string);
                    let max_parallel = node.batch.max_parallel;

                    match Self::run_branches(
                        inner.clone(),
                        graph.clone(),
                        &shared,
                        branches,
                        handle.clone(),
                        account_id.clone(),
                        cancel.clone(),
                        steps.clone(),
                        max_parallel,
                    )
                    .await
                    {
                        Ok(results) => shared.set_parallel_results(results),
                        Err(e) => return (shared, Err(e)),
                    }

                    match join_target {
                        Some(next) => current = next,
                        None => return (shared, Ok(())),
                    }
                    continue;
                }

                match node.successor(action.as_str()) {
                    Some(next) => current = next.to_string(),
                    // No matching edge terminates the branch normally.
                    None => return (shared, Ok(())),
                }
            }
        })
    }

    /// Run fan-out branches concurrently against snapshots of `shared`,
    /// collecting each branch's final result in declaration order.
    #[allow(clippy::too_many_arguments)]
    async fn run_branches(
        inner: Arc<Self>,
        graph: Arc<FlowGraph>,
        shared: &SharedContext,
        branches: Vec<String>,
        handle: Arc<ExecutionHandle>,
        account_id: Arc<String>,
        cancel: CancellationToken,
        steps: Arc<AtomicUsize>,
        max_parallel: Option<usize>,
    ) -> Result<Vec<Value>> {
        let permits = max_parallel.unwrap_or(Semaphore::MAX_PERMITS);
        let semaphore = Arc::new(Semaphore::new(permits));

        let mut tasks = Vec::with_capacity(branches.len());
        for target in branches {
            let snapshot = shared.snapshot();
            let semaphore = semaphore.clone();
            let walk = Self::walk(
                inner.clone(),
                graph.clone(),
                snapshot,
                target,
                handle.clone(),
                account_id.clone(),
                cancel.clone(),
                steps.clone(),
            );
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                walk.await
            }));
        }

        let mut results = Vec::with_capacity(tasks.len());
        let mut failure: Option<EngineError> = None;
        for task in tasks {
            match task.await {
                Ok((branch_shared, Ok(()))) => {
                    results.push(branch_shared.last_result().cloned().unwrap_or(Value::Null));
                }
                Ok((_, Err(e))) => {
                    failure.get_or_insert(e);
                }
                Err(join_error) => {
                    failure.get_or_insert(EngineError::Invariant(format!(
                        "flow execution panicked: {join_error}"
                    )));
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }

    /// Resolve `${SECRET}` references and `{{…}}` templates in node params.
    /// Secret values never reach the logs.
    async fn resolve_params(
        &self,
        shared: &SharedContext,
        params: &crate::params::Params,
        account_id: &str,
    ) -> Result<crate::params::Params> {
        let raw = params.to_value();
        let mut names = Vec::new();
        template::collect_secret_names(&raw, &mut names);
        let mut secrets = HashMap::new();
        for name in names {
            let value = self.secrets.get(account_id, &name).await.map_err(|e| {
                EngineError::Resolution(format!("secret '{name}' unavailable: {e}"))
            })?;
            secrets.insert(name, value);
        }

        let scope = TemplateScope::new()
            .layer(shared.as_map().clone())
            .layer(params.as_map().clone());
        let resolved = template::resolve_value(&raw, &scope, &secrets)?;
        Ok(crate::params::Params::from_value(resolved))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::collaborators::{InMemoryFlowRegistry, InMemorySecretVault};
    use crate::kernel::{FnKernelFactory, Kernel, RunOutput};
    use crate::params::Params;

    struct ConstKernel;

    #[async_trait]
    impl Kernel for ConstKernel {
        fn tag(&self) -> &str {
            "const"
        }

        async fn run(&self, _shared: &mut SharedContext, params: &Params) -> Result<RunOutput> {
            let value = params.get_value("value").cloned().unwrap_or(Value::Null);
            let action = params.get_str("action").unwrap_or("default").to_string();
            Ok(RunOutput::new(Action::new(action), value))
        }
    }

    fn engine_with(yaml: &str) -> Engine {
        let flows = Arc::new(InMemoryFlowRegistry::new());
        flows.put_flow("acct", "flow", yaml);
        let mut kernels = KernelRegistry::new();
        kernels.register(Arc::new(FnKernelFactory::new("const", |_| {
            Ok(Arc::new(ConstKernel) as Arc<dyn Kernel>)
        })));
        Engine::builder(
            flows,
            Arc::new(InMemorySecretVault::new()),
            Arc::new(kernels),
        )
        .build()
    }

    async fn finish(engine: &Engine, id: &str) -> ExecutionStatus {
        for _ in 0..200 {
            let status = engine.get_status(id).await.unwrap();
            if status.status.is_terminal() {
                return status;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("execution did not terminate");
    }

    #[tokio::test]
    async fn unmatched_action_terminates_normally() {
        let engine = engine_with(
            r#"
nodes:
  start:
    type: const
    params: {value: 1, action: "sideways"}
    next:
      forward: other
  other:
    type: const
    params: {value: 2}
"#,
        );
        let id = engine.execute("acct", "flow", json!({})).await.unwrap();
        let status = finish(&engine, &id).await;
        assert_eq!(status.status, ExecutionState::Completed);
        // 'other' never ran; the last result is node start's.
        assert_eq!(status.results["result"], json!(1));
    }

    #[tokio::test]
    async fn step_budget_bounds_cycles() {
        let flows = Arc::new(InMemoryFlowRegistry::new());
        flows.put_flow(
            "acct",
            "loop",
            r#"
nodes:
  start:
    type: const
    params: {value: 1}
    next:
      default: start
"#,
        );
        let mut kernels = KernelRegistry::new();
        kernels.register(Arc::new(FnKernelFactory::new("const", |_| {
            Ok(Arc::new(ConstKernel) as Arc<dyn Kernel>)
        })));
        let engine = Engine::builder(
            flows,
            Arc::new(InMemorySecretVault::new()),
            Arc::new(kernels),
        )
        .max_steps(10)
        .build();

        let id = engine.execute("acct", "loop", json!({})).await.unwrap();
        let status = finish(&engine, &id).await;
        assert_eq!(status.status, ExecutionState::Failed);
        assert!(status.error.as_deref().unwrap().contains("maximum execution steps"));
    }

    #[tokio::test]
    async fn graph_cache_reuses_compilations() {
        let engine = engine_with("nodes:\n  start: {type: const, params: {value: 1}}\n");
        let id1 = engine.execute("acct", "flow", json!({})).await.unwrap();
        finish(&engine, &id1).await;
        let id2 = engine.execute("acct", "flow", json!({})).await.unwrap();
        finish(&engine, &id2).await;
        assert_eq!(engine.inner.cache.lock().len(), 1);
    }

    #[tokio::test]
    async fn unknown_flow_is_not_found() {
        let engine = engine_with("nodes:\n  start: {type: const}\n");
        assert!(matches!(
            engine.execute("acct", "ghost", json!({})).await,
            Err(EngineError::NotFound(_))
        ));
    }
}
