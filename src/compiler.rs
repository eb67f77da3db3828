//! YAML flow compiler.
//!
//! Turns a flow document into an immutable [`FlowGraph`]: node ids mapped to
//! configured kernels, retry policy, batch policy, and action-labeled
//! successor edges. Validation accumulates every problem it finds instead of
//! stopping at the first; unreachable nodes are reported as warnings, not
//! errors. Params are *not* evaluated here: `{{…}}` templates are preserved
//! verbatim and resolved at each step.
//!
//! The start node is `nodes.start` when declared, otherwise the first node in
//! document order. Cycles are allowed (loops are bounded at run time by the
//! engine's step budget).

use crate::error::{EngineError, Result, ValidationReport};
use crate::kernel::{Kernel, KernelRegistry};
use crate::params::{Params, parse_duration};
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Flow document header; opaque to the engine.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FlowMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Deserialize)]
struct FlowDocument {
    #[serde(default)]
    metadata: FlowMetadata,
    #[serde(default)]
    nodes: IndexMap<String, NodeSpec>,
}

#[derive(Debug, Deserialize)]
struct NodeSpec {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    retry: Option<RetrySpec>,
    #[serde(default)]
    batch: Option<BatchSpec>,
    #[serde(default)]
    next: IndexMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RetrySpec {
    #[serde(default)]
    max_retries: i64,
    #[serde(default)]
    wait: Option<String>,
    #[serde(default)]
    timeout: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BatchSpec {
    #[serde(default)]
    max_parallel: Option<i64>,
}

/// Bounded-retry policy attached to one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub wait: Duration,
    pub timeout: Option<Duration>,
}

/// Fan-out bound for split nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchPolicy {
    pub max_parallel: Option<usize>,
}

/// One compiled node: a configured kernel plus routing.
pub struct GraphNode {
    pub id: String,
    pub kind: String,
    pub kernel: Arc<dyn Kernel>,
    pub params: Params,
    pub retry: RetryPolicy,
    pub batch: BatchPolicy,
    /// Action name → successor node id, in declaration order.
    pub successors: IndexMap<String, String>,
}

impl std::fmt::Debug for GraphNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphNode")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("params", &self.params)
            .field("retry", &self.retry)
            .field("batch", &self.batch)
            .field("successors", &self.successors)
            .finish()
    }
}

impl GraphNode {
    pub fn successor(&self, action: &str) -> Option<&str> {
        self.successors.get(action).map(String::as_str)
    }
}

/// Immutable compiled flow, shared by reference across concurrent executions.
#[derive(Debug)]
pub struct FlowGraph {
    pub metadata: FlowMetadata,
    pub start: String,
    pub nodes: IndexMap<String, GraphNode>,
}

impl FlowGraph {
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.get(id)
    }
}

/// Compilation result: the graph plus non-fatal findings.
#[derive(Debug)]
pub struct CompiledFlow {
    pub graph: Arc<FlowGraph>,
    pub warnings: Vec<String>,
}

/// Compiles YAML flow documents against a kernel registry.
pub struct FlowCompiler {
    registry: Arc<KernelRegistry>,
}

impl FlowCompiler {
    pub fn new(registry: Arc<KernelRegistry>) -> Self {
        Self { registry }
    }

    /// Compile a document, accumulating every problem found.
    pub fn compile(&self, yaml: &str) -> Result<CompiledFlow> {
        let document: FlowDocument = serde_yaml::from_str(yaml).map_err(|e| {
            let mut report = ValidationReport::default();
            report.error(format!("invalid YAML: {e}"));
            EngineError::Validation(report)
        })?;

        let mut report = ValidationReport::default();
        if document.nodes.is_empty() {
            report.error("flow declares no nodes");
            return Err(EngineError::Validation(report));
        }

        let declared: HashSet<&str> = document.nodes.keys().map(String::as_str).collect();
        let start = if document.nodes.contains_key("start") {
            "start".to_string()
        } else {
            // First declared node, preserved by the ordered document model.
            document.nodes.keys().next().cloned().unwrap_or_default()
        };

        let mut nodes: IndexMap<String, GraphNode> = IndexMap::new();
        for (id, spec) in &document.nodes {
            let mut retry = RetryPolicy::default();
            if let Some(retry_spec) = &spec.retry {
                if retry_spec.max_retries < 0 {
                    report.error(format!(
                        "node '{id}': retry.max_retries must be >= 0, got {}",
                        retry_spec.max_retries
                    ));
                } else {
                    retry.max_retries = retry_spec.max_retries as u32;
                }
                if let Some(wait) = &retry_spec.wait {
                    match parse_duration(wait) {
                        Ok(parsed) => retry.wait = parsed,
                        Err(_) => {
                            report.error(format!("node '{id}': retry.wait '{wait}' is not a duration"));
                        }
                    }
                }
                if let Some(timeout) = &retry_spec.timeout {
                    match parse_duration(timeout) {
                        Ok(parsed) => retry.timeout = Some(parsed),
                        Err(_) => {
                            report.error(format!(
                                "node '{id}': retry.timeout '{timeout}' is not a duration"
                            ));
                        }
                    }
                }
            }

            let mut batch = BatchPolicy::default();
            if let Some(batch_spec) = &spec.batch {
                match batch_spec.max_parallel {
                    Some(n) if n >= 1 => batch.max_parallel = Some(n as usize),
                    Some(n) => {
                        report.error(format!("node '{id}': batch.max_parallel must be >= 1, got {n}"));
                    }
                    None => {}
                }
            }

            for (action, target) in &spec.next {
                if !declared.contains(target.as_str()) {
                    report.error(format!(
                        "node '{id}': edge '{action}' points to undeclared node '{target}'"
                    ));
                }
            }

            let params = Params::from_value(spec.params.clone().unwrap_or(Value::Null));
            if !self.registry.contains(&spec.kind) {
                report.error(format!("node '{id}': unknown kernel type '{}'", spec.kind));
                continue;
            }
            match self.registry.configure(&spec.kind, &params) {
                Ok(kernel) => {
                    nodes.insert(
                        id.clone(),
                        GraphNode {
                            id: id.clone(),
                            kind: spec.kind.clone(),
                            kernel,
                            params,
                            retry,
                            batch,
                            successors: spec.next.clone(),
                        },
                    );
                }
                Err(e) => {
                    report.error(format!("node '{id}': configuration failed: {e}"));
                }
            }
        }

        if report.is_fatal() {
            return Err(EngineError::Validation(report));
        }

        for id in unreachable_nodes(&nodes, &start) {
            report.warning(format!("node '{id}' is unreachable from '{start}'"));
        }

        Ok(CompiledFlow {
            graph: Arc::new(FlowGraph {
                metadata: document.metadata,
                start,
                nodes,
            }),
            warnings: report.warnings,
        })
    }

    /// Validate without keeping the graph; returns warnings on success.
    pub fn validate(&self, yaml: &str) -> Result<Vec<String>> {
        self.compile(yaml).map(|compiled| compiled.warnings)
    }
}

fn unreachable_nodes(nodes: &IndexMap<String, GraphNode>, start: &str) -> Vec<String> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut frontier = vec![start];
    while let Some(id) = frontier.pop() {
        if !seen.insert(id) {
            continue;
        }
        if let Some(node) = nodes.get(id) {
            for target in node.successors.values() {
                frontier.push(target);
            }
        }
    }
    nodes
        .keys()
        .filter(|id| !seen.contains(id.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::context::SharedContext;
    use crate::kernel::{FnKernelFactory, RunOutput};
    use async_trait::async_trait;
    use serde_json::json;

    struct NoopKernel;

    #[async_trait]
    impl Kernel for NoopKernel {
        fn tag(&self) -> &str {
            "noop"
        }

        async fn run(&self, _shared: &mut SharedContext, _params: &Params) -> Result<RunOutput> {
            Ok(RunOutput::new(Action::default_action(), json!(null)))
        }
    }

    fn test_registry() -> Arc<KernelRegistry> {
        let mut registry = KernelRegistry::new();
        for kind in ["http", "transform", "wait"] {
            registry.register(Arc::new(FnKernelFactory::new(kind, |_params| {
                Ok(Arc::new(NoopKernel) as Arc<dyn Kernel>)
            })));
        }
        Arc::new(registry)
    }

    #[test]
    fn compiles_a_linear_flow() {
        let yaml = r#"
metadata:
  name: fetch-and-shape
  version: "1.0"
nodes:
  start:
    type: http
    params:
      url: "https://api.example.com/{{path}}"
    retry:
      max_retries: 2
      wait: 10ms
    next:
      success: shape
  shape:
    type: transform
    params:
      script: "input.body"
"#;
        let compiled = FlowCompiler::new(test_registry()).compile(yaml).unwrap();
        let graph = &compiled.graph;
        assert_eq!(graph.start, "start");
        assert_eq!(graph.metadata.name, "fetch-and-shape");
        assert_eq!(graph.nodes.len(), 2);

        let start = graph.node("start").unwrap();
        assert_eq!(start.retry.max_retries, 2);
        assert_eq!(start.retry.wait, Duration::from_millis(10));
        assert_eq!(start.successor("success"), Some("shape"));
        assert_eq!(start.successor("client_error"), None);
        // Templates are preserved, not evaluated.
        assert_eq!(
            start.params.get_str("url"),
            Some("https://api.example.com/{{path}}")
        );
        assert!(compiled.warnings.is_empty());
    }

    #[test]
    fn first_declared_node_is_start_fallback() {
        let yaml = r#"
nodes:
  fetch:
    type: http
  after:
    type: transform
"#;
        let compiled = FlowCompiler::new(test_registry()).compile(yaml).unwrap();
        assert_eq!(compiled.graph.start, "fetch");
    }

    #[test]
    fn problems_are_accumulated() {
        let yaml = r#"
nodes:
  start:
    type: frobnicator
    retry:
      max_retries: -1
      wait: quickly
    next:
      done: nowhere
"#;
        let err = FlowCompiler::new(test_registry()).compile(yaml).unwrap_err();
        let EngineError::Validation(report) = err else {
            panic!("expected validation error");
        };
        assert_eq!(report.errors.len(), 4);
        let joined = report.errors.join("\n");
        assert!(joined.contains("unknown kernel type 'frobnicator'"));
        assert!(joined.contains("max_retries must be >= 0"));
        assert!(joined.contains("'quickly' is not a duration"));
        assert!(joined.contains("undeclared node 'nowhere'"));
    }

    #[test]
    fn unreachable_nodes_are_warnings() {
        let yaml = r#"
nodes:
  start:
    type: http
  island:
    type: transform
"#;
        let compiled = FlowCompiler::new(test_registry()).compile(yaml).unwrap();
        assert_eq!(compiled.warnings.len(), 1);
        assert!(compiled.warnings[0].contains("island"));
    }

    #[test]
    fn cycles_are_allowed() {
        let yaml = r#"
nodes:
  start:
    type: wait
    next:
      default: start
"#;
        assert!(FlowCompiler::new(test_registry()).compile(yaml).is_ok());
    }

    #[test]
    fn empty_document_is_fatal() {
        let err = FlowCompiler::new(test_registry()).compile("nodes: {}").unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn successor_order_follows_declaration() {
        let yaml = r#"
nodes:
  start:
    type: http
    next:
      branch_b: b
      branch_a: a
      branch_c: c
  a: {type: transform}
  b: {type: transform}
  c: {type: transform}
"#;
        let compiled = FlowCompiler::new(test_registry()).compile(yaml).unwrap();
        let order: Vec<&str> = compiled.graph.node("start").unwrap()
            .successors
            .keys()
            .map(String::as_str)
            .collect();
        assert_eq!(order, vec!["branch_b", "branch_a", "branch_c"]);
    }
}
