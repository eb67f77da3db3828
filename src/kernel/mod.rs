//! Node kernel contract and the factory registry.
//!
//! A kernel is the implementation bound to a node's `type`. Kernels are
//! configured once at compile time (through their [`KernelFactory`]) and then
//! shared immutably across every concurrent execution of the flow, so `run`
//! takes `&self` and all per-execution state lives in the shared context.
//!
//! The contract per step:
//! 1. the engine resolves templates in the node's params,
//! 2. `run` executes under the retry/timeout envelope and returns an
//!    [`Action`] plus the kernel's primary output value,
//! 3. the engine commits the value to `shared["result"]` and
//!    `shared["<tag>_result"]`,
//! 4. `post`, when overridden, may replace the action by inspecting the
//!    committed result.

use crate::action::Action;
use crate::context::SharedContext;
use crate::error::{EngineError, Result};
use crate::params::Params;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub mod agent;
pub mod condition;
pub mod cron;
pub mod http;
pub mod llm;
pub mod split;
pub mod store;
pub mod transform;
pub mod wait;

/// What one kernel invocation produced.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// Edge label selecting the successor.
    pub action: Action,
    /// Primary output, committed to the shared context by the engine.
    pub value: Value,
}

impl RunOutput {
    pub fn new(action: impl Into<Action>, value: Value) -> Self {
        Self {
            action: action.into(),
            value,
        }
    }

    /// Output routed through the reserved `"default"` edge.
    pub fn default_action(value: Value) -> Self {
        Self {
            action: Action::default_action(),
            value,
        }
    }
}

/// A typed unit of work in a flow.
#[async_trait]
pub trait Kernel: Send + Sync {
    /// Short tag naming the kernel family; used for the `<tag>_result` key.
    fn tag(&self) -> &str;

    /// Default per-attempt timeout, overridable by the node spec.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Whether the engine should fan successors out concurrently.
    fn fan_out(&self) -> bool {
        false
    }

    /// Execute one step. `params` are fully template-resolved.
    async fn run(&self, shared: &mut SharedContext, params: &Params) -> Result<RunOutput>;

    /// Optionally compute the action from the committed result.
    async fn post(
        &self,
        _shared: &mut SharedContext,
        _params: &Params,
        _result: &Value,
    ) -> Result<Option<Action>> {
        Ok(None)
    }
}

/// Compile-time constructor for one kernel kind.
pub trait KernelFactory: Send + Sync {
    /// The `type` string this factory answers to.
    fn kind(&self) -> &str;

    /// Capture static parameters and build the immutable kernel instance.
    ///
    /// `params` here are the raw, untemplated params from the flow document;
    /// anything dynamic must be read again at run time.
    fn configure(&self, params: &Params) -> Result<Arc<dyn Kernel>>;
}

/// Registry of kernel factories keyed by `type`.
#[derive(Default)]
pub struct KernelRegistry {
    factories: HashMap<String, Arc<dyn KernelFactory>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Arc<dyn KernelFactory>) {
        self.factories.insert(factory.kind().to_string(), factory);
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Configure a kernel of the given kind; unknown kinds are a compile error.
    pub fn configure(&self, kind: &str, params: &Params) -> Result<Arc<dyn Kernel>> {
        let factory = self.factories.get(kind).ok_or_else(|| {
            EngineError::Parameter(format!("unknown kernel type '{kind}'"))
        })?;
        factory.configure(params)
    }
}

/// Adapter turning a closure into a factory, used by tests and embedders that
/// want scripted kernels without a full factory type.
pub struct FnKernelFactory<F> {
    kind: String,
    build: F,
}

impl<F> FnKernelFactory<F>
where
    F: Fn(&Params) -> Result<Arc<dyn Kernel>> + Send + Sync,
{
    pub fn new(kind: impl Into<String>, build: F) -> Self {
        Self {
            kind: kind.into(),
            build,
        }
    }
}

impl<F> KernelFactory for FnKernelFactory<F>
where
    F: Fn(&Params) -> Result<Arc<dyn Kernel>> + Send + Sync,
{
    fn kind(&self) -> &str {
        &self.kind
    }

    fn configure(&self, params: &Params) -> Result<Arc<dyn Kernel>> {
        (self.build)(params)
    }
}
