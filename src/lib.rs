//! # driftflow
//!
//! A multi-tenant flow execution engine. Tenants describe workflows as YAML
//! documents — directed graphs of typed nodes — and the engine compiles,
//! runs, and observes them:
//!
//! - **Compiler**: YAML → validated, immutable node graph with typed params,
//!   retry policy, and action-labeled routing ([`compiler`]).
//! - **Kernels**: the units of work bound to node types — HTTP, transform
//!   scripts, condition/router, waits, split/join fan-out, LLM, agent,
//!   key-value store, cron ([`kernel`]).
//! - **Engine**: walks the graph asynchronously, carrying a per-execution
//!   shared context, evaluating `{{…}}` templates and `${SECRET}` references
//!   per step, with bounded retries, timeouts, and cancellation
//!   ([`engine`], [`envelope`], [`template`]).
//! - **Registry**: live execution status, append-only logs with bounded
//!   fan-out to subscribers, cancel tokens ([`registry`]).
//! - **Durable adapters**: one key-value contract over an in-process store
//!   (TTL sweep + JSON snapshot) and optional redis / relational backends
//!   ([`durable`]).
//! - **Scheduler**: persistent cron jobs that re-enter the engine
//!   ([`scheduler`]).
//!
//! External collaborators — the REST/WebSocket gateway, tenant service,
//! flow registry, secret vault, execution store — are consumed through the
//! narrow traits in [`collaborators`].
//!
//! ## Example
//!
//! ```no_run
//! use driftflow::prelude::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn demo() -> driftflow::Result<()> {
//! let flows = Arc::new(InMemoryFlowRegistry::new());
//! flows.put_flow("acct", "double", r#"
//! nodes:
//!   start:
//!     type: transform
//!     params:
//!       script: "input.n * 2"
//! "#);
//!
//! let durable: Arc<dyn DurableStore> = Arc::new(LocalStore::new());
//! let scheduler = Scheduler::new(durable.clone());
//! let kernels = KernelRegistry::with_builtins(durable, scheduler.clone());
//! let engine = Engine::builder(
//!     flows,
//!     Arc::new(InMemorySecretVault::new()),
//!     Arc::new(kernels),
//! )
//! .build();
//! scheduler.set_trigger(Arc::new(engine.clone()));
//!
//! let execution_id = engine.execute("acct", "double", json!({"n": 21})).await?;
//! # Ok(())
//! # }
//! ```

pub mod action;
pub mod collaborators;
pub mod compiler;
pub mod context;
pub mod durable;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod kernel;
pub mod params;
pub mod registry;
pub mod scheduler;
pub mod script;
pub mod template;

pub use action::{Action, DEFAULT_ACTION};
pub use collaborators::{
    ExecutionStore, FlowRegistry, FlowSource, InMemoryExecutionStore, InMemoryFlowRegistry,
    InMemorySecretVault, SecretVault,
};
pub use compiler::{CompiledFlow, FlowCompiler, FlowGraph, FlowMetadata, RetryPolicy};
pub use context::SharedContext;
pub use durable::{DurableStore, LocalStore, QueryFilter, Record};
pub use engine::{Engine, EngineBuilder};
pub use envelope::Envelope;
pub use error::{EngineError, Result, ValidationReport};
pub use kernel::{Kernel, KernelFactory, KernelRegistry, RunOutput};
pub use params::Params;
pub use registry::{
    ExecutionLog, ExecutionRegistry, ExecutionState, ExecutionStatus, LogLevel,
};
pub use scheduler::{CronJob, FlowTrigger, Scheduler};

#[cfg(feature = "storage-redis")]
pub use durable::RedisStore;

#[cfg(feature = "storage-database")]
pub use durable::DatabaseStore;

/// Commonly used external type.
pub use serde_json::Value as JsonValue;

use crate::kernel::agent::{AgentFactory, ToolHandlerRegistry};
use crate::kernel::condition::ConditionFactory;
use crate::kernel::cron::CronFactory;
use crate::kernel::http::HttpFactory;
use crate::kernel::llm::LlmFactory;
use crate::kernel::split::{JoinFactory, SplitFactory};
use crate::kernel::store::StoreFactory;
use crate::kernel::transform::TransformFactory;
use crate::kernel::wait::WaitFactory;
use std::sync::Arc;

impl KernelRegistry {
    /// Registry with every built-in kernel bound to the given durable store
    /// and scheduler, and no agent tool handlers.
    pub fn with_builtins(
        durable: Arc<dyn DurableStore>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self::with_builtins_and_tools(durable, scheduler, ToolHandlerRegistry::new())
    }

    /// Same as [`KernelRegistry::with_builtins`], with agent tool handlers.
    pub fn with_builtins_and_tools(
        durable: Arc<dyn DurableStore>,
        scheduler: Arc<Scheduler>,
        tools: ToolHandlerRegistry,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(HttpFactory));
        registry.register(Arc::new(TransformFactory));
        registry.register(Arc::new(ConditionFactory));
        registry.register(Arc::new(WaitFactory));
        registry.register(Arc::new(SplitFactory));
        registry.register(Arc::new(JoinFactory));
        registry.register(Arc::new(LlmFactory));
        registry.register(Arc::new(AgentFactory::new(tools)));
        registry.register(Arc::new(StoreFactory::new(durable)));
        registry.register(Arc::new(CronFactory::new(scheduler)));
        registry
    }
}

/// Convenient re-exports for embedders.
pub mod prelude {
    pub use crate::action::Action;
    pub use crate::collaborators::{
        ExecutionStore, FlowRegistry, FlowSource, InMemoryExecutionStore, InMemoryFlowRegistry,
        InMemorySecretVault, SecretVault,
    };
    pub use crate::context::SharedContext;
    pub use crate::durable::{DurableStore, LocalStore, QueryFilter};
    pub use crate::engine::Engine;
    pub use crate::error::{EngineError, Result};
    pub use crate::kernel::{Kernel, KernelFactory, KernelRegistry, RunOutput};
    pub use crate::params::Params;
    pub use crate::registry::{ExecutionLog, ExecutionState, ExecutionStatus, LogLevel};
    pub use crate::scheduler::{CronJob, FlowTrigger, Scheduler};

    #[cfg(feature = "storage-redis")]
    pub use crate::durable::RedisStore;

    #[cfg(feature = "storage-database")]
    pub use crate::durable::DatabaseStore;

    pub use serde_json::Value as JsonValue;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::LocalStore;

    #[tokio::test]
    async fn builtin_registry_covers_every_kernel_kind() {
        let durable: Arc<dyn DurableStore> = Arc::new(LocalStore::new());
        let scheduler = Scheduler::new(durable.clone());
        let registry = KernelRegistry::with_builtins(durable, scheduler);
        assert_eq!(
            registry.kinds(),
            vec![
                "agent", "condition", "cron", "http", "join", "llm", "split", "store",
                "transform", "wait",
            ]
        );
    }
}
