//! Transform kernel: evaluates a script against the node's input.
//!
//! The script runs in the sandbox from [`crate::script`], with `input` bound
//! to `shared["input"]` when present, else the previous kernel's result, and
//! `shared` bound to the whole context. The script's final expression is the
//! node's output.

use crate::context::SharedContext;
use crate::error::{EngineError, Result};
use crate::kernel::{Kernel, KernelFactory, RunOutput};
use crate::params::Params;
use crate::script;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

pub struct TransformKernel;

impl TransformKernel {
    /// The value exposed as `input` to transform and condition scripts: the
    /// previous kernel's result once one exists, else the caller's input.
    pub(crate) fn script_input(shared: &SharedContext) -> Value {
        shared
            .last_result()
            .or_else(|| shared.get("input"))
            .cloned()
            .unwrap_or(Value::Null)
    }
}

#[async_trait]
impl Kernel for TransformKernel {
    fn tag(&self) -> &str {
        "transform"
    }

    async fn run(&self, shared: &mut SharedContext, params: &Params) -> Result<RunOutput> {
        let source = params.require_str("script")?;
        let input = Self::script_input(shared);
        let output = script::evaluate(source, input, shared.to_value())?;
        for line in &output.logs {
            tracing::info!(target: "driftflow::transform", "{line}");
        }
        Ok(RunOutput::default_action(output.value))
    }
}

pub struct TransformFactory;

impl KernelFactory for TransformFactory {
    fn kind(&self) -> &str {
        "transform"
    }

    fn configure(&self, params: &Params) -> Result<Arc<dyn Kernel>> {
        // The script itself may be templated, so only its presence is checked here.
        if !params.contains("script") {
            return Err(EngineError::Parameter(
                "transform requires a 'script' parameter".into(),
            ));
        }
        Ok(Arc::new(TransformKernel))
    }
}
