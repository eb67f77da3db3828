//! Split and join kernels for fan-out sections of a graph.
//!
//! A split node passes its input through and marks its outgoing edges as
//! fan-out: the engine runs each successor branch concurrently (bounded by
//! `batch.max_parallel`) against a snapshot of the shared context and
//! collects branch results into `_parallel_results` in declaration order.
//! A join node then materializes those results as `_join_output` in one of
//! three formats and resets `input` to the joined value.

use crate::context::{PARALLEL_RESULTS_KEY, SharedContext};
use crate::error::{EngineError, Result};
use crate::kernel::transform::TransformKernel;
use crate::kernel::{Kernel, KernelFactory, RunOutput};
use crate::params::Params;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Context key holding the join kernel's materialized output.
pub const JOIN_OUTPUT_KEY: &str = "_join_output";

pub struct SplitKernel;

#[async_trait]
impl Kernel for SplitKernel {
    fn tag(&self) -> &str {
        "split"
    }

    fn fan_out(&self) -> bool {
        true
    }

    async fn run(&self, shared: &mut SharedContext, _params: &Params) -> Result<RunOutput> {
        // Pure passthrough; the engine interprets the fan-out marker.
        Ok(RunOutput::default_action(TransformKernel::script_input(shared)))
    }
}

pub struct SplitFactory;

impl KernelFactory for SplitFactory {
    fn kind(&self) -> &str {
        "split"
    }

    fn configure(&self, _params: &Params) -> Result<Arc<dyn Kernel>> {
        Ok(Arc::new(SplitKernel))
    }
}

pub struct JoinKernel;

#[async_trait]
impl Kernel for JoinKernel {
    fn tag(&self) -> &str {
        "join"
    }

    async fn run(&self, shared: &mut SharedContext, params: &Params) -> Result<RunOutput> {
        let results = shared
            .parallel_results()
            .cloned()
            .ok_or_else(|| {
                EngineError::Kernel(format!(
                    "join found no {PARALLEL_RESULTS_KEY}; is it wired after a split?"
                ))
            })?;

        let format = params.get_str("format").unwrap_or("array");
        let output = match format {
            "array" => Value::Array(results),
            "object" => {
                let mut map = Map::new();
                for (i, result) in results.into_iter().enumerate() {
                    map.insert(format!("result_{i}"), result);
                }
                Value::Object(map)
            }
            "map" => {
                let mut map = Map::new();
                for (i, result) in results.into_iter().enumerate() {
                    let key = result
                        .get("branch")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("branch_{i}"));
                    map.insert(key, result);
                }
                Value::Object(map)
            }
            other => {
                return Err(EngineError::Kernel(format!(
                    "unknown join format '{other}'"
                )));
            }
        };

        shared.insert(JOIN_OUTPUT_KEY, output.clone());
        shared.insert("input", output.clone());
        Ok(RunOutput::default_action(output))
    }
}

pub struct JoinFactory;

impl KernelFactory for JoinFactory {
    fn kind(&self) -> &str {
        "join"
    }

    fn configure(&self, params: &Params) -> Result<Arc<dyn Kernel>> {
        if let Some(format) = params.get_str("format") {
            if !matches!(format, "array" | "object" | "map") {
                return Err(EngineError::Parameter(format!(
                    "unknown join format '{format}'"
                )));
            }
        }
        Ok(Arc::new(JoinKernel))
    }
}
