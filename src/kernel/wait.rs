//! Wait kernel: duration sleeps, absolute-time waits, and condition polling.
//!
//! Any sleep here is a suspension point; cancellation of the enclosing
//! execution aborts it through the envelope's cancel race, so the kernel
//! itself only needs to sleep.

use crate::context::SharedContext;
use crate::error::{EngineError, Result};
use crate::kernel::transform::TransformKernel;
use crate::kernel::{Kernel, KernelFactory, RunOutput};
use crate::params::{Params, parse_duration};
use crate::script;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_POLL_ATTEMPTS: u64 = 10;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct WaitKernel;

#[async_trait]
impl Kernel for WaitKernel {
    fn tag(&self) -> &str {
        "wait"
    }

    async fn run(&self, shared: &mut SharedContext, params: &Params) -> Result<RunOutput> {
        match params.get_str("type").unwrap_or("duration") {
            "duration" => self.wait_duration(params).await,
            "until_time" => self.wait_until(params).await,
            "condition" => self.wait_condition(shared, params).await,
            other => Err(EngineError::Parameter(format!(
                "unknown wait type '{other}'"
            ))),
        }
    }
}

impl WaitKernel {
    async fn wait_duration(&self, params: &Params) -> Result<RunOutput> {
        let duration = params
            .get_duration("duration")?
            .ok_or_else(|| EngineError::Parameter("wait requires a 'duration'".into()))?;
        tokio::time::sleep(duration).await;
        Ok(RunOutput::default_action(json!({
            "waited_ms": duration.as_millis() as u64,
        })))
    }

    async fn wait_until(&self, params: &Params) -> Result<RunOutput> {
        let text = params.require_str("time")?;
        let target: DateTime<Utc> = DateTime::parse_from_rfc3339(text)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| EngineError::Parameter(format!("invalid RFC3339 time '{text}': {e}")))?;
        let now = Utc::now();
        // Past instants return immediately.
        if target > now {
            let remaining = (target - now)
                .to_std()
                .unwrap_or(Duration::ZERO);
            tokio::time::sleep(remaining).await;
        }
        Ok(RunOutput::default_action(json!({
            "resumed_at": Utc::now().to_rfc3339(),
            "target": target.to_rfc3339(),
        })))
    }

    async fn wait_condition(&self, shared: &SharedContext, params: &Params) -> Result<RunOutput> {
        let max_attempts = params.get_u64("max_attempts").unwrap_or(DEFAULT_POLL_ATTEMPTS);
        let interval = params
            .get_duration("interval")?
            .unwrap_or(DEFAULT_POLL_INTERVAL);
        let overall = match params.get_value("timeout") {
            Some(Value::String(s)) => Some(parse_duration(s)?),
            _ => params.get_duration("timeout")?,
        };
        let started = tokio::time::Instant::now();

        for attempt in 0..max_attempts {
            if let Some(limit) = overall {
                if started.elapsed() >= limit {
                    return Err(EngineError::Timeout(format!(
                        "condition wait exceeded {limit:?}"
                    )));
                }
            }
            if self.condition_met(shared, params)? {
                return Ok(RunOutput::default_action(json!({
                    "attempts": attempt + 1,
                })));
            }
            if attempt + 1 < max_attempts {
                tokio::time::sleep(interval).await;
            }
        }
        Err(EngineError::Kernel(format!(
            "condition not met after {max_attempts} attempts"
        )))
    }

    fn condition_met(&self, shared: &SharedContext, params: &Params) -> Result<bool> {
        if let Some(source) = params.get_str("script") {
            let input = TransformKernel::script_input(shared);
            let output = script::evaluate(source, input, shared.to_value())?;
            return Ok(script::truthy(&output.value));
        }
        // Without a predicate script, poll for a non-empty key.
        let key = params.get_str("key").unwrap_or("condition");
        Ok(shared.get(key).is_some_and(script::truthy))
    }
}

pub struct WaitFactory;

impl KernelFactory for WaitFactory {
    fn kind(&self) -> &str {
        "wait"
    }

    fn configure(&self, params: &Params) -> Result<Arc<dyn Kernel>> {
        if let Some(kind) = params.get_str("type") {
            if !matches!(kind, "duration" | "until_time" | "condition") {
                return Err(EngineError::Parameter(format!(
                    "unknown wait type '{kind}'"
                )));
            }
        }
        Ok(Arc::new(WaitKernel))
    }
}
