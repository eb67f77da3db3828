//! Agent kernel: an LLM composition with optional tool execution.
//!
//! In its plain form the agent forwards `prompt` to the LLM kernel configured
//! with agent defaults and decorates the output. With `max_steps > 1` and
//! registered tool handlers it runs a bounded ReAct loop modeled as an
//! explicit state machine: request a completion, execute any tool call the
//! model asked for, feed the tool result back, and finalize when the model
//! answers without tools or the step budget runs out. Every intermediate tool
//! invocation is recorded under `steps`.

use crate::context::SharedContext;
use crate::error::{EngineError, Result};
use crate::kernel::llm::LlmKernel;
use crate::kernel::{Kernel, KernelFactory, RunOutput};
use crate::params::Params;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const AGENT_SYSTEM_PROMPT: &str = "You are a helpful assistant with access to tools.";
const DEFAULT_MAX_STEPS: u64 = 1;

/// Async handler invoked when the model requests a tool by name.
pub type ToolHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Named tool handlers available to agents.
#[derive(Default, Clone)]
pub struct ToolHandlerRegistry {
    handlers: HashMap<String, ToolHandler>,
}

impl ToolHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        self.handlers.insert(
            name.into(),
            Arc::new(move |args| Box::pin(handler(args))),
        );
    }

    pub fn get(&self, name: &str) -> Option<&ToolHandler> {
        self.handlers.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// ReAct loop states; the guard on `max_steps` bounds the loop, never
/// recursion depth.
enum AgentState {
    AwaitingLlm,
    ExecutingTool {
        call_id: Value,
        name: String,
        arguments: Value,
        assistant_message: Value,
    },
    Finalizing {
        content: Value,
    },
}

pub struct AgentKernel {
    llm: LlmKernel,
    tools: ToolHandlerRegistry,
}

impl AgentKernel {
    pub fn new(tools: ToolHandlerRegistry) -> Self {
        Self {
            llm: LlmKernel::new(reqwest::Client::new()).with_system_prompt(AGENT_SYSTEM_PROMPT),
            tools,
        }
    }

    fn decorate(agent_type: &str, llm_output: Value, steps: Vec<Value>) -> Value {
        let mut map = match llm_output {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("raw_response".into(), other);
                map
            }
        };
        let response = map.get("content").cloned().unwrap_or(Value::Null);
        map.insert("agent_type".into(), json!(agent_type));
        map.insert("node_type".into(), json!("agent"));
        map.insert("response".into(), response);
        if !steps.is_empty() {
            map.insert("steps".into(), Value::Array(steps));
        }
        Value::Object(map)
    }

    async fn react_loop(
        &self,
        shared: &SharedContext,
        params: &Params,
        max_steps: u64,
    ) -> Result<Value> {
        let mut conversation: Vec<Value> = Vec::new();
        let mut steps: Vec<Value> = Vec::new();
        let mut last_output = Value::Null;
        let mut state = AgentState::AwaitingLlm;
        let mut completions: u64 = 0;

        loop {
            state = match state {
                AgentState::AwaitingLlm => {
                    // The step budget bounds completions, not transitions.
                    if completions >= max_steps {
                        break;
                    }
                    completions += 1;
                    let output = self.llm.complete(shared, params, &conversation).await?;
                    let message = output
                        .pointer("/raw_response/choices/0/message")
                        .cloned()
                        .unwrap_or(Value::Null);
                    let tool_call = message
                        .get("tool_calls")
                        .and_then(Value::as_array)
                        .and_then(|calls| calls.first())
                        .cloned();
                    last_output = output;
                    match tool_call {
                        Some(call) => {
                            let name = call
                                .pointer("/function/name")
                                .and_then(Value::as_str)
                                .ok_or_else(|| {
                                    EngineError::Kernel("tool call has no function name".into())
                                })?
                                .to_string();
                            let arguments = call
                                .pointer("/function/arguments")
                                .map(|raw| match raw {
                                    Value::String(text) => {
                                        serde_json::from_str(text).unwrap_or(Value::Null)
                                    }
                                    other => other.clone(),
                                })
                                .unwrap_or(Value::Null);
                            AgentState::ExecutingTool {
                                call_id: call.get("id").cloned().unwrap_or(Value::Null),
                                name,
                                arguments,
                                assistant_message: message,
                            }
                        }
                        None => AgentState::Finalizing {
                            content: last_output.get("content").cloned().unwrap_or(Value::Null),
                        },
                    }
                }
                AgentState::ExecutingTool {
                    call_id,
                    name,
                    arguments,
                    assistant_message,
                } => {
                    let handler = self.tools.get(&name).ok_or_else(|| {
                        EngineError::Kernel(format!("no handler registered for tool '{name}'"))
                    })?;
                    let result = handler(arguments.clone()).await?;
                    conversation.push(assistant_message);
                    conversation.push(json!({
                        "role": "tool",
                        "tool_call_id": call_id,
                        "content": result.to_string(),
                    }));
                    steps.push(json!({
                        "tool": name,
                        "arguments": arguments,
                        "result": result,
                    }));
                    AgentState::AwaitingLlm
                }
                AgentState::Finalizing { content } => {
                    let mut output = last_output;
                    if let Value::Object(map) = &mut output {
                        map.insert("content".into(), content);
                    }
                    return Ok(Self::decorate("react", output, steps));
                }
            };
        }

        // Step budget exhausted; surface whatever the model said last.
        Ok(Self::decorate("react", last_output, steps))
    }
}

#[async_trait]
impl Kernel for AgentKernel {
    fn tag(&self) -> &str {
        "agent"
    }

    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(300))
    }

    async fn run(&self, shared: &mut SharedContext, params: &Params) -> Result<RunOutput> {
        let max_steps = params.get_u64("max_steps").unwrap_or(DEFAULT_MAX_STEPS);
        let output = if max_steps > 1 && !self.tools.is_empty() {
            self.react_loop(shared, params, max_steps).await?
        } else {
            let llm_output = self.llm.complete(shared, params, &[]).await?;
            Self::decorate("conversational", llm_output, Vec::new())
        };
        Ok(RunOutput::default_action(output))
    }
}

pub struct AgentFactory {
    tools: ToolHandlerRegistry,
}

impl AgentFactory {
    pub fn new(tools: ToolHandlerRegistry) -> Self {
        Self { tools }
    }
}

impl KernelFactory for AgentFactory {
    fn kind(&self) -> &str {
        "agent"
    }

    fn configure(&self, params: &Params) -> Result<Arc<dyn Kernel>> {
        if let Some(max_steps) = params.get_value("max_steps") {
            if max_steps.as_u64().is_none() && !max_steps.is_string() {
                return Err(EngineError::Parameter(
                    "agent max_steps must be a non-negative integer".into(),
                ));
            }
        }
        Ok(Arc::new(AgentKernel::new(self.tools.clone())))
    }
}
