//! Condition / router kernel.
//!
//! Two modes. With a `script` param it evaluates the script and routes on
//! `"true"` / `"false"`. Without one it inspects the shared context for an
//! LLM tool-call structure; when found, the call is stashed under
//! `active_tool_call`, its arguments are shaped into kernel params under
//! `tool_params`, and the tool name becomes the action so the graph can bind
//! an edge per tool. With neither a script nor a tool call, the router
//! returns `"output"`.

use crate::context::{ACTIVE_TOOL_CALL_KEY, SharedContext};
use crate::error::{EngineError, Result};
use crate::kernel::transform::TransformKernel;
use crate::kernel::{Kernel, KernelFactory, RunOutput};
use crate::params::Params;
use crate::script;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;

/// Context key where extracted tool parameters are published for the routed
/// kernel's templates.
pub const TOOL_PARAMS_KEY: &str = "tool_params";

/// Positions inspected for a tool-call array, relative to the shared context.
/// Each segment is matched case-insensitively against snake and Go-style
/// capitalized field names (`tool_calls` / `ToolCalls`).
const TOOL_CALL_PATHS: &[&[&str]] = &[
    &["tool_calls"],
    &["result", "tool_calls"],
    &["choices", "0", "message", "tool_calls"],
    &["llm_result", "tool_calls"],
    &["llm_result", "message", "tool_calls"],
    &["llm_result", "choices", "0", "message", "tool_calls"],
];

pub struct ConditionKernel;

#[async_trait]
impl Kernel for ConditionKernel {
    fn tag(&self) -> &str {
        "condition"
    }

    async fn run(&self, shared: &mut SharedContext, params: &Params) -> Result<RunOutput> {
        if let Some(source) = params.get_str("script") {
            let input = TransformKernel::script_input(shared);
            let output = script::evaluate(source, input, shared.to_value())?;
            let verdict = script::truthy(&output.value);
            return Ok(RunOutput::new(
                if verdict { "true" } else { "false" },
                Value::Bool(verdict),
            ));
        }

        if let Some(call) = find_tool_call(&shared.to_value()) {
            let name = call_name(&call).ok_or_else(|| {
                EngineError::Kernel("tool call has no function name".into())
            })?;
            let arguments = call_arguments(&call);
            let tool_params = extract_tool_params(&name, &arguments);
            shared.insert(
                ACTIVE_TOOL_CALL_KEY,
                json!({
                    "name": name,
                    "arguments": arguments,
                    "params": tool_params,
                }),
            );
            shared.insert(TOOL_PARAMS_KEY, tool_params.clone());
            return Ok(RunOutput::new(name.as_str(), tool_params));
        }

        let passthrough = TransformKernel::script_input(shared);
        Ok(RunOutput::new("output", passthrough))
    }
}

/// Search the known positions for a non-empty tool-call array.
fn find_tool_call(root: &Value) -> Option<Value> {
    for path in TOOL_CALL_PATHS {
        if let Some(calls) = walk_lenient(root, path) {
            if let Some(first) = calls.as_array().and_then(|a| a.first()) {
                return Some(first.clone());
            }
        }
    }
    None
}

fn walk_lenient<'a>(root: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = root;
    for segment in path {
        current = if let Ok(index) = segment.parse::<usize>() {
            current.get(index)?
        } else {
            get_field_lenient(current, segment)?
        };
    }
    Some(current)
}

/// Field access tolerant of Go-marshaled capitalization (`ToolCalls`).
fn get_field_lenient<'a>(value: &'a Value, name: &str) -> Option<&'a Value> {
    let map = value.as_object()?;
    if let Some(found) = map.get(name) {
        return Some(found);
    }
    let target = name.replace('_', "").to_ascii_lowercase();
    map.iter()
        .find(|(k, _)| k.replace('_', "").to_ascii_lowercase() == target)
        .map(|(_, v)| v)
}

fn call_name(call: &Value) -> Option<String> {
    get_field_lenient(call, "function")
        .and_then(|f| get_field_lenient(f, "name"))
        .or_else(|| get_field_lenient(call, "name"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Tool arguments may be an object or a JSON-encoded string.
fn call_arguments(call: &Value) -> Value {
    let raw = get_field_lenient(call, "function")
        .and_then(|f| get_field_lenient(f, "arguments"))
        .or_else(|| get_field_lenient(call, "arguments"));
    match raw {
        Some(Value::String(text)) => serde_json::from_str(text).unwrap_or(Value::Null),
        Some(other) => other.clone(),
        None => Value::Null,
    }
}

/// Shape tool arguments into params for the kernel bound to that tool.
fn extract_tool_params(name: &str, arguments: &Value) -> Value {
    match name {
        "get_website" => json!({
            "url": arguments.get("url").cloned().unwrap_or(Value::Null),
            "method": "GET",
        }),
        "search_web" => {
            let query = arguments
                .get("query")
                .and_then(Value::as_str)
                .unwrap_or_default();
            json!({
                "url": format!("https://duckduckgo.com/html/?q={}", encode_query(query)),
                "method": "GET",
            })
        }
        "send_email" => json!({
            "to": arguments.get("to").cloned().unwrap_or(Value::Null),
            "subject": arguments.get("subject").cloned().unwrap_or(Value::Null),
            "body": arguments.get("body").cloned().unwrap_or(Value::Null),
        }),
        _ => match arguments {
            Value::Object(_) => arguments.clone(),
            _ => json!({}),
        },
    }
}

fn encode_query(query: &str) -> String {
    let mut encoded = String::with_capacity(query.len());
    for byte in query.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char);
            }
            b' ' => encoded.push('+'),
            other => encoded.push_str(&format!("%{other:02X}")),
        }
    }
    encoded
}

pub struct ConditionFactory;

impl KernelFactory for ConditionFactory {
    fn kind(&self) -> &str {
        "condition"
    }

    fn configure(&self, _params: &Params) -> Result<Arc<dyn Kernel>> {
        Ok(Arc::new(ConditionKernel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn script_routes_true_false() {
        let mut shared = SharedContext::new();
        shared.insert("input", json!({"n": 10}));
        let params = Params::from_value(json!({"script": "input.n > 5"}));
        let out = ConditionKernel.run(&mut shared, &params).await.unwrap();
        assert_eq!(out.action, "true");

        let params = Params::from_value(json!({"script": "input.n > 50"}));
        let out = ConditionKernel.run(&mut shared, &params).await.unwrap();
        assert_eq!(out.action, "false");
    }

    #[tokio::test]
    async fn detects_tool_call_in_openai_shape() {
        let mut shared = SharedContext::new();
        shared.commit_result(
            "llm",
            "llm",
            json!({
                "choices": [{
                    "message": {
                        "tool_calls": [{
                            "id": "call_1",
                            "function": {
                                "name": "get_website",
                                "arguments": "{\"url\": \"http://x\"}",
                            },
                        }],
                    },
                }],
            }),
        );
        // The llm result is also visible under llm_result.
        let out = ConditionKernel.run(&mut shared, &Params::new()).await.unwrap();
        assert_eq!(out.action, "get_website");
        assert_eq!(out.value["url"], json!("http://x"));
        let active = shared.get(ACTIVE_TOOL_CALL_KEY).unwrap();
        assert_eq!(active["name"], json!("get_website"));
        assert_eq!(shared.get(TOOL_PARAMS_KEY).unwrap()["url"], json!("http://x"));
    }

    #[tokio::test]
    async fn detects_capitalized_tool_calls() {
        let mut shared = SharedContext::new();
        shared.insert(
            "llm_result",
            json!({
                "ToolCalls": [{
                    "Function": {"Name": "search_web", "Arguments": "{\"query\": \"rust async\"}"},
                }],
            }),
        );
        let out = ConditionKernel.run(&mut shared, &Params::new()).await.unwrap();
        assert_eq!(out.action, "search_web");
        assert_eq!(
            out.value["url"],
            json!("https://duckduckgo.com/html/?q=rust+async")
        );
    }

    #[tokio::test]
    async fn send_email_params_are_shaped() {
        let mut shared = SharedContext::new();
        shared.insert(
            "tool_calls",
            json!([{
                "function": {
                    "name": "send_email",
                    "arguments": {"to": "ops@example.com", "subject": "alert", "body": "cpu high"},
                },
            }]),
        );
        let out = ConditionKernel.run(&mut shared, &Params::new()).await.unwrap();
        assert_eq!(out.action, "send_email");
        assert_eq!(out.value["to"], json!("ops@example.com"));
        assert_eq!(out.value["subject"], json!("alert"));
    }

    #[tokio::test]
    async fn no_tool_call_returns_output() {
        let mut shared = SharedContext::new();
        shared.commit_result("llm", "llm", json!({"content": "plain answer"}));
        let out = ConditionKernel.run(&mut shared, &Params::new()).await.unwrap();
        assert_eq!(out.action, "output");
        assert_eq!(out.value, json!({"content": "plain answer"}));
    }

    #[test]
    fn query_encoding() {
        assert_eq!(encode_query("a b"), "a+b");
        assert_eq!(encode_query("x&y=1"), "x%26y%3D1");
        assert_eq!(encode_query("plain-text_1.2~ok"), "plain-text_1.2~ok");
    }
}
