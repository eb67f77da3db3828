//! LLM completion kernel.
//!
//! Talks to one of three chat-completion providers behind a single output
//! shape: `openai`, `anthropic`, or `generic` (an OpenAI-compatible endpoint
//! at a caller-supplied URL). The exact wire formats stay inside this module;
//! downstream nodes only ever see the normalized
//! `{id, model, content, choices, usage, raw_response}` value, which the
//! router inspects for tool calls.
//!
//! Message sources, in precedence order: a top-level `question` in the flow
//! input, `messages`, `prompt`, `template` + `variables`, or `templates` +
//! `context`.

use crate::context::SharedContext;
use crate::error::{EngineError, Result};
use crate::kernel::{Kernel, KernelFactory, RunOutput};
use crate::params::Params;
use crate::template::{self, TemplateScope};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_TEMPERATURE: f64 = 0.7;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_ANTHROPIC_MAX_TOKENS: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Provider {
    OpenAi,
    Anthropic,
    Generic,
}

impl Provider {
    fn parse(name: &str) -> Result<Self> {
        match name {
            "openai" => Ok(Provider::OpenAi),
            "anthropic" => Ok(Provider::Anthropic),
            "generic" => Ok(Provider::Generic),
            other => Err(EngineError::Parameter(format!(
                "unknown LLM provider '{other}'"
            ))),
        }
    }
}

pub struct LlmKernel {
    client: reqwest::Client,
    /// System prompt used when the kernel has to fabricate a conversation.
    default_system: String,
}

impl LlmKernel {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            default_system: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.default_system = prompt.into();
        self
    }

    /// Assemble the conversation from whichever input form is present.
    fn build_messages(&self, shared: &SharedContext, params: &Params) -> Result<Vec<Value>> {
        // Flow input override: `question` becomes the user message.
        if let Some(question) = shared.get("question").and_then(Value::as_str) {
            return Ok(vec![
                json!({"role": "system", "content": self.default_system}),
                json!({"role": "user", "content": question}),
            ]);
        }
        if let Some(Value::Array(messages)) = params.get_value("messages") {
            return Ok(messages.clone());
        }
        if let Some(prompt) = params.get_str("prompt") {
            return Ok(vec![
                json!({"role": "system", "content": self.default_system}),
                json!({"role": "user", "content": prompt}),
            ]);
        }
        if let Some(text) = params.get_str("template") {
            let variables = params.get_value("variables").cloned().unwrap_or(json!({}));
            let scope = TemplateScope::new().layer_value(&variables);
            let rendered = template::render_str(text, &scope)?;
            let content = rendered.as_str().map(str::to_string).unwrap_or_else(|| rendered.to_string());
            return Ok(vec![
                json!({"role": "system", "content": self.default_system}),
                json!({"role": "user", "content": content}),
            ]);
        }
        if let Some(Value::Array(templates)) = params.get_value("templates") {
            let context = params.get_value("context").cloned().unwrap_or(json!({}));
            let scope = TemplateScope::new().layer_value(&context);
            let mut messages = Vec::with_capacity(templates.len());
            for entry in templates {
                let role = entry
                    .get("role")
                    .and_then(Value::as_str)
                    .unwrap_or("user");
                let text = entry.get("template").and_then(Value::as_str).ok_or_else(|| {
                    EngineError::Parameter("templates entries need a 'template' string".into())
                })?;
                let rendered = template::render_str(text, &scope)?;
                let content = rendered.as_str().map(str::to_string).unwrap_or_else(|| rendered.to_string());
                messages.push(json!({"role": role, "content": content}));
            }
            return Ok(messages);
        }
        Err(EngineError::Parameter(
            "llm needs one of: messages, prompt, template, templates (or a 'question' input)".into(),
        ))
    }

    /// One completion round-trip; also used by the agent kernel.
    pub(crate) async fn complete(
        &self,
        shared: &SharedContext,
        params: &Params,
        extra_messages: &[Value],
    ) -> Result<Value> {
        let provider = Provider::parse(params.get_str("provider").unwrap_or("openai"))?;
        let model = params.get_str("model").unwrap_or("gpt-4o-mini").to_string();
        let mut messages = self.build_messages(shared, params)?;
        messages.extend_from_slice(extra_messages);

        let (url, request, headers) = match provider {
            Provider::OpenAi | Provider::Generic => {
                self.openai_request(provider, &model, messages, params)?
            }
            Provider::Anthropic => self.anthropic_request(&model, messages, params)?,
        };

        let timeout = params.get_duration("timeout")?.unwrap_or(DEFAULT_TIMEOUT);
        let mut builder = self.client.post(&url).json(&request).timeout(timeout);
        for (name, value) in headers {
            builder = builder.header(name, value);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::Timeout(format!("llm request timed out: {e}"))
            } else {
                EngineError::Transport(format!("llm request failed: {e}"))
            }
        })?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| EngineError::Transport(format!("failed to read llm response: {e}")))?;
        if !(200..300).contains(&status) {
            return Err(EngineError::Upstream {
                status,
                message: text.chars().take(512).collect(),
            });
        }
        let raw: Value = serde_json::from_str(&text)?;
        Ok(self.normalize(provider, raw, params))
    }

    fn openai_request(
        &self,
        provider: Provider,
        model: &str,
        messages: Vec<Value>,
        params: &Params,
    ) -> Result<(String, Value, Vec<(String, String)>)> {
        let url = match (provider, params.get_str("base_url")) {
            (Provider::Generic, Some(base)) => base.trim_end_matches('/').to_string(),
            (Provider::Generic, None) => {
                return Err(EngineError::Parameter(
                    "generic provider requires 'base_url'".into(),
                ));
            }
            (_, Some(base)) => format!("{}/chat/completions", base.trim_end_matches('/')),
            (_, None) => "https://api.openai.com/v1/chat/completions".to_string(),
        };

        let mut request = Map::new();
        request.insert("model".into(), json!(model));
        request.insert("messages".into(), Value::Array(messages));
        request.insert(
            "temperature".into(),
            json!(params.get_f64("temperature").unwrap_or(DEFAULT_TEMPERATURE)),
        );
        if let Some(max_tokens) = params.get_u64("max_tokens") {
            request.insert("max_tokens".into(), json!(max_tokens));
        }
        for passthrough in ["stop", "tools", "functions", "response_format"] {
            if let Some(value) = params.get_value(passthrough) {
                request.insert(passthrough.into(), value.clone());
            }
        }

        let mut headers = Vec::new();
        if let Some(api_key) = params.get_str("api_key") {
            headers.push(("Authorization".to_string(), format!("Bearer {api_key}")));
        }
        Ok((url, Value::Object(request), headers))
    }

    fn anthropic_request(
        &self,
        model: &str,
        messages: Vec<Value>,
        params: &Params,
    ) -> Result<(String, Value, Vec<(String, String)>)> {
        let url = params
            .get_str("base_url")
            .map(|base| format!("{}/v1/messages", base.trim_end_matches('/')))
            .unwrap_or_else(|| "https://api.anthropic.com/v1/messages".to_string());

        // System messages ride in a dedicated field.
        let mut system = Vec::new();
        let mut turns = Vec::new();
        for message in messages {
            match message.get("role").and_then(Value::as_str) {
                Some("system") => {
                    if let Some(content) = message.get("content").and_then(Value::as_str) {
                        system.push(content.to_string());
                    }
                }
                _ => turns.push(message),
            }
        }

        let mut request = Map::new();
        request.insert("model".into(), json!(model));
        request.insert("messages".into(), Value::Array(turns));
        request.insert(
            "max_tokens".into(),
            json!(params.get_u64("max_tokens").unwrap_or(DEFAULT_ANTHROPIC_MAX_TOKENS)),
        );
        request.insert(
            "temperature".into(),
            json!(params.get_f64("temperature").unwrap_or(DEFAULT_TEMPERATURE)),
        );
        if !system.is_empty() {
            request.insert("system".into(), json!(system.join("\n")));
        }
        if let Some(stop) = params.get_value("stop") {
            request.insert("stop_sequences".into(), stop.clone());
        }
        if let Some(tools) = params.get_value("tools") {
            request.insert("tools".into(), tools.clone());
        }

        let mut headers = vec![(
            "anthropic-version".to_string(),
            ANTHROPIC_VERSION.to_string(),
        )];
        if let Some(api_key) = params.get_str("api_key") {
            headers.push(("x-api-key".to_string(), api_key.to_string()));
        }
        Ok((url, Value::Object(request), headers))
    }

    fn normalize(&self, provider: Provider, raw: Value, params: &Params) -> Value {
        let (content, choices, usage) = match provider {
            Provider::Anthropic => {
                let content = raw
                    .get("content")
                    .and_then(Value::as_array)
                    .and_then(|blocks| {
                        blocks
                            .iter()
                            .find(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                    })
                    .and_then(|block| block.get("text"))
                    .cloned()
                    .unwrap_or(Value::Null);
                let choices = json!([
                    {"index": 0, "message": {"role": "assistant", "content": content}}
                ]);
                (content, choices, raw.get("usage").cloned().unwrap_or(Value::Null))
            }
            _ => {
                let content = raw
                    .pointer("/choices/0/message/content")
                    .cloned()
                    .unwrap_or(Value::Null);
                let choices = raw.get("choices").cloned().unwrap_or(json!([]));
                (content, choices, raw.get("usage").cloned().unwrap_or(Value::Null))
            }
        };

        let structured = match (params.get_value("response_format"), content.as_str()) {
            (Some(_), Some(text)) => serde_json::from_str::<Value>(text).ok(),
            _ => None,
        };

        let mut output = Map::new();
        output.insert("id".into(), raw.get("id").cloned().unwrap_or(Value::Null));
        output.insert(
            "model".into(),
            raw.get("model").cloned().unwrap_or(Value::Null),
        );
        output.insert("content".into(), content);
        output.insert("choices".into(), choices);
        output.insert("usage".into(), usage);
        output.insert("raw_response".into(), raw);
        if let Some(structured) = structured {
            output.insert("structured_output".into(), structured);
        }
        Value::Object(output)
    }
}

#[async_trait]
impl Kernel for LlmKernel {
    fn tag(&self) -> &str {
        "llm"
    }

    fn timeout(&self) -> Option<Duration> {
        Some(DEFAULT_TIMEOUT + Duration::from_secs(30))
    }

    async fn run(&self, shared: &mut SharedContext, params: &Params) -> Result<RunOutput> {
        let output = self.complete(shared, params, &[]).await?;
        Ok(RunOutput::default_action(output))
    }
}

pub struct LlmFactory;

impl KernelFactory for LlmFactory {
    fn kind(&self) -> &str {
        "llm"
    }

    fn configure(&self, params: &Params) -> Result<Arc<dyn Kernel>> {
        // Provider can be validated statically; credentials usually cannot,
        // since they arrive through secret templates at run time.
        if let Some(provider) = params.get_str("provider") {
            if !provider.contains("{{") {
                Provider::parse(provider)?;
            }
        }
        Ok(Arc::new(LlmKernel::new(reqwest::Client::new())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel() -> LlmKernel {
        LlmKernel::new(reqwest::Client::new())
    }

    #[test]
    fn question_input_overrides_params() {
        let mut shared = SharedContext::new();
        shared.insert("question", json!("What is Rust?"));
        let params = Params::from_value(json!({"prompt": "ignored"}));
        let messages = kernel().build_messages(&shared, &params).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], json!("system"));
        assert_eq!(messages[1]["content"], json!("What is Rust?"));
    }

    #[test]
    fn prompt_becomes_user_message() {
        let shared = SharedContext::new();
        let params = Params::from_value(json!({"prompt": "hello"}));
        let messages = kernel().build_messages(&shared, &params).unwrap();
        assert_eq!(messages[1], json!({"role": "user", "content": "hello"}));
    }

    #[test]
    fn template_mode_renders_variables() {
        let shared = SharedContext::new();
        let params = Params::from_value(json!({
            "template": "Summarize {{topic}} in one line",
            "variables": {"topic": "lifetimes"},
        }));
        let messages = kernel().build_messages(&shared, &params).unwrap();
        assert_eq!(
            messages[1]["content"],
            json!("Summarize lifetimes in one line")
        );
    }

    #[test]
    fn templates_mode_renders_each_role() {
        let shared = SharedContext::new();
        let params = Params::from_value(json!({
            "templates": [
                {"role": "system", "template": "Act as {{persona}}"},
                {"role": "user", "template": "{{question}}"},
            ],
            "context": {"persona": "a reviewer", "question": "ready?"},
        }));
        let messages = kernel().build_messages(&shared, &params).unwrap();
        assert_eq!(messages[0]["content"], json!("Act as a reviewer"));
        assert_eq!(messages[1], json!({"role": "user", "content": "ready?"}));
    }

    #[test]
    fn missing_message_source_is_parameter_error() {
        let shared = SharedContext::new();
        assert!(matches!(
            kernel().build_messages(&shared, &Params::new()),
            Err(EngineError::Parameter(_))
        ));
    }

    #[test]
    fn openai_request_shape() {
        let params = Params::from_value(json!({
            "api_key": "sk-test",
            "max_tokens": 64,
            "tools": [{"type": "function", "function": {"name": "get_website"}}],
        }));
        let (url, request, headers) = kernel()
            .openai_request(Provider::OpenAi, "gpt-4o", vec![json!({"role": "user", "content": "x"})], &params)
            .unwrap();
        assert_eq!(url, "https://api.openai.com/v1/chat/completions");
        assert_eq!(request["model"], json!("gpt-4o"));
        assert_eq!(request["temperature"], json!(0.7));
        assert_eq!(request["max_tokens"], json!(64));
        assert!(request.get("tools").is_some());
        assert_eq!(headers[0].1, "Bearer sk-test");
    }

    #[test]
    fn generic_requires_base_url() {
        let err = kernel()
            .openai_request(Provider::Generic, "m", vec![], &Params::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::Parameter(_)));
    }

    #[test]
    fn anthropic_request_moves_system_aside() {
        let params = Params::from_value(json!({"api_key": "ak"}));
        let messages = vec![
            json!({"role": "system", "content": "be terse"}),
            json!({"role": "user", "content": "hi"}),
        ];
        let (url, request, headers) = kernel()
            .anthropic_request("claude-sonnet-4-5", messages, &params)
            .unwrap();
        assert_eq!(url, "https://api.anthropic.com/v1/messages");
        assert_eq!(request["system"], json!("be terse"));
        assert_eq!(request["messages"].as_array().unwrap().len(), 1);
        assert_eq!(request["max_tokens"], json!(DEFAULT_ANTHROPIC_MAX_TOKENS));
        assert!(headers.iter().any(|(k, _)| k == "anthropic-version"));
        assert!(headers.iter().any(|(k, v)| k == "x-api-key" && v == "ak"));
    }

    #[test]
    fn normalize_openai_response() {
        let raw = json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "{\"ok\":true}"}}],
            "usage": {"total_tokens": 12},
        });
        let params = Params::from_value(json!({"response_format": {"type": "json_object"}}));
        let out = kernel().normalize(Provider::OpenAi, raw, &params);
        assert_eq!(out["content"], json!("{\"ok\":true}"));
        assert_eq!(out["usage"]["total_tokens"], json!(12));
        assert_eq!(out["structured_output"], json!({"ok": true}));
        assert!(out["raw_response"]["choices"].is_array());
    }

    #[test]
    fn normalize_anthropic_response() {
        let raw = json!({
            "id": "msg_1",
            "model": "claude-sonnet-4-5",
            "content": [{"type": "text", "text": "answer"}],
            "usage": {"input_tokens": 3, "output_tokens": 5},
        });
        let out = kernel().normalize(Provider::Anthropic, raw, &Params::new());
        assert_eq!(out["content"], json!("answer"));
        assert_eq!(out["choices"][0]["message"]["content"], json!("answer"));
    }

    #[test]
    fn unknown_provider_rejected_at_configure() {
        let params = Params::from_value(json!({"provider": "hal9000"}));
        assert!(LlmFactory.configure(&params).is_err());
        let templated = Params::from_value(json!({"provider": "{{provider}}"}));
        assert!(LlmFactory.configure(&templated).is_ok());
    }
}
