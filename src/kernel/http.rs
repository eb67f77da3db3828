//! HTTP request kernel.
//!
//! Issues one request per step and routes on the response class: `success`
//! for 2xx, `client_error` for 4xx, `server_error` for 5xx, `default`
//! otherwise. The response body is parsed as JSON when the content type says
//! so; the raw text is always kept under `raw_body`. Transport failures and
//! timeouts are retry-eligible through the envelope.

use crate::action::Action;
use crate::context::SharedContext;
use crate::error::{EngineError, Result};
use crate::kernel::{Kernel, KernelFactory, RunOutput};
use crate::params::Params;
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpKernel {
    client: reqwest::Client,
}

impl HttpKernel {
    fn build_request(
        &self,
        params: &Params,
    ) -> Result<reqwest::RequestBuilder> {
        let url = params.require_str("url")?;
        let method_text = params.get_str("method").unwrap_or("GET");
        let method = reqwest::Method::from_bytes(method_text.to_ascii_uppercase().as_bytes())
            .map_err(|_| EngineError::Parameter(format!("invalid HTTP method '{method_text}'")))?;

        let mut request = self.client.request(method, url);

        if let Some(Value::Object(headers)) = params.get_value("headers") {
            for (name, value) in headers {
                request = request.header(name, value_to_header(value));
            }
        }

        if let Some(Value::Object(query)) = params.get_value("query_params") {
            let pairs: Vec<(String, String)> = query
                .iter()
                .map(|(k, v)| (k.clone(), value_to_header(v)))
                .collect();
            request = request.query(&pairs);
        }

        if let Some(Value::Object(auth)) = params.get_value("auth") {
            request = apply_auth(request, auth)?;
        }

        match params.get_value("body") {
            None | Some(Value::Null) => {}
            Some(Value::String(text)) => {
                request = request.body(text.clone());
            }
            Some(other) => {
                request = request.json(other);
            }
        }

        let timeout = params.get_duration("timeout")?.unwrap_or(DEFAULT_TIMEOUT);
        Ok(request.timeout(timeout))
    }
}

fn value_to_header(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn apply_auth(
    request: reqwest::RequestBuilder,
    auth: &Map<String, Value>,
) -> Result<reqwest::RequestBuilder> {
    let kind = auth
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::Parameter("auth requires a 'type'".into()))?;
    match kind {
        "basic" => {
            let username = auth
                .get("username")
                .and_then(Value::as_str)
                .ok_or_else(|| EngineError::Parameter("basic auth requires 'username'".into()))?;
            let password = auth.get("password").and_then(Value::as_str);
            Ok(request.basic_auth(username, password))
        }
        "bearer" => {
            let token = auth
                .get("token")
                .and_then(Value::as_str)
                .ok_or_else(|| EngineError::Parameter("bearer auth requires 'token'".into()))?;
            Ok(request.bearer_auth(token))
        }
        "api_key" => {
            let key = auth
                .get("key")
                .and_then(Value::as_str)
                .ok_or_else(|| EngineError::Parameter("api_key auth requires 'key'".into()))?;
            let name = auth
                .get("key_name")
                .and_then(Value::as_str)
                .unwrap_or("X-API-Key");
            Ok(request.header(name, key))
        }
        other => Err(EngineError::Parameter(format!(
            "unknown auth type '{other}'"
        ))),
    }
}

fn action_for_status(status: u16) -> &'static str {
    match status {
        200..=299 => "success",
        400..=499 => "client_error",
        500..=599 => "server_error",
        _ => "default",
    }
}

#[async_trait]
impl Kernel for HttpKernel {
    fn tag(&self) -> &str {
        "http"
    }

    fn timeout(&self) -> Option<Duration> {
        // Envelope backstop above the per-request timeout.
        Some(DEFAULT_TIMEOUT + Duration::from_secs(5))
    }

    async fn run(&self, _shared: &mut SharedContext, params: &Params) -> Result<RunOutput> {
        let request = self.build_request(params)?;
        let started = Instant::now();
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::Timeout(format!("http request timed out: {e}"))
            } else {
                EngineError::Transport(format!("http request failed: {e}"))
            }
        })?;

        let status = response.status().as_u16();
        let mut headers = Map::new();
        for (name, value) in response.headers() {
            headers.insert(
                name.as_str().to_string(),
                Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
            );
        }
        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("application/json") || ct.contains("+json"));

        let raw_body = response.text().await.map_err(|e| {
            EngineError::Transport(format!("failed to read response body: {e}"))
        })?;
        let timing_ms = started.elapsed().as_millis() as u64;

        let body = if is_json {
            serde_json::from_str(&raw_body).unwrap_or(Value::String(raw_body.clone()))
        } else {
            Value::String(raw_body.clone())
        };

        let value = json!({
            "status_code": status,
            "headers": headers,
            "body": body,
            "raw_body": raw_body,
            "success": (200..300).contains(&status),
            "timing_ms": timing_ms,
        });
        Ok(RunOutput::new(action_for_status(status), value))
    }

    /// Recomputes the action from the committed result's status code.
    async fn post(
        &self,
        _shared: &mut SharedContext,
        _params: &Params,
        result: &Value,
    ) -> Result<Option<Action>> {
        Ok(result
            .get("status_code")
            .and_then(Value::as_u64)
            .map(|status| Action::new(action_for_status(status as u16))))
    }
}

pub struct HttpFactory;

impl KernelFactory for HttpFactory {
    fn kind(&self) -> &str {
        "http"
    }

    fn configure(&self, params: &Params) -> Result<Arc<dyn Kernel>> {
        let follow_redirect = params.get_bool("follow_redirect").unwrap_or(true);
        let policy = if follow_redirect {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        };
        let client = reqwest::Client::builder()
            .redirect(policy)
            .build()
            .map_err(|e| EngineError::Transport(format!("failed to build http client: {e}")))?;
        Ok(Arc::new(HttpKernel { client }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    /// Minimal loopback HTTP server answering every request with one canned
    /// response, in the spirit of the backend tests that need a live peer.
    fn serve_once(status_line: &'static str, content_type: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf);
                let response = format!(
                    "HTTP/1.1 {status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{addr}/")
    }

    fn kernel() -> HttpKernel {
        HttpKernel {
            client: reqwest::Client::new(),
        }
    }

    #[tokio::test]
    async fn json_response_is_parsed_and_routed_success() {
        let url = serve_once("200 OK", "application/json", r#"{"n": 2}"#);
        let mut shared = SharedContext::new();
        let params = Params::from_value(json!({"url": url}));
        let out = kernel().run(&mut shared, &params).await.unwrap();
        assert_eq!(out.action, "success");
        assert_eq!(out.value["status_code"], json!(200));
        assert_eq!(out.value["body"], json!({"n": 2}));
        assert_eq!(out.value["raw_body"], json!(r#"{"n": 2}"#));
        assert_eq!(out.value["success"], json!(true));
        assert!(out.value["timing_ms"].is_u64());
    }

    #[tokio::test]
    async fn not_found_routes_client_error() {
        let url = serve_once("404 Not Found", "text/plain", "nope");
        let mut shared = SharedContext::new();
        let params = Params::from_value(json!({"url": url}));
        let out = kernel().run(&mut shared, &params).await.unwrap();
        assert_eq!(out.action, "client_error");
        assert_eq!(out.value["body"], json!("nope"));
        assert_eq!(out.value["success"], json!(false));
    }

    #[tokio::test]
    async fn server_error_routes_server_error() {
        let url = serve_once("503 Service Unavailable", "text/plain", "down");
        let mut shared = SharedContext::new();
        let params = Params::from_value(json!({"url": url}));
        let out = kernel().run(&mut shared, &params).await.unwrap();
        assert_eq!(out.action, "server_error");
    }

    #[tokio::test]
    async fn refused_connection_is_transport_error() {
        let mut shared = SharedContext::new();
        // Port 9 (discard) is almost certainly closed.
        let params = Params::from_value(json!({
            "url": "http://127.0.0.1:9/",
            "timeout": "500ms",
        }));
        let err = kernel().run(&mut shared, &params).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Transport(_) | EngineError::Timeout(_)
        ));
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn missing_url_is_parameter_error() {
        let mut shared = SharedContext::new();
        let err = kernel().run(&mut shared, &Params::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::Parameter(_)));
    }

    #[test]
    fn status_classes() {
        assert_eq!(action_for_status(204), "success");
        assert_eq!(action_for_status(404), "client_error");
        assert_eq!(action_for_status(500), "server_error");
        assert_eq!(action_for_status(302), "default");
    }

    #[test]
    fn auth_validation() {
        let client = reqwest::Client::new();
        let builder = client.get("http://example.com/");
        let bad = json!({"type": "basic"});
        assert!(apply_auth(builder, bad.as_object().unwrap()).is_err());

        let builder = client.get("http://example.com/");
        let unknown = json!({"type": "kerberos"});
        assert!(apply_auth(builder, unknown.as_object().unwrap()).is_err());
    }
}
