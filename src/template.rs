//! Template expression evaluator.
//!
//! Resolves `{{ <path> ( | <fn> | .<prop> )* }}` expressions inside
//! string-valued parameters against the current evaluation scope (shared
//! context, params, prior node results), and `${NAME}` secret references
//! against values fetched from the secret vault.
//!
//! Paths are dotted with optional `[index]` steps (`x.y[0].z`). Pipeline
//! stages are either a function name (`fromjson`) or a property accessor
//! (`.q`). An unresolved path yields null; malformed JSON handed to
//! `fromjson` yields an error token object (`{"_template_error": …}`) that a
//! kernel may detect without the whole step failing.

use crate::error::{EngineError, Result};
use regex::Regex;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::OnceLock;

fn template_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([^{}]+)\}\}").expect("template regex"))
}

fn secret_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("secret regex"))
}

/// Layered lookup scope for template paths.
///
/// The first layer containing the path's root key wins; layers are consulted
/// in the order they were pushed (shared context first, then params, then
/// prior node results).
#[derive(Debug, Default)]
pub struct TemplateScope {
    layers: Vec<Map<String, Value>>,
}

impl TemplateScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layer(mut self, values: Map<String, Value>) -> Self {
        self.layers.push(values);
        self
    }

    pub fn layer_value(self, value: &Value) -> Self {
        match value {
            Value::Object(map) => self.layer(map.clone()),
            _ => self,
        }
    }

    fn root(&self, key: &str) -> Option<&Value> {
        self.layers.iter().find_map(|layer| layer.get(key))
    }
}

/// One step of a parsed path: a key plus any number of `[index]` accesses.
#[derive(Debug, PartialEq)]
struct PathStep {
    key: String,
    indexes: Vec<usize>,
}

fn parse_path(path: &str) -> Result<Vec<PathStep>> {
    let mut steps = Vec::new();
    for raw in path.split('.') {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(EngineError::Resolution(format!("empty path segment in '{path}'")));
        }
        let (key, mut cursor) = match raw.find('[') {
            Some(open) => (&raw[..open], &raw[open..]),
            None => (raw, ""),
        };
        if key.is_empty() {
            return Err(EngineError::Resolution(format!(
                "index without key in path segment '{raw}'"
            )));
        }
        let mut indexes = Vec::new();
        // Indexes only trail a segment: `key[0][1]`.
        while !cursor.is_empty() {
            if !cursor.starts_with('[') {
                return Err(EngineError::Resolution(format!(
                    "unexpected text after index in '{raw}'"
                )));
            }
            let close = cursor.find(']').ok_or_else(|| {
                EngineError::Resolution(format!("unclosed index in path segment '{raw}'"))
            })?;
            let idx: usize = cursor[1..close].trim().parse().map_err(|_| {
                EngineError::Resolution(format!("non-numeric index in path segment '{raw}'"))
            })?;
            indexes.push(idx);
            cursor = &cursor[close + 1..];
        }
        steps.push(PathStep {
            key: key.to_string(),
            indexes,
        });
    }
    Ok(steps)
}

fn walk<'a>(mut current: &'a Value, steps: &[PathStep], skip_first_key: bool) -> Option<&'a Value> {
    for (i, step) in steps.iter().enumerate() {
        if !(i == 0 && skip_first_key) {
            current = current.get(&step.key)?;
        }
        for idx in &step.indexes {
            current = current.get(idx)?;
        }
    }
    Some(current)
}

/// Evaluate one expression body (the text between `{{` and `}}`).
fn eval_expression(body: &str, scope: &TemplateScope) -> Result<Value> {
    let mut stages = body.split('|').map(str::trim);
    let path = stages
        .next()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| EngineError::Resolution("empty template expression".into()))?;

    let steps = parse_path(path)?;
    let mut value = match scope.root(&steps[0].key) {
        Some(root) => walk(root, &steps, true).cloned().unwrap_or(Value::Null),
        None => Value::Null,
    };

    for stage in stages {
        if stage.is_empty() {
            return Err(EngineError::Resolution(format!(
                "empty pipeline stage in '{body}'"
            )));
        }
        if let Some(prop) = stage.strip_prefix('.') {
            let steps = parse_path(prop)?;
            value = walk(&value, &steps, false).cloned().unwrap_or(Value::Null);
        } else {
            value = apply_function(stage, value)?;
        }
    }
    Ok(value)
}

fn apply_function(name: &str, value: Value) -> Result<Value> {
    match name {
        "fromjson" => {
            let text = match &value {
                Value::String(s) => s.clone(),
                Value::Null => return Ok(Value::Null),
                other => other.to_string(),
            };
            match serde_json::from_str(&text) {
                Ok(parsed) => Ok(parsed),
                Err(e) => Ok(json!({ "_template_error": format!("fromjson: {e}") })),
            }
        }
        other => Err(EngineError::Resolution(format!(
            "unknown template function '{other}'"
        ))),
    }
}

/// Whether a value is the error token produced by a failed pipeline function.
pub fn is_error_token(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|m| m.contains_key("_template_error"))
}

/// Render one string through the template engine.
///
/// A string that is exactly one `{{…}}` expression substitutes the typed
/// value; mixed text stringifies each expression (null becomes empty).
pub fn render_str(template: &str, scope: &TemplateScope) -> Result<Value> {
    let re = template_regex();
    let trimmed = template.trim();
    if let Some(caps) = re.captures(trimmed) {
        let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        if whole == trimmed {
            return eval_expression(&caps[1], scope);
        }
    }

    let mut failure: Option<EngineError> = None;
    let rendered = re.replace_all(template, |caps: &regex::Captures<'_>| {
        match eval_expression(&caps[1], scope) {
            Ok(Value::Null) => String::new(),
            Ok(Value::String(s)) => s,
            Ok(other) => other.to_string(),
            Err(e) => {
                failure.get_or_insert(e);
                String::new()
            }
        }
    });
    match failure {
        Some(e) => Err(e),
        None => Ok(Value::String(rendered.into_owned())),
    }
}

/// Collect `${NAME}` references from one string.
pub fn secret_names(text: &str) -> Vec<String> {
    secret_regex()
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .collect()
}

/// Collect every `${NAME}` reference reachable in a JSON value.
pub fn collect_secret_names(value: &Value, into: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            for name in secret_names(s) {
                if !into.contains(&name) {
                    into.push(name);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_secret_names(item, into);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_secret_names(item, into);
            }
        }
        _ => {}
    }
}

/// Substitute `${NAME}` references; unknown names are left verbatim so the
/// failure surfaces as a resolution error at the kernel boundary, not as a
/// silently empty credential.
pub fn substitute_secrets(text: &str, secrets: &HashMap<String, String>) -> String {
    secret_regex()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            secrets
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Resolve templates and secrets in every string reachable from `value`.
pub fn resolve_value(
    value: &Value,
    scope: &TemplateScope,
    secrets: &HashMap<String, String>,
) -> Result<Value> {
    match value {
        Value::String(s) => {
            let with_secrets = if secrets.is_empty() {
                s.clone()
            } else {
                substitute_secrets(s, secrets)
            };
            render_str(&with_secrets, scope)
        }
        Value::Array(items) => {
            let resolved: Result<Vec<Value>> = items
                .iter()
                .map(|item| resolve_value(item, scope, secrets))
                .collect();
            Ok(Value::Array(resolved?))
        }
        Value::Object(map) => {
            let mut resolved = Map::new();
            for (k, v) in map {
                resolved.insert(k.clone(), resolve_value(v, scope, secrets)?);
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}
