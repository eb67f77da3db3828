//! Node parameters: a typed view over a free-form JSON mapping.
//!
//! Parameters come from the flow document and may contain `{{…}}` templates;
//! the engine resolves those against the shared context before each step, so
//! kernels always see fully materialized values here.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Immutable per-node configuration, passed to a kernel on every step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params {
    inner: Map<String, Value>,
}

impl Params {
    pub fn new() -> Self {
        Self { inner: Map::new() }
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self { inner: map }
    }

    /// Build params from any JSON value; non-objects become empty params.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self { inner: map },
            _ => Self::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: impl Serialize) -> Result<()> {
        let json = serde_json::to_value(value)?;
        self.inner.insert(key.to_string(), json);
        Ok(())
    }

    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.inner.get(key)
    }

    pub fn get<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        self.inner
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.inner.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.inner.get(key).and_then(Value::as_bool)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.inner.get(key).and_then(Value::as_u64)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.inner.get(key).and_then(Value::as_f64)
    }

    /// Required string parameter; missing or mistyped is a [`EngineError::Parameter`].
    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.get_str(key)
            .ok_or_else(|| EngineError::Parameter(format!("missing required parameter '{key}'")))
    }

    /// Duration parameter in `"10ms"` / `"1s"` form.
    pub fn get_duration(&self, key: &str) -> Result<Option<Duration>> {
        match self.inner.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => parse_duration(s).map(Some),
            // Bare numbers are taken as seconds.
            Some(Value::Number(n)) => {
                let secs = n.as_f64().ok_or_else(|| {
                    EngineError::Parameter(format!("parameter '{key}' is not a valid duration"))
                })?;
                if secs < 0.0 {
                    return Err(EngineError::Parameter(format!(
                        "parameter '{key}' must not be negative"
                    )));
                }
                Ok(Some(Duration::from_secs_f64(secs)))
            }
            Some(other) => Err(EngineError::Parameter(format!(
                "parameter '{key}' is not a duration: {other}"
            ))),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.inner.iter()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.inner
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.inner.clone())
    }

    /// Overlay `other` on top of `self`; keys in `other` win.
    pub fn merge(&self, other: &Params) -> Params {
        let mut merged = self.inner.clone();
        for (k, v) in &other.inner {
            merged.insert(k.clone(), v.clone());
        }
        Params { inner: merged }
    }
}

/// Parse a human duration such as `"250ms"`, `"10s"`, `"2m"`, `"1h"`.
pub fn parse_duration(text: &str) -> Result<Duration> {
    let text = text.trim();
    let split = text
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let amount: f64 = number.trim().parse().map_err(|_| {
        EngineError::Parameter(format!("invalid duration '{text}'"))
    })?;
    if amount < 0.0 {
        return Err(EngineError::Parameter(format!(
            "duration '{text}' must not be negative"
        )));
    }
    let unit_secs = match unit.trim() {
        "us" | "µs" => 1e-6,
        "ms" => 1e-3,
        "" | "s" => 1.0,
        "m" => 60.0,
        "h" => 3600.0,
        "d" => 86400.0,
        other => {
            return Err(EngineError::Parameter(format!(
                "unknown duration unit '{other}' in '{text}'"
            )));
        }
    };
    Ok(Duration::from_secs_f64(amount * unit_secs))
}
