//! Shared context: the per-execution mapping carried between nodes.
//!
//! The context is the sole channel of inter-node communication. The engine
//! owns it exclusively for the lifetime of one execution and commits kernel
//! outputs between steps; kernels never see another execution's context.
//!
//! Reserved, engine-owned keys all start with `_` (`_execution`,
//! `_flow_context`, `_parallel_results`) plus the result slots `result` and
//! `<tag>_result` and the router's `active_tool_call`. Final `results`
//! returned to callers strip the `_`-prefixed keys.

use serde_json::{Map, Value, json};

/// Key holding the last-run kernel's primary output.
pub const RESULT_KEY: &str = "result";
/// Key holding execution identity metadata.
pub const EXECUTION_KEY: &str = "_execution";
/// Key holding accumulated per-node results.
pub const FLOW_CONTEXT_KEY: &str = "_flow_context";
/// Key holding fan-out branch results in declaration order.
pub const PARALLEL_RESULTS_KEY: &str = "_parallel_results";
/// Key where the router stashes a detected LLM tool call.
pub const ACTIVE_TOOL_CALL_KEY: &str = "active_tool_call";

/// Per-execution mutable state, exclusively owned by one execution.
#[derive(Debug, Clone, Default)]
pub struct SharedContext {
    values: Map<String, Value>,
}

impl SharedContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the context from caller-provided input.
    ///
    /// Object inputs are spread into top-level keys and also kept whole under
    /// `input`; any other shape is stored under `input` only.
    pub fn from_input(input: Value) -> Self {
        let mut ctx = Self::new();
        if let Value::Object(map) = &input {
            for (k, v) in map {
                ctx.values.insert(k.clone(), v.clone());
            }
        }
        let keep_whole = match &input {
            Value::Null => false,
            Value::Object(map) => !map.is_empty(),
            _ => true,
        };
        if keep_whole {
            ctx.values.insert("input".to_string(), input);
        }
        ctx
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_cloned(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }

    /// Annotate execution identity (`_execution`).
    pub fn set_execution_meta(&mut self, execution_id: &str, flow_id: &str, account_id: &str) {
        self.values.insert(
            EXECUTION_KEY.to_string(),
            json!({
                "execution_id": execution_id,
                "flow_id": flow_id,
                "account_id": account_id,
            }),
        );
    }

    pub fn execution_meta(&self) -> Option<&Value> {
        self.values.get(EXECUTION_KEY)
    }

    /// Commit a kernel's primary output: `result`, `<tag>_result`, and the
    /// per-node entry under `_flow_context.node_results`.
    pub fn commit_result(&mut self, node_id: &str, tag: &str, value: Value) {
        self.values
            .insert(format!("{tag}_result"), value.clone());
        let flow_ctx = self
            .values
            .entry(FLOW_CONTEXT_KEY.to_string())
            .or_insert_with(|| json!({ "node_results": {} }));
        if let Some(results) = flow_ctx
            .as_object_mut()
            .and_then(|m| m.get_mut("node_results"))
            .and_then(Value::as_object_mut)
        {
            results.insert(node_id.to_string(), value.clone());
        }
        self.values.insert(RESULT_KEY.to_string(), value);
    }

    pub fn last_result(&self) -> Option<&Value> {
        self.values.get(RESULT_KEY)
    }

    /// Snapshot for a fan-out branch. Branches own their copy; nothing they
    /// write flows back except through `_parallel_results`.
    pub fn snapshot(&self) -> SharedContext {
        self.clone()
    }

    pub fn set_parallel_results(&mut self, results: Vec<Value>) {
        self.values
            .insert(PARALLEL_RESULTS_KEY.to_string(), Value::Array(results));
    }

    pub fn parallel_results(&self) -> Option<&Vec<Value>> {
        self.values.get(PARALLEL_RESULTS_KEY).and_then(Value::as_array)
    }

    /// Caller-visible results: everything except engine-owned `_` keys.
    pub fn into_results(self) -> Value {
        let filtered: Map<String, Value> = self
            .values
            .into_iter()
            .filter(|(k, _)| !k.starts_with('_'))
            .collect();
        Value::Object(filtered)
    }
}
