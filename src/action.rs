//! Actions: edge labels returned by kernels to select the next node.
//!
//! An action is a short string. `"default"` is the reserved fallthrough name;
//! kernels are free to return anything else (`"true"`, `"client_error"`, a
//! tool name) and the graph decides what, if anything, is wired to it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the reserved fallthrough edge.
pub const DEFAULT_ACTION: &str = "default";

/// An edge label chosen by a kernel at the end of a step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Action(String);

impl Action {
    pub fn new(name: impl Into<String>) -> Self {
        Action(name.into())
    }

    /// The reserved `"default"` action.
    pub fn default_action() -> Self {
        Action(DEFAULT_ACTION.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_default(&self) -> bool {
        self.0 == DEFAULT_ACTION
    }
}

impl Default for Action {
    fn default() -> Self {
        Action::default_action()
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Action {
    fn from(value: &str) -> Self {
        Action(value.to_string())
    }
}

impl From<String> for Action {
    fn from(value: String) -> Self {
        Action(value)
    }
}

impl PartialEq<str> for Action {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for Action {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_action_round_trip() {
        let action = Action::default();
        assert!(action.is_default());
        assert_eq!(action, DEFAULT_ACTION);
        assert_eq!(action.to_string(), "default");
    }

    #[test]
    fn conversions() {
        let a: Action = "client_error".into();
        assert_eq!(a.as_str(), "client_error");
        let b: Action = String::from("get_website").into();
        assert_eq!(b, "get_website");
        assert!(!b.is_default());
    }
}
