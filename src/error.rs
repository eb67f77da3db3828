//! Error taxonomy for the flow engine.
//!
//! Every fallible surface in the crate returns [`EngineError`]. The variants
//! mirror the phases an error can originate from: compilation
//! ([`EngineError::Validation`]), parameter handling at run time, template and
//! secret resolution, transport, upstream services, timeouts, cancellation,
//! kernel script failures, and engine invariants (converted panics).
//!
//! Retry eligibility is a property of the variant, not the call site: the
//! envelope consults [`EngineError::is_retriable`] and never retries
//! cancellation or configuration mistakes.

use std::fmt;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Accumulated compile-time problems for one flow document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    /// Problems that prevent the flow from compiling.
    pub errors: Vec<String>,
    /// Non-fatal findings, e.g. unreachable nodes.
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn is_fatal(&self) -> bool {
        !self.errors.is_empty()
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} problem(s): {}", self.errors.len(), self.errors.join("; "))
    }
}

/// Common error type for all engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Flow document failed to compile; carries every problem found.
    #[error("validation failed: {0}")]
    Validation(ValidationReport),

    /// A run-time parameter is missing or has the wrong shape.
    #[error("parameter error: {0}")]
    Parameter(String),

    /// Template or secret resolution failed.
    #[error("resolution error: {0}")]
    Resolution(String),

    /// Network or I/O failure while talking to an external system.
    #[error("transport error: {0}")]
    Transport(String),

    /// Upstream service answered with a non-success status.
    #[error("upstream error: status {status}: {message}")]
    Upstream { status: u16, message: String },

    /// An attempt exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The enclosing execution was canceled.
    #[error("execution canceled")]
    Canceled,

    /// Kernel-level failure: script error, unknown tool, bad join format.
    #[error("kernel error: {0}")]
    Kernel(String),

    /// Engine bug surfaced as an error instead of a crash.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// A key, flow, or execution does not exist (or has expired).
    #[error("not found: {0}")]
    NotFound(String),

    /// The targeted execution is not active (already terminal or unknown).
    #[error("not found or not active: {0}")]
    NotActive(String),

    /// The durable backend does not support the requested operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether the envelope may re-attempt after this error.
    ///
    /// Only transient transport conditions and timeouts qualify; everything
    /// else either cannot succeed on retry or must terminate the execution.
    pub fn is_retriable(&self) -> bool {
        matches!(self, EngineError::Transport(_) | EngineError::Timeout(_))
    }

    /// Single-line summary suitable for a terminal execution status.
    pub fn summary(&self) -> String {
        let text = self.to_string();
        match text.split_once('\n') {
            Some((first, _)) => first.to_string(),
            None => text,
        }
    }
}
