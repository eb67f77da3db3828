//! Retry/timeout envelope around kernel invocations.
//!
//! Every `run` goes through [`Envelope::invoke`]: up to `max_retries + 1`
//! attempts, a sleep of `wait` between failed attempts, an optional
//! per-attempt timeout, and cancellation observed both between attempts and
//! while an attempt is in flight. Cancellation is terminal and never retried;
//! only transient errors ([`EngineError::is_retriable`]) re-attempt. Panics
//! inside a kernel are caught and surfaced as [`EngineError::Invariant`]
//! instead of unwinding through the engine.

use crate::context::SharedContext;
use crate::error::{EngineError, Result};
use crate::kernel::{Kernel, RunOutput};
use crate::params::Params;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Retry and timeout policy for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    /// Additional attempts after the first failure.
    pub max_retries: u32,
    /// Sleep between failed attempts.
    pub wait: Duration,
    /// Per-attempt deadline; `None` defers to the kernel's own default.
    pub timeout: Option<Duration>,
}

impl Default for Envelope {
    fn default() -> Self {
        Self {
            max_retries: 0,
            wait: Duration::ZERO,
            timeout: None,
        }
    }
}

impl Envelope {
    pub fn new(max_retries: u32, wait: Duration) -> Self {
        Self {
            max_retries,
            wait,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Invoke the kernel under this policy.
    pub async fn invoke(
        &self,
        kernel: &dyn Kernel,
        shared: &mut SharedContext,
        params: &Params,
        cancel: &CancellationToken,
    ) -> Result<RunOutput> {
        let deadline = self.timeout.or_else(|| kernel.timeout());
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Canceled);
            }

            match self.attempt(kernel, shared, params, cancel, deadline).await {
                Ok(output) => return Ok(output),
                Err(EngineError::Canceled) => return Err(EngineError::Canceled),
                Err(err) if err.is_retriable() && attempt < self.max_retries => {
                    tracing::debug!(
                        attempt = attempt + 1,
                        max_attempts = self.max_retries + 1,
                        error = %err,
                        "kernel attempt failed, retrying"
                    );
                    attempt += 1;
                    if !self.wait.is_zero() {
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(EngineError::Canceled),
                            _ = tokio::time::sleep(self.wait) => {}
                        }
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt(
        &self,
        kernel: &dyn Kernel,
        shared: &mut SharedContext,
        params: &Params,
        cancel: &CancellationToken,
        deadline: Option<Duration>,
    ) -> Result<RunOutput> {
        let run = AssertUnwindSafe(kernel.run(shared, params)).catch_unwind();
        let guarded = async {
            match run.await {
                Ok(result) => result,
                Err(panic) => Err(EngineError::Invariant(format!(
                    "flow execution panicked: {}",
                    panic_message(&panic)
                ))),
            }
        };

        match deadline {
            Some(limit) => tokio::select! {
                _ = cancel.cancelled() => Err(EngineError::Canceled),
                result = tokio::time::timeout(limit, guarded) => match result {
                    Ok(inner) => inner,
                    Err(_) => Err(EngineError::Timeout(format!(
                        "kernel '{}' exceeded {limit:?}",
                        kernel.tag()
                    ))),
                },
            },
            None => tokio::select! {
                _ = cancel.cancelled() => Err(EngineError::Canceled),
                result = guarded => result,
            },
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::RunOutput;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` attempts, then succeeds.
    struct FlakyKernel {
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyKernel {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Kernel for FlakyKernel {
        fn tag(&self) -> &str {
            "flaky"
        }

        async fn run(&self, _shared: &mut SharedContext, _params: &Params) -> Result<RunOutput> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(EngineError::Transport("connection refused".into()))
            } else {
                Ok(RunOutput::default_action(json!(call + 1)))
            }
        }
    }

    struct SlowKernel;

    #[async_trait]
    impl Kernel for SlowKernel {
        fn tag(&self) -> &str {
            "slow"
        }

        async fn run(&self, _shared: &mut SharedContext, _params: &Params) -> Result<RunOutput> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(RunOutput::default_action(json!(null)))
        }
    }

    struct PanickyKernel;

    #[async_trait]
    impl Kernel for PanickyKernel {
        fn tag(&self) -> &str {
            "panicky"
        }

        async fn run(&self, _shared: &mut SharedContext, _params: &Params) -> Result<RunOutput> {
            panic!("boom");
        }
    }

    struct BadParamsKernel {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Kernel for BadParamsKernel {
        fn tag(&self) -> &str {
            "bad"
        }

        async fn run(&self, _shared: &mut SharedContext, _params: &Params) -> Result<RunOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::Parameter("missing url".into()))
        }
    }

    fn fixture() -> (SharedContext, Params, CancellationToken) {
        (SharedContext::new(), Params::new(), CancellationToken::new())
    }

    #[tokio::test]
    async fn succeeds_when_failures_within_budget() {
        let kernel = FlakyKernel::new(2);
        let (mut shared, params, cancel) = fixture();
        let envelope = Envelope::new(2, Duration::from_millis(1));
        let out = envelope
            .invoke(&kernel, &mut shared, &params, &cancel)
            .await
            .unwrap();
        assert_eq!(out.value, json!(3));
        assert_eq!(kernel.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_attempts_when_failures_exceed_budget() {
        let kernel = FlakyKernel::new(5);
        let (mut shared, params, cancel) = fixture();
        let envelope = Envelope::new(2, Duration::ZERO);
        let err = envelope
            .invoke(&kernel, &mut shared, &params, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Transport(_)));
        // Exactly max_retries + 1 attempts.
        assert_eq!(kernel.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retriable_errors_fail_fast() {
        let kernel = BadParamsKernel {
            calls: AtomicU32::new(0),
        };
        let (mut shared, params, cancel) = fixture();
        let envelope = Envelope::new(5, Duration::ZERO);
        let err = envelope
            .invoke(&kernel, &mut shared, &params, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Parameter(_)));
        assert_eq!(kernel.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let (mut shared, params, cancel) = fixture();
        let envelope = Envelope::new(0, Duration::ZERO)
            .with_timeout(Some(Duration::from_millis(20)));
        let err = envelope
            .invoke(&SlowKernel, &mut shared, &params, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
    }

    #[tokio::test]
    async fn cancellation_short_circuits_retries() {
        let kernel = FlakyKernel::new(100);
        let (mut shared, params, cancel) = fixture();
        let envelope = Envelope::new(100, Duration::from_secs(30));
        cancel.cancel();
        let err = envelope
            .invoke(&kernel, &mut shared, &params, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Canceled));
        assert_eq!(kernel.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_interrupts_inflight_attempt() {
        let (mut shared, params, cancel) = fixture();
        let envelope = Envelope::default();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_clone.cancel();
        });
        let started = std::time::Instant::now();
        let err = envelope
            .invoke(&SlowKernel, &mut shared, &params, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Canceled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn panics_become_invariant_errors() {
        let (mut shared, params, cancel) = fixture();
        let err = Envelope::default()
            .invoke(&PanickyKernel, &mut shared, &params, &cancel)
            .await
            .unwrap_err();
        match err {
            EngineError::Invariant(message) => {
                assert!(message.contains("flow execution panicked"));
                assert!(message.contains("boom"));
            }
            other => panic!("expected invariant error, got {other:?}"),
        }
    }
}
