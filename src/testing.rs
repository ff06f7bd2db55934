//! Test utilities for script hosts and governors
//!
//! - [`MockHost`]: a scripted [`SandboxHost`] that records every request it receives
//! - [`generate_host_tests!`](crate::generate_host_tests): standard contract tests
//!   for any `SandboxHost` implementation
//!
//! # Usage
//!
//! ```ignore
//! use script_governor::generate_host_tests;
//!
//! mod my_host_contract {
//!     script_governor::generate_host_tests!(
//!         host: MyHost::new(),
//!         value: ("1 + 1", serde_json::json!(2)),
//!         fault: "throw new Error('nope')",
//!         hang: "while (true) {}",
//!     );
//! }
//! ```

use crate::{PreparedScript, SandboxError, SandboxHost, SandboxRunRequest};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// What a [`MockHost`] does for a given piece of code
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Return `value` after running for `duration`
    Value { value: JsonValue, duration: Duration },
    /// Fail with a runtime fault after running for `duration`
    Fault { message: String, duration: Duration },
    /// Never finish on its own
    Hang,
}

impl MockBehavior {
    pub fn value_after(value: JsonValue, ms: u64) -> Self {
        Self::Value {
            value,
            duration: Duration::from_millis(ms),
        }
    }

    pub fn fault_after(message: impl Into<String>, ms: u64) -> Self {
        Self::Fault {
            message: message.into(),
            duration: Duration::from_millis(ms),
        }
    }
}

/// Scripted host: behaviour is looked up by the exact source code
///
/// Runs take simulated time via `tokio::time::sleep`, so tests using a paused
/// clock get exact durations. Unknown code faults immediately.
#[derive(Debug, Default)]
pub struct MockHost {
    behaviors: HashMap<String, MockBehavior>,
    default: Option<MockBehavior>,
    setup_delay: Duration,
    setup_failure: Option<String>,
    runs: Mutex<Vec<SandboxRunRequest>>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Behaviour for one exact piece of code
    pub fn on(mut self, code: impl Into<String>, behavior: MockBehavior) -> Self {
        self.behaviors.insert(code.into(), behavior);
        self
    }

    /// Behaviour for any code without a specific entry
    pub fn with_default(mut self, behavior: MockBehavior) -> Self {
        self.default = Some(behavior);
        self
    }

    /// Time `prepare` takes before the script can start
    pub fn with_setup_delay(mut self, delay: Duration) -> Self {
        self.setup_delay = delay;
        self
    }

    /// Make every `prepare` fail with a runtime fault
    pub fn with_setup_failure(mut self, message: impl Into<String>) -> Self {
        self.setup_failure = Some(message.into());
        self
    }

    /// Requests received so far, in order
    pub fn runs(&self) -> Vec<SandboxRunRequest> {
        self.recorded().clone()
    }

    pub fn run_count(&self) -> usize {
        self.recorded().len()
    }

    // A test that panicked mid-run must not hide the runs it recorded
    fn recorded(&self) -> MutexGuard<'_, Vec<SandboxRunRequest>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn behavior_for(&self, code: &str) -> MockBehavior {
        self.behaviors
            .get(code)
            .or(self.default.as_ref())
            .cloned()
            .unwrap_or_else(|| MockBehavior::fault_after(format!("no behavior for {code:?}"), 0))
    }
}

impl SandboxHost for MockHost {
    type Prepared = MockRun;

    async fn prepare(&self, request: SandboxRunRequest) -> Result<MockRun, SandboxError> {
        let run = MockRun {
            behavior: self.behavior_for(&request.code),
            timeout: request.timeout,
            timed_out: request.timed_out(),
        };
        self.recorded().push(request);

        tokio::time::sleep(self.setup_delay).await;
        match &self.setup_failure {
            Some(message) => Err(SandboxError::RuntimeFault(message.clone())),
            None => Ok(run),
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// A [`MockHost`] run ready to execute
#[derive(Debug)]
pub struct MockRun {
    behavior: MockBehavior,
    timeout: Duration,
    timed_out: SandboxError,
}

impl PreparedScript for MockRun {
    async fn execute(self) -> Result<JsonValue, SandboxError> {
        let execution = async move {
            match self.behavior {
                MockBehavior::Value { value, duration } => {
                    tokio::time::sleep(duration).await;
                    Ok(value)
                }
                MockBehavior::Fault { message, duration } => {
                    tokio::time::sleep(duration).await;
                    Err(SandboxError::RuntimeFault(message))
                }
                MockBehavior::Hang => std::future::pending().await,
            }
        };

        tokio::time::timeout(self.timeout, execution)
            .await
            .unwrap_or(Err(self.timed_out))
    }
}

/// Generate the standard contract tests for a `SandboxHost`
///
/// `host` is evaluated once per test. `value` is a script and the JSON value it
/// must evaluate to, `fault` a script that errors, `hang` one that never ends.
#[macro_export]
macro_rules! generate_host_tests {
    (
        host: $host:expr,
        value: ($value_code:expr, $expected:expr),
        fault: $fault_code:expr,
        hang: $hang_code:expr $(,)?
    ) => {
        use std::time::Duration;
        use $crate::{Bindings, SandboxError, SandboxHost as _, SandboxRunRequest};

        #[tokio::test]
        async fn test_host_returns_value() {
            let host = $host;
            let request =
                SandboxRunRequest::new($value_code, Bindings::new(), Duration::from_secs(5));

            let value = host.run(request).await.expect("Script should succeed");
            assert_eq!(value, $expected);
        }

        #[tokio::test]
        async fn test_host_reports_runtime_fault() {
            let host = $host;
            let request =
                SandboxRunRequest::new($fault_code, Bindings::new(), Duration::from_secs(5));

            let result = host.run(request).await;
            assert!(
                matches!(result, Err(SandboxError::RuntimeFault(_))),
                "Expected runtime fault, got {:?}",
                result
            );
        }

        #[tokio::test]
        async fn test_host_enforces_timeout() {
            let host = $host;
            let request =
                SandboxRunRequest::new($hang_code, Bindings::new(), Duration::from_millis(200));

            let start = std::time::Instant::now();
            let result = host.run(request).await;

            assert_eq!(result, Err(SandboxError::Timeout { timeout_ms: 200 }));
            assert!(
                start.elapsed() < Duration::from_secs(3),
                "Timed out run should return promptly, took {:?}",
                start.elapsed()
            );
        }

        #[tokio::test]
        async fn test_host_is_reusable_after_failures() {
            let host = $host;

            let hang =
                SandboxRunRequest::new($hang_code, Bindings::new(), Duration::from_millis(100));
            assert!(host.run(hang).await.is_err());

            let fault =
                SandboxRunRequest::new($fault_code, Bindings::new(), Duration::from_secs(5));
            assert!(host.run(fault).await.is_err());

            let ok =
                SandboxRunRequest::new($value_code, Bindings::new(), Duration::from_secs(5));
            assert_eq!(host.run(ok).await.expect("Script should succeed"), $expected);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    mod mock_host_contract {
        use super::{json, MockBehavior, MockHost};

        fn host() -> MockHost {
            MockHost::new()
                .on("1 + 1", MockBehavior::value_after(json!(2), 5))
                .on("throw", MockBehavior::fault_after("Error: nope", 5))
                .on("while (true) {}", MockBehavior::Hang)
        }

        crate::generate_host_tests!(
            host: host(),
            value: ("1 + 1", json!(2)),
            fault: "throw",
            hang: "while (true) {}",
        );
    }

    #[tokio::test]
    async fn test_unknown_code_faults() {
        let host = MockHost::new();
        let request = SandboxRunRequest::new("??", Default::default(), Duration::from_secs(1));

        let result = host.run(request).await;
        assert!(matches!(result, Err(SandboxError::RuntimeFault(_))));
        assert_eq!(host.run_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_records_requests_in_order() {
        let host = MockHost::new().with_default(MockBehavior::value_after(json!(null), 1));

        for code in ["a", "b", "c"] {
            let request = SandboxRunRequest::new(code, Default::default(), Duration::from_secs(1));
            host.run(request).await.unwrap();
        }

        let codes: Vec<_> = host.runs().into_iter().map(|r| r.code).collect();
        assert_eq!(codes, ["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prepare_takes_setup_delay_only() {
        let host = MockHost::new()
            .with_default(MockBehavior::value_after(json!(1), 30))
            .with_setup_delay(Duration::from_millis(200));
        let request = SandboxRunRequest::new("a", Default::default(), Duration::from_secs(1));

        let start = tokio::time::Instant::now();
        let prepared = host.prepare(request).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(200));

        assert_eq!(prepared.execute().await, Ok(json!(1)));
        assert_eq!(start.elapsed(), Duration::from_millis(230));
    }

    #[test]
    fn test_runs_survive_poisoned_lock() {
        let host = MockHost::new();
        host.recorded()
            .push(SandboxRunRequest::new("a", Default::default(), Duration::from_secs(1)));

        let poisoned = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = host.recorded();
            panic!("assertion failed inside a host");
        }));

        assert!(poisoned.is_err());
        assert!(host.runs.is_poisoned());
        assert_eq!(host.run_count(), 1);
        assert_eq!(host.runs()[0].code, "a");
    }
}
