use crate::SandboxError;
use serde_json::Value as JsonValue;
use std::future::Future;
use std::time::Duration;

/// Global bindings made visible to a script, by name
pub type Bindings = serde_json::Map<String, JsonValue>;

/// Globals no script may use, whatever the caller supplied
///
/// Alerts block on a user; timers schedule work that would outlive the
/// per-call deadline.
pub const DENIED_GLOBALS: &[&str] = &["alert", "setInterval", "setTimeout", "setImmediate"];

/// Overwrite every denied global with `null`
///
/// Hosts expose `null` bindings as absent/undefined globals.
pub fn restrict_bindings(mut bindings: Bindings) -> Bindings {
    for name in DENIED_GLOBALS {
        bindings.insert((*name).to_string(), JsonValue::Null);
    }
    bindings
}

/// One invocation handed to a [`SandboxHost`]
#[derive(Debug, Clone)]
pub struct SandboxRunRequest {
    pub code: String,
    pub bindings: Bindings,
    pub timeout: Duration,
}

impl SandboxRunRequest {
    pub fn new(code: impl Into<String>, bindings: Bindings, timeout: Duration) -> Self {
        Self {
            code: code.into(),
            bindings,
            timeout,
        }
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }

    /// Error a host reports when this request runs past its deadline
    pub fn timed_out(&self) -> SandboxError {
        SandboxError::Timeout {
            timeout_ms: self.timeout_ms(),
        }
    }
}

/// A script loaded into a ready sandbox, not yet started
pub trait PreparedScript: Send {
    /// Run the script until it finishes or its deadline passes
    fn execute(self) -> impl Future<Output = Result<JsonValue, SandboxError>> + Send;
}

/// Isolated script execution capability
///
/// Implementations must:
/// - evaluate `code` with only `bindings` (plus the language's builtins) in scope
/// - stop the script and return `SandboxError::Timeout` once `timeout` elapses
/// - return `SandboxError::RuntimeFault` for any error raised by the script
/// - never retry a failed run
///
/// Building the sandbox (`prepare`) is kept apart from running the script
/// (`PreparedScript::execute`) so callers can time the two separately.
pub trait SandboxHost: Send + Sync {
    type Prepared: PreparedScript;

    /// Build the isolated environment for `request` without running any of its code
    fn prepare(
        &self,
        request: SandboxRunRequest,
    ) -> impl Future<Output = Result<Self::Prepared, SandboxError>> + Send;

    /// Prepare and execute in one go, returning the completion value
    fn run(
        &self,
        request: SandboxRunRequest,
    ) -> impl Future<Output = Result<JsonValue, SandboxError>> + Send {
        async move { self.prepare(request).await?.execute().await }
    }

    /// Host name, for logs
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_denied_globals_are_overridden() {
        let mut bindings = Bindings::new();
        bindings.insert("setTimeout".into(), json!("function"));
        bindings.insert("alert".into(), json!(true));
        bindings.insert("row".into(), json!({ "id": 1 }));

        let restricted = restrict_bindings(bindings);

        for name in DENIED_GLOBALS {
            assert_eq!(restricted.get(*name), Some(&JsonValue::Null), "{name}");
        }
        assert_eq!(restricted.get("row"), Some(&json!({ "id": 1 })));
    }

    #[test]
    fn test_denied_globals_added_when_missing() {
        let restricted = restrict_bindings(Bindings::new());
        assert_eq!(restricted.len(), DENIED_GLOBALS.len());
    }

    #[test]
    fn test_timed_out_carries_deadline() {
        let req = SandboxRunRequest::new("1", Bindings::new(), Duration::from_millis(1500));
        assert_eq!(req.timed_out(), SandboxError::Timeout { timeout_ms: 1500 });
    }
}
