use serde::{Deserialize, Serialize};

/// The cumulative per-request script budget is already spent
///
/// Returned by `ExecutionTimeTracker::check_limit()` before any sandbox is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("Execution time limit of {limit_ms}ms exceeded: {elapsed_ms}ms")]
pub struct BudgetExceeded {
    pub limit_ms: u64,
    pub elapsed_ms: u64,
}

/// Failure reported by a `SandboxHost`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum SandboxError {
    /// Script ran past its per-call deadline and was killed
    #[error("Script execution timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Script threw (syntax error, uncaught exception, non-zero exit, ...)
    #[error("{0}")]
    RuntimeFault(String),
}

/// Reason why `ScriptGovernor::run_script()` did not return a value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum ScriptError {
    // === Resource limits ===
    /// Cumulative request budget exhausted; the script was never started
    #[error(transparent)]
    BudgetExceeded(#[from] BudgetExceeded),

    /// Single invocation exceeded the per-execution limit
    #[error("Script execution timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    // === Script errors (userland) ===
    /// Script failed on its own
    #[error("{0}")]
    RuntimeFault(String),
}

impl From<SandboxError> for ScriptError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Timeout { timeout_ms } => Self::Timeout { timeout_ms },
            SandboxError::RuntimeFault(msg) => Self::RuntimeFault(msg),
        }
    }
}

impl ScriptError {
    /// Returns true if a time limit (cumulative or per-call) was hit
    pub fn is_limit_exceeded(&self) -> bool {
        matches!(self, Self::BudgetExceeded(_) | Self::Timeout { .. })
    }

    /// Returns true if the script itself errored
    pub fn is_script_error(&self) -> bool {
        matches!(self, Self::RuntimeFault(_))
    }

    /// Short human-readable category
    pub fn description(&self) -> &str {
        match self {
            Self::BudgetExceeded(_) => "Script time limit exceeded for this request",
            Self::Timeout { .. } => "Script exceeded the per-execution time limit",
            Self::RuntimeFault(msg) => msg,
        }
    }

    /// HTTP status a request handler should answer with
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BudgetExceeded(_) => 429, // Too Many Requests
            Self::Timeout { .. } => 504,    // Gateway Timeout
            Self::RuntimeFault(_) => 500,
        }
    }
}

/// Invalid configuration value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_errors_map_to_script_errors() {
        let err: ScriptError = SandboxError::Timeout { timeout_ms: 1000 }.into();
        assert_eq!(err, ScriptError::Timeout { timeout_ms: 1000 });
        assert!(err.is_limit_exceeded());
        assert_eq!(err.http_status(), 504);

        let err: ScriptError = SandboxError::RuntimeFault("ReferenceError: x".into()).into();
        assert!(err.is_script_error());
        assert!(!err.is_limit_exceeded());
        assert_eq!(err.to_string(), "ReferenceError: x");
    }

    #[test]
    fn test_budget_exceeded_message() {
        let err = ScriptError::from(BudgetExceeded {
            limit_ms: 100,
            elapsed_ms: 120,
        });
        assert_eq!(err.to_string(), "Execution time limit of 100ms exceeded: 120ms");
        assert_eq!(err.http_status(), 429);
        assert!(err.is_limit_exceeded());
    }

    #[test]
    fn test_script_error_serializes() {
        let err = ScriptError::Timeout { timeout_ms: 250 };
        let json = serde_json::to_string(&err).unwrap();
        let back: ScriptError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }
}
