use crate::ConfigError;
use serde::{Deserialize, Deserializer, Serialize};
use std::num::NonZeroU64;
use std::time::Duration;

/// Environment variable holding the cumulative per-request budget (0 or unset = disabled)
pub const PER_REQUEST_LIMIT_ENV: &str = "JS_PER_REQUEST_TIME_LIMIT_MS";
/// Environment variable holding the per-call hard timeout
pub const PER_EXECUTION_LIMIT_ENV: &str = "JS_PER_EXECUTION_TIME_LIMIT_MS";

const DEFAULT_PER_EXECUTION_MS: u64 = 1000;

/// Script time limits configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptLimits {
    /// Wall-clock budget shared by all scripts of one request (default: disabled)
    /// A value of 0 disables cumulative tracking.
    #[serde(default, deserialize_with = "zero_as_none")]
    pub per_request_time_limit_ms: Option<NonZeroU64>,
    /// Hard wall-clock timeout of a single script run (default: 1s)
    #[serde(default = "default_per_execution")]
    pub per_execution_time_limit_ms: NonZeroU64,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            per_request_time_limit_ms: None,
            per_execution_time_limit_ms: default_per_execution(),
        }
    }
}

impl ScriptLimits {
    /// Limits with both knobs set; `per_request_ms == 0` disables cumulative tracking
    pub fn new(per_request_ms: u64, per_execution_ms: NonZeroU64) -> Self {
        Self {
            per_request_time_limit_ms: NonZeroU64::new(per_request_ms),
            per_execution_time_limit_ms: per_execution_ms,
        }
    }

    pub fn per_execution_timeout(&self) -> Duration {
        Duration::from_millis(self.per_execution_time_limit_ms.get())
    }

    /// Read limits from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read limits through `lookup`, falling back to defaults for missing keys
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut limits = Self::default();

        if let Some(ms) = parse_ms(&lookup, PER_REQUEST_LIMIT_ENV)? {
            limits.per_request_time_limit_ms = NonZeroU64::new(ms);
        }

        if let Some(ms) = parse_ms(&lookup, PER_EXECUTION_LIMIT_ENV)? {
            limits.per_execution_time_limit_ms =
                NonZeroU64::new(ms).ok_or_else(|| ConfigError::InvalidValue {
                    key: PER_EXECUTION_LIMIT_ENV.to_string(),
                    value: ms.to_string(),
                    reason: "must be greater than zero".to_string(),
                })?;
        }

        Ok(limits)
    }
}

fn parse_ms(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<u64>, ConfigError> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    trimmed
        .parse::<u64>()
        .map(Some)
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        })
}

fn default_per_execution() -> NonZeroU64 {
    NonZeroU64::new(DEFAULT_PER_EXECUTION_MS).unwrap_or(NonZeroU64::MIN)
}

fn zero_as_none<'de, D>(deserializer: D) -> Result<Option<NonZeroU64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<u64>::deserialize(deserializer)?.and_then(NonZeroU64::new))
}
