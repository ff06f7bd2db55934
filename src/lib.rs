//! Bounded script execution
//!
//! Runs caller-supplied script snippets on an isolated [`SandboxHost`] under two
//! layered time limits: a hard timeout per invocation, and a cumulative budget
//! shared by every invocation of one logical request ([`RequestContext`]).

mod context;
mod error;
mod governor;
mod host;
mod limits;
mod process;
mod tracker;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use context::{request_scope, RequestContext};
pub use error::{BudgetExceeded, ConfigError, SandboxError, ScriptError};
pub use governor::ScriptGovernor;
pub use host::{
    restrict_bindings, Bindings, PreparedScript, SandboxHost, SandboxRunRequest, DENIED_GLOBALS,
};
pub use limits::{ScriptLimits, PER_EXECUTION_LIMIT_ENV, PER_REQUEST_LIMIT_ENV};
pub use process::{PreparedProcess, ProcessHost, BINDINGS_ENV, READY_MARKER};
pub use tracker::{BudgetSnapshot, ExecutionTimeTracker};
