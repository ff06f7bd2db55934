//! Script execution governor
//!
//! Every run goes through the same steps:
//!
//! 1. resolve the request's [`ExecutionTimeTracker`] (or none when budgeting is off)
//! 2. reject the run if the request budget is already spent, before touching the host
//! 3. strip denied globals from the caller's bindings
//! 4. have the host build the sandbox, uncharged
//! 5. execute the script under the per-call timeout, charging the time to the
//!    tracker whatever the outcome
//!
//! A run that pushes the tracker over budget still returns its value; only the
//! next run of the same request is rejected.

use crate::{
    restrict_bindings, Bindings, BudgetExceeded, BudgetSnapshot, ExecutionTimeTracker,
    PreparedScript, RequestContext, SandboxHost, SandboxRunRequest, ScriptError, ScriptLimits,
};
use serde_json::Value as JsonValue;
use std::future::Future;
use std::sync::Arc;
use tracing::field::Empty;
use tracing::Instrument;

/// Budget in force for one run
enum Budget {
    Tracked(Arc<ExecutionTimeTracker>),
    Untracked,
}

impl Budget {
    fn check_limit(&self) -> Result<(), BudgetExceeded> {
        match self {
            Self::Tracked(tracker) => tracker.check_limit(),
            Self::Untracked => Ok(()),
        }
    }

    async fn track<F: Future>(&self, fut: F) -> F::Output {
        match self {
            Self::Tracked(tracker) => tracker.track(fut).await,
            Self::Untracked => fut.await,
        }
    }
}

/// Runs scripts on a [`SandboxHost`] under per-call and per-request time limits
pub struct ScriptGovernor<H> {
    host: H,
    limits: ScriptLimits,
}

impl<H: SandboxHost> ScriptGovernor<H> {
    pub fn new(host: H, limits: ScriptLimits) -> Self {
        Self { host, limits }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn limits(&self) -> &ScriptLimits {
        &self.limits
    }

    /// Budget of the current request, if a script already ran in it
    pub fn budget(&self) -> Option<BudgetSnapshot> {
        RequestContext::current()?
            .script_tracker()
            .map(|tracker| tracker.snapshot())
    }

    /// Run `code` with the caller's `bindings` and return its completion value
    ///
    /// Budget accounting applies when a per-request limit is configured and the
    /// calling task is inside a [`RequestContext`] scope.
    pub async fn run_script(
        &self,
        code: &str,
        bindings: Bindings,
    ) -> Result<JsonValue, ScriptError> {
        let span = tracing::info_span!(
            "run_script",
            host = self.host.name(),
            limit_ms = Empty,
            elapsed_before_ms = Empty,
            created_tracker = Empty,
        );

        async move {
            let budget = self.resolve_budget();

            if let Err(exceeded) = budget.check_limit() {
                tracing::warn!(
                    limit_ms = exceeded.limit_ms,
                    elapsed_ms = exceeded.elapsed_ms,
                    "Script rejected, request time budget exhausted"
                );
                return Err(exceeded.into());
            }

            let request = SandboxRunRequest::new(
                code,
                restrict_bindings(bindings),
                self.limits.per_execution_timeout(),
            );

            let prepared = self.host.prepare(request).await.map_err(|err| {
                tracing::debug!(error = %err, "Sandbox setup failed");
                ScriptError::from(err)
            })?;

            let result = budget.track(prepared.execute()).await;

            if let Budget::Tracked(tracker) = &budget {
                tracing::debug!(elapsed_ms = tracker.elapsed_ms(), "Script time accounted");
            }

            result.map_err(|err| {
                tracing::debug!(error = %err, "Script failed");
                ScriptError::from(err)
            })
        }
        .instrument(span)
        .await
    }

    fn resolve_budget(&self) -> Budget {
        let Some(limit_ms) = self.limits.per_request_time_limit_ms else {
            return Budget::Untracked;
        };
        let Some(ctx) = RequestContext::current() else {
            return Budget::Untracked;
        };

        let (tracker, created) = ctx.get_or_create_script_tracker(limit_ms);
        if created {
            tracing::debug!(limit_ms = limit_ms.get(), "Created script execution tracker");
        }

        let span = tracing::Span::current();
        span.record("created_tracker", created);
        span.record("limit_ms", tracker.limit_ms());
        span.record("elapsed_before_ms", tracker.elapsed_ms());

        Budget::Tracked(tracker)
    }
}
