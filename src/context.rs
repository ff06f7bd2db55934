//! Request-scoped state reachable from anywhere in the request's call graph
//!
//! A [`RequestContext`] is attached to a task with [`RequestContext::scope`] and
//! removed when that future completes. Code running inside the scope reaches it
//! through [`RequestContext::current`] without it being passed down explicitly.

use crate::ExecutionTimeTracker;
use std::future::Future;
use std::num::NonZeroU64;
use std::sync::{Arc, OnceLock};

tokio::task_local! {
    static CURRENT: Arc<RequestContext>;
}

/// State shared by everything that runs on behalf of one logical request
#[derive(Debug, Default)]
pub struct RequestContext {
    script_tracker: OnceLock<Arc<ExecutionTimeTracker>>,
}

impl RequestContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Context of the request the calling task is serving, if any
    pub fn current() -> Option<Arc<Self>> {
        CURRENT.try_with(Arc::clone).ok()
    }

    /// Run `fut` with this context attached
    pub async fn scope<F: Future>(self: Arc<Self>, fut: F) -> F::Output {
        CURRENT.scope(self, fut).await
    }

    /// Run `f` with this context attached
    pub fn sync_scope<R>(self: Arc<Self>, f: impl FnOnce() -> R) -> R {
        CURRENT.sync_scope(self, f)
    }

    /// Script tracker, if a script already ran in this request
    pub fn script_tracker(&self) -> Option<&Arc<ExecutionTimeTracker>> {
        self.script_tracker.get()
    }

    /// Get the request's script tracker, creating it on first use
    ///
    /// The boolean is true when this call created the tracker. Once attached the
    /// tracker is never replaced, even if a later caller asks for another limit.
    pub fn get_or_create_script_tracker(
        &self,
        limit_ms: NonZeroU64,
    ) -> (Arc<ExecutionTimeTracker>, bool) {
        let mut created = false;
        let tracker = self.script_tracker.get_or_init(|| {
            created = true;
            Arc::new(ExecutionTimeTracker::with_limit(limit_ms))
        });
        (Arc::clone(tracker), created)
    }
}

/// Run `fut` inside a fresh request context
pub async fn request_scope<F: Future>(fut: F) -> F::Output {
    RequestContext::new().scope(fut).await
}
