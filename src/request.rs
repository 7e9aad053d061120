//! Pending work items handed to the rate limiter.
//!
//! A [`Work`] is one queued HTTP call: its compiled route, the fully resolved
//! raw request, an optional deadline, a cooperative cancel flag, an optional
//! pre-flight check, and a one-shot completion channel back to the action that
//! queued it.
//!
//! Lifecycle: pending → (skipped | executing → done). The `done` transition
//! happens exactly once; a 429 leaves the work pending so the bucket can
//! reschedule it, and transport failures leave it pending until
//! [`MAX_TRANSPORT_ATTEMPTS`] is reached.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::client::HttpExecutor;
use crate::error::RestError;
use crate::response::RestResponse;
use crate::route::{CompiledRoute, Method};

/// Transport failures are retried until this many attempts have been made.
pub const MAX_TRANSPORT_ATTEMPTS: u32 = 3;

/// Fully resolved request handed to the transport: bytes in, bytes out.
#[derive(Debug, Clone)]
pub struct RawRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute URL including the query string.
    pub url: String,
    /// Header name/value pairs (authorization, user agent, content type).
    pub headers: Vec<(String, String)>,
    /// Request body, if any.
    pub body: Option<Bytes>,
}

/// Pre-flight gate run immediately before dispatch.
pub type Check = Arc<dyn Fn() -> bool + Send + Sync>;

pub(crate) type Completion = oneshot::Sender<Result<RestResponse, RestError>>;

/// Knobs the action layer sets on the work it queues.
pub(crate) struct WorkOptions {
    pub deadline_millis: u64,
    pub priority: bool,
    pub retry_on_rate_limit: bool,
    pub check: Option<Check>,
    pub cancelled: Arc<AtomicBool>,
}

/// One pending HTTP call, owned by the rate limiter until it resolves.
pub struct Work {
    route: CompiledRoute,
    request: RawRequest,
    executor: Arc<dyn HttpExecutor>,
    deadline_millis: u64,
    priority: bool,
    retry_on_rate_limit: bool,
    check: Option<Check>,
    cancelled: Arc<AtomicBool>,
    attempts: u32,
    tx: Option<Completion>,
}

impl Work {
    pub(crate) fn new(
        route: CompiledRoute,
        request: RawRequest,
        executor: Arc<dyn HttpExecutor>,
        tx: Completion,
        options: WorkOptions,
    ) -> Self {
        Self {
            route,
            request,
            executor,
            deadline_millis: options.deadline_millis,
            priority: options.priority,
            retry_on_rate_limit: options.retry_on_rate_limit,
            check: options.check,
            cancelled: options.cancelled,
            attempts: 0,
            tx: Some(tx),
        }
    }

    /// The compiled route this work targets.
    pub fn route(&self) -> &CompiledRoute {
        &self.route
    }

    /// Priority work survives bulk cancellation.
    pub fn is_priority(&self) -> bool {
        self.priority
    }

    /// Whether the cooperative cancel flag is set.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Set the cancel flag. Returns `true` if this call newly cancelled the
    /// work (it was neither cancelled nor done).
    pub fn cancel(&self) -> bool {
        !self.is_done() && !self.cancelled.swap(true, Ordering::SeqCst)
    }

    /// Whether the terminal result has been delivered.
    pub fn is_done(&self) -> bool {
        self.tx.is_none()
    }

    /// Epoch millis deadline, `0` when none was set.
    pub fn deadline_millis(&self) -> u64 {
        self.deadline_millis
    }

    /// Whether a 429 should be absorbed and rescheduled rather than surfaced.
    pub fn retry_on_rate_limit(&self) -> bool {
        self.retry_on_rate_limit
    }

    /// Number of HTTP attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Why this work must be discarded instead of executed, if any reason
    /// applies. Checked at dequeue time and by the periodic sweep.
    pub fn skip_reason(&self, now_millis: u64) -> Option<RestError> {
        if self.is_cancelled() {
            return Some(RestError::Cancelled);
        }
        if self.deadline_millis > 0 && now_millis > self.deadline_millis {
            return Some(RestError::Timeout { deadline_millis: self.deadline_millis });
        }
        if let Some(check) = &self.check {
            if !check() {
                return Some(RestError::Cancelled);
            }
        }
        None
    }

    /// Perform exactly one HTTP attempt.
    pub async fn execute(&mut self) -> RestResponse {
        self.attempts += 1;
        self.executor.execute(&self.request).await
    }

    /// Deliver the terminal result. Exactly-once: later calls are no-ops, and
    /// a receiver that went away (caller dropped the action) is ignored.
    pub fn resolve(&mut self, result: Result<RestResponse, RestError>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(result);
        }
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Work")
            .field("route", &self.route.to_string())
            .field("deadline_millis", &self.deadline_millis)
            .field("priority", &self.priority)
            .field("attempts", &self.attempts)
            .field("cancelled", &self.is_cancelled())
            .field("done", &self.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::Route;
    use async_trait::async_trait;
    use reqwest::header::HeaderMap;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    struct CountingExecutor(AtomicUsize);

    #[async_trait]
    impl HttpExecutor for CountingExecutor {
        async fn execute(&self, _request: &RawRequest) -> RestResponse {
            self.0.fetch_add(1, Ordering::SeqCst);
            RestResponse::from_parts(200, HeaderMap::new(), Bytes::new())
        }
    }

    fn work(options: WorkOptions) -> (Work, oneshot::Receiver<Result<RestResponse, RestError>>) {
        let route = Route::create_message().compile(&["1"]).unwrap();
        let request = RawRequest {
            method: Method::POST,
            url: "http://localhost/channels/1/messages".into(),
            headers: vec![],
            body: None,
        };
        let (tx, rx) = oneshot::channel();
        (Work::new(route, request, Arc::new(CountingExecutor(AtomicUsize::new(0))), tx, options), rx)
    }

    fn default_options() -> WorkOptions {
        WorkOptions {
            deadline_millis: 0,
            priority: false,
            retry_on_rate_limit: true,
            check: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    #[test]
    fn skip_reasons() {
        let (w, _rx) = work(default_options());
        assert!(w.skip_reason(1_000).is_none());

        let (w, _rx) = work(WorkOptions { deadline_millis: 500, ..default_options() });
        assert!(w.skip_reason(400).is_none());
        assert!(matches!(w.skip_reason(501), Some(RestError::Timeout { deadline_millis: 500 })));

        let (w, _rx) = work(WorkOptions {
            check: Some(Arc::new(|| false)),
            ..default_options()
        });
        assert!(matches!(w.skip_reason(0), Some(RestError::Cancelled)));

        let (w, _rx) = work(default_options());
        w.cancel();
        assert!(matches!(w.skip_reason(0), Some(RestError::Cancelled)));
    }

    #[test]
    fn cancel_reports_first_transition_only() {
        let (w, _rx) = work(default_options());
        assert!(w.cancel());
        assert!(!w.cancel());
    }

    #[test]
    fn cancel_after_done_is_a_noop() {
        let (mut w, _rx) = work(default_options());
        w.resolve(Err(RestError::Cancelled));
        assert!(w.is_done());
        assert!(!w.cancel());
    }

    #[tokio::test]
    async fn resolve_is_exactly_once() {
        let (mut w, mut rx) = work(default_options());
        w.resolve(Err(RestError::Cancelled));
        w.resolve(Err(RestError::Shutdown));
        let first = rx.try_recv().unwrap();
        assert!(matches!(first, Err(RestError::Cancelled)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn execute_counts_attempts() {
        let (mut w, _rx) = work(default_options());
        assert_eq!(w.attempts(), 0);
        let resp = w.execute().await;
        assert!(resp.is_ok());
        assert_eq!(w.attempts(), 1);
    }
}
