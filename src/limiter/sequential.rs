//! Default rate limiter: sequential per-bucket drain workers.
//!
//! Scheduling model: every bucket with queued work has at most one drain
//! worker (a tokio task). Work sharing a bucket is strictly serialized in
//! FIFO order; buckets never wait on each other. A single mutex guards the
//! bookkeeping maps (route→hash cache, bucket table, worker set) and is held
//! only for short lookups and moves; HTTP execution always happens outside
//! it.
//!
//! Two-phase bucket discovery: the first call on a route lands in an
//! `uninit` bucket keyed by route + major parameters. Once a response reveals
//! the server hash, the route's queued work migrates to the concrete
//! `hash:major` bucket and the sentinel bucket drains away.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::error::RestError;
use crate::limiter::bucket::Bucket;
use crate::limiter::{RateLimitConfig, RateLimitHeaders, RestRateLimiter};
use crate::request::{Work, MAX_TRANSPORT_ATTEMPTS};
use crate::response::RestResponse;
use crate::route::CompiledRoute;

/// Fallback when a 429 carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Base pause between transport-failure retries (scaled by attempt count).
const TRANSPORT_BACKOFF: Duration = Duration::from_millis(500);

/// Per-bucket FIFO rate limiter with runtime bucket discovery.
#[derive(Clone)]
pub struct SequentialRateLimiter {
    inner: Arc<Inner>,
}

struct Inner {
    config: RateLimitConfig,
    stopped: AtomicBool,
    shutdown_now: AtomicBool,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    /// Route key → server-issued bucket hash, cached from the first response.
    hashes: HashMap<String, String>,
    /// Bucket id → bucket.
    buckets: HashMap<String, Arc<Bucket>>,
    /// Bucket ids that currently have a drain worker scheduled or running.
    running: HashSet<String>,
    /// Routes that have hit a 429 before (controls log level).
    hit_routes: HashSet<String>,
    /// Callbacks waiting for a graceful drain.
    drain_callbacks: Vec<Box<dyn FnOnce() + Send>>,
    sweeper: Option<JoinHandle<()>>,
}

type Callbacks = Vec<Box<dyn FnOnce() + Send>>;

enum Step {
    Sleep(u64),
    Run(Work),
    Again,
    Exit(Callbacks),
}

impl SequentialRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                stopped: AtomicBool::new(false),
                shutdown_now: AtomicBool::new(false),
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Run one cleanup pass immediately; returns the number of buckets
    /// retired. The background sweep calls this on an interval.
    pub fn cleanup(&self) -> usize {
        Inner::cleanup(&self.inner)
    }

    /// Ids of all live buckets (diagnostics).
    pub fn bucket_ids(&self) -> Vec<String> {
        self.inner.state.lock().buckets.keys().cloned().collect()
    }

    /// Total queued work across all buckets (diagnostics).
    pub fn queued_work(&self) -> usize {
        self.inner.state.lock().buckets.values().map(|b| b.queued()).sum()
    }

    /// `(remaining, reset_at_millis, queued)` for one bucket (diagnostics).
    pub fn bucket_snapshot(&self, bucket_id: &str) -> Option<(i64, u64, usize)> {
        self.inner.state.lock().buckets.get(bucket_id).map(|b| b.snapshot())
    }

    /// Cached server hash for a route key (diagnostics).
    pub fn route_hash(&self, route_key: &str) -> Option<String> {
        self.inner.state.lock().hashes.get(route_key).cloned()
    }
}

impl RestRateLimiter for SequentialRateLimiter {
    fn enqueue(&self, mut work: Work) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            work.resolve(Err(RestError::Shutdown));
            return;
        }
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let bucket = Inner::bucket_for(&mut state, work.route());
        tracing::trace!(route = %work.route(), bucket = bucket.id(), "work queued");
        bucket.push_back(work);
        Inner::ensure_sweeper(inner, &mut state);
        Inner::schedule(inner, &mut state, bucket);
    }

    fn stop(&self, shutdown_now: bool, callback: Box<dyn FnOnce() + Send>) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        if shutdown_now {
            self.inner.shutdown_now.store(true, Ordering::SeqCst);
        }
        let callbacks = {
            let mut state = self.inner.state.lock();
            if shutdown_now {
                for bucket in state.buckets.values() {
                    for mut work in bucket.take_queue() {
                        work.resolve(Err(RestError::Cancelled));
                    }
                }
            }
            state.drain_callbacks.push(callback);
            Inner::take_drained(&self.inner, &mut state)
        };
        for cb in callbacks {
            cb();
        }
    }

    fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    fn cancel_requests(&self) -> usize {
        let state = self.inner.state.lock();
        let mut cancelled = 0;
        for bucket in state.buckets.values() {
            bucket.for_each_queued(|work| {
                if !work.is_priority() && work.cancel() {
                    cancelled += 1;
                }
            });
        }
        drop(state);
        if cancelled > 0 {
            tracing::warn!(cancelled, "bulk-cancelled queued requests");
        }
        cancelled
    }
}

impl Inner {
    /// Find or create the bucket for a compiled route, using the cached
    /// server hash when one is known and the uninit sentinel otherwise.
    fn bucket_for(state: &mut State, route: &CompiledRoute) -> Arc<Bucket> {
        let key = route.base_route().route_key();
        let id = match state.hashes.get(&key) {
            Some(hash) => Bucket::real_id(hash, route.major_parameters()),
            None => Bucket::uninit_id(&key, route.major_parameters()),
        };
        Arc::clone(
            state
                .buckets
                .entry(id.clone())
                .or_insert_with(|| Arc::new(Bucket::new(id, route.is_interaction()))),
        )
    }

    /// Ensure exactly one drain worker exists for the bucket.
    fn schedule(inner: &Arc<Inner>, state: &mut State, bucket: Arc<Bucket>) {
        if state.running.insert(bucket.id().to_owned()) {
            let inner = Arc::clone(inner);
            tokio::spawn(async move { Inner::drain(inner, bucket).await });
        }
    }

    fn ensure_sweeper(inner: &Arc<Inner>, state: &mut State) {
        if state.sweeper.is_none() {
            let interval = inner.config.cleanup_interval;
            let weak = Arc::downgrade(inner);
            state.sweeper = Some(tokio::spawn(async move {
                loop {
                    // Real time on purpose: the sweep is housekeeping and must
                    // not consume the injected (possibly fake) sleeper.
                    tokio::time::sleep(interval).await;
                    let Some(inner) = weak.upgrade() else { return };
                    Inner::cleanup(&inner);
                    if inner.stopped.load(Ordering::SeqCst) && inner.state.lock().buckets.is_empty()
                    {
                        return;
                    }
                }
            }));
        }
    }

    /// Drain worker: serializes one bucket's queue, honoring its quota and
    /// the global throttles.
    async fn drain(inner: Arc<Inner>, bucket: Arc<Bucket>) {
        loop {
            if inner.shutdown_now.load(Ordering::SeqCst) {
                for mut work in bucket.take_queue() {
                    work.resolve(Err(RestError::Cancelled));
                }
            }
            let step = {
                let mut state = inner.state.lock();
                if bucket.is_empty() {
                    state.running.remove(bucket.id());
                    Step::Exit(Inner::take_drained(&inner, &mut state))
                } else {
                    let now = inner.config.clock.now_millis();
                    let global_delay = inner
                        .config
                        .global
                        .get()
                        .delay_millis(now, bucket.is_interaction());
                    let delay = bucket.delay_millis(now, global_delay);
                    if delay > 0 {
                        Step::Sleep(delay)
                    } else {
                        match bucket.pop() {
                            None => Step::Again,
                            Some(work) => {
                                if bucket.is_uninit()
                                    && state.hashes.contains_key(&work.route().base_route().route_key())
                                {
                                    // The hash was learned while this item sat
                                    // queued; move it (and the rest of the
                                    // queue) to its real bucket.
                                    let target = Inner::bucket_for(&mut state, work.route());
                                    target.push_back(work);
                                    for item in bucket.take_queue() {
                                        target.push_back(item);
                                    }
                                    Inner::schedule(&inner, &mut state, target);
                                    Step::Again
                                } else {
                                    Step::Run(work)
                                }
                            }
                        }
                    }
                }
            };
            match step {
                Step::Exit(callbacks) => {
                    for cb in callbacks {
                        cb();
                    }
                    return;
                }
                Step::Again => {}
                Step::Sleep(millis) => {
                    inner.config.sleeper.sleep(Duration::from_millis(millis)).await;
                }
                Step::Run(mut work) => {
                    // The pre-flight check is user code; run it off the lock.
                    let now = inner.config.clock.now_millis();
                    if let Some(reason) = work.skip_reason(now) {
                        work.resolve(Err(reason));
                        continue;
                    }
                    let response = work.execute().await;
                    Inner::handle_response(&inner, &bucket, work, response).await;
                }
            }
        }
    }

    /// Fold one executed attempt back into limiter state.
    async fn handle_response(
        inner: &Arc<Inner>,
        bucket: &Arc<Bucket>,
        mut work: Work,
        response: RestResponse,
    ) {
        let now = inner.config.clock.now_millis();

        if response.is_error() {
            if work.attempts() >= MAX_TRANSPORT_ATTEMPTS {
                tracing::warn!(
                    route = %work.route(),
                    attempts = work.attempts(),
                    "transport failure; giving up"
                );
                work.resolve(Err(response.to_error()));
            } else {
                tracing::debug!(
                    route = %work.route(),
                    attempts = work.attempts(),
                    "transport failure; retrying"
                );
                let backoff = TRANSPORT_BACKOFF * work.attempts();
                bucket.push_front(work);
                inner.config.sleeper.sleep(backoff).await;
            }
            return;
        }

        let parsed = RateLimitHeaders::of(&response);
        let route_key = work.route().base_route().route_key();

        // Cache the server hash and migrate an uninit queue to its real
        // bucket. Retries of this very item also target the real bucket.
        let target = {
            let mut state = inner.state.lock();
            if let Some(hash) = &parsed.bucket {
                if state.hashes.insert(route_key.clone(), hash.clone()).is_none() {
                    tracing::debug!(route = %route_key, hash = %hash, "bucket hash discovered");
                }
            }
            let target = Inner::bucket_for(&mut state, work.route());
            if target.id() != bucket.id() {
                for item in bucket.take_queue() {
                    target.push_back(item);
                }
                Inner::schedule(inner, &mut state, Arc::clone(&target));
            }
            target
        };

        if response.is_rate_limit() {
            let retry_after = parsed.retry_after.unwrap_or(DEFAULT_RETRY_AFTER);
            let retry_millis = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX);
            if parsed.global {
                inner.config.global.get().set_classic_until(now + retry_millis);
                tracing::error!(
                    retry_after_millis = retry_millis,
                    scope = parsed.scope.as_deref().unwrap_or("global"),
                    "account-wide rate limit hit"
                );
            } else if !parsed.via {
                inner.config.global.get().set_cloudflare_until(now + retry_millis);
                tracing::error!(
                    retry_after_millis = retry_millis,
                    "origin-IP rate limit hit (response bypassed the API proxy)"
                );
            } else {
                target.apply_rate_limit(now, retry_millis);
                let first = inner.state.lock().hit_routes.insert(route_key.clone());
                if retry_millis >= 60_000 {
                    tracing::warn!(
                        route = %route_key,
                        bucket = target.id(),
                        retry_after_millis = retry_millis,
                        "rate limit exceeded with a long backoff"
                    );
                } else if first {
                    tracing::debug!(
                        route = %route_key,
                        bucket = target.id(),
                        retry_after_millis = retry_millis,
                        "rate limit exceeded"
                    );
                } else {
                    tracing::warn!(
                        route = %route_key,
                        bucket = target.id(),
                        retry_after_millis = retry_millis,
                        "rate limit exceeded"
                    );
                }
            }
            if work.retry_on_rate_limit() {
                target.push_front(work);
                let mut state = inner.state.lock();
                Inner::schedule(inner, &mut state, target);
            } else {
                work.resolve(Err(RestError::RateLimited { retry_after }));
            }
            return;
        }

        target.update(&parsed, now, inner.config.relative_rate_limit);
        work.resolve(Ok(response));
    }

    /// One cleanup pass: resolve expired/cancelled queued work, retire
    /// inactive buckets, and fire drain callbacks when everything is done.
    fn cleanup(inner: &Arc<Inner>) -> usize {
        let stopped = inner.stopped.load(Ordering::SeqCst);
        let shutdown_now = inner.shutdown_now.load(Ordering::SeqCst);
        let (removed, callbacks) = {
            let mut state = inner.state.lock();
            let now = inner.config.clock.now_millis();
            for bucket in state.buckets.values() {
                bucket.remove_queued(
                    |work| {
                        shutdown_now
                            || work.is_cancelled()
                            || (work.deadline_millis() > 0 && now > work.deadline_millis())
                    },
                    |mut work| {
                        let reason = if !work.is_cancelled() && work.deadline_millis() > 0 {
                            RestError::Timeout { deadline_millis: work.deadline_millis() }
                        } else {
                            RestError::Cancelled
                        };
                        work.resolve(Err(reason));
                    },
                );
            }
            let removable: Vec<String> = state
                .buckets
                .iter()
                .filter(|(id, bucket)| {
                    !state.running.contains(*id) && bucket.is_sweepable(now, stopped)
                })
                .map(|(id, _)| id.clone())
                .collect();
            for id in &removable {
                state.buckets.remove(id);
            }
            (removable.len(), Inner::take_drained(inner, &mut state))
        };
        for cb in callbacks {
            cb();
        }
        if removed > 0 {
            tracing::debug!(removed, "retired inactive buckets");
        }
        removed
    }

    /// Collect drain callbacks if the limiter is stopped and fully drained.
    /// Callers must invoke them after releasing the state lock.
    fn take_drained(inner: &Arc<Inner>, state: &mut State) -> Callbacks {
        if !inner.stopped.load(Ordering::SeqCst) {
            return Vec::new();
        }
        let drained =
            state.running.is_empty() && state.buckets.values().all(|bucket| bucket.is_empty());
        if !drained {
            return Vec::new();
        }
        if let Some(sweeper) = state.sweeper.take() {
            sweeper.abort();
        }
        std::mem::take(&mut state.drain_callbacks)
    }
}
