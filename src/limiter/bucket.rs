//! Per-scope FIFO buckets.
//!
//! A bucket serializes all work sharing one rate-limit scope. Its identity is
//! `hash:major-parameters`, where the hash is only learned from the first
//! response for the route; until then the bucket carries an `uninit` sentinel
//! identity keyed by route + major parameters, existing purely to serialize
//! concurrent first-time calls so the discovery race cannot stampede the
//! server.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::limiter::RateLimitHeaders;
use crate::request::Work;

/// Sentinel hash for buckets whose server hash is not yet known.
pub(crate) const UNINIT: &str = "uninit";

#[derive(Debug)]
pub(crate) struct BucketState {
    pub queue: VecDeque<Work>,
    pub remaining: i64,
    pub limit: i64,
    pub reset_at_millis: u64,
}

/// One rate-limit scope: a FIFO queue plus the quota learned for it.
#[derive(Debug)]
pub(crate) struct Bucket {
    id: String,
    interaction: bool,
    state: Mutex<BucketState>,
}

impl Bucket {
    pub fn new(id: String, interaction: bool) -> Self {
        Self {
            id,
            interaction,
            // One call is assumed safe until the server says otherwise.
            state: Mutex::new(BucketState {
                queue: VecDeque::new(),
                remaining: 1,
                limit: 1,
                reset_at_millis: 0,
            }),
        }
    }

    /// Identity of a bucket whose hash is still unknown.
    pub fn uninit_id(route_key: &str, major_parameters: &str) -> String {
        format!("{UNINIT}+{route_key}:{major_parameters}")
    }

    /// Identity of a bucket with a known server hash.
    pub fn real_id(hash: &str, major_parameters: &str) -> String {
        format!("{hash}:{major_parameters}")
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_uninit(&self) -> bool {
        self.id.starts_with(UNINIT)
    }

    pub fn is_interaction(&self) -> bool {
        self.interaction
    }

    pub fn push_back(&self, work: Work) {
        self.state.lock().queue.push_back(work);
    }

    /// Re-insert work that must run next (429 retries, transport retries).
    pub fn push_front(&self, work: Work) {
        self.state.lock().queue.push_front(work);
    }

    pub fn pop(&self) -> Option<Work> {
        self.state.lock().queue.pop_front()
    }

    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    /// Move every queued item out, preserving order (bucket migration).
    pub fn take_queue(&self) -> VecDeque<Work> {
        std::mem::take(&mut self.state.lock().queue)
    }

    /// Millis to wait before the next item may run: the larger of the global
    /// throttle delay and this bucket's own backoff. A reset time that has
    /// already elapsed optimistically restores one use rather than waiting
    /// for a fresh response to say so.
    pub fn delay_millis(&self, now_millis: u64, global_delay_millis: u64) -> u64 {
        let mut state = self.state.lock();
        let own = if state.remaining < 1 {
            if state.reset_at_millis <= now_millis {
                state.remaining = 1;
                0
            } else {
                state.reset_at_millis - now_millis
            }
        } else {
            0
        };
        own.max(global_delay_millis)
    }

    /// Fold one response's quota headers into this bucket.
    ///
    /// With `relative` set, `X-RateLimit-Reset-After` wins over the absolute
    /// `X-RateLimit-Reset`; either is used alone when the other is missing.
    pub fn update(&self, parsed: &RateLimitHeaders, now_millis: u64, relative: bool) {
        let mut state = self.state.lock();
        if let Some(limit) = parsed.limit {
            state.limit = limit;
        }
        if let Some(remaining) = parsed.remaining {
            state.remaining = remaining;
        }
        let relative_reset =
            parsed.reset_after.map(|d| now_millis + u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        state.reset_at_millis = if relative {
            relative_reset.or(parsed.reset_at_millis)
        } else {
            parsed.reset_at_millis.or(relative_reset)
        }
        .unwrap_or(state.reset_at_millis);
        tracing::trace!(
            bucket = %self.id,
            remaining = state.remaining,
            limit = state.limit,
            reset_at = state.reset_at_millis,
            "bucket updated"
        );
    }

    /// Apply a per-bucket 429: no uses left until `now + retry_after`.
    pub fn apply_rate_limit(&self, now_millis: u64, retry_after_millis: u64) {
        let mut state = self.state.lock();
        state.remaining = 0;
        state.reset_at_millis = now_millis + retry_after_millis;
    }

    /// Whether the sweep may retire this bucket.
    pub fn is_sweepable(&self, now_millis: u64, stopped: bool) -> bool {
        let state = self.state.lock();
        state.queue.is_empty()
            && (stopped || self.is_uninit() || state.reset_at_millis <= now_millis)
    }

    /// `(remaining, reset_at_millis, queued)` for diagnostics and tests.
    pub fn snapshot(&self) -> (i64, u64, usize) {
        let state = self.state.lock();
        (state.remaining, state.reset_at_millis, state.queue.len())
    }

    /// Run `f` over every queued item (bulk cancel, deadline sweep).
    pub fn for_each_queued<F: FnMut(&Work)>(&self, mut f: F) {
        for work in &self.state.lock().queue {
            f(work);
        }
    }

    /// Drop queued items matching the predicate, handing them to `dispose`.
    pub fn remove_queued<P, D>(&self, mut predicate: P, mut dispose: D) -> usize
    where
        P: FnMut(&Work) -> bool,
        D: FnMut(Work),
    {
        let mut state = self.state.lock();
        let mut kept = VecDeque::with_capacity(state.queue.len());
        let mut removed = 0;
        for work in state.queue.drain(..) {
            if predicate(&work) {
                removed += 1;
                dispose(work);
            } else {
                kept.push_back(work);
            }
        }
        state.queue = kept;
        removed
    }
}
