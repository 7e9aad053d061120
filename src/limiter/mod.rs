//! Rate-limit admission control.
//!
//! This module decides *when* queued work may execute:
//! - [`RestRateLimiter`]: the seam between the client and a limiter
//!   implementation, so embedders can plug their own.
//! - [`SequentialRateLimiter`]: the default implementation, with per-bucket
//!   FIFO queues keyed by a server-issued hash plus the route's major
//!   parameters, discovered at runtime from response headers.
//! - [`GlobalRateLimit`]: the two account/origin-wide throttles every bucket
//!   consults in addition to its own quota.
//!
//! The server only reveals a bucket's quota in the headers of the first
//! response, so buckets start in an uninitialized state keyed by route + major
//! parameters and migrate to their real identity once the hash is known.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use reqwest::header::HeaderMap;

use crate::clock::{Clock, Sleeper, SystemClock, TokioSleeper};
use crate::request::Work;
use crate::response::RestResponse;

mod bucket;
mod sequential;

pub use sequential::SequentialRateLimiter;

/// Rate-limit response headers, matched verbatim and case-insensitively.
pub mod headers {
    /// Requests allowed per window.
    pub const LIMIT: &str = "X-RateLimit-Limit";
    /// Requests left in the current window.
    pub const REMAINING: &str = "X-RateLimit-Remaining";
    /// Absolute window reset time, epoch seconds (fractional).
    pub const RESET: &str = "X-RateLimit-Reset";
    /// Relative window reset, seconds (fractional); immune to clock skew.
    pub const RESET_AFTER: &str = "X-RateLimit-Reset-After";
    /// Present (`true`) when a 429 is account-wide rather than per-bucket.
    pub const GLOBAL: &str = "X-RateLimit-Global";
    /// Opaque server-issued bucket hash for the route.
    pub const BUCKET: &str = "X-RateLimit-Bucket";
    /// Diagnostic scope of a 429: `user`, `global`, or `shared`.
    pub const SCOPE: &str = "X-RateLimit-Scope";
    /// Absent on responses produced by the edge rather than the API itself.
    pub const VIA: &str = "via";
}

/// Parsed view of the rate-limit headers on one response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitHeaders {
    pub limit: Option<i64>,
    pub remaining: Option<i64>,
    /// Relative reset from `X-RateLimit-Reset-After`.
    pub reset_after: Option<Duration>,
    /// Absolute reset from `X-RateLimit-Reset`, epoch millis.
    pub reset_at_millis: Option<u64>,
    pub bucket: Option<String>,
    pub global: bool,
    pub scope: Option<String>,
    pub retry_after: Option<Duration>,
    /// Whether the response passed through the API proxy at all. A 429
    /// without it came from the edge and throttles the origin IP.
    pub via: bool,
}

impl RateLimitHeaders {
    /// Parse the headers of one response.
    pub fn parse(map: &HeaderMap) -> Self {
        let text = |name: &str| map.get(name).and_then(|v| v.to_str().ok());
        let seconds = |name: &str| {
            let s: f64 = text(name)?.trim().parse().ok()?;
            (s.is_finite() && s >= 0.0).then(|| Duration::from_secs_f64(s))
        };
        Self {
            limit: text(headers::LIMIT).and_then(|v| v.trim().parse().ok()),
            remaining: text(headers::REMAINING).and_then(|v| v.trim().parse().ok()),
            reset_after: seconds(headers::RESET_AFTER),
            reset_at_millis: seconds(headers::RESET)
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            bucket: text(headers::BUCKET).map(str::to_owned),
            global: text(headers::GLOBAL).is_some(),
            scope: text(headers::SCOPE).map(str::to_owned),
            retry_after: seconds(crate::response::RETRY_AFTER),
            via: map.contains_key(headers::VIA),
        }
    }

    /// Parse straight off a response envelope.
    pub fn of(response: &RestResponse) -> Self {
        Self::parse(response.headers())
    }
}

/// The two throttles shared across buckets: the account-wide ("classic")
/// limit and the origin-IP ("cloudflare") limit imposed by the edge.
///
/// Values are epoch millis until which requests must hold off; `0` means no
/// throttle is active. Interaction-scoped buckets are exempt from the classic
/// limit and consult only the cloudflare one.
#[derive(Debug, Default)]
pub struct GlobalRateLimit {
    classic: AtomicU64,
    cloudflare: AtomicU64,
}

impl GlobalRateLimit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Epoch millis until which the account-wide throttle blocks.
    pub fn classic_until(&self) -> u64 {
        self.classic.load(Ordering::SeqCst)
    }

    pub fn set_classic_until(&self, epoch_millis: u64) {
        self.classic.store(epoch_millis, Ordering::SeqCst);
    }

    /// Epoch millis until which the origin-IP throttle blocks.
    pub fn cloudflare_until(&self) -> u64 {
        self.cloudflare.load(Ordering::SeqCst)
    }

    pub fn set_cloudflare_until(&self, epoch_millis: u64) {
        self.cloudflare.store(epoch_millis, Ordering::SeqCst);
    }

    /// Millis a bucket must still wait on the applicable global throttles.
    pub fn delay_millis(&self, now_millis: u64, interaction: bool) -> u64 {
        let mut until = self.cloudflare_until();
        if !interaction {
            until = until.max(self.classic_until());
        }
        until.saturating_sub(now_millis)
    }
}

/// Overridable holder for the process's [`GlobalRateLimit`].
///
/// Several clients talking to the same platform from one process should share
/// a single provider so an account-wide 429 observed by one is honored by all.
#[derive(Debug, Default)]
pub struct GlobalRateLimitProvider {
    inner: ArcSwap<GlobalRateLimit>,
}

impl GlobalRateLimitProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Arc<GlobalRateLimit> {
        self.inner.load_full()
    }

    pub fn replace(&self, global: Arc<GlobalRateLimit>) {
        self.inner.store(global);
    }
}

/// Dependencies and tunables handed to a limiter implementation.
#[derive(Clone)]
pub struct RateLimitConfig {
    pub clock: Arc<dyn Clock>,
    pub sleeper: Arc<dyn Sleeper>,
    pub global: Arc<GlobalRateLimitProvider>,
    /// Prefer the relative `X-RateLimit-Reset-After` header over the absolute
    /// `X-RateLimit-Reset` one (avoids clock skew). Default `true`.
    pub relative_rate_limit: bool,
    /// How often the sweep retires inactive buckets.
    pub cleanup_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
            global: Arc::new(GlobalRateLimitProvider::new()),
            relative_rate_limit: true,
            cleanup_interval: Duration::from_secs(30),
        }
    }
}

impl std::fmt::Debug for RateLimitConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitConfig")
            .field("relative_rate_limit", &self.relative_rate_limit)
            .field("cleanup_interval", &self.cleanup_interval)
            .finish()
    }
}

/// Admission control seam between the client and a limiter implementation.
///
/// The limiter owns queued work exclusively: it decides when each item runs,
/// retries 429s and transport failures internally, and guarantees the item's
/// completion channel fires exactly once.
pub trait RestRateLimiter: Send + Sync {
    /// Queue work for its bucket. Must not block on I/O.
    fn enqueue(&self, work: Work);

    /// Stop accepting new work. With `shutdown_now` everything queued is
    /// cancelled immediately; otherwise the callback fires once queued and
    /// in-flight work has drained naturally.
    fn stop(&self, shutdown_now: bool, callback: Box<dyn FnOnce() + Send>);

    /// Whether `stop` has been called.
    fn is_stopped(&self) -> bool;

    /// Cancel all queued, non-priority, not-yet-cancelled work. Returns the
    /// number of items newly cancelled.
    fn cancel_requests(&self) -> usize;
}

/// Constructor for a pluggable limiter.
pub type RateLimiterFactory = Box<dyn FnOnce(RateLimitConfig) -> Arc<dyn RestRateLimiter> + Send>;

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderMap;

    fn header_map(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                reqwest::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    #[test]
    fn parses_quota_headers() {
        let map = header_map(&[
            ("X-RateLimit-Limit", "5"),
            ("X-RateLimit-Remaining", "3"),
            ("X-RateLimit-Reset-After", "1.250"),
            ("X-RateLimit-Reset", "1700000000.5"),
            ("X-RateLimit-Bucket", "abcd1234"),
            ("via", "1.1 google"),
        ]);
        let parsed = RateLimitHeaders::parse(&map);
        assert_eq!(parsed.limit, Some(5));
        assert_eq!(parsed.remaining, Some(3));
        assert_eq!(parsed.reset_after, Some(Duration::from_millis(1250)));
        assert_eq!(parsed.reset_at_millis, Some(1_700_000_000_500));
        assert_eq!(parsed.bucket.as_deref(), Some("abcd1234"));
        assert!(!parsed.global);
        assert!(parsed.via);
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let map = header_map(&[("x-ratelimit-remaining", "7"), ("retry-after", "2")]);
        let parsed = RateLimitHeaders::parse(&map);
        assert_eq!(parsed.remaining, Some(7));
        assert_eq!(parsed.retry_after, Some(Duration::from_secs(2)));
    }

    #[test]
    fn global_flag_and_scope() {
        let map = header_map(&[
            ("X-RateLimit-Global", "true"),
            ("X-RateLimit-Scope", "global"),
            ("Retry-After", "10"),
        ]);
        let parsed = RateLimitHeaders::parse(&map);
        assert!(parsed.global);
        assert_eq!(parsed.scope.as_deref(), Some("global"));
        assert_eq!(parsed.retry_after, Some(Duration::from_secs(10)));
        assert!(!parsed.via);
    }

    #[test]
    fn malformed_numbers_are_ignored() {
        let map = header_map(&[
            ("X-RateLimit-Remaining", "lots"),
            ("X-RateLimit-Reset-After", "-3"),
        ]);
        let parsed = RateLimitHeaders::parse(&map);
        assert_eq!(parsed.remaining, None);
        assert_eq!(parsed.reset_after, None);
    }

    #[test]
    fn global_delay_applies_per_scope() {
        let global = GlobalRateLimit::new();
        assert_eq!(global.delay_millis(1_000, false), 0);

        global.set_classic_until(5_000);
        assert_eq!(global.delay_millis(1_000, false), 4_000);
        // Interactions are exempt from the classic throttle.
        assert_eq!(global.delay_millis(1_000, true), 0);

        global.set_cloudflare_until(9_000);
        assert_eq!(global.delay_millis(1_000, false), 8_000);
        assert_eq!(global.delay_millis(1_000, true), 8_000);
        assert_eq!(global.delay_millis(10_000, true), 0);
    }

    #[test]
    fn provider_is_swappable() {
        let provider = GlobalRateLimitProvider::new();
        provider.get().set_classic_until(123);
        assert_eq!(provider.get().classic_until(), 123);

        provider.replace(Arc::new(GlobalRateLimit::new()));
        assert_eq!(provider.get().classic_until(), 0);
    }
}
