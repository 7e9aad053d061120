//! The client facade: transport, credentials, and request construction.
//!
//! [`RestClient`] is a cheap-to-clone handle. It owns the HTTP transport (an
//! [`HttpExecutor`], by default reqwest), the rate limiter, and the pieces
//! every request shares: base URL, authorization token, user agent, and an
//! optional default deadline. [`RestClient::request`] produces a
//! [`RestAction`] that, when run, queues a [`Work`] item with the limiter and
//! awaits its resolution.
//!
//! The limiter and the transport are both seams: tests swap in scripted
//! executors and inspect the limiter directly, and embedders can plug a
//! different admission-control strategy via
//! [`RestClientBuilder::rate_limiter`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::oneshot;
use url::Url;

use crate::action::{ActionConfig, RestAction};
use crate::clock::{Clock, Sleeper, SystemClock, TokioSleeper};
use crate::error::RestError;
use crate::limiter::{
    GlobalRateLimitProvider, RateLimitConfig, RateLimiterFactory, RestRateLimiter,
    SequentialRateLimiter,
};
use crate::request::{Check, RawRequest, Work, WorkOptions};
use crate::response::RestResponse;
use crate::route::CompiledRoute;

const DEFAULT_USER_AGENT: &str = concat!("chatrest/", env!("CARGO_PKG_VERSION"));

/// The transport seam: turn one fully resolved request into a response
/// envelope. Never fails; transport errors come back as an envelope carrying
/// the error so the limiter can apply its retry policy uniformly.
#[async_trait]
pub trait HttpExecutor: Send + Sync {
    async fn execute(&self, request: &RawRequest) -> RestResponse;
}

/// Default transport backed by a shared [`reqwest::Client`].
#[derive(Debug, Clone, Default)]
pub struct ReqwestExecutor {
    http: reqwest::Client,
}

impl ReqwestExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing client (custom TLS, proxies, timeouts).
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl HttpExecutor for ReqwestExecutor {
    async fn execute(&self, request: &RawRequest) -> RestResponse {
        let mut builder = self.http.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        match builder.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let headers = response.headers().clone();
                match response.bytes().await {
                    Ok(body) => RestResponse::from_parts(status, headers, body),
                    Err(err) => RestResponse::from_error(err),
                }
            }
            Err(err) => RestResponse::from_error(err),
        }
    }
}

struct Inner {
    base_url: String,
    token: Option<String>,
    user_agent: String,
    default_deadline: Option<Duration>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    global: Arc<GlobalRateLimitProvider>,
    executor: Arc<dyn HttpExecutor>,
    limiter: Arc<dyn RestRateLimiter>,
}

/// Handle to the REST pipeline. Clones share one limiter and transport.
#[derive(Clone)]
pub struct RestClient {
    inner: Arc<Inner>,
}

impl fmt::Debug for RestClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.inner.base_url)
            .field("user_agent", &self.inner.user_agent)
            .field("authorized", &self.inner.token.is_some())
            .finish()
    }
}

impl RestClient {
    /// Start building a client for the API rooted at `base_url`.
    pub fn builder(base_url: impl Into<String>) -> RestClientBuilder {
        RestClientBuilder::new(base_url)
    }

    /// An action performing a body-less request on `route`.
    ///
    /// The action resolves with the 2xx response; non-2xx replies fail it
    /// with [`RestError::Remote`] (429s are absorbed by the limiter unless
    /// the caller opted out).
    pub fn request(&self, route: CompiledRoute) -> RestAction<RestResponse> {
        self.request_with(route, None, None)
    }

    /// An action performing a JSON request on `route`.
    pub fn request_json<B: Serialize>(
        &self,
        route: CompiledRoute,
        body: &B,
    ) -> RestAction<RestResponse> {
        match serde_json::to_vec(body) {
            Ok(bytes) => {
                self.request_with(route, Some(Bytes::from(bytes)), Some("application/json"))
            }
            Err(err) => RestAction::err(
                self,
                RestError::Parsing { detail: format!("request body serialization: {err}") },
            ),
        }
    }

    /// An action performing a request with an arbitrary body.
    pub fn request_with(
        &self,
        route: CompiledRoute,
        body: Option<Bytes>,
        content_type: Option<&'static str>,
    ) -> RestAction<RestResponse> {
        RestAction::new(
            self.clone(),
            Box::new(move |client, config| {
                client.finish_request(route, body, content_type, config).boxed()
            }),
        )
    }

    /// Build the raw request, hand it to the limiter, await its resolution.
    async fn finish_request(
        self,
        route: CompiledRoute,
        body: Option<Bytes>,
        content_type: Option<&'static str>,
        config: ActionConfig,
    ) -> Result<RestResponse, RestError> {
        let url = format!("{}/{}", self.inner.base_url, route.compiled_path());
        let mut headers = Vec::new();
        if let Some(token) = &self.inner.token {
            headers.push(("Authorization".to_owned(), token.clone()));
        }
        headers.push(("User-Agent".to_owned(), self.inner.user_agent.clone()));
        if let Some(content_type) = content_type.filter(|_| body.is_some()) {
            headers.push(("Content-Type".to_owned(), content_type.to_owned()));
        }
        let request = RawRequest { method: route.method().clone(), url, headers, body };

        let deadline_millis = if config.deadline_millis > 0 {
            config.deadline_millis
        } else {
            self.inner.default_deadline.map_or(0, |timeout| {
                let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                self.inner.clock.now_millis().saturating_add(millis)
            })
        };
        let check: Option<Check> = if config.checks.is_empty() {
            None
        } else {
            let checks = config.checks;
            Some(Arc::new(move || checks.iter().all(|check| check())))
        };

        let (tx, rx) = oneshot::channel();
        let work = Work::new(
            route,
            request,
            self.inner.executor.clone(),
            tx,
            WorkOptions {
                deadline_millis,
                priority: config.priority,
                retry_on_rate_limit: config.retry_on_rate_limit,
                check,
                cancelled: config.cancelled,
            },
        );
        self.inner.limiter.enqueue(work);
        // A dropped completion channel means the limiter discarded the work
        // without resolving it, which only happens during teardown.
        match rx.await {
            Ok(Ok(response)) if response.is_ok() => Ok(response),
            Ok(Ok(response)) => Err(response.to_error()),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(RestError::Shutdown),
        }
    }

    /// Stop accepting new work and wait for queued work to drain.
    pub async fn shutdown(&self) {
        self.stop(false).await;
    }

    /// Stop accepting new work and cancel everything queued.
    pub async fn shutdown_now(&self) {
        self.stop(true).await;
    }

    async fn stop(&self, shutdown_now: bool) {
        let (tx, rx) = oneshot::channel();
        self.inner.limiter.stop(
            shutdown_now,
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        let _ = rx.await;
    }

    /// Whether shutdown has begun.
    pub fn is_stopped(&self) -> bool {
        self.inner.limiter.is_stopped()
    }

    /// Cancel all queued non-priority work. Returns how many items were
    /// newly cancelled.
    pub fn cancel_requests(&self) -> usize {
        self.inner.limiter.cancel_requests()
    }

    /// The account/origin-wide throttle state shared by this client.
    pub fn global_rate_limits(&self) -> Arc<GlobalRateLimitProvider> {
        self.inner.global.clone()
    }

    pub(crate) fn clock(&self) -> Arc<dyn Clock> {
        self.inner.clock.clone()
    }

    pub(crate) fn sleeper(&self) -> Arc<dyn Sleeper> {
        self.inner.sleeper.clone()
    }
}

/// Builder for [`RestClient`].
pub struct RestClientBuilder {
    base_url: String,
    token: Option<String>,
    user_agent: String,
    default_deadline: Option<Duration>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    global: Arc<GlobalRateLimitProvider>,
    relative_rate_limit: bool,
    cleanup_interval: Duration,
    executor: Option<Arc<dyn HttpExecutor>>,
    limiter_factory: Option<RateLimiterFactory>,
}

impl RestClientBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            default_deadline: None,
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
            global: Arc::new(GlobalRateLimitProvider::new()),
            relative_rate_limit: true,
            cleanup_interval: Duration::from_secs(30),
            executor: None,
            limiter_factory: None,
        }
    }

    /// `Authorization` header value, sent verbatim on every request.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Convenience for bot credentials: sends `Bot <token>`.
    pub fn bot_token(self, token: impl AsRef<str>) -> Self {
        let token = token.as_ref();
        self.token(format!("Bot {token}"))
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Deadline applied to every request that does not set its own.
    pub fn default_deadline(mut self, timeout: Duration) -> Self {
        self.default_deadline = Some(timeout);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Share global throttle state with other clients in this process.
    pub fn global_rate_limits(mut self, global: Arc<GlobalRateLimitProvider>) -> Self {
        self.global = global;
        self
    }

    /// Trust the relative reset header over the absolute one (default true).
    pub fn relative_rate_limit(mut self, relative: bool) -> Self {
        self.relative_rate_limit = relative;
        self
    }

    /// How often idle buckets are swept (default 30s).
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Replace the HTTP transport.
    pub fn executor(mut self, executor: Arc<dyn HttpExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Replace the admission-control strategy.
    pub fn rate_limiter(mut self, factory: RateLimiterFactory) -> Self {
        self.limiter_factory = Some(factory);
        self
    }

    pub fn build(self) -> Result<RestClient, RestError> {
        let parsed = Url::parse(&self.base_url).map_err(|err| RestError::Configuration {
            detail: format!("base url {:?}: {err}", self.base_url),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(RestError::Configuration {
                detail: format!("base url {:?}: scheme must be http or https", self.base_url),
            });
        }
        let base_url = self.base_url.trim_end_matches('/').to_owned();

        let config = RateLimitConfig {
            clock: self.clock.clone(),
            sleeper: self.sleeper.clone(),
            global: self.global.clone(),
            relative_rate_limit: self.relative_rate_limit,
            cleanup_interval: self.cleanup_interval,
        };
        let limiter = match self.limiter_factory {
            Some(factory) => factory(config),
            None => Arc::new(SequentialRateLimiter::new(config)),
        };
        let executor = self.executor.unwrap_or_else(|| Arc::new(ReqwestExecutor::new()));

        Ok(RestClient {
            inner: Arc::new(Inner {
                base_url,
                token: self.token,
                user_agent: self.user_agent,
                default_deadline: self.default_deadline,
                clock: self.clock,
                sleeper: self.sleeper,
                global: self.global,
                executor,
                limiter,
            }),
        })
    }
}
