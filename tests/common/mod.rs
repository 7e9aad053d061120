//! Shared fixtures: a scripted transport and a deterministic client harness.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chatrest::{
    Clock, HttpExecutor, ManualClock, RawRequest, RestClient, RestResponse,
    SequentialRateLimiter, TrackingSleeper,
};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName};

/// One executed request as the transport saw it.
#[derive(Debug, Clone)]
pub struct Executed {
    pub url: String,
    pub body: Option<Bytes>,
    /// Harness clock reading at execution time.
    pub at_millis: u64,
}

/// Transport double: answers from a queue of scripted responses (then plain
/// 200s) and records every request with a clock timestamp.
pub struct ScriptedExecutor {
    clock: ManualClock,
    script: Mutex<VecDeque<RestResponse>>,
    seen: Mutex<Vec<Executed>>,
}

impl ScriptedExecutor {
    pub fn new(clock: ManualClock) -> Self {
        Self { clock, script: Mutex::new(VecDeque::new()), seen: Mutex::new(Vec::new()) }
    }

    pub fn push(&self, response: RestResponse) {
        self.script.lock().push_back(response);
    }

    pub fn seen(&self) -> Vec<Executed> {
        self.seen.lock().clone()
    }

    pub fn seen_count(&self) -> usize {
        self.seen.lock().len()
    }
}

#[async_trait]
impl HttpExecutor for ScriptedExecutor {
    async fn execute(&self, request: &RawRequest) -> RestResponse {
        self.seen.lock().push(Executed {
            url: request.url.clone(),
            body: request.body.clone(),
            at_millis: self.clock.now_millis(),
        });
        self.script.lock().pop_front().unwrap_or_else(ok)
    }
}

/// Plain 200 with no rate-limit headers.
pub fn ok() -> RestResponse {
    RestResponse::from_parts(200, HeaderMap::new(), Bytes::new())
}

/// Response with the given status and headers.
pub fn response(status: u16, headers: &[(&str, &str)]) -> RestResponse {
    json_response(status, headers, None)
}

/// Response with the given status, headers, and JSON body.
pub fn json_response(
    status: u16,
    headers: &[(&str, &str)],
    body: Option<serde_json::Value>,
) -> RestResponse {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            value.parse().unwrap(),
        );
    }
    let bytes = body
        .map(|v| Bytes::from(serde_json::to_vec(&v).unwrap()))
        .unwrap_or_default();
    RestResponse::from_parts(status, map, bytes)
}

/// Client wired to a manual clock, a fake sleeper, a scripted transport, and
/// a directly inspectable limiter.
pub struct Harness {
    pub client: RestClient,
    pub clock: ManualClock,
    pub sleeper: TrackingSleeper,
    pub executor: Arc<ScriptedExecutor>,
    pub limiter: Arc<SequentialRateLimiter>,
}

/// Harness whose sleeper advances the clock by each requested delay, so
/// waits resolve instantly but scheduling math still sees time pass.
pub fn advancing_harness() -> Harness {
    let clock = ManualClock::new(0);
    build(clock.clone(), TrackingSleeper::advancing(clock))
}

/// Harness whose sleeper records delays but leaves the clock alone; tests
/// move time explicitly with `clock.set` / `clock.advance`.
pub fn frozen_harness() -> Harness {
    build(ManualClock::new(0), TrackingSleeper::new())
}

fn build(clock: ManualClock, sleeper: TrackingSleeper) -> Harness {
    let executor = Arc::new(ScriptedExecutor::new(clock.clone()));
    let slot: Arc<Mutex<Option<Arc<SequentialRateLimiter>>>> = Arc::default();
    let captured = slot.clone();
    let client = RestClient::builder("https://api.example.com")
        .bot_token("test-token")
        .clock(Arc::new(clock.clone()))
        .sleeper(Arc::new(sleeper.clone()))
        .executor(executor.clone())
        .rate_limiter(Box::new(move |config| {
            let limiter = Arc::new(SequentialRateLimiter::new(config));
            *captured.lock() = Some(limiter.clone());
            limiter
        }))
        .build()
        .unwrap();
    let limiter = slot.lock().take().unwrap();
    Harness { client, clock, sleeper, executor, limiter }
}

/// Yield the current-thread scheduler until `predicate` holds (or panic
/// after a bounded number of passes).
pub async fn wait_until(mut predicate: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if predicate() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}
