#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # chatrest
//!
//! Client-side REST pipeline for chat-platform APIs: rate-limit-aware
//! request scheduling with composable, deferred actions.
//!
//! ## Features
//!
//! - **Routes** compiled from templates with per-resource major parameters
//! - **Dynamic buckets** discovered from server rate-limit headers, with
//!   FIFO ordering inside each bucket
//! - **Global throttles** for account-wide and origin-IP 429s, honored by
//!   every bucket (interaction routes exempt from the account-wide one)
//! - **RestAction** composition: `map`, `flat_map`, `zip`, `all_of`,
//!   recovery, delays, deadlines, pre-flight checks
//! - **Deterministic tests** via injectable clock and sleeper
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chatrest::{RestClient, Route};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = RestClient::builder("https://api.example.com/v10")
//!         .bot_token("my-token")
//!         .build()?;
//!
//!     let route = Route::create_message().compile(&["123456789"])?;
//!     let body = serde_json::json!({ "content": "hello" });
//!     let message = client.request_json(route, &body).complete().await?;
//!     println!("created: {:?}", message.object()?);
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod action;
pub mod client;
pub mod clock;
pub mod error;
pub mod limiter;
pub mod request;
pub mod response;
pub mod route;

// Re-exports
pub use action::{RestAction, SubmittedAction};
pub use client::{HttpExecutor, ReqwestExecutor, RestClient, RestClientBuilder};
pub use clock::{Clock, InstantSleeper, ManualClock, Sleeper, SystemClock, TokioSleeper, TrackingSleeper};
pub use error::{ApiErrorBody, RestError};
pub use limiter::{
    GlobalRateLimit, GlobalRateLimitProvider, RateLimitConfig, RateLimitHeaders,
    RateLimiterFactory, RestRateLimiter, SequentialRateLimiter,
};
pub use request::{Check, RawRequest, Work, MAX_TRANSPORT_ATTEMPTS};
pub use response::RestResponse;
pub use route::{CompiledRoute, Method, Route, RouteError};
