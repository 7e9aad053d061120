//! Error types for the REST layer.
//!
//! Semantics:
//! - `Transport` means no HTTP response was received at all; the rate limiter
//!   retries these a bounded number of times before surfacing the error.
//! - `RateLimited` is only ever surfaced when the caller opted out of
//!   transparent 429 handling via [`RestAction::complete_with(false)`];
//!   otherwise 429s are absorbed and rescheduled internally.
//! - Every other variant is terminal: it is delivered to the failure callback
//!   (or returned from `complete()`) exactly once and never swallowed.
//!
//! [`RestAction::complete_with(false)`]: crate::action::RestAction::complete_with

use std::sync::Arc;
use std::time::Duration;

/// Structured error body returned by the platform for non-2xx responses.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct ApiErrorBody {
    /// Platform-specific error code.
    #[serde(default)]
    pub code: i64,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
}

/// Unified error type for everything the REST layer can fail with.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum RestError {
    /// Transport/IO failure; no HTTP response was received.
    #[error("transport failure: {0}")]
    Transport(Arc<reqwest::Error>),
    /// The deadline elapsed before the request was dispatched.
    #[error("request deadline ({deadline_millis} ms epoch) elapsed before dispatch")]
    Timeout {
        /// Epoch millis the request had to complete by.
        deadline_millis: u64,
    },
    /// Cancelled by the caller, a bulk cancel, or a failed pre-flight check.
    #[error("request cancelled before execution")]
    Cancelled,
    /// A 429 surfaced to the caller because transparent retries were disabled.
    #[error("rate limited; retry after {retry_after:?}")]
    RateLimited {
        /// Server-requested wait before the next attempt.
        retry_after: Duration,
    },
    /// Non-2xx, non-429 response from the platform.
    #[error("API error {status}: {message} (code {code})")]
    Remote {
        /// HTTP status code.
        status: u16,
        /// Platform error code, `0` when the body carried none.
        code: i64,
        /// Platform error message or HTTP status text.
        message: String,
    },
    /// A required body parse failed.
    #[error("failed to parse response body: {detail}")]
    Parsing {
        /// What went wrong.
        detail: String,
    },
    /// Work was handed to a rate limiter that has been stopped.
    #[error("rate limiter is shut down")]
    Shutdown,
    /// `complete()` was awaited from inside a queue callback.
    #[error("complete() awaited inside a queue callback; chain with flat_map() or use queue()")]
    Recursion,
    /// Client construction was given an unusable setting.
    #[error("invalid client configuration: {detail}")]
    Configuration {
        /// What was wrong.
        detail: String,
    },
}

impl RestError {
    /// Build a `Remote` error from a response status and optional error body.
    pub fn remote(status: u16, body: Option<ApiErrorBody>) -> Self {
        match body {
            Some(body) => Self::Remote { status, code: body.code, message: body.message },
            None => Self::Remote { status, code: 0, message: format!("HTTP {status}") },
        }
    }

    /// Check if this error is a transport failure.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Check if this error is a deadline timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if the request was cancelled before execution.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Check if this error is a surfaced 429.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Check if this error is a structured platform error.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }

    /// Check if this error is a body parse failure.
    pub fn is_parsing(&self) -> bool {
        matches!(self, Self::Parsing { .. })
    }

    /// Platform error code, if this is a `Remote` error.
    pub fn remote_code(&self) -> Option<i64> {
        match self {
            Self::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// HTTP status, if this is a `Remote` error.
    pub fn remote_status(&self) -> Option<u16> {
        match self {
            Self::Remote { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Server-requested wait, if this is a surfaced 429.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}
