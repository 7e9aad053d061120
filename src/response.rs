//! Response envelope around one HTTP attempt.
//!
//! Wraps either a raw HTTP response (status + headers + body bytes) or a pure
//! transport failure, classifies the outcome, and parses the body as JSON at
//! most once. Required accessors (`object`, `array`, `text`) turn a parse
//! failure into [`RestError::Parsing`]; the `optional_*` accessors yield
//! `None` instead.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::error::{ApiErrorBody, RestError};

/// `Retry-After` header (seconds, possibly fractional), sent on 429s.
pub const RETRY_AFTER: &str = "Retry-After";

/// Outcome of one HTTP attempt.
#[derive(Debug, Clone)]
pub struct RestResponse {
    status: u16,
    headers: HeaderMap,
    body: Bytes,
    error: Option<Arc<reqwest::Error>>,
    parsed: OnceLock<Result<Value, String>>,
}

impl RestResponse {
    /// Wrap a received HTTP response.
    pub fn from_parts(status: u16, headers: HeaderMap, body: Bytes) -> Self {
        Self { status, headers, body, error: None, parsed: OnceLock::new() }
    }

    /// Wrap a transport failure for which no response was received.
    pub fn from_error(error: reqwest::Error) -> Self {
        Self {
            status: 0,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            error: Some(Arc::new(error)),
            parsed: OnceLock::new(),
        }
    }

    /// HTTP status code (`0` for transport failures).
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Response headers (empty for transport failures).
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of a header, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Raw body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The transport failure, if this attempt never produced a response.
    pub fn transport_error(&self) -> Option<&Arc<reqwest::Error>> {
        self.error.as_ref()
    }

    /// 2xx response.
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 429 response.
    pub fn is_rate_limit(&self) -> bool {
        self.status == 429
    }

    /// Local/transport failure; no HTTP response at all.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Server-requested wait from `Retry-After`, if present.
    pub fn retry_after(&self) -> Option<Duration> {
        let seconds: f64 = self.header(RETRY_AFTER)?.trim().parse().ok()?;
        if seconds.is_finite() && seconds >= 0.0 {
            Some(Duration::from_secs_f64(seconds))
        } else {
            None
        }
    }

    // Parse is attempted at most once; subsequent accessors reuse the result.
    fn json(&self) -> &Result<Value, String> {
        self.parsed.get_or_init(|| {
            serde_json::from_slice(&self.body).map_err(|e| e.to_string())
        })
    }

    /// Required JSON object body.
    pub fn object(&self) -> Result<serde_json::Map<String, Value>, RestError> {
        match self.json() {
            Ok(Value::Object(map)) => Ok(map.clone()),
            Ok(other) => Err(RestError::Parsing {
                detail: format!("expected a JSON object, got {}", json_kind(other)),
            }),
            Err(detail) => Err(RestError::Parsing { detail: detail.clone() }),
        }
    }

    /// Required JSON array body.
    pub fn array(&self) -> Result<Vec<Value>, RestError> {
        match self.json() {
            Ok(Value::Array(items)) => Ok(items.clone()),
            Ok(other) => Err(RestError::Parsing {
                detail: format!("expected a JSON array, got {}", json_kind(other)),
            }),
            Err(detail) => Err(RestError::Parsing { detail: detail.clone() }),
        }
    }

    /// Required UTF-8 text body.
    pub fn text(&self) -> Result<String, RestError> {
        String::from_utf8(self.body.to_vec())
            .map_err(|e| RestError::Parsing { detail: format!("body is not UTF-8: {e}") })
    }

    /// JSON object body, or `None` if the body is absent or malformed.
    pub fn optional_object(&self) -> Option<serde_json::Map<String, Value>> {
        match self.json() {
            Ok(Value::Object(map)) => Some(map.clone()),
            _ => None,
        }
    }

    /// JSON array body, or `None` if the body is absent or malformed.
    pub fn optional_array(&self) -> Option<Vec<Value>> {
        match self.json() {
            Ok(Value::Array(items)) => Some(items.clone()),
            _ => None,
        }
    }

    /// Structured platform error from the body, when one is present.
    pub fn api_error(&self) -> Option<ApiErrorBody> {
        let value = self.json().as_ref().ok()?;
        serde_json::from_value(value.clone()).ok()
    }

    /// Translate this response into the error a caller should see.
    ///
    /// Only meaningful for non-2xx/non-429 responses and transport failures.
    pub fn to_error(&self) -> RestError {
        if let Some(err) = &self.error {
            return RestError::Transport(Arc::clone(err));
        }
        RestError::remote(self.status, self.api_error())
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a JSON array",
        Value::Object(_) => "a JSON object",
    }
}
