//! Route templates and their compiled forms.
//!
//! A [`Route`] is an immutable HTTP method + path template with `{name}`
//! placeholders, created once and reused for every call to that endpoint.
//! [`Route::compile`] substitutes concrete values and produces a
//! [`CompiledRoute`]: the literal request path plus the major-parameter key the
//! rate limiter uses to tell bucket scopes apart.
//!
//! Invariants:
//! - A placeholder occupies a whole path segment; braces anywhere else are
//!   rejected at construction time.
//! - `compile` demands exactly `param_count` values.
//! - Compiled values are percent-encoded into the path. Major-parameter values
//!   longer than [`HASHED_MAJOR_THRESHOLD`] contribute a fixed-width hash to
//!   the bucket key instead of the raw value, keeping keys bounded and keeping
//!   secrets (interaction tokens) out of logs; the literal path still carries
//!   the encoded raw value.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

pub use reqwest::Method;

/// Placeholder names that identify an independent rate-limit scope.
pub const MAJOR_PARAMETERS: &[&str] = &["channel_id", "guild_id", "webhook_id", "interaction_token"];

/// Major-parameter values longer than this are hashed into the bucket key.
pub const HASHED_MAJOR_THRESHOLD: usize = 30;

/// Bucket key used when a route has no major parameters.
pub const NO_MAJOR_PARAMETERS: &str = "n/a";

// Conservative superset of characters that must not appear raw in a path
// segment or query component.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'#')
    .add(b'?')
    .add(b'{')
    .add(b'}')
    .add(b'/')
    .add(b'%')
    .add(b'\\')
    .add(b'^')
    .add(b'|');

const QUERY: &AsciiSet =
    &CONTROLS.add(b' ').add(b'"').add(b'<').add(b'>').add(b'#').add(b'&').add(b'=').add(b'+').add(b'%');

/// Errors produced while building or compiling routes.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RouteError {
    /// Template is empty or a segment uses braces incorrectly.
    #[error("malformed template `{template}`: segment `{segment}` misuses braces")]
    MalformedTemplate {
        /// Offending template.
        template: String,
        /// Offending segment (empty when the whole template is empty).
        segment: String,
    },
    /// `compile` was given the wrong number of values.
    #[error("route `{template}` takes {expected} parameters, got {got}")]
    ParamCountMismatch {
        /// Template of the route being compiled.
        template: String,
        /// Number of placeholders in the template.
        expected: usize,
        /// Number of values supplied.
        got: usize,
    },
    /// A query-parameter key was empty.
    #[error("query parameter keys must be non-empty")]
    EmptyQueryKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param { name: String, major: bool },
}

/// Immutable HTTP method + path template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    method: Method,
    template: String,
    segments: Vec<Segment>,
    param_count: usize,
    interaction: bool,
}

impl Route {
    /// Parse a template into a route.
    ///
    /// Every placeholder must be a whole segment of the form `{name}`.
    pub fn new(method: Method, template: &str) -> Result<Self, RouteError> {
        let trimmed = template.trim_matches('/');
        if trimmed.is_empty() {
            return Err(RouteError::MalformedTemplate {
                template: template.to_owned(),
                segment: String::new(),
            });
        }

        let mut segments = Vec::new();
        let mut param_count = 0;
        let mut interaction = false;
        for segment in trimmed.split('/') {
            let malformed = || RouteError::MalformedTemplate {
                template: template.to_owned(),
                segment: segment.to_owned(),
            };
            if segment.starts_with('{') && segment.ends_with('}') && segment.len() > 2 {
                let name = &segment[1..segment.len() - 1];
                if name.contains(['{', '}']) {
                    return Err(malformed());
                }
                if name == "interaction_token" {
                    interaction = true;
                }
                param_count += 1;
                segments.push(Segment::Param {
                    name: name.to_owned(),
                    major: MAJOR_PARAMETERS.contains(&name),
                });
            } else if segment.contains(['{', '}']) || segment.is_empty() {
                return Err(malformed());
            } else {
                segments.push(Segment::Literal(segment.to_owned()));
            }
        }

        Ok(Self { method, template: trimmed.to_owned(), segments, param_count, interaction })
    }

    /// Parse a template for an ad-hoc endpoint not covered by the known table.
    pub fn custom(method: Method, template: &str) -> Result<Self, RouteError> {
        Self::new(method, template)
    }

    /// Like [`custom`](Self::custom), but force the interaction scope even
    /// when the template carries no `{interaction_token}` placeholder.
    pub fn interaction(method: Method, template: &str) -> Result<Self, RouteError> {
        let mut route = Self::new(method, template)?;
        route.interaction = true;
        Ok(route)
    }

    fn known(method: Method, template: &str) -> Self {
        Self::new(method, template).expect("known route template is valid")
    }

    /// HTTP method of this route.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The original (trimmed) template.
    pub fn template(&self) -> &str {
        &self.template
    }

    /// Number of placeholders in the template.
    pub fn param_count(&self) -> usize {
        self.param_count
    }

    /// Whether this route belongs to the interaction scope, which is exempt
    /// from the account-wide global throttle.
    pub fn is_interaction_scoped(&self) -> bool {
        self.interaction
    }

    /// Stable key identifying this route in the server-hash cache.
    pub fn route_key(&self) -> String {
        format!("{}/{}", self.method, self.template)
    }

    /// Substitute placeholder values, producing a compiled route.
    ///
    /// Requires exactly [`param_count`](Self::param_count) values, in template
    /// order.
    pub fn compile(&self, params: &[&str]) -> Result<CompiledRoute, RouteError> {
        if params.len() != self.param_count {
            return Err(RouteError::ParamCountMismatch {
                template: self.template.clone(),
                expected: self.param_count,
                got: params.len(),
            });
        }

        let mut path = String::new();
        let mut major = String::new();
        let mut values = params.iter();
        for segment in &self.segments {
            if !path.is_empty() {
                path.push('/');
            }
            match segment {
                Segment::Literal(lit) => path.push_str(lit),
                Segment::Param { name, major: is_major } => {
                    let value = values.next().expect("length checked above");
                    path.extend(utf8_percent_encode(value, PATH_SEGMENT));
                    if *is_major {
                        if !major.is_empty() {
                            major.push(':');
                        }
                        major.push_str(name);
                        major.push('=');
                        if value.len() > HASHED_MAJOR_THRESHOLD {
                            major.push_str(&hash_major_value(value));
                        } else {
                            major.push_str(value);
                        }
                    }
                }
            }
        }

        if major.is_empty() {
            major.push_str(NO_MAJOR_PARAMETERS);
        }

        Ok(CompiledRoute { route: self.clone(), path, major_parameters: major, query: Vec::new() })
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.method, self.template)
    }
}

/// Hash an over-long major-parameter value to a fixed-width numeric string.
fn hash_major_value(value: &str) -> String {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    format!("{:020}", hasher.finish())
}

/// A [`Route`] with placeholders substituted by concrete values.
///
/// Cheap to clone; all mutating-looking operations return a new value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledRoute {
    route: Route,
    path: String,
    major_parameters: String,
    query: Vec<(String, String)>,
}

impl CompiledRoute {
    /// The route this was compiled from.
    pub fn base_route(&self) -> &Route {
        &self.route
    }

    /// HTTP method.
    pub fn method(&self) -> &Method {
        self.route.method()
    }

    /// Literal path without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Colon-joined `name=value` pairs for the major parameters, or `"n/a"`.
    pub fn major_parameters(&self) -> &str {
        &self.major_parameters
    }

    /// Whether the underlying route is interaction-scoped.
    pub fn is_interaction(&self) -> bool {
        self.route.is_interaction_scoped()
    }

    /// Literal path including the percent-encoded query string, if any.
    pub fn compiled_path(&self) -> String {
        if self.query.is_empty() {
            return self.path.clone();
        }
        let mut out = self.path.clone();
        for (i, (key, value)) in self.query.iter().enumerate() {
            out.push(if i == 0 { '?' } else { '&' });
            out.extend(utf8_percent_encode(key, QUERY));
            out.push('=');
            out.extend(utf8_percent_encode(value, QUERY));
        }
        out
    }

    /// Append query parameters, returning a new compiled route.
    ///
    /// Keys must be non-empty; values are percent-encoded when the path is
    /// rendered.
    pub fn with_query_params(&self, params: &[(&str, &str)]) -> Result<Self, RouteError> {
        if params.iter().any(|(key, _)| key.is_empty()) {
            return Err(RouteError::EmptyQueryKey);
        }
        let mut next = self.clone();
        next.query.extend(params.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())));
        Ok(next)
    }
}

impl fmt::Display for CompiledRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.route.method(), self.compiled_path())
    }
}

/// Well-known routes, mirroring the platform's published endpoint table.
impl Route {
    pub fn get_self() -> Self {
        Self::known(Method::GET, "users/@me")
    }

    pub fn get_user() -> Self {
        Self::known(Method::GET, "users/{user_id}")
    }

    pub fn get_channel() -> Self {
        Self::known(Method::GET, "channels/{channel_id}")
    }

    pub fn modify_channel() -> Self {
        Self::known(Method::PATCH, "channels/{channel_id}")
    }

    pub fn create_message() -> Self {
        Self::known(Method::POST, "channels/{channel_id}/messages")
    }

    pub fn get_message() -> Self {
        Self::known(Method::GET, "channels/{channel_id}/messages/{message_id}")
    }

    pub fn edit_message() -> Self {
        Self::known(Method::PATCH, "channels/{channel_id}/messages/{message_id}")
    }

    pub fn delete_message() -> Self {
        Self::known(Method::DELETE, "channels/{channel_id}/messages/{message_id}")
    }

    pub fn get_guild() -> Self {
        Self::known(Method::GET, "guilds/{guild_id}")
    }

    pub fn get_guild_channels() -> Self {
        Self::known(Method::GET, "guilds/{guild_id}/channels")
    }

    pub fn execute_webhook() -> Self {
        Self::known(Method::POST, "webhooks/{webhook_id}/{webhook_token}")
    }

    pub fn create_interaction_response() -> Self {
        Self::known(Method::POST, "interactions/{interaction_id}/{interaction_token}/callback")
    }

    pub fn edit_original_interaction_response() -> Self {
        Self::known(Method::PATCH, "webhooks/{application_id}/{interaction_token}/messages/@original")
    }
}
