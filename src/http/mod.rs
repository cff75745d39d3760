//! Abstract HTTP transport (§6 `Http`) and the wire types it exchanges.
//!
//! Only the trait matters to the rest of the crate; platform-specific
//! transports are an external concern (§1). [`ReqwestTransport`] is the one
//! default implementation this crate ships, used by the end-to-end tests and
//! by callers who don't want to bring their own.

mod reqwest_transport;

pub use reqwest_transport::ReqwestTransport;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;

use crate::error::OlpError;

/// Monotonically increasing id assigned to each outgoing request, used for
/// [`Http::cancel`] and for log correlation.
pub type RequestId = u64;

/// HTTP method for an outgoing request. A small closed set suffices for this
/// crate's needs (reads, writes, and the lookup/token endpoints).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// HTTP GET.
    Get,
    /// HTTP POST.
    Post,
    /// HTTP PUT.
    Put,
    /// HTTP DELETE.
    Delete,
}

impl Method {
    /// The method's canonical uppercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

/// An outgoing HTTP request.
///
/// Headers preserve insertion order (a `Vec`, not a `HashMap`) because header
/// order is observable to some servers and to tests asserting exact wire
/// shape; name lookup is case-insensitive via [`HttpResponse::header`].
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute request URL.
    pub url: String,
    /// Ordered `(name, value)` header pairs.
    pub headers: Vec<(String, String)>,
    /// Optional request body.
    pub body: Option<Bytes>,
    /// Per-attempt timeout; `None` means no explicit per-request timeout is
    /// applied by the transport (the executor's own retry loop still enforces
    /// `RetrySettings::timeout_per_attempt`).
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    /// Start building a request with the given method and URL.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        HttpRequest {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    /// Append a header, preserving insertion order.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Attach a body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Basic per-request network statistics, surfaced for observability but not
/// interpreted by this crate.
#[derive(Debug, Clone, Default)]
pub struct NetworkStatistics {
    /// Bytes sent, including headers.
    pub bytes_uploaded: u64,
    /// Bytes received, including headers.
    pub bytes_downloaded: u64,
    /// Wall-clock duration of the request.
    pub duration: Duration,
}

/// Response to an [`HttpRequest`].
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Ordered `(name, value)` header pairs, as received.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: Bytes,
    /// Basic statistics about the exchange.
    pub network_statistics: NetworkStatistics,
}

impl HttpResponse {
    /// Case-insensitive header lookup, returning the first match in
    /// insertion order.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// `true` for 2xx status codes.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parse a `Cache-Control: max-age=<seconds>` header into a [`Duration`],
    /// if present. Absence of the header, or a malformed value, means "no
    /// expiry" per §4.4/§4.5.
    pub fn max_age(&self) -> Option<Duration> {
        let header = self.header("cache-control")?;
        header.split(',').find_map(|directive| {
            let directive = directive.trim();
            let rest = directive.strip_prefix("max-age=")?;
            rest.parse::<u64>().ok().map(Duration::from_secs)
        })
    }
}

/// A future returned by [`Http::send`], resolving once the response (or a
/// transport error) is available.
pub type SendFuture<'a> = Pin<Box<dyn Future<Output = Result<HttpResponse, OlpError>> + Send + 'a>>;

/// Abstract HTTP transport. Platform-specific implementations (native TLS
/// stacks, WASM fetch, ...) are an external concern; this crate only relies
/// on this trait plus the [`ReqwestTransport`] default.
pub trait Http: Send + Sync {
    /// Start sending `request`, returning its assigned id immediately and a
    /// future that resolves to the response.
    fn send(&self, request: HttpRequest) -> (RequestId, SendFuture<'_>);

    /// Best-effort cancellation of an in-flight request by id. Safe to call
    /// after the request has already completed.
    fn cancel(&self, request_id: RequestId);
}

/// Retry policy for a single logical operation (§3 `RetrySettings`).
#[derive(Clone)]
pub struct RetrySettings {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Backoff before the first retry.
    pub initial_backoff: Duration,
    /// `(attempt, initial_backoff) -> backoff_duration`, where `attempt` is
    /// the 1-based count of the attempt about to be retried.
    pub backoff_strategy: std::sync::Arc<dyn Fn(u32, Duration) -> Duration + Send + Sync>,
    /// Predicate deciding whether a completed response should be retried.
    pub retry_condition: std::sync::Arc<dyn Fn(&HttpResponse) -> bool + Send + Sync>,
    /// Deadline applied to each individual attempt.
    pub timeout_per_attempt: Duration,
}

impl std::fmt::Debug for RetrySettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrySettings")
            .field("max_attempts", &self.max_attempts)
            .field("initial_backoff", &self.initial_backoff)
            .field("timeout_per_attempt", &self.timeout_per_attempt)
            .finish()
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            backoff_strategy: std::sync::Arc::new(|attempt, initial| {
                initial * 2u32.saturating_pow(attempt.saturating_sub(1))
            }),
            retry_condition: std::sync::Arc::new(|response| response.status >= 500),
            timeout_per_attempt: Duration::from_secs(30),
        }
    }
}

/// Build the ordered header list for a bearer-authenticated request.
pub fn bearer_header(token: &str) -> (String, String) {
    ("Authorization".to_string(), format!("Bearer {token}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with_headers(headers: Vec<(&str, &str)>) -> HttpResponse {
        HttpResponse {
            status: 200,
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: Bytes::new(),
            network_statistics: NetworkStatistics::default(),
        }
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let response = response_with_headers(vec![("Cache-Control", "max-age=60")]);
        assert_eq!(response.header("cache-control"), Some("max-age=60"));
        assert_eq!(response.header("CACHE-CONTROL"), Some("max-age=60"));
    }

    #[test]
    fn max_age_parses_seconds() {
        let response = response_with_headers(vec![("Cache-Control", "max-age=120")]);
        assert_eq!(response.max_age(), Some(Duration::from_secs(120)));
    }

    #[test]
    fn max_age_absent_header_is_none() {
        let response = response_with_headers(vec![]);
        assert_eq!(response.max_age(), None);
    }

    #[test]
    fn max_age_malformed_is_none() {
        let response = response_with_headers(vec![("Cache-Control", "no-cache")]);
        assert_eq!(response.max_age(), None);
    }
}
