//! Auto-refreshing OAuth2-style token provider (§4.3).
//!
//! A single mutex is held across the network round trip so concurrent
//! callers serialize onto one refresh instead of each issuing their own
//! POST. The refresh decision is `ForceRefresh` when the caller's
//! `minimum_validity` is zero, otherwise `now >= token_refresh_time`; the
//! refresh time is recomputed from the new token's `expires_in` immediately
//! after each successful refresh.

pub mod signer;

pub use signer::{HmacSigner, Signer};

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::cancellation::CancellationContext;
use crate::clock::Clock;
use crate::http::{Http, HttpRequest, HttpResponse, Method, RetrySettings};
use crate::scheduler::TaskScheduler;

/// Client credentials used to sign token requests.
#[derive(Clone)]
pub struct Credentials {
    /// The client (application) identifier.
    pub client_id: String,
    /// The client secret. Never logged or included in `Debug` output.
    pub client_secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// A live access token (§3 `TokenEntry`'s public projection).
#[derive(Debug, Clone)]
pub struct Token {
    /// The bearer token value.
    pub access_token: String,
    /// Absolute wall-clock expiry, as reported by the token endpoint.
    pub expires_at: DateTime<Utc>,
    /// The granted scope, if the endpoint returned one.
    pub scope: Option<String>,
}

impl Token {
    /// `true` once `now` has reached or passed [`Token::expires_at`].
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// The `Authorization: Bearer <token>` header pair for this token.
    pub fn authorization_header(&self) -> (String, String) {
        crate::http::bearer_header(&self.access_token)
    }
}

/// Error from [`TokenProvider::get_token`].
#[derive(Error, Debug, Clone)]
pub enum TokenError {
    /// Cooperative cancellation reached a checkpoint.
    #[error("token request cancelled")]
    Cancelled,
    /// Transport-level failure.
    #[error("network error: {0}")]
    Network(String),
    /// The token endpoint rejected the credentials (401/403, not a clock-skew
    /// retry candidate).
    #[error("access denied (status={status:?}): {message}")]
    AccessDenied {
        /// HTTP status, if the rejection came from a response.
        status: Option<u16>,
        /// Additional detail.
        message: String,
    },
    /// The token endpoint returned 5xx, or every retry was exhausted.
    #[error("token service unavailable (status={status:?}): {message}")]
    ServiceUnavailable {
        /// HTTP status, if any.
        status: Option<u16>,
        /// Additional detail.
        message: String,
    },
    /// A 2xx response failed to parse as a token payload.
    #[error("invalid token response: {0}")]
    InvalidResponse(String),
}

/// Configuration for a [`TokenProvider`] (§4.3, §6).
pub struct TokenProviderConfig {
    /// Base URL of the token endpoint, e.g. `https://account.example.com`.
    /// `/oauth2/token` and `/timestamp` are appended by the provider.
    pub endpoint_url: String,
    /// Client credentials.
    pub credentials: Credentials,
    /// Requested scope, if any.
    pub scope: Option<String>,
    /// Minimum remaining validity a cached token must have to be returned
    /// without a refresh. Passing `Duration::ZERO` to
    /// [`TokenProvider::get_token_with_validity`] forces an unconditional
    /// refresh.
    pub minimum_validity: Duration,
    /// `true` to sign requests using the local wall clock; `false` to fetch
    /// the signing timestamp from the endpoint's `/timestamp` resource first
    /// (for clients whose local clock cannot be trusted).
    pub use_system_time: bool,
    /// Retry policy for the signed token request.
    pub retry: RetrySettings,
    /// Request signer. Defaults to [`HmacSigner`].
    pub signer: Arc<dyn Signer>,
}

impl TokenProviderConfig {
    /// Start a configuration with the given endpoint and credentials, using
    /// system time and the default retry policy and signer.
    pub fn new(endpoint_url: impl Into<String>, credentials: Credentials) -> Self {
        TokenProviderConfig {
            endpoint_url: endpoint_url.into(),
            credentials,
            scope: None,
            minimum_validity: Duration::from_secs(60),
            use_system_time: true,
            retry: RetrySettings::default(),
            signer: Arc::new(HmacSigner),
        }
    }

    /// Set the requested scope.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Set the minimum validity window.
    pub fn with_minimum_validity(mut self, minimum_validity: Duration) -> Self {
        self.minimum_validity = minimum_validity;
        self
    }

    /// Use the endpoint's `/timestamp` resource instead of the local clock.
    pub fn with_server_time(mut self) -> Self {
        self.use_system_time = false;
        self
    }

    /// Override the default [`HmacSigner`].
    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = signer;
        self
    }
}

struct TokenState {
    current: Option<Token>,
    refresh_at: Option<Instant>,
}

/// Auto-refreshing client-credentials token provider.
///
/// A refresh serializes concurrent callers through a single `tokio::Mutex`
/// held across the network round trip (deliberately, per §4.3): the second
/// and later callers that arrive while a refresh is in flight wait for the
/// same attempt to finish and then re-check whether it already satisfied
/// their `minimum_validity`, rather than issuing their own request.
pub struct TokenProvider {
    config: TokenProviderConfig,
    http: Arc<dyn Http>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn TaskScheduler>,
    state: AsyncMutex<TokenState>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponseBody {
    access_token: String,
    expires_in: u64,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Deserialize, Default)]
struct ErrorResponseBody {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct TimestampResponseBody {
    timestamp: i64,
}

/// Error code for "the signing timestamp is outside the endpoint's tolerance
/// window", returned alongside a 401 status and a `Date` header the caller
/// can resign against.
const ERROR_WRONG_TIMESTAMP: u32 = 401204;

impl TokenProvider {
    /// Construct a provider. `http`, `clock`, and `scheduler` are shared with
    /// the rest of the client.
    pub fn new(
        config: TokenProviderConfig,
        http: Arc<dyn Http>,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn TaskScheduler>,
    ) -> Self {
        TokenProvider {
            config,
            http,
            clock,
            scheduler,
            state: AsyncMutex::new(TokenState {
                current: None,
                refresh_at: None,
            }),
        }
    }

    /// Get a valid token, refreshing if the cached one has less than
    /// `config.minimum_validity` remaining.
    pub async fn get_token(&self, context: &CancellationContext) -> Result<Token, TokenError> {
        self.get_token_with_validity(context, self.config.minimum_validity)
            .await
    }

    /// Get a valid token, overriding the configured minimum validity for this
    /// call. `Duration::ZERO` forces an unconditional refresh.
    pub async fn get_token_with_validity(
        &self,
        context: &CancellationContext,
        minimum_validity: Duration,
    ) -> Result<Token, TokenError> {
        context.check().map_err(|_| TokenError::Cancelled)?;

        // Fast path without the lock: avoids contending the refresh mutex on
        // every call once a token is warm. Re-checked under the lock below
        // before deciding to refresh, so this is purely an optimization.
        {
            let state = self.state.lock().await;
            if !self.should_refresh(&state, minimum_validity) {
                if let Some(token) = &state.current {
                    return Ok(token.clone());
                }
            }
        }

        self.refresh(context, minimum_validity).await
    }

    /// Drop the cached token so the next `get_token` call always refreshes.
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        state.current = None;
        state.refresh_at = None;
    }

    fn should_refresh(&self, state: &TokenState, minimum_validity: Duration) -> bool {
        let force_refresh = minimum_validity.is_zero();
        if force_refresh {
            return true;
        }
        match state.refresh_at {
            Some(refresh_at) => self.clock.now_monotonic() >= refresh_at,
            None => true,
        }
    }

    async fn refresh(
        &self,
        context: &CancellationContext,
        minimum_validity: Duration,
    ) -> Result<Token, TokenError> {
        let mut state = self.state.lock().await;
        context.check().map_err(|_| TokenError::Cancelled)?;

        // Re-check: another caller may have refreshed while we waited for
        // the lock.
        if !self.should_refresh(&state, minimum_validity) {
            if let Some(token) = &state.current {
                return Ok(token.clone());
            }
        }

        let before = self.clock.now_monotonic();
        let result = self.request_token(context).await;
        match &result {
            Ok(token) => info!(expires_at = %token.expires_at, "token refreshed"),
            Err(err) => warn!(error = %err, "token refresh failed"),
        }
        let token = result?;

        let expires_in = (token.expires_at - self.clock.now_wall())
            .to_std()
            .unwrap_or(Duration::ZERO);
        state.refresh_at = Some(compute_refresh_time(before, expires_in, minimum_validity));
        state.current = Some(token.clone());
        Ok(token)
    }

    async fn request_token(&self, context: &CancellationContext) -> Result<Token, TokenError> {
        let base = self.config.endpoint_url.trim_end_matches('/');
        let mut signing_time = if self.config.use_system_time {
            self.clock.now_wall()
        } else {
            self.fetch_server_time(context, base).await?
        };

        let body = build_request_body(&self.config.scope);
        let retry = &self.config.retry;

        // The clock-skew re-issue (§4.3 step 3) is allowed at most once per
        // `request_token` call: a server that keeps claiming a bad timestamp
        // would otherwise drive an unbounded loop with no backoff.
        let mut clock_skew_retried = false;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            context.check().map_err(|_| TokenError::Cancelled)?;

            let nonce = generate_nonce();
            let auth_header = self
                .config
                .signer
                .sign(&self.config.credentials, signing_time, &nonce);
            let request = HttpRequest::new(Method::Post, format!("{base}/oauth2/token"))
                .with_header("Authorization", auth_header)
                .with_header("Content-Type", "application/json")
                .with_body(body.clone());

            let response = match self.send_raw(context, request).await {
                Ok(response) => response,
                Err(crate::error::OlpError::Cancelled) => return Err(TokenError::Cancelled),
                Err(err) if err.is_transport_retryable() && attempt < retry.max_attempts => {
                    let backoff = (retry.backoff_strategy)(attempt, retry.initial_backoff);
                    self.scheduler
                        .sleep(backoff, context)
                        .await
                        .map_err(|_| TokenError::Cancelled)?;
                    continue;
                }
                Err(err) => return Err(map_transport_error(err)),
            };

            if response.is_success() {
                return parse_token_response(&response, self.clock.now_wall());
            }

            let error_body = parse_error_body(&response);

            if !clock_skew_retried && response.status == 401 && error_body.code == ERROR_WRONG_TIMESTAMP {
                if let Some(date) = response.header("date").and_then(parse_http_date) {
                    debug!("retrying token request with server-reported timestamp");
                    signing_time = date;
                    clock_skew_retried = true;
                    continue;
                }
            }

            if attempt >= retry.max_attempts || !(retry.retry_condition)(&response) {
                return Err(classify_error(&response, &error_body));
            }

            let backoff = (retry.backoff_strategy)(attempt, retry.initial_backoff);
            self.scheduler
                .sleep(backoff, context)
                .await
                .map_err(|_| TokenError::Cancelled)?;
        }
    }

    async fn fetch_server_time(
        &self,
        context: &CancellationContext,
        base: &str,
    ) -> Result<DateTime<Utc>, TokenError> {
        let retry = &self.config.retry;
        let mut attempt = 0u32;
        let response = loop {
            attempt += 1;
            context.check().map_err(|_| TokenError::Cancelled)?;
            let request = HttpRequest::new(Method::Get, format!("{base}/timestamp"));
            match self.send_raw(context, request).await {
                Ok(response) => break response,
                Err(crate::error::OlpError::Cancelled) => return Err(TokenError::Cancelled),
                Err(err) if err.is_transport_retryable() && attempt < retry.max_attempts => {
                    let backoff = (retry.backoff_strategy)(attempt, retry.initial_backoff);
                    self.scheduler
                        .sleep(backoff, context)
                        .await
                        .map_err(|_| TokenError::Cancelled)?;
                }
                Err(err) => return Err(map_transport_error(err)),
            }
        };
        if !response.is_success() {
            return Err(TokenError::ServiceUnavailable {
                status: Some(response.status),
                message: "failed to fetch server timestamp".into(),
            });
        }
        let parsed: TimestampResponseBody = serde_json::from_slice(&response.body)
            .map_err(|err| TokenError::InvalidResponse(err.to_string()))?;
        DateTime::from_timestamp(parsed.timestamp, 0)
            .ok_or_else(|| TokenError::InvalidResponse("timestamp out of range".into()))
    }

    /// Send `request`, attaching a cancel handle for its duration. Returns
    /// the unmapped transport error so callers can distinguish a retryable
    /// transport failure from a successfully-received bad-status response.
    async fn send_raw(
        &self,
        context: &CancellationContext,
        request: HttpRequest,
    ) -> Result<HttpResponse, crate::error::OlpError> {
        let (request_id, future) = self.http.send(request);
        let http = Arc::clone(&self.http);
        let cancel_handle: crate::cancellation::CancelHandle =
            Box::new(move || http.cancel(request_id));
        match context.attach(cancel_handle) {
            Ok(attach_id) => {
                let result = future.await;
                context.detach(attach_id);
                result
            }
            Err(_already_cancelled) => Err(crate::error::OlpError::Cancelled),
        }
    }
}

fn compute_refresh_time(
    now_monotonic: Instant,
    expires_in: Duration,
    minimum_validity: Duration,
) -> Instant {
    let expiry = now_monotonic + expires_in;
    if expiry <= now_monotonic {
        now_monotonic
    } else {
        expiry
            .checked_sub(minimum_validity)
            .unwrap_or(now_monotonic)
    }
}

fn build_request_body(scope: &Option<String>) -> bytes::Bytes {
    let mut object = serde_json::Map::new();
    object.insert(
        "grantType".to_string(),
        serde_json::Value::String("client_credentials".to_string()),
    );
    if let Some(scope) = scope {
        object.insert(
            "scope".to_string(),
            serde_json::Value::String(scope.clone()),
        );
    }
    let encoded = serde_json::Value::Object(object).to_string();
    bytes::Bytes::from(encoded.into_bytes())
}

fn generate_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn parse_token_response(
    response: &HttpResponse,
    now_wall: DateTime<Utc>,
) -> Result<Token, TokenError> {
    let parsed: TokenResponseBody = serde_json::from_slice(&response.body)
        .map_err(|err| TokenError::InvalidResponse(err.to_string()))?;
    if parsed.access_token.is_empty() {
        return Err(TokenError::InvalidResponse(
            "token response had an empty accessToken".into(),
        ));
    }
    let expires_at = now_wall + chrono::Duration::seconds(parsed.expires_in as i64);
    Ok(Token {
        access_token: parsed.access_token,
        expires_at,
        scope: parsed.scope,
    })
}

fn parse_error_body(response: &HttpResponse) -> ErrorResponseBody {
    serde_json::from_slice(&response.body).unwrap_or_default()
}

fn classify_error(response: &HttpResponse, error_body: &ErrorResponseBody) -> TokenError {
    let message = if error_body.message.is_empty() {
        format!("token endpoint returned status {}", response.status)
    } else {
        error_body.message.clone()
    };
    match response.status {
        401 | 403 => TokenError::AccessDenied {
            status: Some(response.status),
            message,
        },
        _ => TokenError::ServiceUnavailable {
            status: Some(response.status),
            message,
        },
    }
}

fn map_transport_error(err: crate::error::OlpError) -> TokenError {
    match err {
        crate::error::OlpError::Cancelled => TokenError::Cancelled,
        crate::error::OlpError::RequestTimeout { message }
        | crate::error::OlpError::NetworkConnection { message } => TokenError::Network(message),
        other => TokenError::ServiceUnavailable {
            status: other.status(),
            message: other.to_string(),
        },
    }
}

/// Parse an RFC 7231 `Date` header value. Only the one format actually
/// emitted by HTTP servers (`IMF-fixdate`) is supported.
fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
