//! Top-level orchestrator tying cancellation, caching, authentication, API
//! resolution, and the HTTP executor into a single cancellable `fetch` call
//! (§4.5, component E).
//!
//! The pipeline below is a direct generalization of what a typical HERE OLP
//! read-path client does (catalog-scoped API lookup, bearer auth, a
//! coalesced and cached GET) without being tied to any one resource type —
//! `FetchRequest` is deliberately generic so it can express config/metadata
//! reads, blob reads, or a query-service call alike.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tracing::{debug, info_span, Instrument};

use crate::cache::{CacheConfig, DefaultCache};
use crate::cancellation::CancellationContext;
use crate::clock::Clock;
use crate::data::{CacheKey, CatalogId};
use crate::error::{OlpError, OlpResult};
use crate::http::{Http, HttpRequest, HttpResponse, Method, RetrySettings};
use crate::lookup::{ApiLookupClient, ApiLookupConfig, FetchMode};
use crate::named_mutex::NamedMutexTable;
use crate::scheduler::TaskScheduler;
use crate::token::{TokenProvider, TokenProviderConfig};

/// The stages a single [`OlpClient::fetch`] attempt passes through, exposed
/// for structured logging and for tests that assert on pipeline shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    /// Not yet started.
    Idle,
    /// Resolving the target service's base URL.
    Resolving,
    /// Acquiring a bearer token.
    Authenticating,
    /// Sending the signed request.
    Sending,
    /// Reading and caching the response body.
    Receiving,
    /// Completed successfully.
    Success,
    /// Completed with an error.
    Failed,
    /// Cancelled before completion.
    Cancelled,
}

/// A single logical fetch: a service/version/resource tuple plus the HTTP
/// particulars needed to build the request once the base URL is resolved.
pub struct FetchRequest {
    /// The lookup service name, e.g. `"query"`, `"blob"`, `"metadata"`.
    pub service: String,
    /// The lookup service version, e.g. `"v1"`.
    pub version: String,
    /// Cache-key segments identifying this specific resource within the
    /// service, e.g. `["partition", "123"]`.
    pub resource_key: Vec<String>,
    /// HTTP method.
    pub method: Method,
    /// Path appended to the resolved base URL (including any leading `/`).
    pub path: String,
    /// Query parameters, appended in order.
    pub query: Vec<(String, String)>,
    /// Additional headers, beyond `Authorization` and `Accept`.
    pub headers: Vec<(String, String)>,
    /// Optional request body.
    pub body: Option<Bytes>,
    /// Governs both the API lookup and the resource cache read/write.
    pub fetch_mode: FetchMode,
    /// Overrides the TTL derived from the response's `Cache-Control` header.
    pub cache_ttl_override: Option<Duration>,
}

impl FetchRequest {
    /// Start building a GET request for `service`/`version` at `path`.
    pub fn get(service: impl Into<String>, version: impl Into<String>, path: impl Into<String>) -> Self {
        FetchRequest {
            service: service.into(),
            version: version.into(),
            resource_key: Vec::new(),
            method: Method::Get,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            fetch_mode: FetchMode::OnlineIfNotFound,
            cache_ttl_override: None,
        }
    }

    /// Append a cache-key segment identifying the specific resource.
    pub fn with_resource_key(mut self, segment: impl Into<String>) -> Self {
        self.resource_key.push(segment.into());
        self
    }

    /// Append a query parameter.
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Append a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Override the fetch mode (default `OnlineIfNotFound`).
    pub fn with_fetch_mode(mut self, mode: FetchMode) -> Self {
        self.fetch_mode = mode;
        self
    }

    fn url(&self, base_url: &str) -> String {
        let mut url = format!("{}{}", base_url.trim_end_matches('/'), self.path);
        if !self.query.is_empty() {
            url.push('?');
            for (i, (name, value)) in self.query.iter().enumerate() {
                if i > 0 {
                    url.push('&');
                }
                url.push_str(&urlencode(name));
                url.push('=');
                url.push_str(&urlencode(value));
            }
        }
        url
    }
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Configuration bundling every sub-component's config (§6).
pub struct OlpClientConfig {
    /// The catalog this client is scoped to.
    pub catalog: CatalogId,
    /// API lookup configuration.
    pub lookup: ApiLookupConfig,
    /// Token provider configuration.
    pub token: TokenProviderConfig,
    /// Cache configuration.
    pub cache: CacheConfig,
    /// Retry policy for resource fetches (distinct from the token
    /// provider's own retry policy).
    pub retry: RetrySettings,
}

/// Orchestrates cancellation, caching, authentication, API resolution, and
/// request coalescing behind a single `fetch` entry point (§4.5).
pub struct OlpClient {
    catalog: CatalogId,
    http: Arc<dyn Http>,
    cache: Arc<DefaultCache>,
    token_provider: TokenProvider,
    lookup: ApiLookupClient,
    named_mutexes: NamedMutexTable,
    scheduler: Arc<dyn TaskScheduler>,
    retry: RetrySettings,
    _clock: Arc<dyn Clock>,
}

impl OlpClient {
    /// Open a client, opening its [`DefaultCache`] as a side effect.
    pub fn open(
        config: OlpClientConfig,
        http: Arc<dyn Http>,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn TaskScheduler>,
    ) -> OlpResult<Self> {
        let cache = Arc::new(DefaultCache::open(config.cache, Arc::clone(&clock))?);
        let token_provider = TokenProvider::new(
            config.token,
            Arc::clone(&http),
            Arc::clone(&clock),
            Arc::clone(&scheduler),
        );
        let lookup = ApiLookupClient::new(
            config.catalog.clone(),
            config.lookup,
            Arc::clone(&http),
            Arc::clone(&cache),
            Arc::clone(&scheduler),
            Arc::clone(&clock),
        );
        Ok(OlpClient {
            catalog: config.catalog,
            http,
            cache,
            token_provider,
            lookup,
            named_mutexes: NamedMutexTable::new(),
            scheduler,
            retry: config.retry,
            _clock: clock,
        })
    }

    /// The catalog this client is scoped to.
    pub fn catalog(&self) -> &CatalogId {
        &self.catalog
    }

    /// The underlying cache, for callers that want to pre-warm or protect
    /// entries directly (e.g. before going offline).
    pub fn cache(&self) -> &Arc<DefaultCache> {
        &self.cache
    }

    /// Run the full fetch pipeline for `request`, returning the raw response
    /// body.
    ///
    /// Steps (§4.5): cancellation checkpoint, request coalescing, cache read,
    /// API resolution, authentication, signed send with retry, cache write.
    pub async fn fetch(
        &self,
        request: FetchRequest,
        context: &CancellationContext,
    ) -> OlpResult<Bytes> {
        context.check()?;

        let cache_key = self.cache_key(&request);
        let fingerprint = self.fingerprint(&request);
        let entry = self.named_mutexes.entry_for(&fingerprint);
        let _permit = entry.lock().await;
        context.check()?;

        if request.fetch_mode != FetchMode::OnlineOnly {
            if let Some(bytes) = self.cache.get(cache_key.as_str())? {
                debug!(key = cache_key.as_str(), "fetch: resource cache hit");
                self.named_mutexes.garbage_collect();
                return Ok(bytes);
            }
            if request.fetch_mode == FetchMode::CacheOnly {
                self.named_mutexes.garbage_collect();
                return Err(OlpError::NotFound {
                    message: format!("no cached entry for '{}'", cache_key.as_str()),
                });
            }
        }

        // §8 invariant 5: a late arrival that queued behind us while an
        // identical fetch was in flight observes that winner's outcome
        // (success or failure) instead of repeating the network call.
        if let Some(result) = entry.recent_result() {
            debug!(fingerprint, "fetch: reusing coalesced in-flight result");
            self.named_mutexes.garbage_collect();
            return result;
        }

        let result = self.fetch_uncached(&request, &cache_key, context).await;
        entry.publish(result.clone());
        self.named_mutexes.garbage_collect();
        result
    }

    /// The coalescing key for `request`: catalog + service + resource key
    /// (§4.5 step 4), deliberately excluding the version so that two
    /// in-flight requests for different versions of the same resource are
    /// not accidentally merged under different fingerprints than intended
    /// while still matching the exact string §4.5 specifies.
    fn fingerprint(&self, request: &FetchRequest) -> String {
        let mut fingerprint = format!("{}{}", self.catalog.as_str(), request.service);
        for segment in &request.resource_key {
            fingerprint.push_str(segment);
        }
        fingerprint
    }

    /// Like [`OlpClient::fetch`], but deserializes the response body as JSON.
    pub async fn fetch_with<T: DeserializeOwned>(
        &self,
        request: FetchRequest,
        context: &CancellationContext,
    ) -> OlpResult<T> {
        let bytes = self.fetch(request, context).await?;
        serde_json::from_slice(&bytes).map_err(|err| OlpError::Unknown {
            message: format!("failed to decode response: {err}"),
        })
    }

    fn cache_key(&self, request: &FetchRequest) -> CacheKey {
        let mut segments = vec![request.service.as_str(), request.version.as_str()];
        segments.extend(request.resource_key.iter().map(String::as_str));
        CacheKey::new(&self.catalog, &segments)
    }

    async fn fetch_uncached(
        &self,
        request: &FetchRequest,
        cache_key: &CacheKey,
        context: &CancellationContext,
    ) -> OlpResult<Bytes> {
        let span = info_span!("olp_fetch", service = %request.service, version = %request.version);
        async move {
            debug!(state = ?AttemptState::Resolving, "resolving API base url");
            let api = self
                .lookup
                .lookup_api(&request.service, &request.version, request.fetch_mode, context)
                .await?;

            debug!(state = ?AttemptState::Authenticating, "acquiring token");
            let token = self.token_provider.get_token(context).await?;

            debug!(state = ?AttemptState::Sending, "sending request");
            let response = self.send_with_retry(request, &api.base_url, &token.access_token, context).await?;

            debug!(state = ?AttemptState::Receiving, "caching response");
            let ttl = request.cache_ttl_override.or_else(|| response.max_age());
            if let Err(err) = self.cache.put(cache_key.as_str(), response.body.clone(), ttl) {
                return Err(err.into());
            }

            Ok(response.body)
        }
        .instrument(span)
        .await
    }

    async fn send_with_retry(
        &self,
        request: &FetchRequest,
        base_url: &str,
        bearer_token: &str,
        context: &CancellationContext,
    ) -> OlpResult<HttpResponse> {
        let url = request.url(base_url);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            context.check()?;

            let mut http_request = HttpRequest::new(request.method, url.clone())
                .with_header("Authorization", format!("Bearer {bearer_token}"))
                .with_header("Accept", "application/json")
                .with_timeout(self.retry.timeout_per_attempt);
            for (name, value) in &request.headers {
                http_request = http_request.with_header(name.clone(), value.clone());
            }
            if let Some(body) = &request.body {
                http_request = http_request.with_body(body.clone());
            }

            match self.send(context, http_request).await {
                Ok(response) => {
                    if response.is_success() {
                        return Ok(response);
                    }
                    if attempt >= self.retry.max_attempts || !(self.retry.retry_condition)(&response)
                    {
                        return Err(response_to_error(&response));
                    }
                }
                Err(OlpError::Cancelled) => return Err(OlpError::Cancelled),
                Err(err) if err.is_transport_retryable() && attempt < self.retry.max_attempts => {}
                Err(err) => return Err(err),
            }

            let backoff = (self.retry.backoff_strategy)(attempt, self.retry.initial_backoff);
            self.scheduler.sleep(backoff, context).await?;
        }
    }

    async fn send(
        &self,
        context: &CancellationContext,
        request: HttpRequest,
    ) -> OlpResult<HttpResponse> {
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
            Err(_already_cancelled) => Err(OlpError::Cancelled),
        }
    }
}

fn response_to_error(response: &HttpResponse) -> OlpError {
    let message = String::from_utf8_lossy(&response.body).to_string();
    match response.status {
        401 | 403 => OlpError::AccessDenied {
            status: Some(response.status),
            message,
        },
        404 => OlpError::NotFound { message },
        _ => OlpError::ServiceUnavailable {
            status: Some(response.status),
            message,
        },
    }
}
