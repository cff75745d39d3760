//! API base-URL resolution and caching (§4.4).
//!
//! The wire shape is a JSON array of `{api, version, baseURL, parameters}`,
//! with the response's `Cache-Control: max-age` driving the cached TTL. A
//! small set of platform-scoped service names route to the platform lookup
//! endpoint instead of the per-catalog resource endpoint.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::cache::{CacheError, DefaultCache};
use crate::cancellation::CancellationContext;
use crate::clock::Clock;
use crate::data::{api_cache_key, CatalogId};
use crate::http::{Http, HttpRequest, HttpResponse, Method};
use crate::scheduler::TaskScheduler;

/// Platform-level services resolved against `<platform_lookup_url>/platform/apis`
/// instead of the per-catalog resource endpoint.
const PLATFORM_SERVICES: &[&str] = &["config", "artifact"];

/// How aggressively [`ApiLookupClient::lookup_api`] is allowed to go to the
/// network (mirrors `client::FetchOptions`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Never go to the network; a cache miss is `Err(LookupError::NotFound)`.
    CacheOnly,
    /// Serve a cache hit immediately; if it's present, also kick off a
    /// network refresh in the background so the next call sees fresh data.
    /// On a miss, behaves like `OnlineIfNotFound`.
    CacheWithUpdate,
    /// Serve a cached hit if present; otherwise fetch from the network and
    /// cache the result.
    OnlineIfNotFound,
    /// Always fetch from the network, refreshing the cache regardless of
    /// what's cached.
    OnlineOnly,
}

/// A resolved API endpoint (§3 `ApiEntry`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiEntry {
    /// The base URL to build requests against.
    pub base_url: String,
    /// Absolute wall-clock expiry of this entry, if the lookup response that
    /// produced it carried a `Cache-Control: max-age`. `None` means either no
    /// expiry (the response had no `max-age`) or that the entry came from a
    /// source that doesn't track one (a cache hit, or a custom endpoint
    /// provider, which is never cached at all).
    pub expiry: Option<DateTime<Utc>>,
}

/// Error from [`ApiLookupClient::lookup_api`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    /// `FetchMode::CacheOnly` missed, or a cached entry expired with no
    /// network fallback requested.
    #[error("no cached API lookup entry")]
    NotFound,
    /// The lookup service is reachable but does not know the requested
    /// service/version pair (or returned a 5xx).
    #[error("lookup service unavailable: {0}")]
    ServiceUnavailable(String),
    /// Transport-level failure.
    #[error("network error: {0}")]
    Network(String),
    /// Cooperative cancellation reached a checkpoint.
    #[error("lookup cancelled")]
    Cancelled,
    /// The lookup response body failed to parse.
    #[error("invalid lookup response: {0}")]
    InvalidResponse(String),
}

/// A caller-supplied resolver that bypasses the network lookup entirely
/// (§4.4's "custom endpoint provider", first in the three-strategy priority
/// order). Given the catalog id, returns the provider's own base URL (not yet
/// catalog-scoped); [`ApiLookupClient::lookup_api`] appends
/// `"/catalogs/<catalog>"` per §4.4.
pub type CustomEndpointProvider = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Configuration for an [`ApiLookupClient`].
#[derive(Clone)]
pub struct ApiLookupConfig {
    /// Base URL of the platform lookup endpoint, e.g.
    /// `https://api-lookup.example.com/lookup/v1`.
    pub platform_lookup_url: String,
    /// Base URL of the resource lookup endpoint (the same host,
    /// conventionally; kept separate because deployments can point it
    /// elsewhere).
    pub resource_lookup_url: String,
    /// Optional custom resolver consulted before any network lookup.
    pub custom_endpoint_provider: Option<CustomEndpointProvider>,
    /// Fallback TTL applied when a lookup response carries no
    /// `Cache-Control: max-age` header.
    pub default_ttl: Duration,
}

impl ApiLookupConfig {
    /// Build a config pointing at the given lookup host.
    pub fn new(
        platform_lookup_url: impl Into<String>,
        resource_lookup_url: impl Into<String>,
    ) -> Self {
        ApiLookupConfig {
            platform_lookup_url: platform_lookup_url.into(),
            resource_lookup_url: resource_lookup_url.into(),
            custom_endpoint_provider: None,
            default_ttl: Duration::from_secs(3600),
        }
    }

    /// Attach a custom endpoint provider.
    pub fn with_custom_endpoint_provider(mut self, provider: CustomEndpointProvider) -> Self {
        self.custom_endpoint_provider = Some(provider);
        self
    }
}

#[derive(Deserialize)]
struct ApiDescriptor {
    api: String,
    version: String,
    #[serde(rename = "baseURL")]
    base_url: String,
}

/// Resolves `(service, version)` pairs to base URLs for a single catalog,
/// caching the result in a [`DefaultCache`] (§4.4).
pub struct ApiLookupClient {
    catalog: CatalogId,
    config: ApiLookupConfig,
    http: Arc<dyn Http>,
    cache: Arc<DefaultCache>,
    scheduler: Arc<dyn TaskScheduler>,
    clock: Arc<dyn Clock>,
}

impl ApiLookupClient {
    /// Construct a client scoped to `catalog`.
    pub fn new(
        catalog: CatalogId,
        config: ApiLookupConfig,
        http: Arc<dyn Http>,
        cache: Arc<DefaultCache>,
        scheduler: Arc<dyn TaskScheduler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        ApiLookupClient {
            catalog,
            config,
            http,
            cache,
            scheduler,
            clock,
        }
    }

    /// Resolve `service`/`version` to a base URL, per `mode`.
    pub async fn lookup_api(
        &self,
        service: &str,
        version: &str,
        mode: FetchMode,
        context: &CancellationContext,
    ) -> Result<ApiEntry, LookupError> {
        if let Some(provider) = &self.config.custom_endpoint_provider {
            if let Some(endpoint) = provider(self.catalog.as_str()) {
                if !endpoint.is_empty() {
                    let base_url = format!(
                        "{}/catalogs/{}",
                        endpoint.trim_end_matches('/'),
                        self.catalog.as_str()
                    );
                    return Ok(ApiEntry {
                        base_url,
                        expiry: None,
                    });
                }
            }
        }

        let key = api_cache_key(&self.catalog, service, version);

        if mode != FetchMode::OnlineOnly {
            match self.cache.get(key.as_str()) {
                Ok(Some(bytes)) => {
                    let base_url = String::from_utf8(bytes.to_vec())
                        .map_err(|err| LookupError::InvalidResponse(err.to_string()))?;
                    if mode == FetchMode::CacheWithUpdate {
                        self.spawn_background_refresh(service, version, context);
                    }
                    return Ok(ApiEntry {
                        base_url,
                        expiry: None,
                    });
                }
                Ok(None) => {
                    if mode == FetchMode::CacheOnly {
                        return Err(LookupError::NotFound);
                    }
                }
                Err(other) => return Err(LookupError::InvalidResponse(other.to_string())),
            }
        }

        context.check().map_err(|_| LookupError::Cancelled)?;
        fetch_and_cache(
            &self.catalog,
            &self.config,
            &self.http,
            &self.cache,
            &self.clock,
            service,
            version,
            context,
        )
        .await
    }

    /// Kick off a detached refresh so the next lookup sees fresh data,
    /// without blocking the caller that got a cache hit.
    fn spawn_background_refresh(&self, service: &str, version: &str, context: &CancellationContext) {
        let catalog = self.catalog.clone();
        let config = self.config.clone();
        let http = Arc::clone(&self.http);
        let cache = Arc::clone(&self.cache);
        let clock = Arc::clone(&self.clock);
        let service = service.to_string();
        let version = version.to_string();
        let child_context = context.child();
        self.scheduler.spawn(Box::pin(async move {
            if let Err(err) = fetch_and_cache(
                &catalog,
                &config,
                &http,
                &cache,
                &clock,
                &service,
                &version,
                &child_context,
            )
            .await
            {
                debug!(error = %err, service, version, "background API lookup refresh failed");
            }
        }));
    }
}

async fn fetch_and_cache(
    catalog: &CatalogId,
    config: &ApiLookupConfig,
    http: &Arc<dyn Http>,
    cache: &Arc<DefaultCache>,
    clock: &Arc<dyn Clock>,
    service: &str,
    version: &str,
    context: &CancellationContext,
) -> Result<ApiEntry, LookupError> {
    let (base_url, ttl) = fetch(catalog, config, http, service, version, context).await?;

    let key = api_cache_key(catalog, service, version);
    if let Err(err) = cache.put(key.as_str(), base_url.clone().into_bytes().into(), ttl) {
        debug!(error = %err, "failed to cache API lookup entry");
    }

    let expiry = ttl.map(|ttl| clock.now_wall() + chrono::Duration::from_std(ttl).unwrap_or_default());
    Ok(ApiEntry { base_url, expiry })
}

async fn fetch(
    catalog: &CatalogId,
    config: &ApiLookupConfig,
    http: &Arc<dyn Http>,
    service: &str,
    version: &str,
    context: &CancellationContext,
) -> Result<(String, Option<Duration>), LookupError> {
    let url = if PLATFORM_SERVICES.contains(&service) {
        format!(
            "{}/platform/apis",
            config.platform_lookup_url.trim_end_matches('/')
        )
    } else {
        format!(
            "{}/resources/{}/apis",
            config.resource_lookup_url.trim_end_matches('/'),
            catalog.as_str()
        )
    };

    let request = HttpRequest::new(Method::Get, url).with_header("Accept", "application/json");
    let response = send(http, context, request).await?;

    if !response.is_success() {
        let message = String::from_utf8_lossy(&response.body).to_string();
        return Err(LookupError::ServiceUnavailable(message));
    }

    let descriptors: Vec<ApiDescriptor> = serde_json::from_slice(&response.body)
        .map_err(|err| LookupError::InvalidResponse(err.to_string()))?;

    let found = descriptors
        .into_iter()
        .find(|d| d.api == service && d.version == version)
        .ok_or_else(|| {
            LookupError::ServiceUnavailable(format!(
                "no entry for service '{service}' version '{version}'"
            ))
        })?;

    Ok((found.base_url, response.max_age()))
}

async fn send(
    http: &Arc<dyn Http>,
    context: &CancellationContext,
    request: HttpRequest,
) -> Result<HttpResponse, LookupError> {
    let (request_id, future) = http.send(request);
    let http_for_cancel = Arc::clone(http);
    let cancel_handle: crate::cancellation::CancelHandle =
        Box::new(move || http_for_cancel.cancel(request_id));
    match context.attach(cancel_handle) {
        Ok(attach_id) => {
            let result = future.await;
            context.detach(attach_id);
            result.map_err(map_transport_error)
        }
        Err(_already_cancelled) => Err(LookupError::Cancelled),
    }
}

fn map_transport_error(err: crate::error::OlpError) -> LookupError {
    match err {
        crate::error::OlpError::Cancelled => LookupError::Cancelled,
        crate::error::OlpError::RequestTimeout { message }
        | crate::error::OlpError::NetworkConnection { message } => LookupError::Network(message),
        other => LookupError::ServiceUnavailable(other.to_string()),
    }
}

/// Not part of the resolution path itself, but used by callers that want to
/// know ahead of time whether a service name routes to the platform lookup
/// (useful for diagnostics and tests).
pub fn is_platform_service(service: &str) -> bool {
    PLATFORM_SERVICES.contains(&service)
}
