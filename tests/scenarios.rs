//! End-to-end scenarios exercised against the public API, the way a real
//! caller would use it, rather than through each module's internal test
//! doubles.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;

use olp_client_core::cache::CacheConfig;
use olp_client_core::clock::SystemClock;
use olp_client_core::http::{
    Http, HttpRequest, HttpResponse, NetworkStatistics, RequestId, RetrySettings, SendFuture,
};
use olp_client_core::lookup::ApiLookupConfig;
use olp_client_core::scheduler::TokioScheduler;
use olp_client_core::token::{Credentials, TokenProvider, TokenProviderConfig};
use olp_client_core::{CacheKey, CancellationContext, CatalogId, FetchRequest, OlpClient, OlpClientConfig, OlpError};

/// A queue-driven [`Http`] test double. The first `N` calls return the
/// queued responses in order; once the queue is drained, further calls hang
/// until [`Http::cancel`] is invoked for that request, at which point they
/// resolve to `Err(OlpError::Cancelled)`.
struct MockHttp {
    queued: StdMutex<Vec<HttpResponse>>,
    calls: AtomicU32,
    cancel_calls: AtomicU32,
    next_id: AtomicU64,
    pending: DashMap<RequestId, tokio::sync::oneshot::Sender<()>>,
}

impl MockHttp {
    fn with_queued(responses: Vec<HttpResponse>) -> Self {
        MockHttp {
            queued: StdMutex::new(responses),
            calls: AtomicU32::new(0),
            cancel_calls: AtomicU32::new(0),
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
        }
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn cancel_count(&self) -> u32 {
        self.cancel_calls.load(Ordering::SeqCst)
    }
}

impl Http for MockHttp {
    fn send(&self, _request: HttpRequest) -> (RequestId, SendFuture<'_>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);

        let queued_response = {
            let mut queued = self.queued.lock().unwrap();
            if queued.is_empty() {
                None
            } else {
                Some(queued.remove(0))
            }
        };

        if let Some(response) = queued_response {
            return (id, Box::pin(async move { Ok(response) }));
        }

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        self.pending.insert(id, tx);
        let future: SendFuture<'_> = Box::pin(async move {
            let _ = rx.await;
            Err(OlpError::Cancelled)
        });
        (id, future)
    }

    fn cancel(&self, request_id: RequestId) {
        if let Some((_, tx)) = self.pending.remove(&request_id) {
            let _ = tx.send(());
            self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn json_response(body: &str) -> HttpResponse {
    HttpResponse {
        status: 200,
        headers: vec![],
        body: Bytes::from(body.to_string()),
        network_statistics: NetworkStatistics::default(),
    }
}

fn lookup_response(service: &str, version: &str, base_url: &str) -> HttpResponse {
    json_response(&format!(
        r#"[{{"api":"{service}","version":"{version}","baseURL":"{base_url}","parameters":{{}}}}]"#
    ))
}

fn token_response(access_token: &str) -> HttpResponse {
    json_response(&format!(
        r#"{{"accessToken":"{access_token}","expiresIn":3600}}"#
    ))
}

fn test_catalog() -> CatalogId {
    CatalogId::parse("here:here-cn:config:eu:realm:my-catalog").unwrap()
}

fn test_client(http: Arc<dyn Http>) -> OlpClient {
    test_client_with_retry(http, RetrySettings::default())
}

fn test_client_with_retry(http: Arc<dyn Http>, retry: RetrySettings) -> OlpClient {
    let config = OlpClientConfig {
        catalog: test_catalog(),
        lookup: ApiLookupConfig::new(
            "https://api-lookup.example.com/lookup/v1",
            "https://api-lookup.example.com/lookup/v1",
        ),
        token: TokenProviderConfig::new(
            "https://auth.example.com",
            Credentials {
                client_id: "id".into(),
                client_secret: "secret".into(),
            },
        ),
        cache: CacheConfig::in_memory_only(1024 * 1024),
        retry,
    };
    OlpClient::open(config, http, Arc::new(SystemClock), Arc::new(TokioScheduler)).unwrap()
}

fn no_retry() -> RetrySettings {
    let mut retry = RetrySettings::default();
    retry.max_attempts = 1;
    retry
}

/// Scenario: a response rejected with HERE's "wrong timestamp" error code
/// (401, code 401204) is retried once using the server's `Date` header as the
/// new signing timestamp, without the caller ever seeing an error.
#[tokio::test]
async fn clock_skew_response_is_retried_with_server_timestamp() {
    let wrong_timestamp = HttpResponse {
        status: 401,
        headers: vec![("Date".to_string(), "Tue, 15 Nov 1994 08:12:31 GMT".to_string())],
        body: Bytes::from(r#"{"code":401204,"message":"wrong timestamp"}"#),
        network_statistics: NetworkStatistics::default(),
    };
    let http = Arc::new(MockHttp::with_queued(vec![
        wrong_timestamp,
        token_response("tok-after-skew-retry"),
    ]));

    let config = TokenProviderConfig::new(
        "https://auth.example.com",
        Credentials {
            client_id: "id".into(),
            client_secret: "secret".into(),
        },
    );
    let provider = TokenProvider::new(config, http.clone(), Arc::new(SystemClock), Arc::new(TokioScheduler));
    let ctx = CancellationContext::new();

    let token = provider.get_token(&ctx).await.unwrap();
    assert_eq!(token.access_token, "tok-after-skew-retry");
    assert_eq!(http.call_count(), 2);
}

/// Scenario: cancelling mid-flight stops the outstanding network call exactly
/// once and leaves no trace in the cache.
#[tokio::test]
async fn cancellation_mid_flight_stops_network_and_skips_cache_write() {
    let http = Arc::new(MockHttp::with_queued(vec![
        lookup_response("query", "v1", "https://query.example.com"),
        token_response("tok"),
    ]));
    let client = test_client(http.clone());
    let ctx = CancellationContext::new();

    let request = FetchRequest::get("query", "v1", "/partitions").with_resource_key("partitions-all");
    let fetch_future = client.fetch(request, &ctx);
    tokio::pin!(fetch_future);

    tokio::select! {
        result = &mut fetch_future => panic!("fetch completed before cancellation: {result:?}"),
        _ = tokio::time::sleep(Duration::from_millis(20)) => {
            ctx.cancel();
        }
    }

    let result = fetch_future.await;
    assert!(matches!(result, Err(OlpError::Cancelled)));
    assert_eq!(http.cancel_count(), 1);

    let catalog = test_catalog();
    let key = CacheKey::new(&catalog, &["query", "v1", "partitions-all"]);
    assert_eq!(client.cache().get(key.as_str()).unwrap(), None);
}

/// Scenario: two concurrent fetches for the same resource coalesce onto a
/// single network round trip per collaborator (lookup + token + resource),
/// rather than each caller issuing its own.
#[tokio::test]
async fn concurrent_identical_fetches_are_coalesced() {
    let http = Arc::new(MockHttp::with_queued(vec![
        lookup_response("query", "v1", "https://query.example.com"),
        token_response("tok"),
        json_response(r#"{"result":"ok"}"#),
    ]));
    let client = Arc::new(test_client(http.clone()));

    let make_request = || FetchRequest::get("query", "v1", "/partitions").with_resource_key("partitions-all");

    let a = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            let ctx = CancellationContext::new();
            client.fetch(make_request(), &ctx).await
        })
    };
    let b = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            let ctx = CancellationContext::new();
            client.fetch(make_request(), &ctx).await
        })
    };

    let (result_a, result_b) = tokio::join!(a, b);
    let body_a = result_a.unwrap().unwrap();
    let body_b = result_b.unwrap().unwrap();
    assert_eq!(body_a.as_ref(), br#"{"result":"ok"}"#);
    assert_eq!(body_b.as_ref(), br#"{"result":"ok"}"#);
    assert_eq!(http.call_count(), 3);
}

/// Scenario (§8 invariant 5, failure branch): when the winner of a coalesced
/// fetch fails, the late arrival observes the same failure rather than
/// repeating the network call itself.
#[tokio::test]
async fn concurrent_identical_fetches_share_a_failure() {
    let unavailable = HttpResponse {
        status: 503,
        headers: vec![],
        body: Bytes::from_static(b"down for maintenance"),
        network_statistics: NetworkStatistics::default(),
    };
    let http = Arc::new(MockHttp::with_queued(vec![
        lookup_response("query", "v1", "https://query.example.com"),
        token_response("tok"),
        unavailable,
    ]));
    let client = Arc::new(test_client_with_retry(http.clone(), no_retry()));

    let make_request = || FetchRequest::get("query", "v1", "/partitions").with_resource_key("partitions-all");

    let a = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            let ctx = CancellationContext::new();
            client.fetch(make_request(), &ctx).await
        })
    };
    let b = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            let ctx = CancellationContext::new();
            client.fetch(make_request(), &ctx).await
        })
    };

    let (result_a, result_b) = tokio::join!(a, b);
    let err_a = result_a.unwrap().unwrap_err();
    let err_b = result_b.unwrap().unwrap_err();
    assert!(matches!(err_a, OlpError::ServiceUnavailable { status: Some(503), .. }));
    assert!(matches!(err_b, OlpError::ServiceUnavailable { status: Some(503), .. }));
    // Lookup, token, and the one failed resource request; neither caller
    // repeated any of the three once the other had already failed.
    assert_eq!(http.call_count(), 3);
}
