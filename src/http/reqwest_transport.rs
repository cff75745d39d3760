//! Default [`Http`] implementation backed by [`reqwest`].
//!
//! Wraps a single shared `reqwest::Client`, since the connection pool it
//! keeps internally is only useful if reused across requests. Each in-flight
//! request registers an abort handle in a shared table keyed by
//! [`RequestId`], so [`Http::cancel`] can drop the underlying future and let
//! `reqwest` tear down the connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

use super::{Http, HttpRequest, HttpResponse, Method, NetworkStatistics, RequestId, SendFuture};
use crate::error::OlpError;

/// A `reqwest`-backed [`Http`] transport. One instance is intended to be
/// shared (behind an `Arc`) across an entire process, matching §5's
/// "HTTP transport: thread-safe; one instance per process" shared-resource
/// policy.
pub struct ReqwestTransport {
    client: reqwest::Client,
    next_id: AtomicU64,
    aborts: DashMap<RequestId, tokio::sync::oneshot::Sender<()>>,
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        ReqwestTransport::new(reqwest::Client::new())
    }
}

impl ReqwestTransport {
    /// Wrap an existing configured `reqwest::Client`.
    pub fn new(client: reqwest::Client) -> Self {
        ReqwestTransport {
            client,
            next_id: AtomicU64::new(1),
            aborts: DashMap::new(),
        }
    }
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Delete => reqwest::Method::DELETE,
    }
}

impl Http for ReqwestTransport {
    fn send(&self, request: HttpRequest) -> (RequestId, SendFuture<'_>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (abort_tx, abort_rx) = tokio::sync::oneshot::channel::<()>();
        self.aborts.insert(id, abort_tx);

        let mut builder = self
            .client
            .request(to_reqwest_method(request.method), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body.clone() {
            builder = builder.body(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let aborts = &self.aborts;
        let future: SendFuture<'_> = Box::pin(async move {
            let start = Instant::now();
            let send_future = builder.send();
            tokio::pin!(send_future);

            let result = tokio::select! {
                result = &mut send_future => result,
                _ = abort_rx => {
                    aborts.remove(&id);
                    return Err(OlpError::Cancelled);
                }
            };
            aborts.remove(&id);

            let response = result.map_err(|err| {
                if err.is_timeout() {
                    OlpError::RequestTimeout {
                        message: err.to_string(),
                    }
                } else {
                    OlpError::NetworkConnection {
                        message: err.to_string(),
                    }
                }
            })?;

            let status = response.status().as_u16();
            let headers: Vec<(String, String)> = response
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        value.to_str().unwrap_or_default().to_string(),
                    )
                })
                .collect();
            let body = response
                .bytes()
                .await
                .map_err(|err| OlpError::NetworkConnection {
                    message: err.to_string(),
                })?;
            let duration = start.elapsed();

            Ok(HttpResponse {
                status,
                headers,
                network_statistics: NetworkStatistics {
                    bytes_uploaded: 0,
                    bytes_downloaded: body.len() as u64,
                    duration,
                },
                body,
            })
        });

        (id, future)
    }

    fn cancel(&self, request_id: RequestId) {
        if let Some((_, tx)) = self.aborts.remove(&request_id) {
            let _ = tx.send(());
        }
    }
}

impl std::fmt::Debug for ReqwestTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestTransport").finish_non_exhaustive()
    }
}

#[allow(unused)]
fn _assert_send_sync() {
    fn is_send_sync<T: Send + Sync>() {}
    is_send_sync::<Arc<ReqwestTransport>>();
}
