//! Per-target upstream client pool.
//!
//! Each distinct target gets one [`UpstreamClient`] wrapping a pooled hyper
//! client. Clients are created lazily and exactly once per target: the pool
//! map hands out a per-target cell and construction runs inside that cell, so
//! concurrent first use of one target never builds two clients and never
//! blocks unrelated targets. Entries leave the pool only on idle expiry or
//! shutdown, never because a request failed.

use crate::error::{ProxyError, Result};
use dashmap::DashMap;
use http::{Request, Response, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame, SizeHint};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioTimer};
use once_cell::sync::OnceCell;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Boxed error carried by proxied bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type for requests forwarded upstream and responses sent to callers.
pub type ProxyBody = BoxBody<Bytes, BoxError>;

/// Configuration for the client pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of idle connections kept per target.
    pub max_idle_per_target: usize,
    /// Maximum concurrent requests per target; further requests queue.
    pub max_concurrent_per_target: usize,
    /// Idle timeout for connections and for pool entries.
    pub idle_timeout: Duration,
    /// Connection establishment timeout.
    pub connect_timeout: Duration,
    /// Speak HTTP/2 with prior knowledge (RPC upstreams).
    pub http2_only: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_target: 32,
            max_concurrent_per_target: 100,
            idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(10),
            http2_only: false,
        }
    }
}

impl PoolConfig {
    /// Creates a new pool configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum idle connections per target.
    pub fn with_max_idle(mut self, max: usize) -> Self {
        self.max_idle_per_target = max;
        self
    }

    /// Sets the maximum concurrent requests per target.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_per_target = max.max(1);
        self
    }

    /// Sets the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enables HTTP/2 only mode.
    pub fn with_http2_only(mut self, http2: bool) -> Self {
        self.http2_only = http2;
        self
    }
}

/// Response body that holds the target's concurrency permit until the body
/// is finished or dropped.
pub struct PooledBody {
    inner: BoxBody<Bytes, hyper::Error>,
    permit: Option<OwnedSemaphorePermit>,
}

impl PooledBody {
    fn new(inner: hyper::body::Incoming, permit: OwnedSemaphorePermit) -> Self {
        Self {
            inner: inner.boxed(),
            permit: Some(permit),
        }
    }
}

impl Body for PooledBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, hyper::Error>>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_frame(cx);
        if matches!(poll, Poll::Ready(None) | Poll::Ready(Some(Err(_)))) {
            this.permit.take();
        }
        poll
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// A reusable client bound to one upstream target.
pub struct UpstreamClient {
    target: String,
    base: String,
    client: Client<HttpConnector, ProxyBody>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    epoch: Instant,
    last_used_ms: AtomicU64,
    requests: AtomicU64,
    failures: AtomicU64,
}

impl UpstreamClient {
    fn new(target: &str, config: &PoolConfig, epoch: Instant) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.connect_timeout));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(config.idle_timeout)
            .pool_max_idle_per_host(config.max_idle_per_target)
            .pool_timer(TokioTimer::new())
            .http2_only(config.http2_only)
            .build(connector);

        let max_concurrent = config.max_concurrent_per_target.max(1);
        let this = Self {
            target: target.to_string(),
            base: base_url(target),
            client,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            epoch,
            last_used_ms: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        };
        this.touch();
        this
    }

    /// Target this client forwards to.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Builds the upstream URI from the target and the inbound path and query.
    pub fn upstream_uri(&self, original: &Uri) -> Result<Uri> {
        let path_and_query = original
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        format!("{}{}", self.base, path_and_query)
            .parse()
            .map_err(|e| ProxyError::UpstreamUnavailable {
                target: self.target.clone(),
                reason: format!("invalid upstream uri: {}", e),
            })
    }

    /// Sends a request upstream, queueing for a concurrency permit if the
    /// target is saturated. The whole exchange, queueing included, is bounded
    /// by `request_timeout`.
    pub async fn send(
        &self,
        req: Request<ProxyBody>,
        request_timeout: Duration,
    ) -> Result<Response<PooledBody>> {
        let started = tokio::time::Instant::now();
        let deadline = started + request_timeout;
        let timed_out = || ProxyError::UpstreamTimeout {
            duration_ms: request_timeout.as_millis() as u64,
        };

        self.touch();
        self.requests.fetch_add(1, Ordering::Relaxed);

        let permit =
            match tokio::time::timeout_at(deadline, Arc::clone(&self.permits).acquire_owned())
                .await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    return Err(ProxyError::UpstreamUnavailable {
                        target: self.target.clone(),
                        reason: "client pool closed".to_string(),
                    });
                }
                Err(_) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    debug!(target = %self.target, "timed out queueing for upstream connection");
                    return Err(timed_out());
                }
            };

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let result = timeout(remaining, self.client.request(req)).await;
        self.touch();

        match result {
            Ok(Ok(response)) => Ok(response.map(|body| PooledBody::new(body, permit))),
            Ok(Err(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target = %self.target,
                    connect = e.is_connect(),
                    error = %e,
                    "upstream request failed"
                );
                Err(ProxyError::UpstreamUnavailable {
                    target: self.target.clone(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                Err(timed_out())
            }
        }
    }

    /// Requests currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.permits.available_permits()
    }

    /// Total requests and failures seen by this client.
    pub fn counts(&self) -> (u64, u64) {
        (
            self.requests.load(Ordering::Relaxed),
            self.failures.load(Ordering::Relaxed),
        )
    }

    fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_used_ms.fetch_max(now, Ordering::Relaxed);
    }

    fn is_idle(&self, idle_timeout: Duration) -> bool {
        let now = self.epoch.elapsed().as_millis() as u64;
        let idle_for = now.saturating_sub(self.last_used_ms.load(Ordering::Relaxed));
        self.in_flight() == 0 && idle_for >= idle_timeout.as_millis() as u64
    }
}

impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("target", &self.target)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

fn base_url(target: &str) -> String {
    let target = target.trim_end_matches('/');
    if target.contains("://") {
        target.to_string()
    } else {
        format!("http://{}", target)
    }
}

/// Pool statistics.
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Clients constructed since startup.
    pub clients_created: u64,
    /// Clients removed by idle expiry.
    pub clients_evicted: u64,
    /// Targets currently pooled.
    pub targets: usize,
    /// Requests currently holding a permit, across all targets.
    pub in_flight: usize,
}

type ClientCell = Arc<OnceCell<Arc<UpstreamClient>>>;

/// Pool of upstream clients keyed by target address.
pub struct ClientPool {
    config: PoolConfig,
    entries: DashMap<String, ClientCell>,
    epoch: Instant,
    clients_created: AtomicU64,
    clients_evicted: AtomicU64,
}

impl ClientPool {
    /// Creates a new pool with the given configuration.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            epoch: Instant::now(),
            clients_created: AtomicU64::new(0),
            clients_evicted: AtomicU64::new(0),
        }
    }

    /// Creates a pool with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(PoolConfig::default())
    }

    /// Returns the client for `target`, constructing it on first use.
    pub fn get_client(&self, target: &str) -> Arc<UpstreamClient> {
        let cell = match self.entries.get(target) {
            Some(cell) => cell.value().clone(),
            None => self
                .entries
                .entry(target.to_string())
                .or_default()
                .value()
                .clone(),
        };

        // The map shard lock is released; only callers racing on this
        // target wait here.
        let client = cell.get_or_init(|| {
            self.clients_created.fetch_add(1, Ordering::Relaxed);
            info!(target = %target, http2 = self.config.http2_only, "creating upstream client");
            Arc::new(UpstreamClient::new(target, &self.config, self.epoch))
        });

        client.touch();
        Arc::clone(client)
    }

    /// Removes clients idle for longer than the idle timeout with no request
    /// in flight. Returns the number removed.
    pub fn evict_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let mut evicted = 0;

        self.entries.retain(|target, cell| match cell.get() {
            Some(client) if client.is_idle(idle_timeout) => {
                debug!(target = %target, "evicting idle upstream client");
                evicted += 1;
                false
            }
            _ => true,
        });

        if evicted > 0 {
            self.clients_evicted
                .fetch_add(evicted as u64, Ordering::Relaxed);
        }
        evicted
    }

    /// Runs idle eviction periodically until shutdown, then drops all
    /// clients.
    pub async fn reap_idle(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let period = (self.config.idle_timeout / 2).max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.evict_idle();
                }
                _ = shutdown_rx.recv() => {
                    self.shutdown();
                    break;
                }
            }
        }
    }

    /// Drops every pooled client.
    pub fn shutdown(&self) {
        let targets = self.entries.len();
        self.entries.clear();
        info!(targets, "client pool shut down");
    }

    /// Returns true if a client for `target` is pooled.
    pub fn contains(&self, target: &str) -> bool {
        self.entries
            .get(target)
            .is_some_and(|cell| cell.get().is_some())
    }

    /// Returns the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Returns pool statistics.
    pub fn stats(&self) -> PoolStats {
        let in_flight = self
            .entries
            .iter()
            .filter_map(|entry| entry.value().get().map(|c| c.in_flight()))
            .sum();

        PoolStats {
            clients_created: self.clients_created.load(Ordering::Relaxed),
            clients_evicted: self.clients_evicted.load(Ordering::Relaxed),
            targets: self.entries.len(),
            in_flight,
        }
    }
}

impl Default for ClientPool {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{Empty, Full};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use tokio::net::TcpListener;

    async fn start_upstream() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let service = service_fn(|_req| async {
                        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from("ok"))))
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        addr.to_string()
    }

    fn empty_request(client: &UpstreamClient) -> Request<ProxyBody> {
        let uri = client.upstream_uri(&Uri::from_static("/ping")).unwrap();
        Request::builder()
            .uri(uri)
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .unwrap()
    }

    #[test]
    fn test_base_url() {
        assert_eq!(base_url("svc-a:8080"), "http://svc-a:8080");
        assert_eq!(base_url("http://svc-a:8080/"), "http://svc-a:8080");
        assert_eq!(base_url("https://svc-a"), "https://svc-a");
    }

    #[test]
    fn test_pool_config_builder() {
        let config = PoolConfig::new()
            .with_max_idle(4)
            .with_max_concurrent(0)
            .with_idle_timeout(Duration::from_secs(5))
            .with_http2_only(true);
        assert_eq!(config.max_idle_per_target, 4);
        assert_eq!(config.max_concurrent_per_target, 1);
        assert_eq!(config.idle_timeout, Duration::from_secs(5));
        assert!(config.http2_only);
    }

    #[tokio::test]
    async fn test_upstream_uri_keeps_path_and_query() {
        let pool = ClientPool::with_defaults();
        let client = pool.get_client("svc-a:8080");
        let uri = client
            .upstream_uri(&Uri::from_static("http://proxy/api/widgets?page=2"))
            .unwrap();
        assert_eq!(uri, "http://svc-a:8080/api/widgets?page=2");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_flight_construction() {
        let pool = Arc::new(ClientPool::with_defaults());
        let barrier = Arc::new(tokio::sync::Barrier::new(32));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    pool.get_client("never-seen:9000")
                })
            })
            .collect();

        let mut clients = Vec::new();
        for handle in handles {
            clients.push(handle.await.unwrap());
        }

        assert_eq!(pool.stats().clients_created, 1);
        assert!(clients.iter().all(|c| Arc::ptr_eq(c, &clients[0])));

        pool.get_client("other:9000");
        assert_eq!(pool.stats().clients_created, 2);
        assert_eq!(pool.stats().targets, 2);
    }

    #[tokio::test]
    async fn test_idle_eviction() {
        let pool = ClientPool::new(PoolConfig::new().with_idle_timeout(Duration::from_millis(20)));
        pool.get_client("svc-a:1");
        assert_eq!(pool.evict_idle(), 0);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(pool.evict_idle(), 1);
        assert!(!pool.contains("svc-a:1"));

        pool.get_client("svc-a:1");
        let stats = pool.stats();
        assert_eq!(stats.clients_created, 2);
        assert_eq!(stats.clients_evicted, 1);
    }

    #[tokio::test]
    async fn test_unreachable_target_keeps_entry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let pool = ClientPool::with_defaults();
        let client = pool.get_client(&addr);
        let result = client.send(empty_request(&client), Duration::from_secs(2)).await;

        assert!(matches!(result, Err(ProxyError::UpstreamUnavailable { .. })));
        assert!(pool.contains(&addr));
        assert_eq!(client.in_flight(), 0);
        assert_eq!(client.counts(), (1, 1));
    }

    #[tokio::test]
    async fn test_timeout_releases_permit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        // Accept connections but never answer.
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let pool = ClientPool::with_defaults();
        let client = pool.get_client(&addr);
        let result = client
            .send(empty_request(&client), Duration::from_millis(100))
            .await;

        assert!(matches!(result, Err(ProxyError::UpstreamTimeout { .. })));
        assert_eq!(client.in_flight(), 0);
        assert!(pool.contains(&addr));
    }

    #[tokio::test]
    async fn test_saturated_target_queues_until_permit_released() {
        let addr = start_upstream().await;
        let pool = ClientPool::new(PoolConfig::new().with_max_concurrent(1));
        let client = pool.get_client(&addr);

        let first = client
            .send(empty_request(&client), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(client.in_flight(), 1);

        // Queued behind the unfinished first body, then times out.
        let second = client
            .send(empty_request(&client), Duration::from_millis(100))
            .await;
        assert!(matches!(second, Err(ProxyError::UpstreamTimeout { .. })));

        let body = first.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from("ok"));
        assert_eq!(client.in_flight(), 0);

        let third = client
            .send(empty_request(&client), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(third.status(), http::StatusCode::OK);
    }
}
