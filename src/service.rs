//! Tower service implementation for routed proxying.
//!
//! One [`ProxyService`] serves one listener. Each request walks the stages
//! of [`Stage`] in order; a [`RequestRecord`] travels with it and records
//! metrics exactly once, whether the request completes, fails, or is
//! abandoned by the caller.

use crate::circuit_breaker::BreakerRegistry;
use crate::error::{ErrorClass, ProxyError, Result};
use crate::metrics::Metrics;
use crate::propagation::{ContextPropagator, ROUTE_KEY_HEADER};
use crate::protocol::Protocol;
use crate::router::{Resolution, RoutingTable};
use crate::rules::RequestAttributes;
use crate::transport::{BoxError, ClientPool, PooledBody, ProxyBody};
use http::header::{HeaderName, CONNECTION};
use http::{HeaderMap, Request, Response};
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tonic::metadata::MetadataMap;
use tower::Service;
use tracing::{debug, info, instrument, warn};

/// Status recorded for requests the caller abandoned before a response.
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Request lifecycle stages, in the only order they may occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Received,
    Resolved,
    ContextPropagated,
    Forwarded,
    ResponseStreaming,
    Completed,
    Failed,
}

/// Per-request bookkeeping. Records metrics once, on finish, failure or drop.
#[derive(Debug)]
pub struct RequestRecord {
    protocol: Protocol,
    path: String,
    started: Instant,
    stage: Stage,
    status: Option<u16>,
    recorded: bool,
}

impl RequestRecord {
    fn new(protocol: Protocol, path: &str) -> Self {
        Self {
            protocol,
            path: path.to_string(),
            started: Instant::now(),
            stage: Stage::Received,
            status: None,
            recorded: false,
        }
    }

    /// Current stage.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    fn advance(&mut self, next: Stage) {
        debug_assert!(next > self.stage, "stage {:?} after {:?}", next, self.stage);
        self.stage = next;
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn complete(mut self) {
        self.advance(Stage::Completed);
        self.record();
    }

    fn fail(mut self, status: u16) {
        self.stage = Stage::Failed;
        self.status = Some(status);
        self.record();
    }

    fn record(&mut self) {
        if self.recorded {
            return;
        }
        self.recorded = true;

        let status = self.status.unwrap_or(CLIENT_CLOSED_REQUEST);
        let duration = self.elapsed().as_secs_f64();
        Metrics::record_request(self.protocol.as_str(), &self.path, status, duration);

        info!(
            protocol = %self.protocol,
            path = %self.path,
            status,
            stage = ?self.stage,
            duration_ms = duration * 1000.0,
            "request finished"
        );
    }
}

impl Drop for RequestRecord {
    fn drop(&mut self) {
        if !self.recorded {
            debug!(stage = ?self.stage, "request abandoned before completion");
            self.stage = Stage::Failed;
            self.record();
        }
    }
}

/// Upstream response body that completes the request record when the last
/// frame has been passed to the caller.
///
/// A body that breaks off mid-stream fails the record as
/// `UpstreamUnavailable` and counts against the target's breaker, even
/// though the status line already went out.
struct StreamingBody {
    inner: PooledBody,
    record: Option<RequestRecord>,
    breakers: Arc<BreakerRegistry>,
    target: String,
}

impl Body for StreamingBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, hyper::Error>>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_frame(cx);
        match &poll {
            Poll::Ready(None) => {
                if let Some(record) = this.record.take() {
                    record.complete();
                }
            }
            Poll::Ready(Some(Err(e))) => {
                if let Some(record) = this.record.take() {
                    warn!(target = %this.target, error = %e, "upstream response body failed mid-stream");
                    let class = ErrorClass::UpstreamUnavailable;
                    Metrics::record_error(class);
                    this.breakers.record_failure(&this.target);
                    record.fail(class.http_status().as_u16());
                }
            }
            _ => {}
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

/// Connection-level headers that must not be forwarded on the HTTP listener.
const HOP_BY_HOP: [&str; 4] = ["keep-alive", "proxy-connection", "upgrade", "te"];

/// Routed proxy service for one listener.
///
/// Implements `tower::Service` for composability with Tower middleware.
///
/// # Example
///
/// ```no_run
/// use rust_sandbox_proxy::circuit_breaker::{BreakerRegistry, CircuitBreakerConfig};
/// use rust_sandbox_proxy::protocol::Protocol;
/// use rust_sandbox_proxy::router::RoutingTable;
/// use rust_sandbox_proxy::service::ProxyService;
/// use rust_sandbox_proxy::transport::ClientPool;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let table = Arc::new(RoutingTable::new("http://127.0.0.1:8080"));
/// let service = ProxyService::new(
///     Protocol::Http,
///     table,
///     Arc::new(ClientPool::with_defaults()),
///     Arc::new(BreakerRegistry::new(CircuitBreakerConfig::default())),
///     Duration::from_secs(30),
/// );
/// ```
#[derive(Clone)]
pub struct ProxyService {
    protocol: Protocol,
    table: Arc<RoutingTable>,
    pool: Arc<ClientPool>,
    breakers: Arc<BreakerRegistry>,
    propagator: ContextPropagator,
    request_timeout: Duration,
}

impl ProxyService {
    /// Creates a service for `protocol` over shared routing state.
    pub fn new(
        protocol: Protocol,
        table: Arc<RoutingTable>,
        pool: Arc<ClientPool>,
        breakers: Arc<BreakerRegistry>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            protocol,
            table,
            pool,
            breakers,
            propagator: ContextPropagator::default(),
            request_timeout,
        }
    }

    /// Uses `propagator` for context handling and HTTP route key lookup.
    pub fn with_propagator(mut self, propagator: ContextPropagator) -> Self {
        self.propagator = propagator;
        self
    }

    /// Listener protocol this service handles.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Proxies one request. Never fails; errors become protocol-appropriate
    /// responses.
    #[instrument(
        level = "debug",
        skip(self, req),
        fields(protocol = self.protocol.as_str(), method = %req.method(), path = %req.uri().path())
    )]
    pub async fn handle<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let mut record = RequestRecord::new(self.protocol, req.uri().path());

        match self.forward(req, &mut record).await {
            Ok((response, target)) => {
                record.advance(Stage::ResponseStreaming);
                record.status = Some(response.status().as_u16());
                response.map(|inner| {
                    StreamingBody {
                        inner,
                        record: Some(record),
                        breakers: Arc::clone(&self.breakers),
                        target,
                    }
                    .map_err(|e| Box::new(e) as BoxError)
                    .boxed()
                })
            }
            Err(err) => self.fail(err, record),
        }
    }

    async fn forward<B>(
        &self,
        req: Request<B>,
        record: &mut RequestRecord,
    ) -> Result<(Response<PooledBody>, String)>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let (mut parts, body) = req.into_parts();

        let route_key = self
            .protocol
            .route_key(&parts.headers, self.propagator.route_key_header())?;
        self.protocol.validate(&parts.headers)?;

        let resolution = {
            let attrs = RequestAttributes::new(route_key.as_deref(), parts.uri.path(), &parts.headers);
            self.table.resolve(&attrs)
        };
        Metrics::record_resolution(resolution.is_miss());
        record.advance(Stage::Resolved);

        parts.headers = self.propagate(parts.headers, &resolution);
        record.advance(Stage::ContextPropagated);

        let target = resolution.target().to_string();
        if !self.breakers.allow(&target) {
            return Err(ProxyError::CircuitOpen { target });
        }

        let client = self.pool.get_client(&target);
        parts.uri = client.upstream_uri(&parts.uri)?;
        record.advance(Stage::Forwarded);

        let remaining = self.request_timeout.saturating_sub(record.elapsed());
        let upstream_req = Request::from_parts(parts, body.map_err(|e| -> BoxError { e.into() }).boxed());

        match client.send(upstream_req, remaining).await {
            Ok(response) => {
                self.breakers.record_success(&target);
                debug!(
                    target = %target,
                    version = resolution.version(),
                    status = response.status().as_u16(),
                    "upstream responded"
                );
                Ok((response, target))
            }
            Err(err) => {
                if matches!(
                    err.class(),
                    Some(ErrorClass::UpstreamUnavailable | ErrorClass::UpstreamTimeout)
                ) {
                    self.breakers.record_failure(&target);
                }
                Err(err)
            }
        }
    }

    /// Carries inbound context onto the outbound headers, then applies the
    /// matched rule's headers, which win on conflict.
    ///
    /// Extract and inject run on the same carrier, so context values pass
    /// through byte for byte. The rewrites that change the request are
    /// hop-by-hop stripping, the canonical `x-route-key` header when the
    /// route key arrives under a custom header, and the rule headers.
    fn propagate(&self, headers: HeaderMap, resolution: &Resolution) -> HeaderMap {
        let mut headers = match self.protocol {
            Protocol::Http => {
                let mut headers = strip_hop_by_hop(headers);
                let ctx = self.propagator.extract_from_http(&headers);
                self.propagator.inject_into_http(&ctx, &mut headers);
                if let Some(route_key) = ctx.route_key {
                    if self.propagator.has_custom_route_key_header() {
                        headers.insert(HeaderName::from_static(ROUTE_KEY_HEADER), route_key);
                    }
                }
                headers
            }
            Protocol::Rpc => {
                let mut metadata = MetadataMap::from_headers(headers);
                let ctx = self.propagator.extract_from_metadata(&metadata);
                self.propagator.inject_into_metadata(&ctx, &mut metadata);
                metadata.into_headers()
            }
        };

        for (name, value) in resolution.additional_headers() {
            headers.insert(name.clone(), value.clone());
        }
        headers
    }

    fn fail(&self, err: ProxyError, record: RequestRecord) -> Response<ProxyBody> {
        let class = err.class().unwrap_or(ErrorClass::UpstreamUnavailable);
        warn!(
            protocol = %self.protocol,
            class = %class,
            stage = ?record.stage(),
            error = %err,
            "request failed"
        );
        Metrics::record_error(class);
        record.fail(class.http_status().as_u16());
        self.protocol.error_response(class)
    }
}

fn strip_hop_by_hop(mut headers: HeaderMap) -> HeaderMap {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    headers.remove(CONNECTION);
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers
}

impl Service<Request<Incoming>> for ProxyService {
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { Ok(this.handle(req).await) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::protocol::{empty_body, PROXY_ERROR_HEADER};
    use crate::rules::RoutingRule;
    use http::{HeaderValue, StatusCode};

    fn service(protocol: Protocol, table: Arc<RoutingTable>) -> ProxyService {
        ProxyService::new(
            protocol,
            table,
            Arc::new(ClientPool::with_defaults()),
            Arc::new(BreakerRegistry::new(CircuitBreakerConfig::default())),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_stages_are_ordered() {
        assert!(Stage::Received < Stage::Resolved);
        assert!(Stage::Resolved < Stage::ContextPropagated);
        assert!(Stage::ContextPropagated < Stage::Forwarded);
        assert!(Stage::Forwarded < Stage::ResponseStreaming);
        assert!(Stage::ResponseStreaming < Stage::Completed);
    }

    #[test]
    fn test_rule_headers_override_propagated_context() {
        let table = Arc::new(RoutingTable::new("default:80"));
        table.replace(vec![RoutingRule::new("k", "svc-a:80")
            .with_additional_header("x-trace-id", "forced")
            .with_additional_header("x-sandbox", "k")]);
        let svc = service(Protocol::Http, Arc::clone(&table));

        let mut headers = HeaderMap::new();
        headers.insert("x-route-key", HeaderValue::from_static("k"));
        headers.insert("x-trace-id", HeaderValue::from_static("from-client"));
        headers.insert("authorization", HeaderValue::from_static("Bearer t"));

        let empty = HeaderMap::new();
        let resolution = table.resolve(&RequestAttributes::new(Some("k"), "/", &empty));
        let out = svc.propagate(headers, &resolution);

        assert_eq!(out["x-trace-id"], "forced");
        assert_eq!(out["x-sandbox"], "k");
        assert_eq!(out["x-route-key"], "k");
        assert_eq!(out["authorization"], "Bearer t");
    }

    #[test]
    fn test_custom_route_key_header_also_sent_canonically() {
        let table = Arc::new(RoutingTable::new("default:80"));
        let svc = service(Protocol::Http, Arc::clone(&table))
            .with_propagator(ContextPropagator::new(HeaderName::from_static("x-sandbox")));

        let mut headers = HeaderMap::new();
        headers.insert("x-sandbox", HeaderValue::from_static("blue"));

        let empty = HeaderMap::new();
        let resolution = table.resolve(&RequestAttributes::new(Some("blue"), "/", &empty));
        let out = svc.propagate(headers, &resolution);

        assert_eq!(out["x-sandbox"], "blue");
        assert_eq!(out["x-route-key"], "blue");
    }

    #[test]
    fn test_default_route_key_header_not_duplicated() {
        let table = Arc::new(RoutingTable::new("default:80"));
        let svc = service(Protocol::Http, Arc::clone(&table));

        let mut headers = HeaderMap::new();
        headers.insert("x-route-key", HeaderValue::from_static("blue"));

        let empty = HeaderMap::new();
        let resolution = table.resolve(&RequestAttributes::new(Some("blue"), "/", &empty));
        let out = svc.propagate(headers, &resolution);

        assert_eq!(out.get_all("x-route-key").iter().count(), 1);
    }

    #[test]
    fn test_hop_by_hop_headers_removed() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-private"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-private", HeaderValue::from_static("1"));
        headers.insert("x-route-key", HeaderValue::from_static("k"));

        let out = strip_hop_by_hop(headers);
        assert!(out.get(CONNECTION).is_none());
        assert!(out.get("keep-alive").is_none());
        assert!(out.get("x-private").is_none());
        assert_eq!(out["x-route-key"], "k");
    }

    #[tokio::test]
    async fn test_malformed_rpc_request_rejected() {
        let table = Arc::new(RoutingTable::new("default:80"));
        let svc = service(Protocol::Rpc, table);

        let req = Request::builder()
            .uri("/pkg.Svc/Call")
            .body(empty_body())
            .unwrap();
        let response = svc.handle(req).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["grpc-status"], "3");
        assert_eq!(response.headers()[PROXY_ERROR_HEADER], "malformed_request");
    }

    #[tokio::test]
    async fn test_open_circuit_short_circuits() {
        let table = Arc::new(RoutingTable::new("127.0.0.1:1"));
        let breakers = Arc::new(BreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(60),
            success_threshold: 1,
        }));
        breakers.record_failure("127.0.0.1:1");

        let pool = Arc::new(ClientPool::with_defaults());
        let svc = ProxyService::new(
            Protocol::Http,
            table,
            Arc::clone(&pool),
            breakers,
            Duration::from_secs(1),
        );

        let req = Request::builder().uri("/x").body(empty_body()).unwrap();
        let response = svc.handle(req).await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()[PROXY_ERROR_HEADER], "upstream_unavailable");
        // Rejected before a client was ever built.
        assert_eq!(pool.stats().clients_created, 0);
    }
}
