//! Admin endpoints for health, readiness, metrics and the routing table.

use crate::metrics::Metrics;
use crate::protocol::full_body;
use crate::router::RoutingTable;
use crate::transport::ProxyBody;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Request, Response, StatusCode};
use hyper::body::Incoming;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;
use tracing::{debug, warn};

/// Admin service for operational endpoints.
///
/// Serves:
/// - `/health` - Liveness, always 200 OK
/// - `/ready` - 200 once startup has finished, 503 before
/// - `/metrics` - Prometheus metrics in text format
/// - `/routes` - JSON view of the published routing table
///
/// # Example
///
/// ```no_run
/// use rust_sandbox_proxy::admin::AdminService;
/// use rust_sandbox_proxy::router::RoutingTable;
/// use std::sync::Arc;
///
/// let service = AdminService::new(Arc::new(RoutingTable::new("http://127.0.0.1:8080")));
/// service.set_ready(true);
/// ```
#[derive(Clone)]
pub struct AdminService {
    table: Arc<RoutingTable>,
    ready: Arc<AtomicBool>,
}

impl AdminService {
    /// Creates an admin service over the shared routing table. Starts not ready.
    pub fn new(table: Arc<RoutingTable>) -> Self {
        Self {
            table,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Marks the proxy ready or not ready to take traffic.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    /// Handles one admin request.
    pub fn handle<B>(&self, req: &Request<B>) -> Response<ProxyBody> {
        match req.uri().path() {
            "/health" => {
                debug!("health check requested");
                Self::text_response(StatusCode::OK, "healthy")
            }
            "/ready" => {
                if self.ready.load(Ordering::Acquire) {
                    Self::text_response(StatusCode::OK, "ready")
                } else {
                    Self::text_response(StatusCode::SERVICE_UNAVAILABLE, "not ready")
                }
            }
            "/metrics" => {
                debug!("metrics requested");
                match Metrics::encode() {
                    Ok(metrics) => Self::metrics_response(metrics),
                    Err(e) => {
                        warn!("failed to encode metrics: {}", e);
                        Self::text_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "Failed to encode metrics",
                        )
                    }
                }
            }
            "/routes" => match serde_json::to_string_pretty(&self.table.describe()) {
                Ok(json) => {
                    let mut response = Response::new(full_body(json));
                    response
                        .headers_mut()
                        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                    response
                }
                Err(e) => {
                    warn!("failed to serialize routing table: {}", e);
                    Self::text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode routes")
                }
            },
            _ => Self::text_response(StatusCode::NOT_FOUND, "Not Found"),
        }
    }

    fn metrics_response(metrics: String) -> Response<ProxyBody> {
        let mut response = Response::new(full_body(metrics));
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        );
        response
    }

    fn text_response(status: StatusCode, message: &'static str) -> Response<ProxyBody> {
        let mut response = Response::new(full_body(message));
        *response.status_mut() = status;
        response
    }
}

impl Service<Request<Incoming>> for AdminService {
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let response = self.handle(&req);
        Box::pin(async move { Ok(response) })
    }
}
