//! Operator-facing listener for `/health`, `/ready`, `/metrics` and `/routes`.
//!
//! Runs on its own port so health checks and scrapes never compete with proxied
//! traffic for the proxy listeners' connection budget.

use crate::admin::AdminService;
use crate::error::{ProxyError, Result};
use crate::listener::bind_tcp;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioIo, TokioTimer};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tower::Service;
use tracing::{debug, info, instrument, warn};

/// Health checks and scrapes that have not sent their headers by then are dropped.
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Serves an [`AdminService`] over HTTP/1.1.
///
/// Open admin connections are tracked and aborted on shutdown, so a stuck
/// scraper cannot hold the process open.
///
/// ```no_run
/// use rust_sandbox_proxy::admin::AdminService;
/// use rust_sandbox_proxy::admin_listener::AdminListener;
/// use rust_sandbox_proxy::router::RoutingTable;
/// use std::sync::Arc;
/// use tokio::sync::broadcast;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let (shutdown_tx, _) = broadcast::channel(1);
///     let admin = AdminService::new(Arc::new(RoutingTable::new("http://127.0.0.1:8080")));
///     let listener = AdminListener::bind("127.0.0.1:9090", admin).await?;
///     listener.serve(shutdown_tx.subscribe()).await?;
///     Ok(())
/// }
/// ```
pub struct AdminListener {
    tcp_listener: TcpListener,
    admin: AdminService,
    addr: SocketAddr,
}

impl AdminListener {
    /// Binds the admin port. Fails with `ProxyError::ListenerBind`.
    #[instrument(level = "info", skip(admin))]
    pub async fn bind(addr: &str, admin: AdminService) -> Result<Self> {
        let (tcp_listener, addr) = bind_tcp(addr).await?;
        info!(%addr, "admin endpoints bound");

        Ok(Self {
            tcp_listener,
            admin,
            addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accepts admin connections until shutdown, then aborts the ones
    /// still open.
    #[instrument(level = "info", skip(self, shutdown_rx), fields(addr = %self.addr))]
    pub async fn serve(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.tcp_listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let admin = self.admin.clone();
                        connections.spawn(async move {
                            if let Err(e) = serve_admin_connection(stream, admin).await {
                                debug!(%peer, error = %e, "admin connection closed with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "admin accept failed"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown_rx.recv() => break,
            }
        }

        let open = connections.len();
        connections.shutdown().await;
        info!(aborted_connections = open, "admin listener stopped");
        Ok(())
    }
}

async fn serve_admin_connection(stream: TcpStream, admin: AdminService) -> Result<()> {
    let service = service_fn(move |req: Request<Incoming>| {
        let mut admin = admin.clone();
        async move { admin.call(req).await }
    });

    http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT)
        .serve_connection(TokioIo::new(stream), service)
        .await
        .map_err(ProxyError::Http)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::RoutingTable;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn admin() -> AdminService {
        AdminService::new(Arc::new(RoutingTable::new("http://127.0.0.1:8080")))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_admin_listener_bind() {
        let listener = AdminListener::bind("127.0.0.1:0", admin()).await.unwrap();
        assert_ne!(listener.local_addr().port(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_admin_listener_bind_invalid_address() {
        let listener = AdminListener::bind("999.999.999.999:0", admin()).await;
        assert!(matches!(listener, Err(ProxyError::ListenerBind { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_aborts_idle_admin_connection() {
        let listener = AdminListener::bind("127.0.0.1:0", admin()).await.unwrap();
        let addr = listener.local_addr();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let server = tokio::spawn(listener.serve(shutdown_rx));

        // Keep-alive connection left open after one request.
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nhost: admin\r\n\r\n")
            .await
            .unwrap();
        let mut buf = [0u8; 256];
        let n = stream.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 200"));

        shutdown_tx.send(()).unwrap();
        let finished = tokio::time::timeout(Duration::from_secs(2), server).await;
        assert!(finished.unwrap().unwrap().is_ok());
    }
}
