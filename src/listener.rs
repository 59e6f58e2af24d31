//! TCP listeners for the HTTP and RPC front doors.
//!
//! The HTTP listener speaks HTTP/1.1; the RPC listener speaks HTTP/2 with
//! prior knowledge (h2c), which is what cleartext gRPC clients use. Both hand
//! every request to a [`ProxyService`].

use crate::connection::ConnectionLimiter;
use crate::error::{ProxyError, Result};
use crate::protocol::Protocol;
use crate::service::ProxyService;
use hyper::body::Incoming;
use hyper::server::conn::{http1, http2};
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tower::Service;
use tracing::{debug, info, instrument, warn};

/// Listener that accepts connections and spawns a handler task per connection.
///
/// The wire protocol follows the service: [`Protocol::Http`] is served as
/// HTTP/1.1, [`Protocol::Rpc`] as h2c.
///
/// # Example
///
/// ```no_run
/// use rust_sandbox_proxy::circuit_breaker::{BreakerRegistry, CircuitBreakerConfig};
/// use rust_sandbox_proxy::connection::ConnectionLimiter;
/// use rust_sandbox_proxy::listener::Listener;
/// use rust_sandbox_proxy::protocol::Protocol;
/// use rust_sandbox_proxy::router::RoutingTable;
/// use rust_sandbox_proxy::service::ProxyService;
/// use rust_sandbox_proxy::transport::ClientPool;
/// use std::sync::Arc;
/// use std::time::Duration;
/// use tokio::sync::broadcast;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let (shutdown_tx, _) = broadcast::channel(1);
///     let service = ProxyService::new(
///         Protocol::Http,
///         Arc::new(RoutingTable::new("http://127.0.0.1:8080")),
///         Arc::new(ClientPool::with_defaults()),
///         Arc::new(BreakerRegistry::new(CircuitBreakerConfig::default())),
///         Duration::from_secs(30),
///     );
///     let listener = Listener::bind("127.0.0.1:3000", service, ConnectionLimiter::new(10_000)).await?;
///     listener.serve(shutdown_tx.subscribe()).await?;
///     Ok(())
/// }
/// ```
pub struct Listener {
    tcp_listener: TcpListener,
    proxy_service: ProxyService,
    limiter: ConnectionLimiter,
    addr: SocketAddr,
}

impl Listener {
    /// Binds to the specified address.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::ListenerBind` if binding fails.
    #[instrument(level = "info", skip(proxy_service, limiter), fields(protocol = %proxy_service.protocol()))]
    pub async fn bind(
        addr: &str,
        proxy_service: ProxyService,
        limiter: ConnectionLimiter,
    ) -> Result<Self> {
        let (tcp_listener, local_addr) = bind_tcp(addr).await?;

        info!(
            protocol = %proxy_service.protocol(),
            max_connections = limiter.max_connections(),
            "bound to {}",
            local_addr
        );

        Ok(Self {
            tcp_listener,
            proxy_service,
            limiter,
            addr: local_addr,
        })
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the protocol this listener serves.
    pub fn protocol(&self) -> Protocol {
        self.proxy_service.protocol()
    }

    /// Serves incoming connections until a shutdown signal is received.
    ///
    /// Connections over the limit are dropped immediately. In-flight
    /// connections are left to finish on their own tasks.
    #[instrument(level = "info", skip(self, shutdown_rx), fields(addr = %self.addr, protocol = %self.protocol()))]
    pub async fn serve(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("serving connections");

        loop {
            tokio::select! {
                accept_result = self.tcp_listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let Some(guard) = self.limiter.try_acquire() else {
                                drop(stream);
                                continue;
                            };
                            debug!("accepted connection from {}", peer_addr);

                            let service = self.proxy_service.clone();
                            tokio::spawn(async move {
                                let _guard = guard;
                                if let Err(e) = Self::handle_connection(stream, service).await {
                                    debug!("connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("received shutdown signal, stopping listener");
                    break;
                }
            }
        }

        Ok(())
    }

    #[instrument(level = "debug", skip_all)]
    async fn handle_connection(stream: TcpStream, service: ProxyService) -> Result<()> {
        let _ = stream.set_nodelay(true);
        match service.protocol() {
            Protocol::Http => Self::serve_http1(TokioIo::new(stream), service).await,
            Protocol::Rpc => Self::serve_http2(TokioIo::new(stream), service).await,
        }
    }

    /// Serves HTTP/1.1 on the given I/O stream.
    async fn serve_http1<I>(io: TokioIo<I>, service: ProxyService) -> Result<()>
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let service = service_fn(move |req: Request<Incoming>| {
            let mut svc = service.clone();
            async move { svc.call(req).await }
        });

        http1::Builder::new()
            .serve_connection(io, service)
            .await
            .map_err(ProxyError::Http)
    }

    /// Serves HTTP/2 prior knowledge on the given I/O stream.
    async fn serve_http2<I>(io: TokioIo<I>, service: ProxyService) -> Result<()>
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let service = service_fn(move |req: Request<Incoming>| {
            let mut svc = service.clone();
            async move { svc.call(req).await }
        });

        http2::Builder::new(TokioExecutor::new())
            .serve_connection(io, service)
            .await
            .map_err(ProxyError::Http)
    }
}

/// Binds a TCP socket and resolves the address it actually got, so `:0`
/// binds report their ephemeral port.
pub(crate) async fn bind_tcp(addr: &str) -> Result<(TcpListener, SocketAddr)> {
    let bind_err = |source| ProxyError::ListenerBind {
        addr: addr.to_string(),
        source,
    };
    let tcp_listener = TcpListener::bind(addr).await.map_err(bind_err)?;
    let local_addr = tcp_listener.local_addr().map_err(bind_err)?;
    Ok((tcp_listener, local_addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{BreakerRegistry, CircuitBreakerConfig};
    use crate::router::RoutingTable;
    use crate::transport::ClientPool;
    use std::sync::Arc;
    use std::time::Duration;

    fn service(protocol: Protocol) -> ProxyService {
        ProxyService::new(
            protocol,
            Arc::new(RoutingTable::new("http://127.0.0.1:9999")),
            Arc::new(ClientPool::with_defaults()),
            Arc::new(BreakerRegistry::new(CircuitBreakerConfig::default())),
            Duration::from_secs(30),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_listener_bind() {
        let listener = Listener::bind("127.0.0.1:0", service(Protocol::Http), ConnectionLimiter::new(8)).await;
        assert!(listener.is_ok());
        let listener = listener.unwrap();
        assert_eq!(listener.protocol(), Protocol::Http);
        assert_ne!(listener.local_addr().port(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_listener_bind_invalid_address() {
        let listener =
            Listener::bind("999.999.999.999:0", service(Protocol::Http), ConnectionLimiter::new(8)).await;
        assert!(matches!(listener, Err(ProxyError::ListenerBind { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rpc_listener_bind() {
        let listener = Listener::bind("127.0.0.1:0", service(Protocol::Rpc), ConnectionLimiter::new(8)).await;
        assert_eq!(listener.unwrap().protocol(), Protocol::Rpc);
    }
}
