//! Error types for the sandbox proxy.

use std::io;
use thiserror::Error;

/// Errors that can occur during proxy operations.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Failed to bind to the listener address.
    #[error("failed to bind listener to {addr}: {source}")]
    ListenerBind { addr: String, source: io::Error },

    /// HTTP protocol error on an inbound connection.
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The upstream could not be reached or the exchange broke off.
    #[error("upstream {target} unavailable: {reason}")]
    UpstreamUnavailable { target: String, reason: String },

    /// Circuit breaker is open.
    #[error("circuit breaker is open for upstream: {target}")]
    CircuitOpen { target: String },

    /// Deadline exceeded awaiting the upstream.
    #[error("upstream request timed out after {duration_ms}ms")]
    UpstreamTimeout { duration_ms: u64 },

    /// Inbound request rejected before routing.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ProxyError {
    /// Returns the caller-visible class of a per-request error.
    ///
    /// Startup errors (bind, config, listener I/O) have no class; they never
    /// reach a caller.
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            ProxyError::UpstreamUnavailable { .. } | ProxyError::CircuitOpen { .. } => {
                Some(ErrorClass::UpstreamUnavailable)
            }
            ProxyError::UpstreamTimeout { .. } => Some(ErrorClass::UpstreamTimeout),
            ProxyError::MalformedRequest(_) => Some(ErrorClass::MalformedRequest),
            _ => None,
        }
    }
}

/// Machine-readable failure class reported to callers and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Connection failed or was short-circuited by the breaker.
    UpstreamUnavailable,
    /// Deadline exceeded awaiting upstream.
    UpstreamTimeout,
    /// Request rejected at `Received`.
    MalformedRequest,
    /// Rule sync failed to fetch updates. Never surfaced to a request.
    SyncSourceError,
}

impl ErrorClass {
    /// Stable label used in responses and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::UpstreamUnavailable => "upstream_unavailable",
            ErrorClass::UpstreamTimeout => "upstream_timeout",
            ErrorClass::MalformedRequest => "malformed_request",
            ErrorClass::SyncSourceError => "sync_source_error",
        }
    }

    /// HTTP status reported to the original caller.
    pub fn http_status(&self) -> http::StatusCode {
        match self {
            ErrorClass::UpstreamUnavailable => http::StatusCode::BAD_GATEWAY,
            ErrorClass::UpstreamTimeout => http::StatusCode::GATEWAY_TIMEOUT,
            ErrorClass::MalformedRequest => http::StatusCode::BAD_REQUEST,
            ErrorClass::SyncSourceError => http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// gRPC status code reported on the RPC listener.
    pub fn grpc_code(&self) -> tonic::Code {
        match self {
            ErrorClass::UpstreamUnavailable => tonic::Code::Unavailable,
            ErrorClass::UpstreamTimeout => tonic::Code::DeadlineExceeded,
            ErrorClass::MalformedRequest => tonic::Code::InvalidArgument,
            ErrorClass::SyncSourceError => tonic::Code::Internal,
        }
    }

    /// Caller-facing description. Never includes upstream addresses.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorClass::UpstreamUnavailable => "upstream unavailable",
            ErrorClass::UpstreamTimeout => "upstream request timed out",
            ErrorClass::MalformedRequest => "malformed request",
            ErrorClass::SyncSourceError => "routing rules unavailable",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
