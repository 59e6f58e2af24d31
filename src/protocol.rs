//! Protocol adapters for the HTTP and RPC listeners.
//!
//! Both listeners feed the same forwarding path; this module holds what
//! differs between them: where the route key lives, which requests are
//! malformed, and how a failure is reported to the caller.

use crate::error::{ErrorClass, ProxyError, Result};
use crate::propagation::ROUTE_KEY_METADATA;
use crate::transport::ProxyBody;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, Response, StatusCode};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;

/// Header naming the failure class on proxy-generated error responses.
pub const PROXY_ERROR_HEADER: &str = "x-proxy-error";

const GRPC_CONTENT_TYPE: &str = "application/grpc";

/// Inbound listener protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// HTTP/1.1, route key in a configurable header.
    Http,
    /// gRPC over HTTP/2 cleartext, route key in `x-routing-key` metadata.
    Rpc,
}

impl Protocol {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Rpc => "rpc",
        }
    }

    /// Reads the route key for this protocol.
    ///
    /// A missing key is `Ok(None)`. A value that is not visible ASCII, or
    /// repeated values that disagree, make the request malformed.
    pub fn route_key(&self, headers: &HeaderMap, http_header: &HeaderName) -> Result<Option<String>> {
        let name = match self {
            Protocol::Http => http_header.clone(),
            Protocol::Rpc => HeaderName::from_static(ROUTE_KEY_METADATA),
        };

        let mut values = headers.get_all(&name).iter();
        let first = match values.next() {
            Some(value) => value,
            None => return Ok(None),
        };

        let key = first.to_str().map_err(|_| {
            ProxyError::MalformedRequest(format!("{} is not valid text", name))
        })?;

        if values.any(|other| other != first) {
            return Err(ProxyError::MalformedRequest(format!(
                "conflicting values for {}",
                name
            )));
        }

        Ok(Some(key.to_string()))
    }

    /// Rejects requests the listener cannot forward.
    pub fn validate(&self, headers: &HeaderMap) -> Result<()> {
        match self {
            Protocol::Http => Ok(()),
            Protocol::Rpc => {
                let is_grpc = headers
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(|ct| ct.starts_with(GRPC_CONTENT_TYPE));
                if is_grpc {
                    Ok(())
                } else {
                    Err(ProxyError::MalformedRequest(
                        "rpc request without application/grpc content-type".to_string(),
                    ))
                }
            }
        }
    }

    /// Builds the caller-facing response for a failed request.
    ///
    /// The body names the class only; targets and upstream error text stay
    /// in the logs.
    pub fn error_response(&self, class: ErrorClass) -> Response<ProxyBody> {
        match self {
            Protocol::Http => {
                let body = serde_json::json!({
                    "error": {
                        "class": class.as_str(),
                        "message": class.description(),
                    }
                });
                let mut response = Response::new(full_body(body.to_string()));
                *response.status_mut() = class.http_status();
                let headers = response.headers_mut();
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                headers.insert(
                    PROXY_ERROR_HEADER,
                    HeaderValue::from_static(class.as_str()),
                );
                response
            }
            Protocol::Rpc => {
                // Trailers-only response: gRPC status travels in the headers.
                let code = class.grpc_code() as i32;
                let mut response = Response::new(empty_body());
                *response.status_mut() = StatusCode::OK;
                let headers = response.headers_mut();
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(GRPC_CONTENT_TYPE));
                headers.insert("grpc-status", HeaderValue::from(code));
                headers.insert(
                    "grpc-message",
                    HeaderValue::from_static(class.description()),
                );
                headers.insert(
                    PROXY_ERROR_HEADER,
                    HeaderValue::from_static(class.as_str()),
                );
                response
            }
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wraps bytes as a proxy body.
pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

/// An empty proxy body.
pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}
