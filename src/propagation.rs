//! Routing and tracing context propagation.
//!
//! Moves the route key, trace id, span id and `x-ctx-*` extension entries
//! between HTTP header maps and RPC metadata maps. Values are carried
//! unchanged; only key spelling differs between the two carriers.

use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use std::collections::BTreeMap;
use tonic::metadata::{Ascii, KeyAndValueRef, MetadataKey, MetadataMap, MetadataValue};
use tracing::debug;

/// Default HTTP header carrying the route key.
pub const ROUTE_KEY_HEADER: &str = "x-route-key";
/// HTTP header carrying the trace id.
pub const TRACE_ID_HEADER: &str = "x-trace-id";
/// HTTP header carrying the span id.
pub const SPAN_ID_HEADER: &str = "x-span-id";

/// Metadata key carrying the route key on the RPC listener.
pub const ROUTE_KEY_METADATA: &str = "x-routing-key";
/// Metadata key carrying the trace id.
pub const TRACE_ID_METADATA: &str = "x-trace-id";
/// Metadata key carrying the span id.
pub const SPAN_ID_METADATA: &str = "x-span-id";

/// Prefix marking open-ended context entries. Same spelling in both carriers.
pub const EXTENSION_PREFIX: &str = "x-ctx-";

/// Context extracted from one inbound request.
///
/// Values are kept as raw header bytes, so opaque (non-ASCII) values pass
/// through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropagatedContext {
    pub route_key: Option<HeaderValue>,
    pub trace_id: Option<HeaderValue>,
    pub span_id: Option<HeaderValue>,
    /// Extension entries keyed by lower-case name, prefix included.
    pub extensions: BTreeMap<String, HeaderValue>,
}

impl PropagatedContext {
    /// Returns true if nothing was extracted.
    pub fn is_empty(&self) -> bool {
        self.route_key.is_none()
            && self.trace_id.is_none()
            && self.span_id.is_none()
            && self.extensions.is_empty()
    }
}

/// Extracts and injects [`PropagatedContext`] on HTTP headers and RPC metadata.
#[derive(Debug, Clone)]
pub struct ContextPropagator {
    route_key_header: HeaderName,
    trace_id_header: HeaderName,
    span_id_header: HeaderName,
}

impl Default for ContextPropagator {
    fn default() -> Self {
        Self::new(HeaderName::from_static(ROUTE_KEY_HEADER))
    }
}

impl ContextPropagator {
    /// Creates a propagator using `route_key_header` on the HTTP side.
    pub fn new(route_key_header: HeaderName) -> Self {
        Self {
            route_key_header,
            trace_id_header: HeaderName::from_static(TRACE_ID_HEADER),
            span_id_header: HeaderName::from_static(SPAN_ID_HEADER),
        }
    }

    /// HTTP header name carrying the route key.
    pub fn route_key_header(&self) -> &HeaderName {
        &self.route_key_header
    }

    /// Returns true if the route key travels under a non-default header.
    pub fn has_custom_route_key_header(&self) -> bool {
        self.route_key_header != ROUTE_KEY_HEADER
    }

    /// Pulls well-known and extension context from HTTP headers.
    pub fn extract_from_http(&self, headers: &HeaderMap) -> PropagatedContext {
        let extensions = headers
            .iter()
            .filter(|(name, _)| name.as_str().starts_with(EXTENSION_PREFIX))
            .map(|(name, value)| (name.as_str().to_string(), value.clone()))
            .collect();

        PropagatedContext {
            route_key: headers.get(&self.route_key_header).cloned(),
            trace_id: headers.get(&self.trace_id_header).cloned(),
            span_id: headers.get(&self.span_id_header).cloned(),
            extensions,
        }
    }

    /// Sets context entries on outbound HTTP headers, overwriting existing
    /// values for those keys only.
    pub fn inject_into_http(&self, ctx: &PropagatedContext, headers: &mut HeaderMap) {
        if let Some(route_key) = &ctx.route_key {
            headers.insert(self.route_key_header.clone(), route_key.clone());
        }
        if let Some(trace_id) = &ctx.trace_id {
            headers.insert(self.trace_id_header.clone(), trace_id.clone());
        }
        if let Some(span_id) = &ctx.span_id {
            headers.insert(self.span_id_header.clone(), span_id.clone());
        }
        for (key, value) in &ctx.extensions {
            match HeaderName::from_bytes(key.as_bytes()) {
                Ok(name) => {
                    headers.insert(name, value.clone());
                }
                Err(_) => debug!(key = %key, "dropping context key not valid as header"),
            }
        }
    }

    /// Pulls context from RPC metadata using lower-case metadata keys.
    pub fn extract_from_metadata(&self, metadata: &MetadataMap) -> PropagatedContext {
        let read = |key: &str| metadata.get(key).and_then(to_header_value);

        let extensions = metadata
            .iter()
            .filter_map(|entry| match entry {
                KeyAndValueRef::Ascii(key, value) if key.as_str().starts_with(EXTENSION_PREFIX) => {
                    to_header_value(value).map(|v| (key.as_str().to_string(), v))
                }
                _ => None,
            })
            .collect();

        PropagatedContext {
            route_key: read(ROUTE_KEY_METADATA),
            trace_id: read(TRACE_ID_METADATA),
            span_id: read(SPAN_ID_METADATA),
            extensions,
        }
    }

    /// Sets context entries on outbound RPC metadata, overwriting existing
    /// values for those keys only.
    pub fn inject_into_metadata(&self, ctx: &PropagatedContext, metadata: &mut MetadataMap) {
        let mut set = |key: &str, value: &HeaderValue| {
            let key = MetadataKey::<Ascii>::from_bytes(key.as_bytes());
            let value = MetadataValue::<Ascii>::try_from(value.as_bytes());
            match (key, value) {
                (Ok(key), Ok(value)) => {
                    metadata.insert(key, value);
                }
                _ => debug!("dropping context entry not valid as ascii metadata"),
            }
        };

        if let Some(route_key) = &ctx.route_key {
            set(ROUTE_KEY_METADATA, route_key);
        }
        if let Some(trace_id) = &ctx.trace_id {
            set(TRACE_ID_METADATA, trace_id);
        }
        if let Some(span_id) = &ctx.span_id {
            set(SPAN_ID_METADATA, span_id);
        }
        for (key, value) in &ctx.extensions {
            set(key, value);
        }
    }
}

fn to_header_value(value: &MetadataValue<Ascii>) -> Option<HeaderValue> {
    HeaderValue::from_bytes(value.as_encoded_bytes()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-route-key", HeaderValue::from_static("sandbox-42"));
        headers.insert("x-trace-id", HeaderValue::from_static("4bf92f3577b34da6a3ce929d0e0e4736"));
        headers.insert("x-span-id", HeaderValue::from_static("00f067aa0ba902b7"));
        headers.insert("x-ctx-tenant", HeaderValue::from_static("Acme Corp"));
        headers.insert("accept", HeaderValue::from_static("*/*"));
        headers
    }

    #[test]
    fn test_extract_from_http() {
        let propagator = ContextPropagator::default();
        let ctx = propagator.extract_from_http(&inbound_headers());

        assert_eq!(ctx.route_key.unwrap(), "sandbox-42");
        assert_eq!(ctx.trace_id.unwrap(), "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(ctx.span_id.unwrap(), "00f067aa0ba902b7");
        assert_eq!(ctx.extensions["x-ctx-tenant"], "Acme Corp");
        assert_eq!(ctx.extensions.len(), 1);
    }

    #[test]
    fn test_extract_ignores_unknown_headers() {
        let propagator = ContextPropagator::default();
        let mut headers = HeaderMap::new();
        headers.insert("accept", HeaderValue::from_static("*/*"));
        assert!(propagator.extract_from_http(&headers).is_empty());
    }

    #[test]
    fn test_http_round_trip() {
        let propagator = ContextPropagator::default();
        let original = inbound_headers();
        let ctx = propagator.extract_from_http(&original);

        let mut outbound = HeaderMap::new();
        propagator.inject_into_http(&ctx, &mut outbound);

        for name in ["x-route-key", "x-trace-id", "x-span-id", "x-ctx-tenant"] {
            assert_eq!(outbound.get(name), original.get(name), "{}", name);
        }
        assert!(outbound.get("accept").is_none());
    }

    #[test]
    fn test_http_round_trip_keeps_opaque_bytes() {
        let propagator = ContextPropagator::default();
        let mut original = HeaderMap::new();
        original.insert("x-trace-id", HeaderValue::from_bytes(b"caf\xe9-trace").unwrap());
        original.insert("x-ctx-owner", HeaderValue::from_bytes(b"j\xfcrgen").unwrap());

        let ctx = propagator.extract_from_http(&original);
        let mut outbound = HeaderMap::new();
        propagator.inject_into_http(&ctx, &mut outbound);

        assert_eq!(outbound["x-trace-id"].as_bytes(), b"caf\xe9-trace");
        assert_eq!(outbound["x-ctx-owner"].as_bytes(), b"j\xfcrgen");
    }

    #[test]
    fn test_metadata_round_trip_keeps_opaque_bytes() {
        let propagator = ContextPropagator::default();
        let mut original = HeaderMap::new();
        original.insert("x-route-key", HeaderValue::from_bytes(b"sandbox-\xe9").unwrap());

        let ctx = propagator.extract_from_http(&original);
        let mut metadata = MetadataMap::new();
        propagator.inject_into_metadata(&ctx, &mut metadata);

        let back = propagator.extract_from_metadata(&metadata);
        assert_eq!(back.route_key.unwrap().as_bytes(), b"sandbox-\xe9");
    }

    #[test]
    fn test_inject_overwrites_only_context_keys() {
        let propagator = ContextPropagator::default();
        let ctx = PropagatedContext {
            trace_id: Some(HeaderValue::from_static("new-trace")),
            ..Default::default()
        };

        let mut headers = HeaderMap::new();
        headers.insert("x-trace-id", HeaderValue::from_static("old-trace"));
        headers.insert("x-route-key", HeaderValue::from_static("keep-me"));
        headers.insert("authorization", HeaderValue::from_static("Bearer t"));
        propagator.inject_into_http(&ctx, &mut headers);

        assert_eq!(headers["x-trace-id"], "new-trace");
        assert_eq!(headers["x-route-key"], "keep-me");
        assert_eq!(headers["authorization"], "Bearer t");
    }

    #[test]
    fn test_cross_protocol_preserves_values() {
        let propagator = ContextPropagator::default();
        let original = inbound_headers();
        let ctx = propagator.extract_from_http(&original);

        let mut metadata = MetadataMap::new();
        propagator.inject_into_metadata(&ctx, &mut metadata);

        assert_eq!(metadata.get("x-routing-key").unwrap().to_str().unwrap(), "sandbox-42");
        assert_eq!(
            metadata.get("x-trace-id").unwrap().to_str().unwrap(),
            "4bf92f3577b34da6a3ce929d0e0e4736"
        );
        assert_eq!(metadata.get("x-ctx-tenant").unwrap().to_str().unwrap(), "Acme Corp");

        let back = propagator.extract_from_metadata(&metadata);
        assert_eq!(back, ctx);

        let mut headers = HeaderMap::new();
        propagator.inject_into_http(&back, &mut headers);
        for name in ["x-route-key", "x-trace-id", "x-span-id", "x-ctx-tenant"] {
            assert_eq!(headers.get(name), original.get(name), "{}", name);
        }
    }

    #[test]
    fn test_custom_route_key_header() {
        let propagator = ContextPropagator::new(HeaderName::from_static("x-sandbox"));
        let mut headers = HeaderMap::new();
        headers.insert("x-sandbox", HeaderValue::from_static("blue"));
        headers.insert("x-route-key", HeaderValue::from_static("ignored"));

        let ctx = propagator.extract_from_http(&headers);
        assert_eq!(ctx.route_key.clone().unwrap(), "blue");
        assert!(propagator.has_custom_route_key_header());
        assert!(!ContextPropagator::default().has_custom_route_key_header());

        let mut outbound = HeaderMap::new();
        propagator.inject_into_http(&ctx, &mut outbound);
        assert_eq!(outbound["x-sandbox"], "blue");
        assert!(outbound.get("x-route-key").is_none());
    }
}
