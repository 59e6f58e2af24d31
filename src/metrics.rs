//! Prometheus metrics collection and export.

use crate::error::ErrorClass;
use once_cell::sync::Lazy;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::io;
use std::sync::{Arc, Mutex};

/// Labels for per-request counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    /// Listener protocol ("http" or "rpc")
    pub protocol: String,
    /// First path segment (e.g. "/api")
    pub path: String,
    /// Response status code
    pub status: String,
}

/// Labels for the latency histogram.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DurationLabels {
    pub protocol: String,
    pub path: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ClassLabels {
    pub class: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SyncLabels {
    pub result: String,
}

/// Global metrics registry.
///
/// Initialized once at startup and shared across all tasks.
static METRICS: Lazy<Arc<Mutex<Metrics>>> = Lazy::new(|| Arc::new(Mutex::new(Metrics::new())));

/// Result of one rule sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncResult {
    /// New rules were published.
    Updated,
    /// Source returned the rules already published.
    Unchanged,
    /// Source failed or timed out.
    Failed,
}

impl SyncResult {
    fn as_str(&self) -> &'static str {
        match self {
            SyncResult::Updated => "updated",
            SyncResult::Unchanged => "unchanged",
            SyncResult::Failed => "error",
        }
    }
}

/// Metrics collector for the proxy.
///
/// Tracks request counts and latencies by path, routing outcomes, error
/// classes and rule sync activity.
pub struct Metrics {
    registry: Registry,
    requests_total: Family<RequestLabels, Counter>,
    request_duration_seconds: Family<DurationLabels, Histogram>,
    routing_resolutions_total: Family<OutcomeLabels, Counter>,
    routing_errors_total: Family<ClassLabels, Counter>,
    rule_syncs_total: Family<SyncLabels, Counter>,
    routing_table_version: Gauge,
    routing_table_rules: Gauge,
    connections_rejected_total: Counter,
}

impl Metrics {
    /// Creates a new metrics collector with default buckets.
    fn new() -> Self {
        let mut registry = Registry::default();

        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "proxy_requests",
            "Total number of proxied requests",
            requests_total.clone(),
        );

        let request_duration_seconds =
            Family::<DurationLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 14))
            });
        registry.register(
            "proxy_request_duration_seconds",
            "Proxied request latency in seconds",
            request_duration_seconds.clone(),
        );

        let routing_resolutions_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "proxy_routing_resolutions",
            "Routing table lookups by outcome (matched or miss)",
            routing_resolutions_total.clone(),
        );

        let routing_errors_total = Family::<ClassLabels, Counter>::default();
        registry.register(
            "proxy_routing_errors",
            "Routing and forwarding errors by class",
            routing_errors_total.clone(),
        );

        let rule_syncs_total = Family::<SyncLabels, Counter>::default();
        registry.register(
            "proxy_rule_syncs",
            "Rule sync attempts by result",
            rule_syncs_total.clone(),
        );

        let routing_table_version = Gauge::default();
        registry.register(
            "proxy_routing_table_version",
            "Version of the published routing table",
            routing_table_version.clone(),
        );

        let routing_table_rules = Gauge::default();
        registry.register(
            "proxy_routing_table_rules",
            "Number of rules in the published routing table",
            routing_table_rules.clone(),
        );

        let connections_rejected_total = Counter::default();
        registry.register(
            "proxy_connections_rejected",
            "Inbound connections closed because the connection limit was reached",
            connections_rejected_total.clone(),
        );

        Self {
            registry,
            requests_total,
            request_duration_seconds,
            routing_resolutions_total,
            routing_errors_total,
            rule_syncs_total,
            routing_table_version,
            routing_table_rules,
            connections_rejected_total,
        }
    }

    /// Records a finished request.
    ///
    /// # Arguments
    ///
    /// * `protocol` - Listener protocol label
    /// * `path` - Request path; collapsed to its first segment
    /// * `status` - Status code returned to the caller
    /// * `duration_secs` - Request duration in seconds
    pub fn record_request(protocol: &str, path: &str, status: u16, duration_secs: f64) {
        let path = path_label(path);
        let labels = RequestLabels {
            protocol: protocol.to_string(),
            path: path.clone(),
            status: status.to_string(),
        };
        let duration_labels = DurationLabels {
            protocol: protocol.to_string(),
            path,
        };

        if let Ok(metrics) = METRICS.lock() {
            metrics.requests_total.get_or_create(&labels).inc();
            metrics
                .request_duration_seconds
                .get_or_create(&duration_labels)
                .observe(duration_secs);
        }
    }

    /// Records a routing table lookup.
    pub fn record_resolution(miss: bool) {
        let labels = OutcomeLabels {
            outcome: if miss { "miss" } else { "matched" }.to_string(),
        };
        if let Ok(metrics) = METRICS.lock() {
            metrics.routing_resolutions_total.get_or_create(&labels).inc();
        }
    }

    /// Records an error by class.
    pub fn record_error(class: ErrorClass) {
        let labels = ClassLabels {
            class: class.as_str().to_string(),
        };
        if let Ok(metrics) = METRICS.lock() {
            metrics.routing_errors_total.get_or_create(&labels).inc();
        }
    }

    /// Records one rule sync attempt.
    pub fn record_sync(result: SyncResult) {
        let labels = SyncLabels {
            result: result.as_str().to_string(),
        };
        if let Ok(metrics) = METRICS.lock() {
            metrics.rule_syncs_total.get_or_create(&labels).inc();
        }
        if result == SyncResult::Failed {
            Self::record_error(ErrorClass::SyncSourceError);
        }
    }

    /// Records a newly published routing table.
    pub fn record_table_published(version: u64, rules: usize) {
        if let Ok(metrics) = METRICS.lock() {
            metrics
                .routing_table_version
                .set(i64::try_from(version).unwrap_or(i64::MAX));
            metrics
                .routing_table_rules
                .set(i64::try_from(rules).unwrap_or(i64::MAX));
        }
    }

    /// Records an inbound connection rejected by the connection limit.
    pub fn record_connection_rejected() {
        if let Ok(metrics) = METRICS.lock() {
            metrics.connections_rejected_total.inc();
        }
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the mutex is poisoned.
    pub fn encode() -> Result<String, io::Error> {
        let metrics = METRICS
            .lock()
            .map_err(|e| io::Error::other(format!("mutex poisoned: {}", e)))?;

        let mut buffer = String::new();
        encode(&mut buffer, &metrics.registry)
            .map_err(|e| io::Error::other(format!("encoding error: {}", e)))?;

        Ok(buffer)
    }
}

/// Collapses a request path to its first segment to bound label cardinality.
pub fn path_label(path: &str) -> String {
    let trimmed = path.trim_start_matches('/');
    match trimmed.split(['/', '?']).next() {
        Some(segment) if !segment.is_empty() => format!("/{}", segment),
        _ => "/".to_string(),
    }
}
