//! Route-key routing table with atomic, lock-free-read updates.
//!
//! The table publishes an immutable [`RuleSet`] snapshot through an
//! `ArcSwap`. Lookups load the current snapshot without taking a lock;
//! [`RoutingTable::replace`] builds a new snapshot and swaps it in whole, so a
//! lookup observes either the old table or the new one, never a mix.

use crate::metrics::Metrics;
use crate::rules::{CompiledRule, RequestAttributes, RoutingRule, RuleSet};
use arc_swap::ArcSwap;
use http::HeaderMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

static EMPTY_HEADERS: Lazy<HeaderMap> = Lazy::new(HeaderMap::new);

/// A published, immutable version of the rule set.
#[derive(Debug)]
pub struct TableSnapshot {
    version: u64,
    rules: RuleSet,
}

impl TableSnapshot {
    /// Monotonic version; 0 is the empty startup table.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Rules in this version.
    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }
}

/// Outcome of resolving a request.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// A rule under the request's route key matched.
    Matched {
        rule: Arc<CompiledRule>,
        version: u64,
    },
    /// No route key or no matching rule; traffic goes to the default target.
    Default { target: Arc<str>, version: u64 },
}

impl Resolution {
    /// Destination for the forwarded request.
    pub fn target(&self) -> &str {
        match self {
            Resolution::Matched { rule, .. } => rule.target(),
            Resolution::Default { target, .. } => target,
        }
    }

    /// Headers to merge into the forwarded request.
    pub fn additional_headers(&self) -> &HeaderMap {
        match self {
            Resolution::Matched { rule, .. } => rule.additional_headers(),
            Resolution::Default { .. } => &EMPTY_HEADERS,
        }
    }

    /// Table version the lookup was served from.
    pub fn version(&self) -> u64 {
        match self {
            Resolution::Matched { version, .. } | Resolution::Default { version, .. } => *version,
        }
    }

    /// Returns true if the request fell back to the default target.
    pub fn is_miss(&self) -> bool {
        matches!(self, Resolution::Default { .. })
    }
}

/// Routing table shared between request handlers and the rule sync loop.
///
/// # Example
///
/// ```
/// use rust_sandbox_proxy::router::RoutingTable;
/// use rust_sandbox_proxy::rules::{RequestAttributes, RoutingRule};
/// use http::HeaderMap;
///
/// let table = RoutingTable::new("http://default:8080");
/// table.replace(vec![RoutingRule::new("test-key", "svc-a").with_path_prefix("/api")]);
///
/// let headers = HeaderMap::new();
/// let hit = table.resolve(&RequestAttributes::new(Some("test-key"), "/api/widgets", &headers));
/// assert_eq!(hit.target(), "svc-a");
///
/// let miss = table.resolve(&RequestAttributes::new(Some("test-key"), "/other", &headers));
/// assert_eq!(miss.target(), "http://default:8080");
/// ```
#[derive(Debug)]
pub struct RoutingTable {
    current: ArcSwap<TableSnapshot>,
    default_target: Arc<str>,
    /// Serializes writers so versions are totally ordered. Readers never take it.
    write_lock: Mutex<()>,
}

impl RoutingTable {
    /// Creates an empty table that sends everything to `default_target`.
    pub fn new(default_target: impl Into<String>) -> Self {
        Self {
            current: ArcSwap::from_pointee(TableSnapshot {
                version: 0,
                rules: RuleSet::default(),
            }),
            default_target: Arc::from(default_target.into()),
            write_lock: Mutex::new(()),
        }
    }

    /// Resolves a request to a target and headers to inject.
    ///
    /// Never fails: a missing or empty route key, or no matching rule, yields
    /// the default target.
    pub fn resolve(&self, attrs: &RequestAttributes<'_>) -> Resolution {
        let snapshot = self.current.load_full();
        let version = snapshot.version;

        let matched = attrs
            .route_key
            .filter(|key| !key.is_empty())
            .and_then(|key| snapshot.rules.find(key, attrs.path, attrs.headers));

        match matched {
            Some(rule) => {
                debug!(
                    route_key = ?attrs.route_key,
                    target = %rule.target(),
                    version,
                    "matched routing rule"
                );
                Resolution::Matched {
                    rule: Arc::clone(rule),
                    version,
                }
            }
            None => {
                debug!(route_key = ?attrs.route_key, path = %attrs.path, "routing miss, using default target");
                Resolution::Default {
                    target: Arc::clone(&self.default_target),
                    version,
                }
            }
        }
    }

    /// Atomically replaces the entire rule set and returns the new version.
    ///
    /// Rules are accepted as submitted; declaration order is match priority.
    pub fn replace(&self, rules: Vec<RoutingRule>) -> u64 {
        let rules = RuleSet::new(rules);
        let _guard = self.write_lock.lock();
        let version = self.current.load().version + 1;
        let rule_count = rules.len();
        let key_count = rules.route_key_count();

        self.current.store(Arc::new(TableSnapshot { version, rules }));
        Metrics::record_table_published(version, rule_count);

        info!(
            version,
            rules = rule_count,
            route_keys = key_count,
            "routing table replaced"
        );
        version
    }

    /// Current published snapshot.
    pub fn snapshot(&self) -> Arc<TableSnapshot> {
        self.current.load_full()
    }

    /// Current version.
    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Configured fallback target.
    pub fn default_target(&self) -> &str {
        &self.default_target
    }

    /// Returns true if the default target or any published rule sends
    /// traffic to `target`.
    pub fn routes_to(&self, target: &str) -> bool {
        &*self.default_target == target
            || self
                .current
                .load()
                .rules
                .rules()
                .iter()
                .any(|rule| rule.target_service == target)
    }

    /// Returns true if the published rules equal `rules` in order and content.
    pub fn has_rules(&self, rules: &[RoutingRule]) -> bool {
        self.current.load().rules.rules() == rules
    }

    /// Serializable view of the current table for the admin endpoint.
    pub fn describe(&self) -> TableDescription {
        let snapshot = self.snapshot();
        TableDescription {
            version: snapshot.version,
            default_target: self.default_target.to_string(),
            rules: snapshot.rules.rules().to_vec(),
        }
    }
}

/// JSON view of a routing table version.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDescription {
    pub version: u64,
    pub default_target: String,
    pub rules: Vec<RoutingRule>,
}
