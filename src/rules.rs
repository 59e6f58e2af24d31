//! Routing rules keyed by sandbox route key.
//!
//! Rules arrive from the control plane as plain data ([`RoutingRule`]) and are
//! compiled once into [`CompiledRule`]s grouped by route key inside a
//! [`RuleSet`]. A rule set is never mutated after it is built; updates replace
//! the whole set.

use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::warn;

/// A declarative routing rule scoped to one route key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    /// Tenant/sandbox identifier. Many rules may share a key.
    pub route_key: String,
    /// Destination address (`host:port`, URL, or logical service name).
    pub target_service: String,
    /// Request matches if its path starts with any prefix. Empty matches all.
    #[serde(default)]
    pub path_prefixes: Vec<String>,
    /// Header name to exact expected value. All must match.
    #[serde(default)]
    pub header_matchers: BTreeMap<String, String>,
    /// Headers injected into the forwarded request.
    #[serde(default)]
    pub additional_headers: BTreeMap<String, String>,
}

impl RoutingRule {
    /// Creates a catch-all rule for the given key and target.
    pub fn new(route_key: impl Into<String>, target_service: impl Into<String>) -> Self {
        Self {
            route_key: route_key.into(),
            target_service: target_service.into(),
            path_prefixes: Vec::new(),
            header_matchers: BTreeMap::new(),
            additional_headers: BTreeMap::new(),
        }
    }

    /// Adds a path prefix condition.
    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefixes.push(prefix.into());
        self
    }

    /// Adds an exact header match condition.
    pub fn with_header_matcher(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.header_matchers.insert(name.into(), value.into());
        self
    }

    /// Adds a header to inject into forwarded requests.
    pub fn with_additional_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.additional_headers.insert(name.into(), value.into());
        self
    }

    /// Returns true if the rule has no match conditions.
    pub fn is_catch_all(&self) -> bool {
        self.path_prefixes.is_empty() && self.header_matchers.is_empty()
    }
}

/// Protocol-agnostic view of an inbound request used for matching.
#[derive(Debug, Clone, Copy)]
pub struct RequestAttributes<'a> {
    /// Route key extracted by the protocol adapter, if any.
    pub route_key: Option<&'a str>,
    /// Request path.
    pub path: &'a str,
    /// Request headers or RPC metadata.
    pub headers: &'a HeaderMap,
}

impl<'a> RequestAttributes<'a> {
    pub fn new(route_key: Option<&'a str>, path: &'a str, headers: &'a HeaderMap) -> Self {
        Self {
            route_key,
            path,
            headers,
        }
    }
}

/// Condition on a header value.
#[derive(Debug, Clone)]
enum HeaderCondition {
    Exact { name: HeaderName, value: String },
    /// Name was not a valid header name; can never match.
    Unmatchable,
}

impl HeaderCondition {
    fn matches(&self, headers: &HeaderMap) -> bool {
        match self {
            HeaderCondition::Exact { name, value } => headers
                .get(name)
                .is_some_and(|v| v.as_bytes() == value.as_bytes()),
            HeaderCondition::Unmatchable => false,
        }
    }
}

/// A rule prepared for matching on the request path.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    source: RoutingRule,
    conditions: Vec<HeaderCondition>,
    additional_headers: HeaderMap,
}

impl CompiledRule {
    /// Compiles a rule. Entries that are not valid HTTP header names or values
    /// are kept as non-matching conditions or dropped from injection.
    pub fn compile(source: RoutingRule) -> Self {
        let conditions = source
            .header_matchers
            .iter()
            .map(|(name, value)| match HeaderName::from_bytes(name.as_bytes()) {
                Ok(name) => HeaderCondition::Exact {
                    name,
                    value: value.clone(),
                },
                Err(_) => {
                    warn!(
                        route_key = %source.route_key,
                        header = %name,
                        "invalid header matcher name, rule can never match"
                    );
                    HeaderCondition::Unmatchable
                }
            })
            .collect();

        let mut additional_headers = HeaderMap::with_capacity(source.additional_headers.len());
        for (name, value) in &source.additional_headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    additional_headers.insert(name, value);
                }
                _ => warn!(
                    route_key = %source.route_key,
                    header = %name,
                    "skipping invalid additional header"
                ),
            }
        }

        Self {
            source,
            conditions,
            additional_headers,
        }
    }

    /// Checks path prefixes and header matchers against the request.
    pub fn matches(&self, path: &str, headers: &HeaderMap) -> bool {
        let path_ok = self.source.path_prefixes.is_empty()
            || self
                .source
                .path_prefixes
                .iter()
                .any(|prefix| path.starts_with(prefix.as_str()));

        path_ok && self.conditions.iter().all(|c| c.matches(headers))
    }

    /// The rule as submitted.
    pub fn rule(&self) -> &RoutingRule {
        &self.source
    }

    /// Resolved destination.
    pub fn target(&self) -> &str {
        &self.source.target_service
    }

    /// Headers to merge into the forwarded request.
    pub fn additional_headers(&self) -> &HeaderMap {
        &self.additional_headers
    }
}

/// Immutable set of compiled rules grouped by route key.
///
/// Insertion order within a key is match priority.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<RoutingRule>,
    by_key: HashMap<String, Vec<Arc<CompiledRule>>>,
}

impl RuleSet {
    /// Builds a rule set, preserving submission order per key.
    pub fn new(rules: Vec<RoutingRule>) -> Self {
        let mut by_key: HashMap<String, Vec<Arc<CompiledRule>>> = HashMap::new();
        for rule in &rules {
            by_key
                .entry(rule.route_key.clone())
                .or_default()
                .push(Arc::new(CompiledRule::compile(rule.clone())));
        }
        Self { rules, by_key }
    }

    /// First rule under the key matching the request, in declaration order.
    pub fn find(&self, route_key: &str, path: &str, headers: &HeaderMap) -> Option<&Arc<CompiledRule>> {
        self.by_key
            .get(route_key)?
            .iter()
            .find(|rule| rule.matches(path, headers))
    }

    /// The rules as submitted, in order.
    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns true if there are no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Number of distinct route keys.
    pub fn route_key_count(&self) -> usize {
        self.by_key.len()
    }
}
