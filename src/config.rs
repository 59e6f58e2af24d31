//! Configuration for the proxy.

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::transport::PoolConfig;
use http::header::HeaderName;
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A listener address is not a socket address.
    #[error("invalid {which} address '{addr}': {reason}")]
    InvalidListenAddr {
        which: &'static str,
        addr: String,
        reason: String,
    },

    /// Two listeners share an address.
    #[error("listener addresses must be distinct: {addr}")]
    DuplicateAddrs { addr: String },

    /// Default target is empty or not an address.
    #[error("invalid default target '{target}': {reason}")]
    InvalidDefaultTarget { target: String, reason: String },

    /// Route key header is not a valid header name.
    #[error("invalid route key header '{name}'")]
    InvalidHeaderName { name: String },

    /// Rule source is neither a file path nor an http URL.
    #[error("invalid rule source '{source_spec}': {reason}")]
    InvalidRuleSource { source_spec: String, reason: String },

    /// Invalid timeout value.
    #[error("invalid timeout value: {reason}")]
    InvalidTimeout { reason: String },

    /// A limit that must be positive is zero.
    #[error("{name} must be greater than zero")]
    InvalidLimit { name: &'static str },
}

/// Where routing rules come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleSourceSpec {
    /// JSON or TOML file on disk.
    File(PathBuf),
    /// JSON feed served by the control plane.
    Http(String),
}

/// Proxy configuration loaded at startup.
///
/// Immutable after initialization and shared across tasks via `Arc`.
/// Configuration can be loaded from environment variables or defaults.
///
/// # Environment Variables
///
/// * `PROXY_LISTEN_ADDR` - HTTP listener address (default: "127.0.0.1:3000")
/// * `PROXY_RPC_LISTEN_ADDR` - RPC listener address (default: "127.0.0.1:3001")
/// * `PROXY_METRICS_ADDR` - Admin and metrics address (default: "127.0.0.1:9090")
/// * `PROXY_DEFAULT_TARGET` - Target for unmatched requests (default: "http://127.0.0.1:8080")
/// * `PROXY_ROUTE_KEY_HEADER` - HTTP header carrying the route key (default: "X-Route-Key")
/// * `PROXY_RULE_SOURCE` - Rule file path or `http://` feed URL (default: none)
/// * `PROXY_SYNC_INTERVAL_MS` - Rule poll interval (default: 30000)
/// * `PROXY_SYNC_TIMEOUT_MS` - Timeout per rule fetch (default: 5000)
/// * `PROXY_REQUEST_TIMEOUT_MS` - End-to-end request deadline (default: 30000)
/// * `PROXY_IDLE_TIMEOUT_MS` - Idle upstream connection timeout (default: 90000)
/// * `PROXY_CONNECT_TIMEOUT_MS` - Upstream connect timeout (default: 10000)
/// * `PROXY_MAX_IDLE_PER_TARGET` - Idle connections kept per target (default: 32)
/// * `PROXY_MAX_CONNECTIONS_PER_TARGET` - Concurrent requests per target (default: 100)
/// * `PROXY_BREAKER_THRESHOLD` - Consecutive failures that open a circuit (default: 5)
/// * `PROXY_BREAKER_COOLDOWN_MS` - Open circuit cooldown (default: 30000)
/// * `PROXY_MAX_CONNECTIONS` - Maximum concurrent inbound connections (default: 10000)
///
/// # Example
///
/// ```
/// use rust_sandbox_proxy::config::ProxyConfig;
///
/// let config = ProxyConfig::from_env();
/// assert!(!config.default_target.is_empty());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// HTTP listener address.
    pub listen_addr: String,

    /// RPC (h2c) listener address.
    pub rpc_listen_addr: String,

    /// Address to serve admin endpoints and metrics on.
    pub metrics_addr: String,

    /// Target used when no rule matches.
    pub default_target: String,

    /// HTTP header carrying the route key.
    pub route_key_header: String,

    /// Rule source; without one the table stays empty.
    #[serde(default)]
    pub rule_source: Option<String>,

    pub sync_interval: Duration,
    pub sync_timeout: Duration,

    /// End-to-end deadline for one proxied request.
    pub request_timeout: Duration,

    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_idle_per_target: usize,
    pub max_connections_per_target: usize,

    pub breaker_threshold: u64,
    pub breaker_cooldown: Duration,

    /// Maximum concurrent inbound connections per listener.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_max_connections() -> usize {
    10_000
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:3000".to_string(),
            rpc_listen_addr: "127.0.0.1:3001".to_string(),
            metrics_addr: "127.0.0.1:9090".to_string(),
            default_target: "http://127.0.0.1:8080".to_string(),
            route_key_header: "X-Route-Key".to_string(),
            rule_source: None,
            sync_interval: Duration::from_secs(30),
            sync_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(10),
            max_idle_per_target: 32,
            max_connections_per_target: 100,
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(30),
            max_connections: default_max_connections(),
        }
    }
}

impl ProxyConfig {
    /// Loads configuration from environment variables with fallback to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Loads configuration from an arbitrary variable lookup.
    ///
    /// Unparseable numeric values fall back to the default with a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let string = |name: &str, default: String| {
            lookup(name)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or(default)
        };
        let number = |name: &str, default: u64| parse_or(&lookup, name, default);
        let millis = |name: &str, default: Duration| {
            Duration::from_millis(parse_or(&lookup, name, default.as_millis() as u64))
        };

        Self {
            listen_addr: string("PROXY_LISTEN_ADDR", defaults.listen_addr),
            rpc_listen_addr: string("PROXY_RPC_LISTEN_ADDR", defaults.rpc_listen_addr),
            metrics_addr: string("PROXY_METRICS_ADDR", defaults.metrics_addr),
            default_target: string("PROXY_DEFAULT_TARGET", defaults.default_target),
            route_key_header: string("PROXY_ROUTE_KEY_HEADER", defaults.route_key_header),
            rule_source: lookup("PROXY_RULE_SOURCE")
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            sync_interval: millis("PROXY_SYNC_INTERVAL_MS", defaults.sync_interval),
            sync_timeout: millis("PROXY_SYNC_TIMEOUT_MS", defaults.sync_timeout),
            request_timeout: millis("PROXY_REQUEST_TIMEOUT_MS", defaults.request_timeout),
            idle_timeout: millis("PROXY_IDLE_TIMEOUT_MS", defaults.idle_timeout),
            connect_timeout: millis("PROXY_CONNECT_TIMEOUT_MS", defaults.connect_timeout),
            max_idle_per_target: number(
                "PROXY_MAX_IDLE_PER_TARGET",
                defaults.max_idle_per_target as u64,
            ) as usize,
            max_connections_per_target: number(
                "PROXY_MAX_CONNECTIONS_PER_TARGET",
                defaults.max_connections_per_target as u64,
            ) as usize,
            breaker_threshold: number("PROXY_BREAKER_THRESHOLD", defaults.breaker_threshold),
            breaker_cooldown: millis("PROXY_BREAKER_COOLDOWN_MS", defaults.breaker_cooldown),
            max_connections: number("PROXY_MAX_CONNECTIONS", defaults.max_connections as u64)
                as usize,
        }
    }

    /// Loads configuration from environment variables and validates it.
    pub fn from_env_validated() -> Result<Self, ConfigError> {
        let config = Self::from_env();
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - A listener address is not a valid socket address
    /// - Two listeners share an address
    /// - The default target is not a usable address
    /// - The route key header is not a valid header name
    /// - The rule source is neither a path nor an http URL
    /// - A timeout is zero, or the request timeout exceeds one hour
    /// - A connection limit or the breaker threshold is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        let addrs = [
            ("listen", &self.listen_addr),
            ("rpc listen", &self.rpc_listen_addr),
            ("metrics", &self.metrics_addr),
        ];
        for (which, addr) in addrs {
            addr.parse::<SocketAddr>()
                .map_err(|e| ConfigError::InvalidListenAddr {
                    which,
                    addr: addr.clone(),
                    reason: e.to_string(),
                })?;
        }
        for (i, (_, a)) in addrs.iter().enumerate() {
            if addrs[i + 1..].iter().any(|(_, b)| a == b) {
                return Err(ConfigError::DuplicateAddrs {
                    addr: a.to_string(),
                });
            }
        }

        validate_target(&self.default_target)?;

        self.route_key_header_name()?;
        self.rule_source_spec()?;

        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout {
                reason: "request timeout must be greater than zero".to_string(),
            });
        }
        if self.request_timeout > Duration::from_secs(3600) {
            return Err(ConfigError::InvalidTimeout {
                reason: "request timeout must not exceed 1 hour".to_string(),
            });
        }
        for (name, timeout) in [
            ("sync interval", self.sync_interval),
            ("sync timeout", self.sync_timeout),
            ("connect timeout", self.connect_timeout),
            ("idle timeout", self.idle_timeout),
        ] {
            if timeout.is_zero() {
                return Err(ConfigError::InvalidTimeout {
                    reason: format!("{} must be greater than zero", name),
                });
            }
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidLimit {
                name: "max_connections",
            });
        }
        if self.max_connections_per_target == 0 {
            return Err(ConfigError::InvalidLimit {
                name: "max_connections_per_target",
            });
        }
        if self.breaker_threshold == 0 {
            return Err(ConfigError::InvalidLimit {
                name: "breaker_threshold",
            });
        }

        Ok(())
    }

    /// Route key header as a header name (lower-cased).
    pub fn route_key_header_name(&self) -> Result<HeaderName, ConfigError> {
        HeaderName::from_bytes(self.route_key_header.as_bytes()).map_err(|_| {
            ConfigError::InvalidHeaderName {
                name: self.route_key_header.clone(),
            }
        })
    }

    /// Parsed rule source, if one is configured.
    pub fn rule_source_spec(&self) -> Result<Option<RuleSourceSpec>, ConfigError> {
        let Some(source) = &self.rule_source else {
            return Ok(None);
        };
        let invalid = |reason: &str| ConfigError::InvalidRuleSource {
            source_spec: source.clone(),
            reason: reason.to_string(),
        };

        if source.contains("://") {
            let url = url::Url::parse(source).map_err(|e| invalid(&e.to_string()))?;
            if url.scheme() != "http" {
                return Err(invalid("only http:// feeds are supported"));
            }
            Ok(Some(RuleSourceSpec::Http(source.clone())))
        } else {
            Ok(Some(RuleSourceSpec::File(PathBuf::from(source))))
        }
    }

    /// Client pool settings; `http2_only` selects prior-knowledge HTTP/2.
    pub fn pool_config(&self, http2_only: bool) -> PoolConfig {
        PoolConfig::new()
            .with_max_idle(self.max_idle_per_target)
            .with_max_concurrent(self.max_connections_per_target)
            .with_idle_timeout(self.idle_timeout)
            .with_connect_timeout(self.connect_timeout)
            .with_http2_only(http2_only)
    }

    /// Circuit breaker settings.
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker_threshold,
            cooldown: self.breaker_cooldown,
            ..Default::default()
        }
    }

    /// Returns the request timeout duration.
    pub fn timeout(&self) -> Duration {
        self.request_timeout
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Copy,
{
    match lookup(name) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(variable = name, value = %raw, "ignoring unparseable value, using default");
            default
        }),
        None => default,
    }
}

fn validate_target(target: &str) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidDefaultTarget {
        target: target.to_string(),
        reason,
    };

    if target.is_empty() {
        return Err(invalid("must not be empty".to_string()));
    }

    let url = if target.contains("://") {
        url::Url::parse(target)
    } else {
        url::Url::parse(&format!("http://{}", target))
    }
    .map_err(|e| invalid(e.to_string()))?;

    if url.scheme() != "http" {
        return Err(invalid("must use http".to_string()));
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    Ok(())
}
