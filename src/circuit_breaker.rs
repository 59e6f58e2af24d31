//! Per-target circuit breaking.
//!
//! Each upstream target gets a breaker with three states:
//! - **Closed**: Normal operation, requests flow through
//! - **Open**: Too many consecutive failures, reject immediately until the cooldown ends
//! - **HalfOpen**: Cooldown elapsed, let requests probe whether the target recovered

use crate::router::RoutingTable;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Circuit is half-open, testing if the target recovered
    HalfOpen,
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u64,
    /// How long the circuit stays open before probing
    pub cooldown: Duration,
    /// Successful probes in HalfOpen before closing
    pub success_threshold: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            success_threshold: 1,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: State,
    consecutive_failures: u64,
    half_open_successes: u64,
    opened_at: Option<Instant>,
}

/// Circuit breaker for one upstream target.
///
/// All transitions happen under a short synchronous lock; nothing is held
/// across an await point.
///
/// # Example
///
/// ```
/// use rust_sandbox_proxy::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, State};
///
/// let cb = CircuitBreaker::new(CircuitBreakerConfig::default());
/// if cb.allow_request() {
///     cb.record_success();
/// }
/// assert_eq!(cb.state(), State::Closed);
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    config: CircuitBreakerConfig,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
    total_rejected: AtomicU64,
}

impl CircuitBreaker {
    /// Creates a new circuit breaker with the given configuration.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
            }),
            config,
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
        }
    }

    /// Checks if a request should be allowed through.
    ///
    /// Returns `false` while the circuit is open and the cooldown has not
    /// elapsed.
    pub fn allow_request(&self) -> bool {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();

        let allowed = match inner.state {
            State::Closed | State::HalfOpen => true,
            State::Open => {
                let cooled = inner
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.config.cooldown);
                if cooled {
                    inner.state = State::HalfOpen;
                    inner.half_open_successes = 0;
                }
                cooled
            }
        };

        if !allowed {
            self.total_rejected.fetch_add(1, Ordering::Relaxed);
        }
        allowed
    }

    /// Records a successful request.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            State::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    inner.state = State::Closed;
                    inner.consecutive_failures = 0;
                    inner.half_open_successes = 0;
                    inner.opened_at = None;
                }
            }
            State::Closed => inner.consecutive_failures = 0,
            State::Open => {}
        }
    }

    /// Records a failed request. Returns true if this failure opened the circuit.
    pub fn record_failure(&self) -> bool {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();

        match inner.state {
            State::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = State::Open;
                    inner.opened_at = Some(Instant::now());
                    return true;
                }
                false
            }
            State::HalfOpen => {
                // A failed probe reopens immediately
                inner.state = State::Open;
                inner.opened_at = Some(Instant::now());
                inner.consecutive_failures = 0;
                inner.half_open_successes = 0;
                true
            }
            State::Open => false,
        }
    }

    /// Returns the current state of the circuit breaker.
    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    /// Returns statistics about the circuit breaker.
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
            current_failure_count: inner.consecutive_failures,
        }
    }

    /// Resets the circuit breaker to the closed state.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = State::Closed;
        inner.consecutive_failures = 0;
        inner.half_open_successes = 0;
        inner.opened_at = None;
    }
}

/// Statistics for the circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub total_requests: u64,
    pub total_failures: u64,
    pub total_rejected: u64,
    pub current_failure_count: u64,
}

/// Breakers keyed by upstream target, created on first use.
#[derive(Debug)]
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: CircuitBreakerConfig,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    /// Returns the breaker for `target`, creating it if needed.
    pub fn get(&self, target: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(target) {
            return breaker.value().clone();
        }
        self.breakers
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.clone())))
            .value()
            .clone()
    }

    /// Checks the breaker for `target`.
    pub fn allow(&self, target: &str) -> bool {
        let allowed = self.get(target).allow_request();
        if !allowed {
            warn!(target = %target, "circuit open, short-circuiting request");
        }
        allowed
    }

    /// Records a successful exchange with `target`.
    pub fn record_success(&self, target: &str) {
        self.get(target).record_success();
    }

    /// Records a failed exchange with `target`.
    pub fn record_failure(&self, target: &str) {
        if self.get(target).record_failure() {
            info!(
                target = %target,
                cooldown_ms = self.config.cooldown.as_millis() as u64,
                "circuit opened"
            );
        }
    }

    /// Drops breakers for targets the table no longer routes to. Returns the
    /// number removed.
    pub fn retain_routed(&self, table: &RoutingTable) -> usize {
        let before = self.breakers.len();
        self.breakers.retain(|target, _| {
            let routed = table.routes_to(target);
            if !routed {
                debug!(target = %target, "dropping breaker for unrouted target");
            }
            routed
        });
        before.saturating_sub(self.breakers.len())
    }

    /// Prunes unrouted breakers every `period` until shutdown.
    pub async fn prune_unrouted(
        self: Arc<Self>,
        table: Arc<RoutingTable>,
        period: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.retain_routed(&table);
                    if removed > 0 {
                        info!(removed, remaining = self.len(), "pruned circuit breakers");
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    }

    /// Number of tracked targets.
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Returns true if no target has been seen.
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
