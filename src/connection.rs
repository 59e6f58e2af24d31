//! Inbound connection limiting.
//!
//! Each listener owns a limiter; connections past the limit are closed as
//! soon as they are accepted.

use crate::metrics::Metrics;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct Counters {
    active: AtomicUsize,
    accepted: AtomicUsize,
    rejected: AtomicUsize,
}

/// Bounds concurrently served inbound connections.
#[derive(Debug, Clone)]
pub struct ConnectionLimiter {
    semaphore: Arc<Semaphore>,
    counters: Arc<Counters>,
    max_connections: usize,
}

impl ConnectionLimiter {
    /// Creates a limiter admitting at most `max_connections` at once.
    pub fn new(max_connections: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_connections)),
            counters: Arc::new(Counters::default()),
            max_connections,
        }
    }

    /// Admits a connection, or returns `None` if the limit is reached.
    ///
    /// The returned guard is owned and can move into the connection task.
    pub fn try_acquire(&self) -> Option<ConnectionGuard> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => {
                let active = self.counters.active.fetch_add(1, Ordering::Relaxed) + 1;
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                debug!(active, "connection acquired");
                Some(ConnectionGuard {
                    _permit: permit,
                    counters: Arc::clone(&self.counters),
                })
            }
            Err(_) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                Metrics::record_connection_rejected();
                warn!(max = self.max_connections, "connection limit reached, rejecting");
                None
            }
        }
    }

    /// Returns the number of active connections.
    pub fn active_connections(&self) -> usize {
        self.counters.active.load(Ordering::Relaxed)
    }

    /// Returns the maximum allowed connections.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Returns connection statistics.
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            active: self.counters.active.load(Ordering::Relaxed),
            total_accepted: self.counters.accepted.load(Ordering::Relaxed),
            total_rejected: self.counters.rejected.load(Ordering::Relaxed),
            max_connections: self.max_connections,
        }
    }
}

/// Releases a connection slot when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    _permit: OwnedSemaphorePermit,
    counters: Arc<Counters>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let active = self.counters.active.fetch_sub(1, Ordering::Relaxed) - 1;
        debug!(active, "connection released");
    }
}

/// Statistics about connection usage.
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub active: usize,
    pub total_accepted: usize,
    pub total_rejected: usize,
    pub max_connections: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_limiter_basic() {
        let limiter = ConnectionLimiter::new(2);

        let guard1 = limiter.try_acquire();
        let guard2 = limiter.try_acquire();
        assert!(guard1.is_some());
        assert!(guard2.is_some());
        assert_eq!(limiter.active_connections(), 2);

        // At limit
        assert!(limiter.try_acquire().is_none());
        assert_eq!(limiter.stats().total_rejected, 1);
    }

    #[test]
    fn test_guard_outlives_limiter_handle() {
        let limiter = ConnectionLimiter::new(1);
        let guard = limiter.clone().try_acquire();
        assert!(guard.is_some());
        assert_eq!(limiter.active_connections(), 1);

        drop(guard);
        assert_eq!(limiter.active_connections(), 0);
        assert!(limiter.try_acquire().is_some());
    }

    #[test]
    fn test_connection_stats() {
        let limiter = ConnectionLimiter::new(2);

        let _guard1 = limiter.try_acquire();
        let _guard2 = limiter.try_acquire();
        let _ = limiter.try_acquire();

        let stats = limiter.stats();
        assert_eq!(stats.active, 2);
        assert_eq!(stats.total_accepted, 2);
        assert_eq!(stats.total_rejected, 1);
        assert_eq!(stats.max_connections, 2);
    }
}
