//! Client connection pooling.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::client::conn::Connection;

/// A shared set of connections kept alive between exchanges.
///
/// Idle connections are reused for new exchanges to the same route (or a
/// coalescable HTTP/2 origin); a background sweep evicts the
/// least-recently-used idle connections past the limits.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    state: Mutex<PoolState>,
    max_idle_connections: usize,
    keep_alive: Duration,
}

struct PoolState {
    connections: Vec<Arc<Connection>>,
    cleanup_running: bool,
}

impl ConnectionPool {
    /// A pool holding up to `max_idle_connections` idle connections, each
    /// for at most `keep_alive`.
    pub fn new(max_idle_connections: usize, keep_alive: Duration) -> ConnectionPool {
        ConnectionPool {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    connections: Vec::new(),
                    cleanup_running: false,
                }),
                max_idle_connections,
                keep_alive,
            }),
        }
    }

    /// The number of pooled connections with no active exchange.
    pub fn idle_connection_count(&self) -> usize {
        self.lock()
            .connections
            .iter()
            .filter(|c| c.is_idle())
            .count()
    }

    /// The number of pooled connections.
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Finds an eligible pooled connection for `host:port` and allocates
    /// an exchange slot on it.
    pub(crate) fn acquire(&self, host: &str, port: u16) -> Option<Arc<Connection>> {
        let state = self.lock();
        for conn in state.connections.iter() {
            if conn.is_eligible(host, port) && conn.is_healthy() {
                conn.allocate();
                trace!("reusing connection {} for {}:{}", conn.id(), host, port);
                return Some(conn.clone());
            }
        }
        None
    }

    /// Adds a freshly-established connection, with its first allocation
    /// already counted.
    pub(crate) fn put(&self, conn: Arc<Connection>) {
        let mut state = self.lock();
        state.connections.push(conn);
        if !state.cleanup_running {
            state.cleanup_running = true;
            let pool = self.clone();
            tokio::spawn(async move { pool.run_cleanup().await });
        }
    }

    /// Releases an exchange's allocation. Poisoned connections are removed
    /// and closed here rather than pooled.
    pub(crate) fn release(&self, conn: &Arc<Connection>) {
        conn.release_allocation();
        let close = conn.no_new_exchanges() && conn.is_idle();
        if close {
            let mut state = self.lock();
            state.connections.retain(|c| !Arc::ptr_eq(c, conn));
            drop(state);
            conn.close();
        }
    }

    /// Closes and removes every idle connection.
    pub fn evict_all(&self) {
        let evicted: Vec<Arc<Connection>> = {
            let mut state = self.lock();
            let (idle, busy): (Vec<_>, Vec<_>) = state
                .connections
                .drain(..)
                .partition(|c| c.is_idle());
            state.connections = busy;
            idle
        };
        for conn in evicted {
            conn.close();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.inner.state.lock().expect("pool lock")
    }

    async fn run_cleanup(self) {
        loop {
            let wait = self.cleanup(Instant::now());
            match wait {
                Some(wait) => tokio::time::sleep(wait).await,
                None => {
                    let mut state = self.lock();
                    if state.connections.is_empty() {
                        state.cleanup_running = false;
                        return;
                    }
                    // Raced with a put; go around again.
                }
            }
        }
    }

    /// Performs one maintenance pass: evicts the connection that has been
    /// idle longest if it exceeds a limit, and reports how long to wait
    /// until the next pass. `None` means the pool is empty.
    fn cleanup(&self, now: Instant) -> Option<Duration> {
        let to_close: Option<Arc<Connection>>;
        let wait: Option<Duration>;
        {
            let mut state = self.lock();
            if state.connections.is_empty() {
                return None;
            }

            let mut idle_count = 0;
            let mut longest_idle: Option<(usize, Duration)> = None;
            let mut any_unhealthy: Option<usize> = None;
            for (i, conn) in state.connections.iter().enumerate() {
                if !conn.is_healthy() && conn.is_idle() {
                    any_unhealthy = Some(i);
                }
                if !conn.is_idle() {
                    continue;
                }
                idle_count += 1;
                let idle_for = now.saturating_duration_since(conn.idle_at());
                if longest_idle.map(|(_, d)| idle_for > d).unwrap_or(true) {
                    longest_idle = Some((i, idle_for));
                }
            }

            let evict_index = if let Some(i) = any_unhealthy {
                Some(i)
            } else {
                match longest_idle {
                    Some((i, idle_for))
                        if idle_for >= self.inner.keep_alive
                            || idle_count > self.inner.max_idle_connections =>
                    {
                        Some(i)
                    }
                    Some((_, idle_for)) => {
                        wait = Some(self.inner.keep_alive - idle_for);
                        return wait;
                    }
                    None => {
                        // Only busy connections; check back in a while.
                        return Some(self.inner.keep_alive);
                    }
                }
            };

            to_close = evict_index.map(|i| state.connections.remove(i));
        }
        if let Some(conn) = to_close {
            debug!("evicting connection {}", conn.id());
            conn.close();
        }
        // Immediately look for the next eviction candidate.
        Some(Duration::ZERO)
    }
}

impl Default for ConnectionPool {
    fn default() -> ConnectionPool {
        ConnectionPool::new(5, Duration::from_secs(5 * 60))
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("connections", &self.connection_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::route::Route;

    fn idle_connection(port: u16) -> Arc<Connection> {
        Arc::new(Connection::test_connection(Route::test_route(
            "example.com",
            port,
        )))
    }

    #[tokio::test]
    async fn excess_idle_connections_evicted() {
        let pool = ConnectionPool::new(2, Duration::from_secs(300));
        for port in 1..=4u16 {
            pool.put(idle_connection(port));
        }
        // Run sweeps until the pool is within its idle bound.
        for _ in 0..8 {
            pool.cleanup(Instant::now());
        }
        assert!(pool.idle_connection_count() <= 2);
    }

    #[tokio::test]
    async fn keep_alive_expiry_evicts() {
        let pool = ConnectionPool::new(5, Duration::from_secs(300));
        pool.put(idle_connection(80));
        assert_eq!(pool.connection_count(), 1);

        // Not yet expired: the sweep reports the remaining wait.
        let wait = pool.cleanup(Instant::now()).unwrap();
        assert!(wait <= Duration::from_secs(300));
        assert!(wait > Duration::ZERO);
        assert_eq!(pool.connection_count(), 1);

        // Past the keep-alive horizon the connection goes away.
        pool.cleanup(Instant::now() + Duration::from_secs(301));
        assert_eq!(pool.connection_count(), 0);
    }

    #[tokio::test]
    async fn release_closes_poisoned_connections() {
        let pool = ConnectionPool::new(5, Duration::from_secs(300));
        let conn = idle_connection(80);
        conn.allocate();
        pool.put(conn.clone());

        conn.mark_no_new_exchanges();
        pool.release(&conn);
        assert_eq!(pool.connection_count(), 0);
        assert!(!conn.is_healthy());
    }

    #[tokio::test]
    async fn acquire_prefers_eligible_connection() {
        let pool = ConnectionPool::new(5, Duration::from_secs(300));
        let conn = idle_connection(80);
        pool.put(conn.clone());

        let reused = pool.acquire("example.com", 80).unwrap();
        assert!(Arc::ptr_eq(&reused, &conn));
        assert_eq!(reused.allocations(), 1);
        // An HTTP/1.1 connection fits one exchange at a time.
        assert!(pool.acquire("example.com", 80).is_none());
        assert!(pool.acquire("other.com", 80).is_none());
    }

    #[tokio::test]
    async fn evict_all_spares_active_connections() {
        let pool = ConnectionPool::new(5, Duration::from_secs(300));
        let active = idle_connection(80);
        active.allocate();
        let idle = idle_connection(81);
        pool.put(active.clone());
        pool.put(idle);

        pool.evict_all();
        assert_eq!(pool.connection_count(), 1);
        assert!(active.is_healthy());
    }
}
