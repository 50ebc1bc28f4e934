//! Bounded pool of reusable connections.
//!
//! A `Semaphore` with `max_size` permits accounts for every live connection,
//! idle or checked out; the idle list itself sits behind a `parking_lot`
//! mutex that is never held across an await. Connections are opened lazily
//! through a [`Connector`] the first time a permit finds the idle list empty.
//!
//! Checked-out connections are wrapped in a [`PooledConnection`] guard.
//! Dropping the guard is the release: a connection that is broken, or still
//! owes replies for commands sent on it, is closed instead of being parked,
//! so the next caller never reads a stale reply.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use super::config::PoolConfig;
use super::connection::{Connection, MemoryConnector, TcpConnector};
use crate::error::MqError;
use crate::storage::ListStore;
use crate::traits::Connector;

/// Point-in-time view of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub max_size: usize,
    /// Open connections parked in the pool.
    pub idle: usize,
    /// Checked-out slots. Zero once the pool is closed.
    pub in_use: usize,
    /// Connections opened over the pool's lifetime.
    pub created: u64,
    /// Connections closed on release because they were broken or busy.
    pub discarded: u64,
}

/// Shared, bounded set of connections.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    slots: Arc<Semaphore>,
    idle: Mutex<Vec<Connection>>,
    next_id: AtomicU64,
    created: AtomicU64,
    discarded: AtomicU64,
    closed: AtomicBool,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("target", &self.connector.describe())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    #[must_use]
    pub fn new(connector: impl Connector, config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            connector: Arc::new(connector),
            slots: Arc::new(Semaphore::new(config.max_size)),
            config,
            idle: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            created: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Pool of TCP connections to `addr`.
    #[must_use]
    pub fn tcp(addr: impl Into<String>, config: PoolConfig) -> Arc<Self> {
        let connector = TcpConnector::new(addr, config.connection.clone());
        Self::new(connector, config)
    }

    /// Pool of in-process connections to `store`.
    #[must_use]
    pub fn memory(store: Arc<ListStore>, config: PoolConfig) -> Arc<Self> {
        let connector = MemoryConnector::new(store).with_config(config.connection.clone());
        Self::new(connector, config)
    }

    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Checks out a connection, waiting up to the configured acquire timeout.
    ///
    /// # Errors
    ///
    /// See [`ConnectionPool::acquire_timeout`].
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection, MqError> {
        self.acquire_timeout(self.config.acquire_timeout).await
    }

    /// Checks out a connection, waiting up to `timeout` for a free slot.
    ///
    /// # Errors
    ///
    /// Returns `MqError::PoolExhausted` if no slot frees up in time,
    /// `MqError::PoolClosed` after [`ConnectionPool::close`], and the
    /// connector's error if a new connection cannot be opened.
    pub async fn acquire_timeout(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Result<PooledConnection, MqError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MqError::PoolClosed);
        }

        let permit = match tokio::time::timeout(timeout, Arc::clone(&self.slots).acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(MqError::PoolClosed),
            Err(_) => {
                return Err(MqError::PoolExhausted {
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        };

        let idle = self.idle.lock().pop();
        let conn = match idle {
            Some(conn) => conn,
            None => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let conn = self.connector.connect(id).await.inspect_err(|err| {
                    warn!(target_addr = %self.connector.describe(), error = %err, "connect failed");
                })?;
                self.created.fetch_add(1, Ordering::Relaxed);
                conn
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Stops handing out connections and closes the idle ones. Checked-out
    /// connections are closed as they are released.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.slots.close();
        self.idle.lock().clear();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let idle = self.idle.lock().len();
        let in_use = if self.is_closed() {
            0
        } else {
            self.config
                .max_size
                .saturating_sub(self.slots.available_permits())
        };
        PoolStats {
            max_size: self.config.max_size,
            idle,
            in_use,
            created: self.created.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }

    fn put_back(&self, conn: Connection) {
        if self.is_closed() {
            return;
        }
        if !conn.is_reusable() {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("redmq_pool_discarded_total").increment(1);
            debug!(
                connection_id = conn.id(),
                broken = conn.is_broken(),
                in_flight = conn.in_flight(),
                "discarding connection"
            );
            return;
        }
        self.idle.lock().push(conn);
    }
}

// ---------------------------------------------------------------------------
// PooledConnection
// ---------------------------------------------------------------------------

/// A checked-out connection. Dropping it releases the connection.
pub struct PooledConnection {
    // Only `None` while `drop` runs.
    conn: Option<Connection>,
    pool: Arc<ConnectionPool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Returns the connection to the pool. Same as dropping the guard.
    pub fn release(self) {}

    /// Closes the connection instead of returning it.
    pub fn discard(mut self) {
        self.mark_broken();
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PooledConnection").field(&self.conn).finish()
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection is present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection is present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use redmq_core::Command;

    use super::*;

    fn pool(max_size: usize) -> Arc<ConnectionPool> {
        ConnectionPool::memory(
            Arc::new(ListStore::new()),
            PoolConfig {
                max_size,
                acquire_timeout: Duration::from_millis(50),
                ..PoolConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn connections_are_reused() {
        let pool = pool(2);
        let id = {
            let conn = pool.acquire().await.unwrap();
            conn.id()
        };
        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id(), id);
        assert_eq!(pool.stats().created, 1);
    }

    #[tokio::test]
    async fn exhausted_pool_times_out() {
        let pool = pool(1);
        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, MqError::PoolExhausted { timeout_ms: 50 }));
    }

    #[tokio::test]
    async fn release_wakes_a_waiter() {
        let pool = pool(1);
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.acquire_timeout(Duration::from_secs(2)).await.map(|c| c.id())
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let id = held.id();
        held.release();

        assert_eq!(waiter.await.unwrap().unwrap(), id);
    }

    #[tokio::test]
    async fn broken_connections_are_discarded() {
        let pool = pool(1);
        let first = pool.acquire().await.unwrap();
        let first_id = first.id();
        first.discard();

        let second = pool.acquire().await.unwrap();
        assert_ne!(second.id(), first_id);
        let stats = pool.stats();
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.created, 2);
    }

    #[tokio::test]
    async fn connections_with_unread_replies_are_discarded() {
        let pool = pool(1);
        {
            let mut conn = pool.acquire().await.unwrap();
            conn.enqueue(&Command::ping());
            conn.flush().await.unwrap();
        }
        assert_eq!(pool.stats().discarded, 1);
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test]
    async fn stats_track_occupancy() {
        let pool = pool(3);
        let a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().in_use, 2);
        drop(a);
        let stats = pool.stats();
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.max_size, 3);
    }

    #[tokio::test]
    async fn closed_pool_refuses_acquire() {
        let pool = pool(1);
        drop(pool.acquire().await.unwrap());
        pool.close();
        assert!(matches!(pool.acquire().await, Err(MqError::PoolClosed)));
        assert_eq!(pool.stats().idle, 0);
    }
}
