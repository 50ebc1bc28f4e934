//! Connection and pool configuration.

use std::time::Duration;

use redmq_core::resp::DEFAULT_MAX_BULK_LEN;

/// Settings for the bounded connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on live connections, idle and in use together.
    pub max_size: usize,
    /// How long `acquire` waits for a free slot before giving up.
    pub acquire_timeout: Duration,
    /// Per-connection socket settings.
    pub connection: ConnectionConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 20,
            acquire_timeout: Duration::from_secs(2),
            connection: ConnectionConfig::default(),
        }
    }
}

/// Per-connection settings applied by connectors.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Maximum time to establish a TCP connection.
    pub connect_timeout: Duration,
    /// Maximum time to wait for a single reply. Blocking commands extend
    /// this by their own block duration. `None` waits forever.
    pub read_timeout: Option<Duration>,
    /// Sent as `AUTH` right after connecting.
    pub password: Option<String>,
    /// Sent as `SELECT` right after connecting, when non-zero.
    pub database: u32,
    /// Largest bulk string accepted from the server.
    pub max_bulk_len: usize,
    /// Disable Nagle's algorithm on TCP sockets.
    pub tcp_nodelay: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Some(Duration::from_secs(30)),
            password: None,
            database: 0,
            max_bulk_len: DEFAULT_MAX_BULK_LEN,
            tcp_nodelay: true,
        }
    }
}
