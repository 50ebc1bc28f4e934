//! A single framed connection to a RESP server, and the connectors that
//! open them.
//!
//! A `Connection` owns one `Framed` stream. Commands are encoded straight
//! into the framed write buffer, so queueing costs no syscall; `flush`
//! writes everything queued so far as one batch and `read_frame` pulls one
//! reply at a time. The connection counts commands that have been queued
//! but not yet answered: a connection with outstanding replies, or one that
//! has seen a framing or I/O error, must never be handed to another caller.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use redmq_core::{Command, Frame, RespCodec};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

use super::config::ConnectionConfig;
use crate::error::MqError;
use crate::storage::{serve_connection, ListStore};
use crate::traits::Connector;

/// Byte stream a connection can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// One connection to the server.
pub struct Connection {
    id: u64,
    framed: Framed<Box<dyn AsyncStream>, RespCodec>,
    in_flight: usize,
    unflushed: usize,
    broken: bool,
    read_timeout: Option<Duration>,
    created_at: Instant,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("in_flight", &self.in_flight)
            .field("unflushed", &self.unflushed)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Wraps an established stream.
    #[must_use]
    pub fn new(id: u64, stream: impl AsyncStream + 'static, config: &ConnectionConfig) -> Self {
        let stream: Box<dyn AsyncStream> = Box::new(stream);
        Self {
            id,
            framed: Framed::new(
                stream,
                RespCodec::new().with_max_bulk_len(config.max_bulk_len),
            ),
            in_flight: 0,
            unflushed: 0,
            broken: false,
            read_timeout: config.read_timeout,
            created_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Commands queued or sent whose replies have not been read yet.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Commands queued since the last flush.
    #[must_use]
    pub fn unflushed(&self) -> usize {
        self.unflushed
    }

    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Flags the connection as unusable. The pool drops it on release.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Safe to hand to the next caller: healthy, with nothing outstanding.
    #[must_use]
    pub fn is_reusable(&self) -> bool {
        !self.broken && self.in_flight == 0 && self.unflushed == 0
    }

    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    #[must_use]
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    /// Encodes `cmd` into the write buffer. Nothing touches the socket.
    pub fn enqueue(&mut self, cmd: &Command) {
        cmd.encode(self.framed.write_buffer_mut());
        self.in_flight += 1;
        self.unflushed += 1;
    }

    /// Writes every queued command to the socket.
    ///
    /// A flush with nothing queued is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `MqError::Io` if the write fails; the connection is marked broken.
    pub async fn flush(&mut self) -> Result<(), MqError> {
        if self.unflushed == 0 && self.framed.write_buffer().is_empty() {
            return Ok(());
        }
        if let Err(err) = SinkExt::<Frame>::flush(&mut self.framed).await {
            return Err(self.failed(err.into()));
        }
        self.unflushed = 0;
        Ok(())
    }

    /// Reads the next reply frame.
    ///
    /// `extra` is added to the configured read timeout, for commands that
    /// block server-side.
    ///
    /// # Errors
    ///
    /// Returns `MqError::ProtocolDesync` if the stream ends or cannot be
    /// parsed, `MqError::Io` on socket errors, and `MqError::Timeout` if no
    /// reply arrives in time. All of these mark the connection broken.
    pub async fn read_frame(&mut self, extra: Duration) -> Result<Frame, MqError> {
        let next = match self.read_timeout {
            Some(limit) => {
                let limit = limit + extra;
                match tokio::time::timeout(limit, self.framed.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        return Err(self.failed(MqError::Timeout {
                            timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                        }));
                    }
                }
            }
            None => self.framed.next().await,
        };

        match next {
            Some(Ok(frame)) => {
                self.in_flight = self.in_flight.saturating_sub(1);
                Ok(frame)
            }
            Some(Err(err)) => Err(self.failed(err.into())),
            None => {
                let err = MqError::ProtocolDesync(format!(
                    "connection closed with {} replies outstanding",
                    self.in_flight
                ));
                Err(self.failed(err))
            }
        }
    }

    /// Marks the connection broken if `err` leaves it unusable.
    fn failed(&mut self, err: MqError) -> MqError {
        if err.breaks_connection() {
            debug!(connection_id = self.id, error = %err, "connection broken");
            self.broken = true;
        }
        err
    }

    /// Sends one command and reads its reply, bypassing pipelining.
    ///
    /// # Errors
    ///
    /// Propagates flush and read failures. An error reply is returned as
    /// `MqError::Server`.
    pub async fn call(&mut self, cmd: &Command) -> Result<Frame, MqError> {
        self.enqueue(cmd);
        self.flush().await?;
        match self.read_frame(Duration::ZERO).await? {
            Frame::Error(msg) => Err(MqError::Server(msg)),
            frame => Ok(frame),
        }
    }

    /// `AUTH` and `SELECT` as configured.
    pub(crate) async fn handshake(&mut self, config: &ConnectionConfig) -> Result<(), MqError> {
        if let Some(password) = &config.password {
            expect_ok(self.call(&Command::auth(password)).await?)?;
        }
        if config.database != 0 {
            expect_ok(self.call(&Command::select(config.database)).await?)?;
        }
        Ok(())
    }
}

fn expect_ok(frame: Frame) -> Result<(), MqError> {
    match frame {
        Frame::Simple(s) if s == "OK" => Ok(()),
        other => Err(MqError::UnexpectedReply {
            expected: "+OK",
            found: other.kind(),
        }),
    }
}

// ---------------------------------------------------------------------------
// TcpConnector
// ---------------------------------------------------------------------------

/// Opens TCP connections to a RESP server.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    config: ConnectionConfig,
}

impl TcpConnector {
    #[must_use]
    pub fn new(addr: impl Into<String>, config: ConnectionConfig) -> Self {
        Self {
            addr: addr.into(),
            config,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, id: u64) -> Result<Connection, MqError> {
        let timeout = self.config.connect_timeout;
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| MqError::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })??;
        stream.set_nodelay(self.config.tcp_nodelay)?;

        let mut conn = Connection::new(id, stream, &self.config);
        conn.handshake(&self.config).await?;
        debug!(connection_id = id, addr = %self.addr, "connected");
        Ok(conn)
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

// ---------------------------------------------------------------------------
// MemoryConnector
// ---------------------------------------------------------------------------

/// Connects to an in-process [`ListStore`] over a duplex pipe.
///
/// Each connection gets its own serving task, exactly as a TCP client would
/// on the standalone server.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    store: Arc<ListStore>,
    config: ConnectionConfig,
    buffer_size: usize,
}

impl MemoryConnector {
    #[must_use]
    pub fn new(store: Arc<ListStore>) -> Self {
        Self {
            store,
            config: ConnectionConfig::default(),
            buffer_size: 64 * 1024,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<ListStore> {
        &self.store
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, id: u64) -> Result<Connection, MqError> {
        let (client, server) = tokio::io::duplex(self.buffer_size);
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(err) = serve_connection(server, store).await {
                debug!(connection_id = id, error = %err, "in-memory connection closed");
            }
        });

        let mut conn = Connection::new(id, client, &self.config);
        conn.handshake(&self.config).await?;
        Ok(conn)
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            read_timeout: Some(Duration::from_millis(200)),
            ..ConnectionConfig::default()
        }
    }

    #[tokio::test]
    async fn enqueue_does_not_write_until_flush() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut conn = Connection::new(1, client, &config());

        conn.enqueue(&Command::ping());
        conn.enqueue(&Command::ping());
        assert_eq!(conn.in_flight(), 2);
        assert_eq!(conn.unflushed(), 2);

        let mut buf = [0u8; 64];
        let nothing = tokio::time::timeout(Duration::from_millis(20), server.read(&mut buf)).await;
        assert!(nothing.is_err(), "bytes reached the socket before flush");

        conn.flush().await.unwrap();
        assert_eq!(conn.unflushed(), 0);
        let mut expected = Vec::new();
        expected.extend_from_slice(&Command::ping().to_bytes());
        expected.extend_from_slice(&Command::ping().to_bytes());
        let mut got = vec![0u8; expected.len()];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn read_frame_tracks_in_flight() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut conn = Connection::new(1, client, &config());

        conn.enqueue(&Command::echo("hi"));
        conn.flush().await.unwrap();
        server.write_all(b"$2\r\nhi\r\n").await.unwrap();

        let frame = conn.read_frame(Duration::ZERO).await.unwrap();
        assert_eq!(frame, Frame::Bulk(Some(Bytes::from_static(b"hi"))));
        assert_eq!(conn.in_flight(), 0);
        assert!(conn.is_reusable());
    }

    #[tokio::test]
    async fn closed_stream_is_a_desync() {
        let (client, server) = tokio::io::duplex(1024);
        let mut conn = Connection::new(1, client, &config());
        conn.enqueue(&Command::ping());
        conn.flush().await.unwrap();
        drop(server);

        let err = conn.read_frame(Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, MqError::ProtocolDesync(_)));
        assert!(conn.is_broken());
        assert!(!conn.is_reusable());
    }

    #[tokio::test]
    async fn failed_write_breaks_the_connection() {
        let (client, server) = tokio::io::duplex(1024);
        let mut conn = Connection::new(1, client, &config());
        drop(server);
        conn.enqueue(&Command::ping());

        let err = conn.flush().await.unwrap_err();
        assert!(matches!(err, MqError::Io(_)));
        assert!(err.breaks_connection());
        assert!(conn.is_broken());
    }

    #[tokio::test]
    async fn silent_server_times_out_and_breaks() {
        let (client, _server) = tokio::io::duplex(1024);
        let mut conn = Connection::new(1, client, &config());
        conn.enqueue(&Command::ping());
        conn.flush().await.unwrap();

        let err = conn.read_frame(Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, MqError::Timeout { timeout_ms: 200 }));
        assert!(conn.is_broken());
    }

    #[tokio::test]
    async fn memory_connector_answers_ping() {
        let connector = MemoryConnector::new(Arc::new(ListStore::new()));
        let mut conn = connector.connect(7).await.unwrap();
        assert_eq!(conn.id(), 7);
        assert_eq!(
            conn.call(&Command::ping()).await.unwrap(),
            Frame::Simple("PONG".into())
        );
    }

    #[tokio::test]
    async fn handshake_rejects_wrong_password() {
        let store = Arc::new(ListStore::with_password("s3cret"));
        let bad = MemoryConnector::new(Arc::clone(&store)).with_config(ConnectionConfig {
            password: Some("nope".into()),
            ..ConnectionConfig::default()
        });
        assert!(matches!(bad.connect(1).await, Err(MqError::Server(_))));

        let good = MemoryConnector::new(store).with_config(ConnectionConfig {
            password: Some("s3cret".into()),
            ..ConnectionConfig::default()
        });
        assert!(good.connect(2).await.is_ok());
    }
}
