//! Command pipelining over a single connection.
//!
//! Commands are queued with the reply shape they are expected to produce,
//! written together by one `flush`, and answered in order by `drain`. The
//! n-th reply frame read always belongs to the n-th queued command; nothing
//! here reorders, skips, or peeks ahead.
//!
//! Failure handling splits in two. A reply that is well framed but wrong
//! (an `-ERR` reply, or a frame of the wrong shape) leaves the stream in
//! step: the remaining replies are still consumed and the connection stays
//! usable. A framing failure or a closed stream means the reply stream can
//! no longer be trusted, so the connection is marked broken and the pool
//! closes it on release.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use redmq_core::{Command, Frame};
use tracing::trace;

use super::connection::Connection;
use crate::error::MqError;

// ---------------------------------------------------------------------------
// ReplyShape / Reply
// ---------------------------------------------------------------------------

/// The reply a command is expected to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyShape {
    /// Any simple string.
    Status,
    /// Exactly `+OK`.
    Ok,
    Int,
    /// Bulk string, possibly null.
    Bulk,
    /// Array of bulk strings, possibly null.
    MultiBulk,
}

/// A decoded reply.
///
/// Error replies never become a `Reply`; the pipeline turns them into
/// `MqError::Server` in the slot of the command that caused them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Simple string, `+OK` included.
    Status(String),
    Int(i64),
    /// `None` for a null bulk, e.g. `RPOP` on an empty list.
    Bulk(Option<Bytes>),
    /// `None` for a null array, e.g. a `BRPOP` that timed out.
    MultiBulk(Option<Vec<Bytes>>),
}

impl ReplyShape {
    #[must_use]
    pub fn describe(self) -> &'static str {
        match self {
            ReplyShape::Status => "status",
            ReplyShape::Ok => "+OK",
            ReplyShape::Int => "integer",
            ReplyShape::Bulk => "bulk",
            ReplyShape::MultiBulk => "array of bulk strings",
        }
    }

    /// Decodes `frame` as this shape.
    ///
    /// # Errors
    ///
    /// Returns `MqError::Server` for error replies and
    /// `MqError::UnexpectedReply` when the frame has another shape.
    pub fn decode(self, frame: Frame) -> Result<Reply, MqError> {
        let mismatch = |found: &Frame| MqError::UnexpectedReply {
            expected: self.describe(),
            found: found.kind(),
        };

        match (self, frame) {
            (_, Frame::Error(msg)) => Err(MqError::Server(msg)),
            (ReplyShape::Status, Frame::Simple(s)) => Ok(Reply::Status(s)),
            (ReplyShape::Ok, Frame::Simple(s)) if s == "OK" => Ok(Reply::Status(s)),
            (ReplyShape::Int, Frame::Integer(n)) => Ok(Reply::Int(n)),
            (ReplyShape::Bulk, Frame::Bulk(data)) => Ok(Reply::Bulk(data)),
            (ReplyShape::MultiBulk, Frame::Array(None)) => Ok(Reply::MultiBulk(None)),
            (ReplyShape::MultiBulk, Frame::Array(Some(items))) => items
                .into_iter()
                .map(|item| match item {
                    Frame::Bulk(Some(data)) => Ok(data),
                    other => Err(mismatch(&other)),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(|items| Reply::MultiBulk(Some(items))),
            (_, other) => Err(mismatch(&other)),
        }
    }
}

impl Reply {
    fn kind(&self) -> &'static str {
        match self {
            Reply::Status(_) => "status",
            Reply::Int(_) => "integer",
            Reply::Bulk(_) => "bulk",
            Reply::MultiBulk(_) => "array",
        }
    }

    /// # Errors
    ///
    /// Returns `MqError::UnexpectedReply` if this is not an integer reply.
    pub fn into_int(self) -> Result<i64, MqError> {
        match self {
            Reply::Int(n) => Ok(n),
            other => Err(MqError::UnexpectedReply {
                expected: "integer",
                found: other.kind(),
            }),
        }
    }

    /// # Errors
    ///
    /// Returns `MqError::UnexpectedReply` if this is not a bulk reply.
    pub fn into_bulk(self) -> Result<Option<Bytes>, MqError> {
        match self {
            Reply::Bulk(data) => Ok(data),
            other => Err(MqError::UnexpectedReply {
                expected: "bulk",
                found: other.kind(),
            }),
        }
    }

    /// # Errors
    ///
    /// Returns `MqError::UnexpectedReply` if this is not an array reply.
    pub fn into_multi_bulk(self) -> Result<Option<Vec<Bytes>>, MqError> {
        match self {
            Reply::MultiBulk(items) => Ok(items),
            other => Err(MqError::UnexpectedReply {
                expected: "array",
                found: other.kind(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct PendingCommand {
    name: &'static str,
    shape: ReplyShape,
}

/// Queues commands on one connection and reads their replies in order.
///
/// Dropping a pipeline that still has pending commands marks the connection
/// broken, since their replies would otherwise be read by the next user.
#[derive(Debug)]
pub struct Pipeline<'c> {
    conn: &'c mut Connection,
    pending: VecDeque<PendingCommand>,
    block_for: Duration,
}

impl<'c> Pipeline<'c> {
    #[must_use]
    pub fn new(conn: &'c mut Connection) -> Self {
        Self {
            conn,
            pending: VecDeque::new(),
            block_for: Duration::ZERO,
        }
    }

    /// Queues `cmd`. Its bytes go into the write buffer; nothing is sent yet.
    pub fn enqueue(&mut self, cmd: &Command, shape: ReplyShape) -> &mut Self {
        self.conn.enqueue(cmd);
        self.pending.push_back(PendingCommand {
            name: cmd.name(),
            shape,
        });
        self
    }

    /// Queues a command that blocks server-side for up to `block`. Reads
    /// allow for that much extra time on top of the connection's read timeout.
    pub fn enqueue_blocking(&mut self, cmd: &Command, shape: ReplyShape, block: Duration) -> &mut Self {
        self.block_for = self.block_for.max(block);
        self.enqueue(cmd, shape)
    }

    /// Commands whose replies have not been drained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Sends every queued command in one write.
    ///
    /// # Errors
    ///
    /// Returns `MqError::Io` if the write fails.
    pub async fn flush(&mut self) -> Result<(), MqError> {
        if self.conn.is_broken() {
            return Err(MqError::ProtocolDesync("connection is broken".into()));
        }
        self.conn.flush().await
    }

    /// Reads one reply per pending command, in order.
    ///
    /// # Errors
    ///
    /// - `MqError::PipelineState` if commands were queued but not flushed.
    ///   Nothing is read.
    /// - `MqError::ProtocolDesync`, `MqError::Io`, or `MqError::Timeout` if
    ///   the stream fails. The connection is broken afterwards.
    /// - `MqError::Server` or `MqError::UnexpectedReply` for the first reply
    ///   that did not decode, after all replies have been read.
    pub async fn drain(&mut self) -> Result<Vec<Reply>, MqError> {
        if self.conn.unflushed() > 0 {
            return Err(MqError::PipelineState("drain called before flush"));
        }
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }
        if self.conn.is_broken() {
            return Err(MqError::ProtocolDesync("connection is broken".into()));
        }

        let extra = std::mem::take(&mut self.block_for);
        let mut replies = Vec::with_capacity(self.pending.len());
        let mut first_err = None;

        while let Some(pending) = self.pending.pop_front() {
            let frame = match self.conn.read_frame(extra).await {
                Ok(frame) => frame,
                Err(err) => {
                    self.pending.clear();
                    return Err(err);
                }
            };
            trace!(command = pending.name, reply = frame.kind(), "reply");
            match pending.shape.decode(frame) {
                Ok(reply) => replies.push(reply),
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(replies),
        }
    }

    /// `flush` then `drain`.
    ///
    /// # Errors
    ///
    /// See [`Pipeline::flush`] and [`Pipeline::drain`].
    pub async fn execute(&mut self) -> Result<Vec<Reply>, MqError> {
        self.flush().await?;
        self.drain().await
    }
}

impl Drop for Pipeline<'_> {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            self.conn.mark_broken();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::network::config::ConnectionConfig;
    use crate::network::connection::MemoryConnector;
    use crate::storage::ListStore;
    use crate::traits::Connector;

    fn scripted() -> (Connection, DuplexStream) {
        let (client, server) = tokio::io::duplex(4096);
        let config = ConnectionConfig {
            read_timeout: Some(Duration::from_millis(200)),
            ..ConnectionConfig::default()
        };
        (Connection::new(1, client, &config), server)
    }

    async fn memory() -> Connection {
        MemoryConnector::new(Arc::new(ListStore::new()))
            .connect(1)
            .await
            .unwrap()
    }

    #[test]
    fn decode_matches_shapes() {
        assert_eq!(
            ReplyShape::Int.decode(Frame::Integer(3)).unwrap(),
            Reply::Int(3)
        );
        assert_eq!(
            ReplyShape::Bulk.decode(Frame::Bulk(None)).unwrap(),
            Reply::Bulk(None)
        );
        assert_eq!(
            ReplyShape::Ok.decode(Frame::ok()).unwrap(),
            Reply::Status("OK".into())
        );
        assert_eq!(
            ReplyShape::MultiBulk
                .decode(Frame::Array(Some(vec![Frame::bulk("k"), Frame::bulk("v")])))
                .unwrap(),
            Reply::MultiBulk(Some(vec![Bytes::from_static(b"k"), Bytes::from_static(b"v")]))
        );
    }

    #[test]
    fn decode_rejects_other_shapes() {
        let err = ReplyShape::Int.decode(Frame::bulk("1")).unwrap_err();
        assert!(matches!(
            err,
            MqError::UnexpectedReply {
                expected: "integer",
                found: "bulk"
            }
        ));
        assert!(matches!(
            ReplyShape::Ok.decode(Frame::Simple("QUEUED".into())),
            Err(MqError::UnexpectedReply { .. })
        ));
        assert!(matches!(
            ReplyShape::Bulk.decode(Frame::Error("ERR nope".into())),
            Err(MqError::Server(msg)) if msg == "ERR nope"
        ));
    }

    #[tokio::test]
    async fn replies_come_back_in_order() {
        let mut conn = memory().await;
        let mut pipe = Pipeline::new(&mut conn);
        pipe.enqueue(&Command::lpush("q", "a"), ReplyShape::Int)
            .enqueue(&Command::lpush("q", "b"), ReplyShape::Int)
            .enqueue(&Command::rpop("q"), ReplyShape::Bulk)
            .enqueue(&Command::llen("q"), ReplyShape::Int)
            .enqueue(&Command::ping(), ReplyShape::Status);
        assert_eq!(pipe.len(), 5);

        let replies = pipe.execute().await.unwrap();
        assert_eq!(
            replies,
            vec![
                Reply::Int(1),
                Reply::Int(2),
                Reply::Bulk(Some(Bytes::from_static(b"a"))),
                Reply::Int(1),
                Reply::Status("PONG".into()),
            ]
        );
        assert!(pipe.is_empty());
        drop(pipe);
        assert!(conn.is_reusable());
    }

    #[tokio::test]
    async fn drain_before_flush_is_rejected() {
        let mut conn = memory().await;
        let mut pipe = Pipeline::new(&mut conn);
        pipe.enqueue(&Command::ping(), ReplyShape::Status);
        assert!(matches!(
            pipe.drain().await,
            Err(MqError::PipelineState(_))
        ));
        // Still recoverable: flush and drain as intended.
        pipe.flush().await.unwrap();
        assert_eq!(pipe.drain().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn second_flush_sends_nothing() {
        let (mut conn, mut server) = scripted();
        let mut pipe = Pipeline::new(&mut conn);
        pipe.enqueue(&Command::ping(), ReplyShape::Status);
        pipe.flush().await.unwrap();
        pipe.flush().await.unwrap();

        let expected = Command::ping().to_bytes();
        let mut got = vec![0u8; expected.len()];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected.to_vec());

        let mut extra = [0u8; 1];
        let more = tokio::time::timeout(Duration::from_millis(20), server.read(&mut extra)).await;
        assert!(more.is_err(), "second flush wrote bytes");

        server.write_all(b"+PONG\r\n").await.unwrap();
        pipe.drain().await.unwrap();
    }

    #[tokio::test]
    async fn server_error_keeps_the_stream_in_step() {
        let (mut conn, mut server) = scripted();
        let mut pipe = Pipeline::new(&mut conn);
        pipe.enqueue(&Command::ltrim("q", 0, 9), ReplyShape::Ok)
            .enqueue(&Command::llen("q"), ReplyShape::Int);
        pipe.flush().await.unwrap();
        server
            .write_all(b"-ERR wrong type\r\n:4\r\n")
            .await
            .unwrap();

        let err = pipe.drain().await.unwrap_err();
        assert!(matches!(err, MqError::Server(msg) if msg == "ERR wrong type"));
        drop(pipe);
        assert!(!conn.is_broken());
        assert_eq!(conn.in_flight(), 0);
    }

    #[tokio::test]
    async fn truncated_stream_is_a_desync() {
        let (mut conn, mut server) = scripted();
        let mut pipe = Pipeline::new(&mut conn);
        pipe.enqueue(&Command::ping(), ReplyShape::Status)
            .enqueue(&Command::ping(), ReplyShape::Status);
        pipe.flush().await.unwrap();
        server.write_all(b"+PONG\r\n").await.unwrap();
        drop(server);

        assert!(matches!(
            pipe.drain().await,
            Err(MqError::ProtocolDesync(_))
        ));
        drop(pipe);
        assert!(conn.is_broken());
    }

    #[tokio::test]
    async fn garbage_is_a_desync() {
        let (mut conn, mut server) = scripted();
        let mut pipe = Pipeline::new(&mut conn);
        pipe.enqueue(&Command::ping(), ReplyShape::Status);
        pipe.flush().await.unwrap();
        server.write_all(b"?what\r\n").await.unwrap();

        assert!(matches!(
            pipe.drain().await,
            Err(MqError::ProtocolDesync(_))
        ));
        drop(pipe);
        assert!(conn.is_broken());
    }

    #[tokio::test]
    async fn abandoned_pipeline_breaks_the_connection() {
        let mut conn = memory().await;
        {
            let mut pipe = Pipeline::new(&mut conn);
            pipe.enqueue(&Command::ping(), ReplyShape::Status);
            pipe.flush().await.unwrap();
        }
        assert!(conn.is_broken());
    }
}
