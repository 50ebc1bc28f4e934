//! Error type shared by the pool, pipeline, client, and broker.

use redmq_core::{EnvelopeError, QueueNameError, RespError};

/// Errors surfaced by `redmq` operations.
#[derive(Debug, thiserror::Error)]
pub enum MqError {
    #[error("no pooled connection became available within {timeout_ms}ms")]
    PoolExhausted { timeout_ms: u64 },
    #[error("connection pool is closed")]
    PoolClosed,
    /// The reply stream no longer lines up with the commands sent. The
    /// connection that produced this error is never reused.
    #[error("protocol desync: {0}")]
    ProtocolDesync(String),
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("handler failed: {0}")]
    HandlerFailure(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// An error reply (`-ERR ...`) from the server.
    #[error("server error: {0}")]
    Server(String),
    #[error("unexpected reply: expected {expected}, found {found}")]
    UnexpectedReply {
        expected: &'static str,
        found: &'static str,
    },
    #[error("pipeline misuse: {0}")]
    PipelineState(&'static str),
    #[error(transparent)]
    InvalidQueueName(#[from] QueueNameError),
    #[error("a worker is already registered for message type {0:?}")]
    AlreadyRegistered(String),
    #[error("broker is {found}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        found: &'static str,
    },
}

impl MqError {
    /// Whether retrying the same operation later may succeed.
    ///
    /// Pollers back off and retry on transient errors; anything else is
    /// reported and the envelope (if any) follows the failure path.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MqError::PoolExhausted { .. }
                | MqError::ProtocolDesync(_)
                | MqError::Io(_)
                | MqError::Timeout { .. }
        )
    }

    /// Whether the connection that produced this error must be discarded.
    ///
    /// A timed-out read leaves its reply somewhere on the wire, so it breaks
    /// the connection as surely as a framing error.
    #[must_use]
    pub fn breaks_connection(&self) -> bool {
        matches!(
            self,
            MqError::ProtocolDesync(_) | MqError::Io(_) | MqError::Timeout { .. }
        )
    }
}

impl From<RespError> for MqError {
    fn from(err: RespError) -> Self {
        match err {
            RespError::Io(io) => MqError::Io(io),
            other => MqError::ProtocolDesync(other.to_string()),
        }
    }
}

impl From<EnvelopeError> for MqError {
    fn from(err: EnvelopeError) -> Self {
        MqError::Serialization(err.to_string())
    }
}
