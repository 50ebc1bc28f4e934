use async_trait::async_trait;
use redmq_core::Envelope;

use crate::error::MqError;
use crate::network::Connection;

/// Opens new connections for the pool.
/// Implementations: TCP (`TcpConnector`), in-process (`MemoryConnector`).
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a connection, including any handshake. `id` is assigned by the pool.
    async fn connect(&self, id: u64) -> Result<Connection, MqError>;

    /// Human-readable target, for logs.
    fn describe(&self) -> String;
}

/// Processes envelopes of one message type.
///
/// Return `Ok(Some(body))` to publish a reply, `Ok(None)` for no reply, and
/// `Err` to fail the attempt, which retries or dead-letters the envelope.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<Option<Vec<u8>>>;
}
