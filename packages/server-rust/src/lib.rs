//! `redmq` Server: pooled RESP connections, command pipelining, and an
//! at-least-once message broker over Redis lists.

pub mod error;
pub mod network;
pub mod service;
pub mod storage;
pub mod traits;

pub use error::MqError;
pub use network::{
    Connection, ConnectionConfig, ConnectionPool, MemoryConnector, Pipeline, PoolConfig,
    PoolStats, PooledConnection, Reply, ReplyShape, TcpConnector,
};
pub use service::{
    handler_fn, json_handler, BrokerConfig, BrokerState, BrokerStats, ClientConfig, MessageBroker,
    MqClient, QueueDepths, RequestFilter, ResponseFilter, RetryPolicy, TypeStats,
    WorkerRegistration,
};
pub use storage::ListStore;
pub use traits::{Connector, MessageHandler};

pub use redmq_core::{Command, Envelope, QueueNames, QueueRole};
