//! Message queue client and broker.
//!
//! 1. **Client** (`client`): publish, notify, and pop over the pool
//! 2. **Registry** (`registry`): one worker registration per message type, with counters
//! 3. **Pollers** (`worker`): pop, dispatch, reply, retry, dead-letter
//! 4. **Broker** (`broker`): lifecycle around the pollers (`lifecycle`)
//! 5. **Policies** (`config`, `retry`): broker and client settings, poll backoff

pub mod broker;
pub mod client;
pub mod config;
pub mod handler;
pub mod lifecycle;
pub mod registry;
pub mod retry;
mod worker;

pub use broker::MessageBroker;
pub use client::{MqClient, QueueDepths};
pub use config::{BrokerConfig, ClientConfig, RequestFilter, ResponseFilter};
pub use handler::{handler_fn, is_serialization_error, json_handler, FnHandler, JsonHandler};
pub use lifecycle::{BrokerState, Lifecycle};
pub use registry::{BrokerStats, HandlerStats, TypeStats, WorkerRegistration, WorkerRegistry};
pub use retry::RetryPolicy;
