//! Connections, pooling, and command pipelining.

pub mod config;
pub mod connection;
pub mod pipeline;
pub mod pool;

pub use config::*;
pub use connection::*;
pub use pipeline::*;
pub use pool::*;
