//! Embedded in-memory list store.
//!
//! - [`ListStore`]: keyed lists with Redis list semantics and blocking pops
//! - [`serve_connection`] / [`serve`]: the RESP front end, for in-process
//!   duplex pipes and for TCP clients respectively

pub mod list_store;
pub mod server;

pub use list_store::ListStore;
pub use server::{serve, serve_connection};
