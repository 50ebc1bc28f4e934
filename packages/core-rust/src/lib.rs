//! `redmq` Core: RESP frame codec, command builder, message envelope, and queue naming.

pub mod command;
pub mod envelope;
pub mod queue_names;
pub mod resp;

pub use command::Command;
pub use envelope::{Envelope, EnvelopeError};
pub use queue_names::{queue_name, temp_queue_name, QueueNameError, QueueNames, QueueRole};
pub use resp::{Frame, RespCodec, RespError};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
