//! Outbound command builder.
//!
//! A command is an ASCII name plus binary-safe arguments, sent as a RESP
//! array of bulk strings. Constructors cover the list primitives the message
//! queue is built on.

use std::fmt;
use std::time::Duration;

use bytes::{Bytes, BytesMut};

use crate::resp::{put_bulk, put_line, Frame};

/// Smallest blocking-pop timeout sent to the server. A timeout of zero means
/// "block forever" on the wire, so shorter requests are rounded up to this.
pub const MIN_BLOCKING_TIMEOUT: Duration = Duration::from_millis(1);

/// A single protocol command ready to be written to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: &'static str,
    args: Vec<Bytes>,
}

impl Command {
    /// Starts a command with no arguments.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            args: Vec::new(),
        }
    }

    /// Appends an argument, copying its bytes.
    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.args.push(Bytes::copy_from_slice(arg.as_ref()));
        self
    }

    /// Appends an argument that is already reference-counted, without copying.
    #[must_use]
    pub fn arg_bytes(mut self, arg: Bytes) -> Self {
        self.args.push(arg);
        self
    }

    /// Appends an integer argument in decimal form.
    #[must_use]
    pub fn arg_int(self, value: i64) -> Self {
        self.arg(value.to_string())
    }

    /// The command name, e.g. `"LPUSH"`.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The encoded arguments, excluding the command name.
    #[must_use]
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Appends the wire encoding of this command to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        put_line(dst, b'*', (self.args.len() + 1).to_string().as_bytes());
        put_bulk(dst, self.name.as_bytes());
        for arg in &self.args {
            put_bulk(dst, arg);
        }
    }

    /// Encodes into a standalone buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(self.encoded_len_hint());
        self.encode(&mut dst);
        dst.freeze()
    }

    /// The command as a frame, as a server would decode it.
    #[must_use]
    pub fn to_frame(&self) -> Frame {
        let mut items = Vec::with_capacity(self.args.len() + 1);
        items.push(Frame::bulk(self.name));
        items.extend(self.args.iter().cloned().map(|a| Frame::Bulk(Some(a))));
        Frame::Array(Some(items))
    }

    fn encoded_len_hint(&self) -> usize {
        // 16 bytes of framing per element is generous for any realistic length.
        self.args.iter().map(|a| a.len() + 16).sum::<usize>() + self.name.len() + 32
    }

    // -- Connection -----------------------------------------------------------

    #[must_use]
    pub fn ping() -> Self {
        Self::new("PING")
    }

    #[must_use]
    pub fn echo(message: impl AsRef<[u8]>) -> Self {
        Self::new("ECHO").arg(message)
    }

    #[must_use]
    pub fn auth(password: &str) -> Self {
        Self::new("AUTH").arg(password)
    }

    #[must_use]
    pub fn select(db: u32) -> Self {
        Self::new("SELECT").arg(db.to_string())
    }

    // -- Lists ----------------------------------------------------------------

    /// Push onto the head of a list. Paired with `RPOP`/`BRPOP` this gives FIFO.
    #[must_use]
    pub fn lpush(key: &str, value: impl Into<Bytes>) -> Self {
        Self::new("LPUSH").arg(key).arg_bytes(value.into())
    }

    #[must_use]
    pub fn rpush(key: &str, value: impl Into<Bytes>) -> Self {
        Self::new("RPUSH").arg(key).arg_bytes(value.into())
    }

    #[must_use]
    pub fn lpop(key: &str) -> Self {
        Self::new("LPOP").arg(key)
    }

    #[must_use]
    pub fn rpop(key: &str) -> Self {
        Self::new("RPOP").arg(key)
    }

    /// Blocking pop from the tail of the first non-empty list in `keys`.
    #[must_use]
    pub fn brpop<K: AsRef<str>>(keys: &[K], timeout: Duration) -> Self {
        let mut cmd = Self::new("BRPOP");
        for key in keys {
            cmd = cmd.arg(key.as_ref());
        }
        cmd.arg(format_timeout(timeout))
    }

    #[must_use]
    pub fn ltrim(key: &str, start: i64, stop: i64) -> Self {
        Self::new("LTRIM").arg(key).arg_int(start).arg_int(stop)
    }

    #[must_use]
    pub fn llen(key: &str) -> Self {
        Self::new("LLEN").arg(key)
    }

    #[must_use]
    pub fn lrange(key: &str, start: i64, stop: i64) -> Self {
        Self::new("LRANGE").arg(key).arg_int(start).arg_int(stop)
    }

    // -- Keys -----------------------------------------------------------------

    #[must_use]
    pub fn del<K: AsRef<str>>(keys: &[K]) -> Self {
        let mut cmd = Self::new("DEL");
        for key in keys {
            cmd = cmd.arg(key.as_ref());
        }
        cmd
    }
}

/// Formats a blocking timeout as fractional seconds (`"1.500"`).
#[must_use]
pub fn format_timeout(timeout: Duration) -> String {
    let timeout = timeout.max(MIN_BLOCKING_TIMEOUT);
    format!("{:.3}", timeout.as_secs_f64())
}

impl fmt::Display for Command {
    // Arguments are payloads and may be large or sensitive; only the shape is shown.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} args)", self.name, self.args.len())
    }
}

impl From<Command> for Frame {
    fn from(cmd: Command) -> Self {
        cmd.to_frame()
    }
}
