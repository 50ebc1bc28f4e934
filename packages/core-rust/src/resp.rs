//! RESP2 frame model and the `tokio-util` codec that reads and writes it.
//!
//! Every reply on the wire starts with a one-byte type prefix:
//!
//! | Prefix | Frame |
//! |--------|-------|
//! | `+` | status line |
//! | `-` | error line |
//! | `:` | signed 64-bit integer |
//! | `$` | length-prefixed bulk string (`$-1` is null) |
//! | `*` | array of frames (`*-1` is null) |
//!
//! The decoder never consumes bytes from the buffer until a complete frame is
//! available, so a partially received reply is simply retried on the next read.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const CRLF: &[u8] = b"\r\n";

/// Largest bulk string the decoder accepts by default (512 MB, the server limit).
pub const DEFAULT_MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Deepest array nesting the decoder accepts by default.
pub const DEFAULT_MAX_DEPTH: usize = 32;

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// A single RESP2 protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `+OK\r\n`
    Simple(String),
    /// `-ERR message\r\n`
    Error(String),
    /// `:42\r\n`
    Integer(i64),
    /// `$3\r\nfoo\r\n`, or `$-1\r\n` for null.
    Bulk(Option<Bytes>),
    /// `*2\r\n...`, or `*-1\r\n` for null.
    Array(Option<Vec<Frame>>),
}

impl Frame {
    /// The `+OK` status reply.
    #[must_use]
    pub fn ok() -> Self {
        Frame::Simple("OK".to_string())
    }

    /// A non-null bulk string.
    #[must_use]
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Frame::Bulk(Some(data.into()))
    }

    /// Short human-readable name of the frame type, used in error messages.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Simple(_) => "status",
            Frame::Error(_) => "error",
            Frame::Integer(_) => "integer",
            Frame::Bulk(None) => "null bulk",
            Frame::Bulk(Some(_)) => "bulk",
            Frame::Array(None) => "null array",
            Frame::Array(Some(_)) => "array",
        }
    }

    /// Appends the wire encoding of this frame to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Frame::Simple(s) => put_line(dst, b'+', s.as_bytes()),
            Frame::Error(s) => put_line(dst, b'-', s.as_bytes()),
            Frame::Integer(i) => put_line(dst, b':', i.to_string().as_bytes()),
            Frame::Bulk(None) => dst.put_slice(b"$-1\r\n"),
            Frame::Bulk(Some(data)) => put_bulk(dst, data),
            Frame::Array(None) => dst.put_slice(b"*-1\r\n"),
            Frame::Array(Some(items)) => {
                put_line(dst, b'*', items.len().to_string().as_bytes());
                for item in items {
                    item.encode(dst);
                }
            }
        }
    }
}

pub(crate) fn put_line(dst: &mut BytesMut, prefix: u8, line: &[u8]) {
    dst.reserve(line.len() + 3);
    dst.put_u8(prefix);
    dst.put_slice(line);
    dst.put_slice(CRLF);
}

pub(crate) fn put_bulk(dst: &mut BytesMut, data: &[u8]) {
    put_line(dst, b'$', data.len().to_string().as_bytes());
    dst.reserve(data.len() + 2);
    dst.put_slice(data);
    dst.put_slice(CRLF);
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Framing errors. Any of these means the byte stream can no longer be trusted.
#[derive(Debug, thiserror::Error)]
pub enum RespError {
    #[error("invalid frame type byte {0:#04x}")]
    InvalidPrefix(u8),
    #[error("invalid integer in frame header: {0:?}")]
    InvalidInteger(String),
    #[error("invalid frame length {0}")]
    InvalidLength(i64),
    #[error("bulk string of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },
    #[error("array nesting exceeds depth {0}")]
    TooDeep(usize),
    #[error("bulk string is not terminated by CRLF")]
    MissingTerminator,
    #[error("status line is not valid UTF-8")]
    NotUtf8,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(2)
        .position(|w| w == CRLF)
        .map(|p| from + p)
}

fn parse_int(line: &[u8]) -> Result<i64, RespError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| RespError::InvalidInteger(String::from_utf8_lossy(line).into_owned()))
}

fn parse_text(line: &[u8]) -> Result<String, RespError> {
    std::str::from_utf8(line)
        .map(str::to_string)
        .map_err(|_| RespError::NotUtf8)
}

/// Cursor over a receive buffer. `Ok(None)` from any method means "need more bytes".
struct Parser<'a> {
    buf: &'a [u8],
    pos: usize,
    max_bulk_len: usize,
    max_depth: usize,
}

impl<'a> Parser<'a> {
    fn line(&mut self) -> Option<&'a [u8]> {
        let end = find_crlf(self.buf, self.pos)?;
        let line = &self.buf[self.pos..end];
        self.pos = end + 2;
        Some(line)
    }

    fn frame(&mut self, depth: usize) -> Result<Option<Frame>, RespError> {
        let Some(&prefix) = self.buf.get(self.pos) else {
            return Ok(None);
        };
        if !matches!(prefix, b'+' | b'-' | b':' | b'$' | b'*') {
            return Err(RespError::InvalidPrefix(prefix));
        }
        self.pos += 1;
        let Some(line) = self.line() else {
            return Ok(None);
        };

        match prefix {
            b'+' => Ok(Some(Frame::Simple(parse_text(line)?))),
            b'-' => Ok(Some(Frame::Error(parse_text(line)?))),
            b':' => Ok(Some(Frame::Integer(parse_int(line)?))),
            b'$' => self.bulk_body(parse_int(line)?),
            _ => self.array_body(parse_int(line)?, depth),
        }
    }

    fn bulk_body(&mut self, len: i64) -> Result<Option<Frame>, RespError> {
        if len == -1 {
            return Ok(Some(Frame::Bulk(None)));
        }
        let len = usize::try_from(len).map_err(|_| RespError::InvalidLength(len))?;
        if len > self.max_bulk_len {
            return Err(RespError::TooLarge {
                len,
                max: self.max_bulk_len,
            });
        }
        let end = self.pos + len;
        if self.buf.len() < end + 2 {
            return Ok(None);
        }
        if &self.buf[end..end + 2] != CRLF {
            return Err(RespError::MissingTerminator);
        }
        let data = Bytes::copy_from_slice(&self.buf[self.pos..end]);
        self.pos = end + 2;
        Ok(Some(Frame::Bulk(Some(data))))
    }

    fn array_body(&mut self, count: i64, depth: usize) -> Result<Option<Frame>, RespError> {
        if count == -1 {
            return Ok(Some(Frame::Array(None)));
        }
        let count = usize::try_from(count).map_err(|_| RespError::InvalidLength(count))?;
        if depth >= self.max_depth {
            return Err(RespError::TooDeep(self.max_depth));
        }
        // Cap the preallocation: the count comes off the wire.
        let mut items = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            match self.frame(depth + 1)? {
                Some(item) => items.push(item),
                None => return Ok(None),
            }
        }
        Ok(Some(Frame::Array(Some(items))))
    }
}

// ---------------------------------------------------------------------------
// RespCodec
// ---------------------------------------------------------------------------

/// `tokio-util` codec for RESP2 frames, used by both the client connection
/// and the embedded list store.
#[derive(Debug, Clone)]
pub struct RespCodec {
    max_bulk_len: usize,
    max_depth: usize,
}

impl RespCodec {
    /// Creates a codec with the default size and nesting limits.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_bulk_len: DEFAULT_MAX_BULK_LEN,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    /// Overrides the maximum accepted bulk string length.
    #[must_use]
    pub fn with_max_bulk_len(mut self, max_bulk_len: usize) -> Self {
        self.max_bulk_len = max_bulk_len;
        self
    }
}

impl Default for RespCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for RespCodec {
    type Item = Frame;
    type Error = RespError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, RespError> {
        if src.is_empty() {
            return Ok(None);
        }
        let mut parser = Parser {
            buf: &src[..],
            pos: 0,
            max_bulk_len: self.max_bulk_len,
            max_depth: self.max_depth,
        };
        match parser.frame(0)? {
            Some(frame) => {
                let consumed = parser.pos;
                src.advance(consumed);
                tracing::trace!(kind = frame.kind(), consumed, "decoded frame");
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Frame> for RespCodec {
    type Error = RespError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), RespError> {
        item.encode(dst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn decode_all(input: &[u8]) -> Vec<Frame> {
        let mut codec = RespCodec::new();
        let mut buf = BytesMut::from(input);
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).expect("decode") {
            frames.push(frame);
        }
        assert!(buf.is_empty(), "leftover bytes: {buf:?}");
        frames
    }

    #[test]
    fn decodes_every_reply_type() {
        let frames = decode_all(b"+OK\r\n-ERR wrong type\r\n:42\r\n$3\r\nfoo\r\n$-1\r\n*-1\r\n");
        assert_eq!(
            frames,
            vec![
                Frame::ok(),
                Frame::Error("ERR wrong type".to_string()),
                Frame::Integer(42),
                Frame::bulk("foo"),
                Frame::Bulk(None),
                Frame::Array(None),
            ]
        );
    }

    #[test]
    fn decodes_nested_array() {
        let frames = decode_all(b"*2\r\n$4\r\nq.in\r\n*2\r\n:1\r\n$-1\r\n");
        assert_eq!(
            frames,
            vec![Frame::Array(Some(vec![
                Frame::bulk("q.in"),
                Frame::Array(Some(vec![Frame::Integer(1), Frame::Bulk(None)])),
            ]))]
        );
    }

    #[test]
    fn bulk_payload_is_binary_safe() {
        let frames = decode_all(b"$6\r\na\r\nb\0c\r\n");
        assert_eq!(frames, vec![Frame::bulk(&b"a\r\nb\0c"[..])]);
    }

    #[test]
    fn partial_frame_leaves_buffer_untouched() {
        let mut codec = RespCodec::new();
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nfoo\r\n$3\r\nba"[..]);
        let before = buf.len();
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), before);

        buf.extend_from_slice(b"r\r\n");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::Array(Some(vec![Frame::bulk("foo"), Frame::bulk("bar")]))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn unknown_prefix_is_an_error() {
        let mut codec = RespCodec::new();
        let mut buf = BytesMut::from(&b"?what\r\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(RespError::InvalidPrefix(b'?'))
        ));
    }

    #[test]
    fn bulk_without_terminator_is_an_error() {
        let mut codec = RespCodec::new();
        let mut buf = BytesMut::from(&b"$3\r\nfooXY"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(RespError::MissingTerminator)
        ));
    }

    #[test]
    fn bad_integer_is_an_error() {
        let mut codec = RespCodec::new();
        let mut buf = BytesMut::from(&b":12a\r\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(RespError::InvalidInteger(_))
        ));
    }

    #[test]
    fn oversized_bulk_is_rejected_before_buffering() {
        let mut codec = RespCodec::new().with_max_bulk_len(4);
        let mut buf = BytesMut::from(&b"$5\r\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(RespError::TooLarge { len: 5, max: 4 })
        ));
    }

    #[test]
    fn negative_length_other_than_null_is_rejected() {
        let mut codec = RespCodec::new();
        let mut buf = BytesMut::from(&b"$-2\r\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(RespError::InvalidLength(-2))
        ));
    }

    #[test]
    fn encodes_array_of_bulks() {
        let mut dst = BytesMut::new();
        Frame::Array(Some(vec![Frame::bulk("LLEN"), Frame::bulk("a.inq")])).encode(&mut dst);
        assert_eq!(&dst[..], b"*2\r\n$4\r\nLLEN\r\n$5\r\na.inq\r\n");
    }

    fn arb_frame() -> impl Strategy<Value = Frame> {
        let leaf = prop_oneof![
            "[a-zA-Z0-9 ]{0,12}".prop_map(Frame::Simple),
            "[a-zA-Z0-9 ]{0,12}".prop_map(Frame::Error),
            any::<i64>().prop_map(Frame::Integer),
            proptest::option::of(proptest::collection::vec(any::<u8>(), 0..48))
                .prop_map(|b| Frame::Bulk(b.map(Bytes::from))),
        ];
        leaf.prop_recursive(3, 32, 5, |inner| {
            proptest::option::of(proptest::collection::vec(inner, 0..5)).prop_map(Frame::Array)
        })
    }

    proptest! {
        #[test]
        fn byte_at_a_time_delivery_yields_the_same_frames(frames in proptest::collection::vec(arb_frame(), 1..6)) {
            let mut wire = BytesMut::new();
            for frame in &frames {
                frame.encode(&mut wire);
            }

            let mut codec = RespCodec::new();
            let mut buf = BytesMut::new();
            let mut decoded = Vec::new();
            for byte in wire.iter() {
                buf.put_u8(*byte);
                while let Some(frame) = codec.decode(&mut buf).unwrap() {
                    decoded.push(frame);
                }
            }

            prop_assert_eq!(decoded, frames);
            prop_assert!(buf.is_empty());
        }
    }
}
