//! RESP wire frames.
//!
//! A `Frame` is the byte-level unit written to and read from a socket.
//! Replies are lowered to frames just before they hit the wire, and the
//! request reader uses the same parser to decode multibulk requests.

use bytes::{Bytes, BytesMut};

/// Largest bulk payload accepted from a peer (512 MB, same as Redis).
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// RESP frame types
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Simple string: +OK\r\n
    Simple(String),
    /// Error: -ERR message\r\n
    Error(String),
    /// Integer: :1000\r\n
    Integer(i64),
    /// Bulk string: $5\r\nhello\r\n or $-1\r\n (null)
    Bulk(Option<Bytes>),
    /// Array: *2\r\n... or *-1\r\n (null)
    Array(Option<Vec<Frame>>),
}

impl Frame {
    /// Encode a frame to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf
    }

    /// Encode a frame into an existing buffer
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Frame::Simple(s) => line(buf, b'+', s.as_bytes()),
            Frame::Error(s) => line(buf, b'-', s.as_bytes()),
            Frame::Integer(n) => line(buf, b':', n.to_string().as_bytes()),
            Frame::Bulk(None) => buf.extend_from_slice(b"$-1\r\n"),
            Frame::Bulk(Some(data)) => {
                line(buf, b'$', data.len().to_string().as_bytes());
                buf.extend_from_slice(data);
                buf.extend_from_slice(b"\r\n");
            }
            Frame::Array(None) => buf.extend_from_slice(b"*-1\r\n"),
            Frame::Array(Some(frames)) => {
                line(buf, b'*', frames.len().to_string().as_bytes());
                for frame in frames {
                    frame.encode_into(buf);
                }
            }
        }
    }

    pub fn simple<S: Into<String>>(s: S) -> Frame {
        Frame::Simple(s.into())
    }

    pub fn error<S: Into<String>>(s: S) -> Frame {
        Frame::Error(s.into())
    }

    pub fn null() -> Frame {
        Frame::Bulk(None)
    }

    pub fn bulk<B: Into<Bytes>>(data: B) -> Frame {
        Frame::Bulk(Some(data.into()))
    }

    pub fn integer(n: i64) -> Frame {
        Frame::Integer(n)
    }

    pub fn array(frames: Vec<Frame>) -> Frame {
        Frame::Array(Some(frames))
    }

    /// Payload of a non-null bulk string, if this is one.
    pub fn as_bulk(&self) -> Option<&Bytes> {
        match self {
            Frame::Bulk(Some(data)) => Some(data),
            _ => None,
        }
    }
}

fn line(buf: &mut BytesMut, prefix: u8, body: &[u8]) {
    buf.extend_from_slice(&[prefix]);
    buf.extend_from_slice(body);
    buf.extend_from_slice(b"\r\n");
}

/// Parse result
#[derive(Debug)]
pub enum ParseResult {
    /// Successfully parsed a frame with bytes consumed
    Complete(Frame, usize),
    /// Need more data
    Incomplete,
    /// Parse error
    Error(String),
}

/// Parse a RESP frame from the start of `buffer`.
pub fn parse(buffer: &[u8]) -> ParseResult {
    let Some(&kind) = buffer.first() else {
        return ParseResult::Incomplete;
    };

    let Some(end) = find_crlf(buffer) else {
        return ParseResult::Incomplete;
    };
    let header = &buffer[1..end];
    let body_start = end + 2;

    match kind {
        b'+' => match std::str::from_utf8(header) {
            Ok(s) => ParseResult::Complete(Frame::Simple(s.to_string()), body_start),
            Err(_) => ParseResult::Error("invalid UTF-8 in simple string".to_string()),
        },
        b'-' => match std::str::from_utf8(header) {
            Ok(s) => ParseResult::Complete(Frame::Error(s.to_string()), body_start),
            Err(_) => ParseResult::Error("invalid UTF-8 in error".to_string()),
        },
        b':' => match parse_number(header, "integer") {
            Ok(n) => ParseResult::Complete(Frame::Integer(n), body_start),
            Err(e) => ParseResult::Error(e),
        },
        b'$' => {
            let len = match parse_number(header, "bulk length") {
                Ok(n) => n,
                Err(e) => return ParseResult::Error(e),
            };
            if len < 0 {
                return ParseResult::Complete(Frame::Bulk(None), body_start);
            }
            if len > MAX_BULK_LEN {
                return ParseResult::Error("invalid bulk length".to_string());
            }

            let data_end = body_start + len as usize;
            if buffer.len() < data_end + 2 {
                return ParseResult::Incomplete;
            }
            if &buffer[data_end..data_end + 2] != b"\r\n" {
                return ParseResult::Error("bulk string missing trailing CRLF".to_string());
            }

            let data = Bytes::copy_from_slice(&buffer[body_start..data_end]);
            ParseResult::Complete(Frame::Bulk(Some(data)), data_end + 2)
        }
        b'*' => {
            let len = match parse_number(header, "multibulk length") {
                Ok(n) => n,
                Err(e) => return ParseResult::Error(e),
            };
            if len < 0 {
                return ParseResult::Complete(Frame::Array(None), body_start);
            }
            if len > MAX_BULK_LEN {
                return ParseResult::Error("invalid multibulk length".to_string());
            }

            let mut offset = body_start;
            let mut frames = Vec::with_capacity((len as usize).min(1024));
            for _ in 0..len {
                match parse(&buffer[offset..]) {
                    ParseResult::Complete(frame, consumed) => {
                        frames.push(frame);
                        offset += consumed;
                    }
                    other => return other,
                }
            }

            ParseResult::Complete(Frame::Array(Some(frames)), offset)
        }
        other => ParseResult::Error(format!("unknown frame type: {}", other as char)),
    }
}

/// Find CRLF in buffer, return position of \r
pub(crate) fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}

pub(crate) fn parse_number(raw: &[u8], what: &str) -> Result<i64, String> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| format!("invalid {what}: {}", String::from_utf8_lossy(raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scalars() {
        match parse(b"+OK\r\n") {
            ParseResult::Complete(Frame::Simple(s), 5) => assert_eq!(s, "OK"),
            other => panic!("Expected simple string, got {other:?}"),
        }

        match parse(b"-ERR unknown command\r\n") {
            ParseResult::Complete(Frame::Error(s), 22) => assert_eq!(s, "ERR unknown command"),
            other => panic!("Expected error, got {other:?}"),
        }

        match parse(b":-42\r\n") {
            ParseResult::Complete(Frame::Integer(n), 6) => assert_eq!(n, -42),
            other => panic!("Expected integer, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_bulk_strings() {
        match parse(b"$5\r\nhello\r\n") {
            ParseResult::Complete(Frame::Bulk(Some(data)), 11) => assert_eq!(&data[..], b"hello"),
            other => panic!("Expected bulk string, got {other:?}"),
        }

        assert!(matches!(
            parse(b"$-1\r\n"),
            ParseResult::Complete(Frame::Bulk(None), 5)
        ));

        match parse(b"$0\r\n\r\n") {
            ParseResult::Complete(Frame::Bulk(Some(data)), 6) => assert!(data.is_empty()),
            other => panic!("Expected empty bulk string, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_array() {
        let buffer = b"*2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n";
        match parse(buffer) {
            ParseResult::Complete(Frame::Array(Some(frames)), consumed) => {
                assert_eq!(consumed, buffer.len());
                assert_eq!(frames, vec![Frame::bulk("foo"), Frame::bulk("bar")]);
            }
            other => panic!("Expected array, got {other:?}"),
        }

        assert!(matches!(
            parse(b"*-1\r\n"),
            ParseResult::Complete(Frame::Array(None), 5)
        ));
    }

    #[test]
    fn test_parse_incomplete() {
        for partial in [&b"+OK"[..], b"$5\r\nhel", b"*2\r\n$3\r\nfoo\r\n", b""] {
            assert!(
                matches!(parse(partial), ParseResult::Incomplete),
                "{:?} should be incomplete",
                String::from_utf8_lossy(partial)
            );
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse(b"?what\r\n"), ParseResult::Error(_)));
        assert!(matches!(parse(b"$abc\r\n"), ParseResult::Error(_)));
        assert!(matches!(parse(b"$3\r\nfooXY"), ParseResult::Error(_)));
    }

    #[test]
    fn test_encode() {
        assert_eq!(&Frame::simple("OK").encode()[..], b"+OK\r\n");
        assert_eq!(&Frame::error("ERR unknown").encode()[..], b"-ERR unknown\r\n");
        assert_eq!(&Frame::integer(42).encode()[..], b":42\r\n");
        assert_eq!(&Frame::null().encode()[..], b"$-1\r\n");
        assert_eq!(
            &Frame::array(vec![Frame::bulk("foo"), Frame::integer(1)]).encode()[..],
            b"*2\r\n$3\r\nfoo\r\n:1\r\n"
        );
    }
}
