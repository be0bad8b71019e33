//! Request decoding from a byte stream.
//!
//! Accepts multibulk requests (`*2\r\n$3\r\nGET\r\n$1\r\nk\r\n`) and inline
//! commands (`GET k\r\n`). Partial input is buffered across reads, so a
//! request split over several TCP segments decodes the same as one that
//! arrives whole.

use super::frame::{find_crlf, parse_number, MAX_BULK_LEN};
use crate::request::Request;
use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Longest inline command line or length header accepted before the peer
/// is cut off.
const MAX_INLINE_LEN: usize = 64 * 1024;

/// Most input held back for the next request while a streaming reply owns
/// the connection.
const MAX_PENDING_LEN: usize = 64 * 1024;

/// Failure to decode a request from the peer.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ReadError {
    fn protocol(msg: impl Into<String>) -> Self {
        ReadError::Protocol(msg.into())
    }
}

/// A multibulk request whose header has been consumed but whose elements
/// have not all arrived yet. Elements leave the read buffer as soon as they
/// are complete, so a request spread over many reads is decoded once.
struct Multibulk {
    expected: usize,
    parts: Vec<Option<Bytes>>,
    /// Length of the bulk string whose header was consumed.
    bulk_len: Option<usize>,
}

impl Multibulk {
    fn new(expected: usize) -> Self {
        Self {
            expected,
            parts: Vec::with_capacity(expected.min(1024)),
            bulk_len: None,
        }
    }

    fn into_request(self) -> Result<Request, ReadError> {
        let mut parts = self.parts.into_iter();
        let name = match parts.next() {
            Some(Some(raw)) => command_name(&raw)?,
            _ => return Err(ReadError::protocol("expected bulk string for command name")),
        };
        Ok(Request::new(name, parts.collect()))
    }
}

/// Decodes one request at a time from the read half of a connection.
pub struct RequestReader<R> {
    reader: R,
    buffer: BytesMut,
    pending: Option<Multibulk>,
}

impl<R: AsyncRead + Unpin> RequestReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(BUFFER_SIZE),
            pending: None,
        }
    }

    /// Read the next request.
    ///
    /// Returns `Ok(None)` when the peer closes the connection between
    /// requests. A close in the middle of a request is a protocol error.
    pub async fn next_request(&mut self) -> Result<Option<Request>, ReadError> {
        loop {
            if let Some(request) = self.decode()? {
                return Ok(Some(request));
            }

            let n = self.reader.read_buf(&mut self.buffer).await?;
            if n == 0 {
                if self.pending.is_none() && self.buffer.iter().all(u8::is_ascii_whitespace) {
                    trace!("Connection closed by client");
                    return Ok(None);
                }
                return Err(ReadError::protocol(
                    "connection closed with incomplete request",
                ));
            }
        }
    }

    /// Keep reading until the peer goes away.
    ///
    /// Used while a streaming reply owns the write half: bytes that arrive in
    /// the meantime stay buffered for the next `next_request` call. Also
    /// returns once more than `MAX_PENDING_LEN` bytes are waiting, so a peer
    /// that floods a streaming connection gets dropped.
    pub async fn closed(&mut self) {
        while self.buffer.len() <= MAX_PENDING_LEN {
            match self.reader.read_buf(&mut self.buffer).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
        debug!(
            buffered = self.buffer.len(),
            "Too much input while streaming"
        );
    }

    /// Try to decode one request from what is already buffered.
    fn decode(&mut self) -> Result<Option<Request>, ReadError> {
        loop {
            if self.pending.is_none() {
                let Some(&first) = self.buffer.first() else {
                    return Ok(None);
                };

                if first != b'*' {
                    match self.decode_inline()? {
                        Some(Some(request)) => return Ok(Some(request)),
                        Some(None) => continue,
                        None => return Ok(None),
                    }
                }

                let Some(len) = take_header(&mut self.buffer, "multibulk length")? else {
                    return Ok(None);
                };
                // Null and empty multibulks carry no request.
                if len <= 0 {
                    continue;
                }
                if len > MAX_BULK_LEN {
                    return Err(ReadError::protocol("invalid multibulk length"));
                }
                self.pending = Some(Multibulk::new(len as usize));
            }

            if !self.decode_elements()? {
                return Ok(None);
            }
            if let Some(pending) = self.pending.take() {
                return pending.into_request().map(Some);
            }
        }
    }

    /// Move every complete element of the pending multibulk out of the
    /// buffer. Returns `true` once all of them have arrived.
    fn decode_elements(&mut self) -> Result<bool, ReadError> {
        let Some(pending) = self.pending.as_mut() else {
            return Ok(true);
        };

        while pending.parts.len() < pending.expected {
            let len = match pending.bulk_len {
                Some(len) => len,
                None => {
                    let Some(&first) = self.buffer.first() else {
                        return Ok(false);
                    };
                    if first != b'$' {
                        return Err(ReadError::protocol(if pending.parts.is_empty() {
                            "expected bulk string for command name"
                        } else {
                            "expected bulk string"
                        }));
                    }

                    let Some(len) = take_header(&mut self.buffer, "bulk length")? else {
                        return Ok(false);
                    };
                    if len < 0 {
                        pending.parts.push(None);
                        continue;
                    }
                    if len > MAX_BULK_LEN {
                        return Err(ReadError::protocol("invalid bulk length"));
                    }
                    pending.bulk_len = Some(len as usize);
                    len as usize
                }
            };

            if self.buffer.len() < len + 2 {
                return Ok(false);
            }
            if &self.buffer[len..len + 2] != b"\r\n" {
                return Err(ReadError::protocol("bulk string missing trailing CRLF"));
            }

            let data = Bytes::copy_from_slice(&self.buffer[..len]);
            self.buffer.advance(len + 2);
            pending.bulk_len = None;
            pending.parts.push(Some(data));
        }

        Ok(true)
    }

    /// Decode an inline command line.
    ///
    /// Outer `None` means more data is needed; inner `None` means the line
    /// was blank and has been consumed.
    fn decode_inline(&mut self) -> Result<Option<Option<Request>>, ReadError> {
        let Some(end) = self.buffer.iter().position(|&b| b == b'\n') else {
            if self.buffer.len() > MAX_INLINE_LEN {
                return Err(ReadError::protocol("too big inline request"));
            }
            return Ok(None);
        };

        let raw = self.buffer.split_to(end + 1);
        let line = match find_crlf(&raw) {
            Some(cr) => &raw[..cr],
            None => &raw[..end],
        };

        let mut words = line
            .split(|b| b.is_ascii_whitespace())
            .filter(|w| !w.is_empty())
            .map(Bytes::copy_from_slice);

        let Some(name) = words.next() else {
            return Ok(Some(None));
        };
        let name = command_name(&name)?;
        Ok(Some(Some(Request::new(name, words.map(Some).collect()))))
    }
}

/// Consume a `*<n>\r\n` or `$<n>\r\n` header from the front of `buffer`.
fn take_header(buffer: &mut BytesMut, what: &str) -> Result<Option<i64>, ReadError> {
    let Some(end) = find_crlf(buffer) else {
        if buffer.len() > MAX_INLINE_LEN {
            return Err(ReadError::protocol(format!("too big {what}")));
        }
        return Ok(None);
    };

    let len = parse_number(&buffer[1..end], what).map_err(ReadError::Protocol)?;
    buffer.advance(end + 2);
    Ok(Some(len))
}

fn command_name(raw: &[u8]) -> Result<String, ReadError> {
    std::str::from_utf8(raw)
        .map(str::to_string)
        .map_err(|_| ReadError::protocol("invalid command name"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio_test::io::Builder;

    fn args(request: &Request) -> Vec<Option<&[u8]>> {
        request.args.iter().map(|a| a.as_deref()).collect()
    }

    #[tokio::test]
    async fn test_reads_multibulk_request() {
        let mock = Builder::new()
            .read(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n")
            .build();
        let mut reader = RequestReader::new(mock);

        let request = reader.next_request().await.unwrap().unwrap();
        assert_eq!(request.name, "SET");
        assert_eq!(args(&request), vec![Some(&b"k"[..]), Some(&b"v"[..])]);

        assert!(reader.next_request().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reassembles_split_request() {
        let mock = Builder::new()
            .read(b"*2\r\n$4\r\nEC")
            .read(b"HO\r\n$5\r\nhel")
            .read(b"lo\r\n")
            .build();
        let mut reader = RequestReader::new(mock);

        let request = reader.next_request().await.unwrap().unwrap();
        assert_eq!(request.name, "ECHO");
        assert_eq!(args(&request), vec![Some(&b"hello"[..])]);
    }

    #[tokio::test]
    async fn test_reads_pipelined_and_inline_requests() {
        let mock = Builder::new()
            .read(b"PING\r\n\r\nget  key\n*1\r\n$4\r\nQUIT\r\n")
            .build();
        let mut reader = RequestReader::new(mock);

        let names: Vec<String> = [
            reader.next_request().await.unwrap().unwrap(),
            reader.next_request().await.unwrap().unwrap(),
            reader.next_request().await.unwrap().unwrap(),
        ]
        .into_iter()
        .map(|r| r.name)
        .collect();
        assert_eq!(names, vec!["PING", "get", "QUIT"]);
    }

    #[tokio::test]
    async fn test_null_argument_preserved() {
        let mock = Builder::new()
            .read(b"*2\r\n$3\r\nGET\r\n$-1\r\n")
            .build();
        let mut reader = RequestReader::new(mock);

        let request = reader.next_request().await.unwrap().unwrap();
        assert_eq!(args(&request), vec![None]);
    }

    #[tokio::test]
    async fn test_malformed_request_is_protocol_error() {
        let mock = Builder::new().read(b"*1\r\n:12\r\n").build();
        let mut reader = RequestReader::new(mock);

        match reader.next_request().await {
            Err(ReadError::Protocol(msg)) => assert_eq!(msg, "expected bulk string for command name"),
            other => panic!("Expected protocol error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_truncated_request_is_protocol_error() {
        let mock = Builder::new().read(b"*2\r\n$3\r\nGET\r\n").build();
        let mut reader = RequestReader::new(mock);

        assert!(matches!(
            reader.next_request().await,
            Err(ReadError::Protocol(_))
        ));
    }

    fn multibulk(count: usize) -> Vec<u8> {
        let mut raw = format!("*{}\r\n$4\r\nMSET\r\n", count + 1).into_bytes();
        for i in 0..count {
            let arg = format!("{:06}", i);
            raw.extend_from_slice(format!("${}\r\n{}\r\n", arg.len(), arg).as_bytes());
        }
        raw
    }

    #[test]
    fn test_split_multibulk_consumes_complete_elements() {
        let raw = multibulk(50_000);
        let mut reader = RequestReader::new(tokio::io::empty());

        let mut chunks = raw.chunks(1000).peekable();
        let mut decoded = None;
        while let Some(chunk) = chunks.next() {
            reader.buffer.extend_from_slice(chunk);
            decoded = reader.decode().unwrap();
            if chunks.peek().is_some() {
                assert!(decoded.is_none());
                // Only the tail of one unfinished element stays buffered.
                assert!(reader.buffer.len() < 16, "{} bytes held", reader.buffer.len());
            }
        }

        let request = decoded.unwrap();
        assert_eq!(request.name, "MSET");
        assert_eq!(request.args.len(), 50_000);
        assert_eq!(request.args[49_999].as_deref(), Some(&b"049999"[..]));
        assert!(reader.buffer.is_empty());
        assert!(reader.pending.is_none());
    }

    #[tokio::test]
    async fn test_reads_large_request_in_small_reads() {
        let raw = multibulk(200_000);
        let mut mock = Builder::new();
        for chunk in raw.chunks(BUFFER_SIZE) {
            mock.read(chunk);
        }
        let mut reader = RequestReader::new(mock.build());

        let request = tokio::time::timeout(Duration::from_secs(10), reader.next_request())
            .await
            .expect("decoding should not stall")
            .unwrap()
            .unwrap();
        assert_eq!(request.args.len(), 200_000);
        assert_eq!(request.args[0].as_deref(), Some(&b"000000"[..]));
        assert!(reader.next_request().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bulk_split_across_reads_keeps_header_progress() {
        let mock = Builder::new()
            .read(b"*2\r\n$3\r\nGET\r\n$10\r\n0123")
            .read(b"456")
            .read(b"789\r\n")
            .build();
        let mut reader = RequestReader::new(mock);

        let request = reader.next_request().await.unwrap().unwrap();
        assert_eq!(args(&request), vec![Some(&b"0123456789"[..])]);
    }

    #[tokio::test]
    async fn test_close_inside_pending_multibulk_is_protocol_error() {
        let mock = Builder::new().read(b"*3\r\n$3\r\nSET\r\n").build();
        let mut reader = RequestReader::new(mock);

        assert!(matches!(
            reader.next_request().await,
            Err(ReadError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_gives_up_on_flooding_peer() {
        let (client, server) = tokio::io::duplex(BUFFER_SIZE);
        let mut reader = RequestReader::new(server);

        let flood = tokio::spawn(async move {
            let mut client = client;
            let chunk = vec![b'x'; BUFFER_SIZE];
            // 10 MiB, far more than the reader may hold
            for _ in 0..640 {
                if client.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        });

        tokio::time::timeout(Duration::from_secs(5), reader.closed())
            .await
            .expect("closed() should return while the peer is still writing");
        assert!(!flood.is_finished());
        assert!(reader.buffer.len() > MAX_PENDING_LEN);
        assert!(reader.buffer.len() <= MAX_PENDING_LEN + BUFFER_SIZE);

        drop(reader);
        flood.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_returns_on_peer_close() {
        let mock = Builder::new().read(b"PING\r\n").build();
        let mut reader = RequestReader::new(mock);

        reader.closed().await;
        let request = reader.next_request().await.unwrap().unwrap();
        assert_eq!(request.name, "PING");
    }
}
