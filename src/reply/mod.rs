//! Wire-level replies.
//!
//! Every request produces exactly one [`Reply`]. Most variants lower to a
//! single [`Frame`]; the two pub/sub sinks keep writing to the connection
//! after their first frame until the connection's teardown signal fires or
//! their message source closes.

mod encode;
mod seqmap;

pub use encode::{encode, Value};
pub use seqmap::SeqMap;

use crate::pubsub::{ChannelWriter, MultiChannelWriter};
use crate::resp::Frame;
use bytes::Bytes;
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

pub const METHOD_NOT_SUPPORTED: &str = "method not supported";
pub const WRONG_NUMBER_OF_ARGUMENTS: &str = "wrong number of arguments";

#[derive(Debug)]
pub enum Reply {
    Status(String),
    /// Full error line without the leading `-`, e.g. `ERR no such key`.
    Error(String),
    Integer(i64),
    Bulk(Option<Bytes>),
    MultiBulk(Option<Vec<Frame>>),
    /// Flattened field/value pairs of a hash.
    HashValue(Vec<(String, Bytes)>),
    SeqMap(SeqMap),
    Channel(ChannelWriter),
    MultiChannel(MultiChannelWriter),
}

impl Reply {
    pub fn ok() -> Reply {
        Reply::Status("OK".to_string())
    }

    pub fn status<S: Into<String>>(s: S) -> Reply {
        Reply::Status(s.into())
    }

    /// Error reply with the generic `ERR` code prepended.
    pub fn error<S: AsRef<str>>(message: S) -> Reply {
        Reply::Error(format!("ERR {}", message.as_ref()))
    }

    pub fn method_not_supported() -> Reply {
        Reply::error(METHOD_NOT_SUPPORTED)
    }

    pub fn wrong_number_of_arguments() -> Reply {
        Reply::error(WRONG_NUMBER_OF_ARGUMENTS)
    }

    pub fn integer(n: i64) -> Reply {
        Reply::Integer(n)
    }

    pub fn bulk<B: Into<Bytes>>(data: B) -> Reply {
        Reply::Bulk(Some(data.into()))
    }

    pub fn nil() -> Reply {
        Reply::Bulk(None)
    }

    pub fn multi_bulk(frames: Vec<Frame>) -> Reply {
        Reply::MultiBulk(Some(frames))
    }

    /// Whether this reply keeps streaming after its first frame.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Reply::Channel(_) | Reply::MultiChannel(_))
    }

    /// Lower a one-shot reply to its wire frame.
    ///
    /// Streaming sinks have no single frame and are handed back unchanged.
    pub fn into_frame(self) -> Result<Frame, Reply> {
        Ok(match self {
            Reply::Status(s) => Frame::Simple(s),
            Reply::Error(e) => Frame::Error(e),
            Reply::Integer(n) => Frame::Integer(n),
            Reply::Bulk(data) => Frame::Bulk(data),
            Reply::MultiBulk(frames) => Frame::Array(frames),
            Reply::HashValue(pairs) => Frame::array(
                pairs
                    .into_iter()
                    .flat_map(|(field, value)| [Frame::bulk(field), Frame::Bulk(Some(value))])
                    .collect(),
            ),
            Reply::SeqMap(map) => map.into_frame(),
            sink @ (Reply::Channel(_) | Reply::MultiChannel(_)) => return Err(sink),
        })
    }

    /// Write the reply to `writer`.
    ///
    /// For sinks this only returns once streaming ends: `teardown` fired,
    /// the message source closed, or a write failed.
    pub async fn write_to<W>(self, writer: &mut W, teardown: &CancellationToken) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let sink = match self.into_frame() {
            Ok(frame) => return write_frame(writer, &frame).await,
            Err(sink) => sink,
        };

        match sink {
            Reply::Channel(writer_sink) => writer_sink.write_to(writer, teardown).await,
            Reply::MultiChannel(fan_out) => fan_out.write_to(writer, teardown).await,
            _ => Ok(()),
        }
    }
}

pub(crate) async fn write_frame<W>(writer: &mut W, frame: &Frame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.encode()).await?;
    writer.flush().await
}

impl From<SeqMap> for Reply {
    fn from(map: SeqMap) -> Self {
        Reply::SeqMap(map)
    }
}

impl From<ChannelWriter> for Reply {
    fn from(sink: ChannelWriter) -> Self {
        Reply::Channel(sink)
    }
}

impl From<MultiChannelWriter> for Reply {
    fn from(sink: MultiChannelWriter) -> Self {
        Reply::MultiChannel(sink)
    }
}
