//! Command results and their mapping onto reply variants.

use super::{Reply, SeqMap};
use crate::error::{Error, Result};
use crate::pubsub::{ChannelWriter, MultiChannelWriter};
use crate::request::Request;
use crate::resp::Frame;
use bytes::Bytes;
use std::collections::HashMap;

/// What a command returns on success.
///
/// Each shape maps to one reply variant:
///
/// | value | reply |
/// |---|---|
/// | `List` | `MultiBulk` |
/// | `Str`, `Bytes` | `Bulk` |
/// | `Nil` | null `Bulk` |
/// | `Hash` | `HashValue` |
/// | `Map` | `MultiBulk` of flattened entries |
/// | `Int` | `Integer` |
/// | `Reply` | itself (fan-out sinks get stamped with the request) |
#[derive(Debug)]
pub enum Value {
    Nil,
    Int(i64),
    Str(String),
    Bytes(Bytes),
    List(Vec<Value>),
    Hash(HashMap<String, Bytes>),
    Map(HashMap<String, Value>),
    Reply(Reply),
}

/// Turn a command's result into the reply sent for `request`.
pub fn encode(request: &Request, value: Value) -> Result<Reply> {
    Ok(match value {
        Value::List(items) => Reply::MultiBulk(Some(frames(items)?)),
        Value::Str(s) => Reply::Bulk(Some(Bytes::from(s))),
        Value::Bytes(b) => Reply::Bulk(Some(b)),
        Value::Nil => Reply::Bulk(None),
        Value::Hash(hash) => Reply::HashValue(sorted(hash)),
        Value::Map(map) => Reply::MultiBulk(Some(map_entries(map)?)),
        Value::Int(n) => Reply::Integer(n),
        Value::Reply(Reply::MultiChannel(mut sink)) => {
            sink.stamp(request);
            Reply::MultiChannel(sink)
        }
        Value::Reply(reply) => reply,
    })
}

fn frames(items: Vec<Value>) -> Result<Vec<Frame>> {
    items.into_iter().map(to_frame).collect()
}

fn map_entries(map: HashMap<String, Value>) -> Result<Vec<Frame>> {
    let mut out = Vec::with_capacity(map.len() * 2);
    for (key, value) in sorted(map) {
        out.push(Frame::bulk(key));
        out.push(to_frame(value)?);
    }
    Ok(out)
}

/// Encode a value nested inside a list or map.
fn to_frame(value: Value) -> Result<Frame> {
    Ok(match value {
        Value::Nil => Frame::null(),
        Value::Int(n) => Frame::Integer(n),
        Value::Str(s) => Frame::bulk(s),
        Value::Bytes(b) => Frame::Bulk(Some(b)),
        Value::List(items) => Frame::array(frames(items)?),
        Value::Hash(hash) => Frame::array(
            sorted(hash)
                .into_iter()
                .flat_map(|(field, value)| [Frame::bulk(field), Frame::Bulk(Some(value))])
                .collect(),
        ),
        Value::Map(map) => Frame::array(map_entries(map)?),
        Value::Reply(reply) => match reply.into_frame() {
            Ok(frame) => frame,
            Err(sink) => {
                return Err(Error::UnsupportedType {
                    kind: if matches!(sink, Reply::Channel(_)) {
                        "ChannelWriter"
                    } else {
                        "MultiChannelWriter"
                    },
                    rendered: format!("{sink:?}"),
                })
            }
        },
    })
}

fn sorted<V>(map: HashMap<String, V>) -> Vec<(String, V)> {
    let mut pairs: Vec<_> = map.into_iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    pairs
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(Bytes::from(b))
    }
}

impl From<Option<Bytes>> for Value {
    fn from(b: Option<Bytes>) -> Self {
        b.map_or(Value::Nil, Value::Bytes)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Int(i64::try_from(n).unwrap_or(i64::MAX))
    }
}

impl From<Vec<String>> for Value {
    fn from(items: Vec<String>) -> Self {
        Value::List(items.into_iter().map(Value::Str).collect())
    }
}

impl From<Vec<Bytes>> for Value {
    fn from(items: Vec<Bytes>) -> Self {
        Value::List(items.into_iter().map(Value::Bytes).collect())
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<HashMap<String, Bytes>> for Value {
    fn from(hash: HashMap<String, Bytes>) -> Self {
        Value::Hash(hash)
    }
}

impl From<HashMap<String, Value>> for Value {
    fn from(map: HashMap<String, Value>) -> Self {
        Value::Map(map)
    }
}

impl From<Reply> for Value {
    fn from(reply: Reply) -> Self {
        Value::Reply(reply)
    }
}

impl From<SeqMap> for Value {
    fn from(map: SeqMap) -> Self {
        Value::Reply(Reply::SeqMap(map))
    }
}

impl From<ChannelWriter> for Value {
    fn from(sink: ChannelWriter) -> Self {
        Value::Reply(Reply::Channel(sink))
    }
}

impl From<MultiChannelWriter> for Value {
    fn from(sink: MultiChannelWriter) -> Self {
        Value::Reply(Reply::MultiChannel(sink))
    }
}
