//! RESP (Redis Serialization Protocol) framing.
//!
//! `frame` holds the wire codec, `reader` turns a byte stream into
//! [`Request`](crate::Request)s.

pub mod frame;
pub mod reader;

pub use frame::{parse, Frame, ParseResult};
pub use reader::{ReadError, RequestReader};
