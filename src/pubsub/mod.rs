//! Publish/subscribe support.
//!
//! - `sink`: reply variants that stream published messages to a subscriber
//! - `hub`: the shared channel → subscriber table that publishes fan out from

mod hub;
mod sink;

pub use hub::{Hub, DEFAULT_CHANNEL_CAPACITY};
pub use sink::{ChannelWriter, MultiChannelWriter};

use crate::resp::Frame;

/// One pushed message, written to the subscriber as a multibulk.
pub type Message = Vec<Frame>;
