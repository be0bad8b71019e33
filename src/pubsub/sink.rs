//! Streaming reply sinks.
//!
//! A sink is written like any other reply, but after its first frame it
//! keeps forwarding published messages to the same connection. Streaming
//! stops when the connection's teardown token is cancelled or when every
//! message source has closed.

use super::Message;
use crate::reply::write_frame;
use crate::request::Request;
use crate::resp::Frame;
use std::fmt;
use std::future::poll_fn;
use std::io;
use std::task::Poll;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Streams the messages of one subscription to one connection.
pub struct ChannelWriter {
    first_reply: Vec<Frame>,
    messages: mpsc::Receiver<Message>,
    teardown: Option<CancellationToken>,
}

impl ChannelWriter {
    /// `first_reply` is written as a multibulk before any message.
    pub fn new(first_reply: Vec<Frame>, messages: mpsc::Receiver<Message>) -> Self {
        Self {
            first_reply,
            messages,
            teardown: None,
        }
    }

    /// Bind the sink to the teardown signal of the connection that issued
    /// `request`.
    pub fn stamp(&mut self, request: &Request) {
        self.teardown = Some(request.teardown.clone());
    }

    pub fn is_stamped(&self) -> bool {
        self.teardown.is_some()
    }

    pub fn first_reply(&self) -> &[Frame] {
        &self.first_reply
    }

    pub(crate) async fn write_to<W>(
        mut self,
        writer: &mut W,
        teardown: &CancellationToken,
    ) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let teardown = self.teardown.take().unwrap_or_else(|| teardown.clone());
        write_frame(writer, &Frame::array(std::mem::take(&mut self.first_reply))).await?;

        loop {
            tokio::select! {
                _ = teardown.cancelled() => {
                    trace!("Subscriber torn down");
                    return Ok(());
                }
                message = self.messages.recv() => match message {
                    Some(message) => write_frame(writer, &Frame::array(message)).await?,
                    None => return Ok(()),
                },
            }
        }
    }
}

impl fmt::Debug for ChannelWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelWriter")
            .field("first_reply", &self.first_reply)
            .field("stamped", &self.teardown.is_some())
            .finish()
    }
}

/// Several subscriptions of one connection multiplexed onto its socket.
///
/// All first replies are written up front; afterwards a message from any of
/// the inner subscriptions is forwarded as soon as it is published.
pub struct MultiChannelWriter {
    writers: Vec<ChannelWriter>,
}

impl MultiChannelWriter {
    pub fn new(writers: Vec<ChannelWriter>) -> Self {
        Self { writers }
    }

    pub fn writers(&self) -> &[ChannelWriter] {
        &self.writers
    }

    pub fn stamp(&mut self, request: &Request) {
        for writer in &mut self.writers {
            writer.stamp(request);
        }
    }

    pub fn is_stamped(&self) -> bool {
        !self.writers.is_empty() && self.writers.iter().all(ChannelWriter::is_stamped)
    }

    pub(crate) async fn write_to<W>(
        self,
        writer: &mut W,
        teardown: &CancellationToken,
    ) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let teardown = self
            .writers
            .iter()
            .find_map(|w| w.teardown.clone())
            .unwrap_or_else(|| teardown.clone());

        let mut sources = Vec::with_capacity(self.writers.len());
        for sink in self.writers {
            write_frame(writer, &Frame::array(sink.first_reply)).await?;
            sources.push(sink.messages);
        }

        // Each poll starts after the source that delivered last.
        let mut start = 0;
        loop {
            let next = poll_fn(|cx| {
                let mut open = false;
                for i in 0..sources.len() {
                    let idx = (start + i) % sources.len();
                    match sources[idx].poll_recv(cx) {
                        Poll::Ready(Some(message)) => {
                            start = idx + 1;
                            return Poll::Ready(Some(message));
                        }
                        Poll::Ready(None) => {}
                        Poll::Pending => open = true,
                    }
                }
                if open {
                    Poll::Pending
                } else {
                    Poll::Ready(None)
                }
            });

            tokio::select! {
                _ = teardown.cancelled() => {
                    trace!("Subscriber torn down");
                    return Ok(());
                }
                message = next => match message {
                    Some(message) => write_frame(writer, &Frame::array(message)).await?,
                    None => return Ok(()),
                },
            }
        }
    }
}

impl fmt::Debug for MultiChannelWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.writers).finish()
    }
}
