//! Subscription table shared by every connection.
//!
//! Publishing, subscribing and clearing a disconnected host all take the
//! same lock, so a host that has been cleared is never delivered to again.
//! Delivery itself never blocks: a subscriber whose queue is full misses the
//! message, and one whose connection has gone away is pruned.

use super::{ChannelWriter, Message, MultiChannelWriter};
use crate::reply::Reply;
use crate::resp::Frame;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Default number of undelivered messages buffered per subscription.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

struct Subscriber {
    host: String,
    tx: mpsc::Sender<Message>,
}

pub struct Hub {
    channels: Mutex<HashMap<Bytes, Vec<Subscriber>>>,
    capacity: usize,
}

impl Hub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<Bytes, Vec<Subscriber>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe `host` to `channels`.
    ///
    /// One channel yields a [`ChannelWriter`], several yield a
    /// [`MultiChannelWriter`]. Each first reply is
    /// `subscribe <channel> <subscription count of host>`.
    pub fn subscribe(&self, host: &str, channels: Vec<Bytes>) -> Reply {
        let mut table = self.table();
        let mut writers = Vec::with_capacity(channels.len());

        for channel in channels {
            let (tx, rx) = mpsc::channel(self.capacity);
            let subscribers = table.entry(channel.clone()).or_default();
            subscribers.retain(|s| s.host != host);
            subscribers.push(Subscriber {
                host: host.to_string(),
                tx,
            });

            let count = count_for(&table, host);
            debug!(host, channel = %String::from_utf8_lossy(&channel), count, "Subscribed");
            writers.push(ChannelWriter::new(
                vec![
                    Frame::bulk("subscribe"),
                    Frame::Bulk(Some(channel)),
                    Frame::integer(count),
                ],
                rx,
            ));
        }

        match writers.len() {
            0 => Reply::wrong_number_of_arguments(),
            1 => Reply::Channel(writers.remove(0)),
            _ => Reply::MultiChannel(MultiChannelWriter::new(writers)),
        }
    }

    /// Deliver `payload` to every subscriber of `channel`.
    ///
    /// Returns the number of subscribers the message was queued for.
    pub fn publish(&self, channel: &Bytes, payload: Bytes) -> i64 {
        let mut table = self.table();
        let Some(subscribers) = table.get_mut(channel) else {
            return 0;
        };

        let message: Message = vec![
            Frame::bulk("message"),
            Frame::Bulk(Some(channel.clone())),
            Frame::Bulk(Some(payload)),
        ];

        let mut delivered = 0;
        subscribers.retain(|s| match s.tx.try_send(message.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(host = %s.host, "Subscriber queue full, dropping message");
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!(host = %s.host, "Pruning closed subscriber");
                false
            }
        });

        if subscribers.is_empty() {
            table.remove(channel);
        }
        delivered
    }

    /// Drop every subscription held by `host`. Returns how many were removed.
    pub fn clear_subscribe(&self, host: &str) -> usize {
        let mut table = self.table();
        let mut removed = 0;
        table.retain(|_, subscribers| {
            let before = subscribers.len();
            subscribers.retain(|s| s.host != host);
            removed += before - subscribers.len();
            !subscribers.is_empty()
        });
        if removed > 0 {
            debug!(host, removed, "Cleared subscriptions");
        }
        removed
    }

    /// Number of live subscribers of `channel`.
    pub fn numsub(&self, channel: &[u8]) -> usize {
        self.table()
            .get(channel)
            .map_or(0, |subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

fn count_for(table: &HashMap<Bytes, Vec<Subscriber>>, host: &str) -> i64 {
    table
        .values()
        .filter(|subs| subs.iter().any(|s| s.host == host))
        .count() as i64
}
