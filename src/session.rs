use crate::handler::Handler;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

/// Per-connection state.
///
/// Owned by the task serving the connection; commands that declare a
/// session parameter get it mutably for the duration of their call.
pub struct Session {
    db: usize,
    subscribed: bool,
    created_at: DateTime<Utc>,
    host: String,
    handler: Arc<dyn Handler>,
}

impl Session {
    pub fn new(host: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        Self {
            db: 0,
            subscribed: false,
            created_at: Utc::now(),
            host: host.into(),
            handler,
        }
    }

    /// Selected database index.
    pub fn db(&self) -> usize {
        self.db
    }

    pub fn select(&mut self, db: usize) {
        self.db = db;
    }

    /// Whether the connection holds subscriptions that must be cleared
    /// when it closes.
    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    pub fn set_subscribed(&mut self, subscribed: bool) {
        self.subscribed = subscribed;
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    /// Release connection-scoped resources held by the handler.
    pub(crate) fn close(&mut self) {
        if self.subscribed {
            self.handler.clear_subscribe(&self.host);
            self.subscribed = false;
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("db", &self.db)
            .field("subscribed", &self.subscribed)
            .field("created_at", &self.created_at)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}
