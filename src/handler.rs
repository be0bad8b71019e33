use crate::command::Command;

/// The object whose commands a server exposes.
///
/// `commands` is called once while the server is built; the resulting
/// registry never changes afterwards.
pub trait Handler: Send + Sync + 'static {
    /// Every command this handler can serve.
    fn commands(&self) -> Vec<Command<Self>>
    where
        Self: Sized;

    /// Return `true` to keep a command out of the registry.
    fn check_shield(&self, name: &str) -> bool {
        let _ = name;
        false
    }

    /// Drop all subscriptions held by `host`. Called when a connection that
    /// subscribed to something closes.
    fn clear_subscribe(&self, host: &str) {
        let _ = host;
    }
}
