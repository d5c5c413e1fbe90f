use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::error::Result;

/// Raw per-channel listener: `(channel, data, source_server)`.
///
/// Listeners run on whatever task the transport delivers from and must not
/// block; removal matches on pointer identity.
pub type MessageListener = Arc<dyn Fn(&str, &str, &str) + Send + Sync>;

/// Transport-agnostic messaging contract.
///
/// Delivery is best-effort and at-most-once per send attempt; the returned
/// `Result` is advisory and carries no acknowledgement. Implementations should
/// keep [`Messenger::is_connected`] accurate rather than fail sends on
/// transient delivery constraints.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_to_all(&self, channel: &str, data: &str) -> Result<()>;

    /// Sends a message to a specific server. Targeting is best-effort
    /// depending on transport.
    async fn send_to_server(&self, channel: &str, server_name: &str, data: &str) -> Result<()>;

    async fn send_to_proxy(&self, channel: &str, data: &str) -> Result<()>;

    fn register_listener(&self, channel: &str, listener: MessageListener);

    fn unregister_listener(&self, channel: &str, listener: &MessageListener);

    fn is_connected(&self) -> bool;

    fn server_name(&self) -> String;

    fn proxy_server_name(&self) -> String;
}

/// Copy-on-write channel listener registry.
///
/// The dispatch path clones an `Arc` snapshot of the listener list; add and
/// remove replace the whole list, so registration is safe while delivery is
/// in progress.
#[derive(Default)]
pub struct ListenerSet {
    channels: RwLock<HashMap<String, Arc<Vec<MessageListener>>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, channel: &str, listener: MessageListener) {
        let mut channels = self.write();
        let entry = channels
            .entry(channel.to_string())
            .or_insert_with(|| Arc::new(Vec::new()));
        let mut next = entry.as_ref().clone();
        next.push(listener);
        *entry = Arc::new(next);
    }

    pub fn remove(&self, channel: &str, listener: &MessageListener) {
        let mut channels = self.write();
        let Some(entry) = channels.get_mut(channel) else {
            return;
        };
        let next: Vec<MessageListener> = entry
            .iter()
            .filter(|existing| !same_listener(existing, listener))
            .cloned()
            .collect();
        if next.is_empty() {
            channels.remove(channel);
        } else {
            *entry = Arc::new(next);
        }
    }

    pub fn snapshot(&self, channel: &str) -> Option<Arc<Vec<MessageListener>>> {
        self.read().get(channel).cloned()
    }

    pub fn dispatch(&self, channel: &str, data: &str, source_server: &str) {
        if let Some(listeners) = self.snapshot(channel) {
            for listener in listeners.iter() {
                listener(channel, data, source_server);
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Vec<MessageListener>>>> {
        match self.channels.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Vec<MessageListener>>>> {
        match self.channels.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn same_listener(a: &MessageListener, b: &MessageListener) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}
