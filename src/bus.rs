use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::codec;
use crate::error::Result;
use crate::interfaces::messenger::{MessageListener, Messenger};

type TypedDispatch = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Clone)]
struct TypedRegistration {
    id: u64,
    dispatch: TypedDispatch,
}

struct BusInner {
    messenger: Arc<dyn Messenger>,
    typed: Mutex<HashMap<String, Arc<Vec<TypedRegistration>>>>,
    raw_bridges: Mutex<HashMap<String, MessageListener>>,
    next_id: AtomicU64,
}

/// Typed, multiplexed publish/subscribe on top of one raw [`Messenger`].
///
/// At most one raw listener is registered per channel, shared by every typed
/// registration on that channel. Payloads that fail to decode for one typed
/// listener are dropped for that listener only.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(messenger: Arc<dyn Messenger>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                messenger,
                typed: Mutex::new(HashMap::new()),
                raw_bridges: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn messenger(&self) -> &Arc<dyn Messenger> {
        &self.inner.messenger
    }

    /// Registers a typed listener on `channel`; the raw bridge listener is
    /// installed lazily on first registration.
    pub fn register<T, F>(&self, channel: &str, listener: F) -> Subscription
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T, &str) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let channel_name = channel.to_string();
        let dispatch: TypedDispatch = Arc::new(move |data: &str, source_server: &str| {
            match codec::from_json::<T>(data) {
                Ok(payload) => listener(payload, source_server),
                Err(err) => {
                    debug!("dropping undecodable payload on {channel_name}: {err}");
                }
            }
        });

        {
            let mut typed = self.inner.typed_lock();
            let entry = typed
                .entry(channel.to_string())
                .or_insert_with(|| Arc::new(Vec::new()));
            let mut next = entry.as_ref().clone();
            next.push(TypedRegistration { id, dispatch });
            *entry = Arc::new(next);
        }

        {
            let mut bridges = self.inner.raw_lock();
            if !bridges.contains_key(channel) {
                let weak = Arc::downgrade(&self.inner);
                let raw: MessageListener =
                    Arc::new(move |channel: &str, data: &str, source_server: &str| {
                        if let Some(inner) = weak.upgrade() {
                            inner.dispatch_typed(channel, data, source_server);
                        }
                    });
                self.inner
                    .messenger
                    .register_listener(channel, Arc::clone(&raw));
                bridges.insert(channel.to_string(), raw);
            }
        }

        Subscription {
            inner: Arc::clone(&self.inner),
            channel: channel.to_string(),
            id,
            closed: AtomicBool::new(false),
        }
    }

    pub async fn send_to_all<T: Serialize>(&self, channel: &str, payload: &T) -> Result<()> {
        let json = codec::to_json(payload)?;
        self.inner.messenger.send_to_all(channel, &json).await
    }

    pub async fn send_to_server<T: Serialize>(
        &self,
        channel: &str,
        server_name: &str,
        payload: &T,
    ) -> Result<()> {
        let json = codec::to_json(payload)?;
        self.inner
            .messenger
            .send_to_server(channel, server_name, &json)
            .await
    }

    pub async fn send_to_proxy<T: Serialize>(&self, channel: &str, payload: &T) -> Result<()> {
        let json = codec::to_json(payload)?;
        self.inner.messenger.send_to_proxy(channel, &json).await
    }
}

impl BusInner {
    fn dispatch_typed(&self, channel: &str, data: &str, source_server: &str) {
        let snapshot = self.typed_lock().get(channel).cloned();
        if let Some(registrations) = snapshot {
            for registration in registrations.iter() {
                (registration.dispatch)(data, source_server);
            }
        }
    }

    fn remove_registration(self: &Arc<Self>, channel: &str, id: u64) {
        let remaining = {
            let mut typed = self.typed_lock();
            let Some(entry) = typed.get_mut(channel) else {
                return;
            };
            let next: Vec<TypedRegistration> = entry
                .iter()
                .filter(|registration| registration.id != id)
                .cloned()
                .collect();
            let remaining = next.len();
            if next.is_empty() {
                typed.remove(channel);
            } else {
                *entry = Arc::new(next);
            }
            remaining
        };

        if remaining == 0 {
            let bridge = self.raw_lock().remove(channel);
            if let Some(raw) = bridge {
                self.messenger.unregister_listener(channel, &raw);
            }
        }
    }

    fn typed_lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Vec<TypedRegistration>>>> {
        match self.typed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn raw_lock(&self) -> MutexGuard<'_, HashMap<String, MessageListener>> {
        match self.raw_bridges.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Handle to one typed registration; closing removes the listener and, when it
/// was the channel's last, the raw bridge listener too. Dropping closes.
pub struct Subscription {
    inner: Arc<BusInner>,
    channel: String,
    id: u64,
    closed: AtomicBool,
}

impl Subscription {
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.remove_registration(&self.channel, self.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}
