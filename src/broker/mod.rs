mod config;
mod conn;

pub use config::{BrokerConfig, BrokerConfigBuilder, DEFAULT_TRANSPORT_CHANNEL};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::codec;
use crate::envelope::{Envelope, Target};
use crate::error::{FleetwireError, Result};
use crate::interfaces::messenger::{ListenerSet, MessageListener, Messenger};
use crate::interfaces::transport::Transport;
use crate::services::transport::{TcpTransport, TlsTransport};
use conn::{BrokerConnection, Frame};

struct BrokerInner {
    config: BrokerConfig,
    transport: Arc<dyn Transport>,
    listeners: ListenerSet,
    publish_conn: tokio::sync::Mutex<Option<BrokerConnection>>,
    connected: AtomicBool,
    running: AtomicBool,
}

/// [`Messenger`] implementation speaking the broker's wire protocol directly
/// over TCP (or TLS).
///
/// Two independent connections: a lazily-opened publish connection reused
/// across sends, and a subscribe connection held open by a background task
/// that reconnects with a fixed backoff until the client is closed.
pub struct BrokerMessenger {
    inner: Arc<BrokerInner>,
    subscribe_task: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerMessenger {
    /// Spawns the subscribe loop on the ambient tokio runtime.
    pub fn new(config: BrokerConfig) -> Self {
        let transport: Arc<dyn Transport> = if config.tls() {
            Arc::new(TlsTransport::new())
        } else {
            Arc::new(TcpTransport)
        };
        Self::with_transport(config, transport)
    }

    pub fn with_transport(config: BrokerConfig, transport: Arc<dyn Transport>) -> Self {
        let inner = Arc::new(BrokerInner {
            config,
            transport,
            listeners: ListenerSet::new(),
            publish_conn: tokio::sync::Mutex::new(None),
            connected: AtomicBool::new(false),
            running: AtomicBool::new(true),
        });
        let task = tokio::spawn({
            let inner = Arc::clone(&inner);
            async move {
                inner.run_subscribe_loop().await;
            }
        });
        Self {
            inner,
            subscribe_task: Mutex::new(Some(task)),
        }
    }

    /// Stops the subscribe loop and drops both connections.
    pub async fn close(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.connected.store(false, Ordering::SeqCst);
        let task = {
            let mut guard = match self.subscribe_task.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take()
        };
        if let Some(task) = task {
            task.abort();
        }
        let mut publish = self.inner.publish_conn.lock().await;
        *publish = None;
    }
}

impl Drop for BrokerMessenger {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.connected.store(false, Ordering::SeqCst);
        let task = match self.subscribe_task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            task.abort();
        }
    }
}

#[async_trait]
impl Messenger for BrokerMessenger {
    async fn send_to_all(&self, channel: &str, data: &str) -> Result<()> {
        self.inner
            .publish(Envelope::new(
                channel,
                data,
                Target::All,
                None,
                self.inner.config.server_name(),
            ))
            .await
    }

    async fn send_to_server(&self, channel: &str, server_name: &str, data: &str) -> Result<()> {
        self.inner
            .publish(Envelope::new(
                channel,
                data,
                Target::Server,
                Some(server_name.to_string()),
                self.inner.config.server_name(),
            ))
            .await
    }

    async fn send_to_proxy(&self, channel: &str, data: &str) -> Result<()> {
        self.inner
            .publish(Envelope::new(
                channel,
                data,
                Target::Proxy,
                None,
                self.inner.config.server_name(),
            ))
            .await
    }

    fn register_listener(&self, channel: &str, listener: MessageListener) {
        self.inner.listeners.add(channel, listener);
    }

    fn unregister_listener(&self, channel: &str, listener: &MessageListener) {
        self.inner.listeners.remove(channel, listener);
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn server_name(&self) -> String {
        self.inner.config.server_name().to_string()
    }

    fn proxy_server_name(&self) -> String {
        self.inner.config.proxy_server_name().to_string()
    }
}

impl BrokerInner {
    async fn run_subscribe_loop(&self) {
        while self.running.load(Ordering::SeqCst) {
            match BrokerConnection::connect(&self.config, self.transport.as_ref()).await {
                Ok(mut conn) => {
                    match conn.subscribe(self.config.transport_channel()).await {
                        Ok(()) => {
                            self.connected.store(true, Ordering::SeqCst);
                            loop {
                                if !self.running.load(Ordering::SeqCst) {
                                    return;
                                }
                                match conn.read_reply().await {
                                    Ok(frame) => self.handle_subscribe_frame(frame),
                                    Err(err) => {
                                        if self.running.load(Ordering::SeqCst) {
                                            warn!("broker subscribe loop error: {err}");
                                        }
                                        break;
                                    }
                                }
                            }
                        }
                        Err(err) => warn!("broker subscribe failed: {err}"),
                    }
                    self.connected.store(false, Ordering::SeqCst);
                }
                Err(err) => {
                    self.connected.store(false, Ordering::SeqCst);
                    if self.running.load(Ordering::SeqCst) {
                        warn!("broker connect failed: {err}");
                    }
                }
            }
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(self.config.reconnect_delay()).await;
        }
    }

    fn handle_subscribe_frame(&self, frame: Frame) {
        let Frame::Array(Some(items)) = frame else {
            return;
        };
        let mut items = items.into_iter();
        let Some(Frame::Bulk(Some(kind))) = items.next() else {
            return;
        };
        if kind != "message" {
            return;
        }
        let Some(_broker_channel) = items.next() else {
            return;
        };
        let Some(Frame::Bulk(Some(payload))) = items.next() else {
            return;
        };
        let Ok(envelope) = codec::from_json::<Envelope>(&payload) else {
            return;
        };
        if !delivery_filter(
            &envelope,
            self.config.server_name(),
            self.config.proxy_server_name(),
        ) {
            return;
        }
        self.listeners
            .dispatch(&envelope.channel, &envelope.data, &envelope.source_server);
    }

    async fn publish(&self, envelope: Envelope) -> Result<()> {
        let payload = codec::to_json(&envelope)?;
        if !self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut guard = self.publish_conn.lock().await;
        if guard.is_none() {
            match BrokerConnection::connect(&self.config, self.transport.as_ref()).await {
                Ok(conn) => *guard = Some(conn),
                Err(err) => {
                    warn!("broker publish connect failed: {err}");
                    return Ok(());
                }
            }
        }

        if let Some(conn) = guard.as_mut() {
            match self.try_publish(conn, &payload).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!("broker publish failed (will retry once): {err}");
                    *guard = None;
                }
            }
        }

        match BrokerConnection::connect(&self.config, self.transport.as_ref()).await {
            Ok(mut conn) => match self.try_publish(&mut conn, &payload).await {
                Ok(()) => {
                    *guard = Some(conn);
                    Ok(())
                }
                Err(err) => {
                    warn!("broker publish retry failed: {err}");
                    Ok(())
                }
            },
            Err(err) => {
                warn!("broker publish reconnect failed: {err}");
                Ok(())
            }
        }
    }

    async fn try_publish(&self, conn: &mut BrokerConnection, payload: &str) -> Result<()> {
        tokio::time::timeout(
            self.config.socket_timeout(),
            conn.publish(self.config.transport_channel(), payload),
        )
        .await
        .map_err(|_| FleetwireError::Transport("broker publish timed out".into()))?
    }
}

/// Whether an inbound envelope should reach this process's listeners.
///
/// Self-sent broadcasts are not re-delivered; server-targeted traffic is
/// delivered by the named target, or by the proxy acting as a relay.
fn delivery_filter(envelope: &Envelope, local_server: &str, proxy_server: &str) -> bool {
    if envelope.channel.is_empty() {
        return false;
    }
    let source = envelope.source_server.as_str();
    let is_proxy = local_server.eq_ignore_ascii_case(proxy_server);
    match envelope.target {
        Target::Proxy => is_proxy,
        Target::All => source.is_empty() || !source.eq_ignore_ascii_case(local_server),
        Target::Server => {
            if !source.is_empty() && source.eq_ignore_ascii_case(local_server) {
                return false;
            }
            if is_proxy {
                return true;
            }
            envelope
                .target_server
                .as_deref()
                .is_some_and(|target| target.eq_ignore_ascii_case(local_server))
        }
    }
}
