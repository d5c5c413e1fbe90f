mod schema;
mod sqlite;
mod store;

pub use sqlite::SqliteOutboxStore;
pub use store::{InMemoryOutboxStore, OutboxStore, StoredMessage};

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::debug;

use crate::config::QueueConfig;
use crate::envelope::{now_millis, Target};
use crate::error::{FleetwireError, Result};
use crate::interfaces::messenger::{MessageListener, Messenger};
use crate::interfaces::scheduler::{Scheduler, TaskHandle};

const FLUSH_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Why a queued message was discarded instead of delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NotAllowlisted,
    InvalidTarget,
    MissingTargetServer,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DropReason::NotAllowlisted => "NOT_ALLOWLISTED",
            DropReason::InvalidTarget => "INVALID_TARGET",
            DropReason::MissingTargetServer => "MISSING_TARGET_SERVER",
        };
        f.write_str(name)
    }
}

/// Observer hooks for outbox outcomes; all methods default to no-ops.
pub trait OutboxListener: Send + Sync {
    fn on_enqueued(&self, _id: i64, _target: Target, _target_server: Option<&str>, _channel: &str) {
    }
    fn on_delivered(&self, _id: i64, _target: Target, _target_server: Option<&str>, _channel: &str) {
    }
    fn on_dropped(
        &self,
        _id: i64,
        _reason: DropReason,
        _target: Option<Target>,
        _target_server: Option<&str>,
        _channel: &str,
    ) {
    }
    fn on_expired(
        &self,
        _id: i64,
        _target: Option<Target>,
        _target_server: Option<&str>,
        _channel: &str,
        _age_millis: i64,
    ) {
    }
    fn on_delivery_failed(
        &self,
        _id: i64,
        _target: Target,
        _target_server: Option<&str>,
        _channel: &str,
        _error: &FleetwireError,
    ) {
    }
}

struct NoopOutboxListener;

impl OutboxListener for NoopOutboxListener {}

pub type ServerListSupplier = Box<dyn Fn() -> Vec<String> + Send + Sync>;
pub type ReachabilityCheck = Box<dyn Fn(&str) -> bool + Send + Sync>;

struct QueueInner {
    store: Arc<dyn OutboxStore>,
    delegate: Arc<dyn Messenger>,
    listener: Arc<dyn OutboxListener>,
    owner_id: String,
    allowlist: HashSet<String>,
    max_batch_size: usize,
    max_age_millis: i64,
    all_servers: Option<ServerListSupplier>,
    reachability: Option<ReachabilityCheck>,
    flushing: AtomicBool,
}

/// Durable outbox wrapper around a delegate [`Messenger`].
///
/// When immediate delivery isn't possible, allowlisted channels are persisted
/// and retried by a periodic flush instead of being dropped.
pub struct QueuedMessenger {
    inner: Arc<QueueInner>,
    flush_task: Box<dyn TaskHandle>,
}

pub struct QueuedMessengerBuilder {
    store: Arc<dyn OutboxStore>,
    delegate: Arc<dyn Messenger>,
    scheduler: Arc<dyn Scheduler>,
    owner_id: String,
    allowlist: Vec<String>,
    flush_period: Duration,
    max_batch_size: usize,
    max_age: Duration,
    all_servers: Option<ServerListSupplier>,
    reachability: Option<ReachabilityCheck>,
    listener: Option<Arc<dyn OutboxListener>>,
}

impl QueuedMessengerBuilder {
    pub fn config(mut self, config: &QueueConfig) -> Self {
        self.allowlist = config.allowlist.clone();
        self.flush_period = config.flush_period();
        self.max_batch_size = config.max_batch_size;
        self.max_age = config.max_age();
        self
    }

    pub fn allowlist<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowlist = channels.into_iter().map(Into::into).collect();
        self
    }

    pub fn flush_period(mut self, period: Duration) -> Self {
        self.flush_period = period;
        self
    }

    pub fn max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Known-server supplier; with one configured, queued broadcasts fan out
    /// into one send per server because reachability may differ per server.
    pub fn all_servers(
        mut self,
        supplier: impl Fn() -> Vec<String> + Send + Sync + 'static,
    ) -> Self {
        self.all_servers = Some(Box::new(supplier));
        self
    }

    /// Per-server reachability check, consulted instead of the delegate's
    /// connectivity for server-targeted sends.
    pub fn reachability(mut self, check: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.reachability = Some(Box::new(check));
        self
    }

    pub fn listener(mut self, listener: Arc<dyn OutboxListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn build(self) -> Result<QueuedMessenger> {
        let owner_id = self.owner_id.trim().to_string();
        if owner_id.is_empty() {
            return Err(FleetwireError::Config("owner id must not be blank".into()));
        }

        let allowlist: HashSet<String> = self
            .allowlist
            .iter()
            .map(|channel| channel.trim().to_string())
            .filter(|channel| !channel.is_empty())
            .collect();

        let flush_period = if self.flush_period.is_zero() {
            Duration::from_secs(2)
        } else {
            self.flush_period
        };

        let inner = Arc::new(QueueInner {
            store: self.store,
            delegate: self.delegate,
            listener: self.listener.unwrap_or_else(|| Arc::new(NoopOutboxListener)),
            owner_id,
            allowlist,
            max_batch_size: self.max_batch_size,
            max_age_millis: self.max_age.as_millis() as i64,
            all_servers: self.all_servers,
            reachability: self.reachability,
            flushing: AtomicBool::new(false),
        });

        let flush_task = self.scheduler.run_repeating(FLUSH_INITIAL_DELAY, flush_period, {
            let inner = Arc::clone(&inner);
            Box::new(move || {
                let inner = Arc::clone(&inner);
                async move {
                    inner.flush().await;
                }
                .boxed()
            })
        });

        Ok(QueuedMessenger { inner, flush_task })
    }
}

impl QueuedMessenger {
    pub fn builder(
        store: Arc<dyn OutboxStore>,
        delegate: Arc<dyn Messenger>,
        scheduler: Arc<dyn Scheduler>,
        owner_id: impl Into<String>,
    ) -> QueuedMessengerBuilder {
        let defaults = QueueConfig::default();
        QueuedMessengerBuilder {
            store,
            delegate,
            scheduler,
            owner_id: owner_id.into(),
            allowlist: defaults.allowlist.clone(),
            flush_period: defaults.flush_period(),
            max_batch_size: defaults.max_batch_size,
            max_age: defaults.max_age(),
            all_servers: None,
            reachability: None,
            listener: None,
        }
    }

    /// Cancels the periodic flush task; in-flight deliveries are not
    /// cancelled.
    pub fn close(&self) {
        self.flush_task.cancel();
    }
}

impl Drop for QueuedMessenger {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl Messenger for QueuedMessenger {
    async fn send_to_all(&self, channel: &str, data: &str) -> Result<()> {
        let inner = &self.inner;
        if inner.should_queue(channel) {
            let servers = inner.known_servers();
            if !servers.is_empty() {
                for server_name in servers {
                    if server_name.trim().is_empty() {
                        continue;
                    }
                    self.send_to_server(channel, &server_name, data).await?;
                }
                return Ok(());
            }
        }

        if inner.can_send_to_all() {
            return inner.delegate.send_to_all(channel, data).await;
        }
        if inner.should_queue(channel) {
            return inner.enqueue(Target::All, None, channel, data).await;
        }
        inner.delegate.send_to_all(channel, data).await
    }

    async fn send_to_server(&self, channel: &str, server_name: &str, data: &str) -> Result<()> {
        let inner = &self.inner;
        if inner.can_send_to_server(server_name) {
            return inner.delegate.send_to_server(channel, server_name, data).await;
        }
        if inner.should_queue(channel) {
            return inner
                .enqueue(Target::Server, Some(server_name), channel, data)
                .await;
        }
        inner.delegate.send_to_server(channel, server_name, data).await
    }

    async fn send_to_proxy(&self, channel: &str, data: &str) -> Result<()> {
        let inner = &self.inner;
        if inner.can_send_to_proxy() {
            return inner.delegate.send_to_proxy(channel, data).await;
        }
        if inner.should_queue(channel) {
            return inner.enqueue(Target::Proxy, None, channel, data).await;
        }
        inner.delegate.send_to_proxy(channel, data).await
    }

    fn register_listener(&self, channel: &str, listener: MessageListener) {
        self.inner.delegate.register_listener(channel, listener);
    }

    fn unregister_listener(&self, channel: &str, listener: &MessageListener) {
        self.inner.delegate.unregister_listener(channel, listener);
    }

    fn is_connected(&self) -> bool {
        self.inner.delegate.is_connected()
    }

    fn server_name(&self) -> String {
        self.inner.delegate.server_name()
    }

    fn proxy_server_name(&self) -> String {
        self.inner.delegate.proxy_server_name()
    }
}

impl QueueInner {
    fn should_queue(&self, channel: &str) -> bool {
        !self.allowlist.is_empty() && self.allowlist.contains(channel.trim())
    }

    fn can_send_to_all(&self) -> bool {
        self.delegate.is_connected()
    }

    fn can_send_to_proxy(&self) -> bool {
        self.delegate.is_connected()
    }

    fn can_send_to_server(&self, server_name: &str) -> bool {
        let server_name = server_name.trim();
        if server_name.is_empty() {
            return false;
        }
        match &self.reachability {
            Some(check) => check(server_name),
            None => self.delegate.is_connected(),
        }
    }

    fn known_servers(&self) -> Vec<String> {
        match &self.all_servers {
            Some(supplier) => supplier(),
            None => Vec::new(),
        }
    }

    async fn enqueue(
        &self,
        target: Target,
        target_server: Option<&str>,
        channel: &str,
        data: &str,
    ) -> Result<()> {
        let channel = channel.trim();
        if channel.is_empty() {
            return Ok(());
        }
        let target_server = target_server.map(str::trim).filter(|name| !name.is_empty());
        let id = self
            .store
            .enqueue(&self.owner_id, target, target_server, channel, data, now_millis())
            .await?;
        self.listener.on_enqueued(id, target, target_server, channel);
        Ok(())
    }

    async fn flush(&self) {
        if self.allowlist.is_empty() || self.max_batch_size == 0 {
            return;
        }
        // Single-flight: a slow cycle must not overlap the next tick.
        if self.flushing.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.flush_once().await {
            debug!("outbox flush failed: {err}");
        }
        self.flushing.store(false, Ordering::SeqCst);
    }

    async fn flush_once(&self) -> Result<()> {
        let batch = self
            .store
            .fetch_batch(&self.owner_id, self.max_batch_size)
            .await?;
        if batch.is_empty() {
            return Ok(());
        }

        let now = now_millis();
        let mut delete_ids = Vec::new();

        for message in batch {
            let age = now - message.created_at;
            if self.max_age_millis > 0 && message.created_at > 0 && age > self.max_age_millis {
                delete_ids.push(message.id);
                self.listener.on_expired(
                    message.id,
                    Target::parse(&message.target),
                    message.target_server.as_deref(),
                    &message.channel,
                    age,
                );
                continue;
            }

            if !self.should_queue(&message.channel) {
                delete_ids.push(message.id);
                self.listener.on_dropped(
                    message.id,
                    DropReason::NotAllowlisted,
                    Target::parse(&message.target),
                    message.target_server.as_deref(),
                    &message.channel,
                );
                continue;
            }

            let Some(target) = Target::parse(&message.target) else {
                delete_ids.push(message.id);
                self.listener.on_dropped(
                    message.id,
                    DropReason::InvalidTarget,
                    None,
                    message.target_server.as_deref(),
                    &message.channel,
                );
                continue;
            };

            let target_server = message
                .target_server
                .as_deref()
                .map(str::trim)
                .filter(|name| !name.is_empty());
            if target == Target::Server && target_server.is_none() {
                delete_ids.push(message.id);
                self.listener.on_dropped(
                    message.id,
                    DropReason::MissingTargetServer,
                    Some(target),
                    None,
                    &message.channel,
                );
                continue;
            }

            if !self.can_send(target, target_server) {
                continue;
            }

            match self
                .deliver(target, target_server, &message.channel, &message.data)
                .await
            {
                Ok(()) => {
                    delete_ids.push(message.id);
                    self.listener
                        .on_delivered(message.id, target, target_server, &message.channel);
                }
                Err(err) => {
                    self.listener.on_delivery_failed(
                        message.id,
                        target,
                        target_server,
                        &message.channel,
                        &err,
                    );
                    if let Err(store_err) = self.store.record_attempt(message.id, now).await {
                        debug!("failed to record outbox attempt: {store_err}");
                    }
                }
            }
        }

        if !delete_ids.is_empty() {
            self.store.delete_by_ids(&delete_ids).await?;
        }
        Ok(())
    }

    fn can_send(&self, target: Target, target_server: Option<&str>) -> bool {
        match target {
            Target::All => self.can_send_to_all(),
            Target::Proxy => self.can_send_to_proxy(),
            Target::Server => self.can_send_to_server(target_server.unwrap_or_default()),
        }
    }

    async fn deliver(
        &self,
        target: Target,
        target_server: Option<&str>,
        channel: &str,
        data: &str,
    ) -> Result<()> {
        match target {
            Target::All => self.delegate.send_to_all(channel, data).await,
            Target::Proxy => self.delegate.send_to_proxy(channel, data).await,
            Target::Server => {
                self.delegate
                    .send_to_server(channel, target_server.unwrap_or_default(), data)
                    .await
            }
        }
    }
}
