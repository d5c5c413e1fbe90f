#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;

use fleetwire::error::{FleetwireError, Result};
use fleetwire::interfaces::messenger::{MessageListener, Messenger};
use fleetwire::interfaces::scheduler::{RepeatingTask, Scheduler, TaskHandle};

/// Opt-in log output for debugging test runs (`RUST_LOG=debug cargo test`).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Multi-node in-memory hub: each node sees sends from every other node with
/// the sender's name as the source server.
#[derive(Default)]
pub struct TestNetwork {
    nodes: Mutex<HashMap<String, Arc<Node>>>,
}

#[derive(Default)]
struct Node {
    listeners: RwLock<HashMap<String, Vec<MessageListener>>>,
}

impl Node {
    fn deliver(&self, channel: &str, data: &str, source_server: &str) {
        let snapshot: Vec<MessageListener> = {
            let listeners = self.listeners.read().unwrap();
            listeners.get(channel).cloned().unwrap_or_default()
        };
        for listener in snapshot {
            listener(channel, data, source_server);
        }
    }
}

impl TestNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn create(
        self: &Arc<Self>,
        server_name: &str,
        proxy_server_name: &str,
    ) -> Arc<TestMessenger> {
        let node = {
            let mut nodes = self.nodes.lock().unwrap();
            Arc::clone(nodes.entry(server_name.to_string()).or_default())
        };
        Arc::new(TestMessenger {
            network: Arc::clone(self),
            node,
            server_name: server_name.to_string(),
            proxy_server_name: proxy_server_name.to_string(),
        })
    }
}

pub struct TestMessenger {
    network: Arc<TestNetwork>,
    node: Arc<Node>,
    server_name: String,
    proxy_server_name: String,
}

#[async_trait]
impl Messenger for TestMessenger {
    async fn send_to_all(&self, channel: &str, data: &str) -> Result<()> {
        let nodes: Vec<Arc<Node>> = self.network.nodes.lock().unwrap().values().cloned().collect();
        for node in nodes {
            node.deliver(channel, data, &self.server_name);
        }
        Ok(())
    }

    async fn send_to_server(&self, channel: &str, server_name: &str, data: &str) -> Result<()> {
        if server_name.trim().is_empty() {
            return Ok(());
        }
        let node = self.network.nodes.lock().unwrap().get(server_name).cloned();
        if let Some(node) = node {
            node.deliver(channel, data, &self.server_name);
        }
        Ok(())
    }

    async fn send_to_proxy(&self, channel: &str, data: &str) -> Result<()> {
        let proxy = self.proxy_server_name.clone();
        self.send_to_server(channel, &proxy, data).await
    }

    fn register_listener(&self, channel: &str, listener: MessageListener) {
        self.node
            .listeners
            .write()
            .unwrap()
            .entry(channel.to_string())
            .or_default()
            .push(listener);
    }

    fn unregister_listener(&self, channel: &str, listener: &MessageListener) {
        let mut listeners = self.node.listeners.write().unwrap();
        if let Some(list) = listeners.get_mut(channel) {
            list.retain(|existing| {
                Arc::as_ptr(existing) as *const () != Arc::as_ptr(listener) as *const ()
            });
        }
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn server_name(&self) -> String {
        self.server_name.clone()
    }

    fn proxy_server_name(&self) -> String {
        self.proxy_server_name.clone()
    }
}

/// Scheduler whose delayed and repeating tasks only run when the test says
/// so; immediate tasks are spawned on the runtime.
#[derive(Default)]
pub struct ManualScheduler {
    delayed: Mutex<Vec<Arc<ManualTask>>>,
    repeating: Mutex<Vec<Arc<RepeatingEntry>>>,
}

pub struct ManualTask {
    future: Mutex<Option<BoxFuture<'static, ()>>>,
    cancelled: AtomicBool,
}

struct RepeatingEntry {
    task: RepeatingTask,
    cancelled: AtomicBool,
}

struct ManualTaskHandle {
    task: Arc<ManualTask>,
}

impl TaskHandle for ManualTaskHandle {
    fn cancel(&self) {
        self.task.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.task.cancelled.load(Ordering::SeqCst)
    }
}

struct RepeatingHandle {
    entry: Arc<RepeatingEntry>,
}

impl TaskHandle for RepeatingHandle {
    fn cancel(&self) {
        self.entry.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.entry.cancelled.load(Ordering::SeqCst)
    }
}

struct SpawnedHandle;

impl TaskHandle for SpawnedHandle {
    fn cancel(&self) {}

    fn is_cancelled(&self) -> bool {
        false
    }
}

impl ManualScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn delayed_count(&self) -> usize {
        self.delayed.lock().unwrap().len()
    }

    pub fn delayed_cancelled(&self, index: usize) -> bool {
        self.delayed.lock().unwrap()[index]
            .cancelled
            .load(Ordering::SeqCst)
    }

    /// Runs every delayed task that has not been cancelled, once.
    pub async fn fire_delayed(&self) {
        let tasks: Vec<Arc<ManualTask>> = self.delayed.lock().unwrap().clone();
        for task in tasks {
            if task.cancelled.load(Ordering::SeqCst) {
                continue;
            }
            let future = task.future.lock().unwrap().take();
            if let Some(future) = future {
                future.await;
            }
        }
    }

    /// Polls until at least `count` delayed tasks are registered.
    pub async fn wait_for_delayed(&self, count: usize) {
        for _ in 0..400 {
            if self.delayed_count() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {count} delayed task(s)");
    }

    /// Runs every registered repeating task once (an outbox flush tick).
    pub async fn tick(&self) {
        let entries: Vec<Arc<RepeatingEntry>> = self.repeating.lock().unwrap().clone();
        for entry in entries {
            if entry.cancelled.load(Ordering::SeqCst) {
                continue;
            }
            (entry.task)().await;
        }
    }
}

impl Scheduler for ManualScheduler {
    fn run(&self, task: BoxFuture<'static, ()>) -> Box<dyn TaskHandle> {
        tokio::spawn(task);
        Box::new(SpawnedHandle)
    }

    fn run_later(&self, _delay: Duration, task: BoxFuture<'static, ()>) -> Box<dyn TaskHandle> {
        let manual = Arc::new(ManualTask {
            future: Mutex::new(Some(task)),
            cancelled: AtomicBool::new(false),
        });
        self.delayed.lock().unwrap().push(Arc::clone(&manual));
        Box::new(ManualTaskHandle { task: manual })
    }

    fn run_repeating(
        &self,
        _initial_delay: Duration,
        _period: Duration,
        task: RepeatingTask,
    ) -> Box<dyn TaskHandle> {
        let entry = Arc::new(RepeatingEntry {
            task,
            cancelled: AtomicBool::new(false),
        });
        self.repeating.lock().unwrap().push(Arc::clone(&entry));
        Box::new(RepeatingHandle { entry })
    }
}

/// Delegate messenger with a switchable connected flag that records every
/// direct send; can be told to fail sends to exercise retry paths.
pub struct CapturingMessenger {
    pub connected: AtomicBool,
    pub fail_sends: AtomicBool,
    pub sent: Mutex<Vec<String>>,
    server_name: String,
    proxy_server_name: String,
}

impl CapturingMessenger {
    pub fn new(connected: bool) -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(connected),
            fail_sends: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            server_name: "local".to_string(),
            proxy_server_name: "proxy".to_string(),
        })
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    fn record(&self, entry: String) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(FleetwireError::Transport("send failed".to_string()));
        }
        self.sent.lock().unwrap().push(entry);
        Ok(())
    }
}

#[async_trait]
impl Messenger for CapturingMessenger {
    async fn send_to_all(&self, channel: &str, data: &str) -> Result<()> {
        self.record(format!("ALL|{channel}|{data}"))
    }

    async fn send_to_server(&self, channel: &str, server_name: &str, data: &str) -> Result<()> {
        self.record(format!("{server_name}|{channel}|{data}"))
    }

    async fn send_to_proxy(&self, channel: &str, data: &str) -> Result<()> {
        self.record(format!("PROXY|{channel}|{data}"))
    }

    fn register_listener(&self, _channel: &str, _listener: MessageListener) {}

    fn unregister_listener(&self, _channel: &str, _listener: &MessageListener) {}

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn server_name(&self) -> String {
        self.server_name.clone()
    }

    fn proxy_server_name(&self) -> String {
        self.proxy_server_name.clone()
    }
}
