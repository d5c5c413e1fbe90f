use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::bus::{EventBus, Subscription};
use crate::envelope::now_millis;
use crate::error::FleetwireError;
use crate::interfaces::messenger::Messenger;
use crate::interfaces::scheduler::{Scheduler, TaskHandle};

pub const REQUEST_CHANNEL: &str = "fleetwire:rpc:req";
pub const RESPONSE_CHANNEL: &str = "fleetwire:rpc:res";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    pub request_id: String,
    pub service: String,
    pub method: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponse {
    pub request_id: String,
    pub ok: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub created_at: i64,
}

impl RpcResponse {
    pub fn success(request_id: impl Into<String>, result: Value) -> Self {
        Self {
            request_id: request_id.into(),
            ok: true,
            result,
            error: None,
            created_at: now_millis(),
        }
    }

    pub fn failure(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ok: false,
            result: Value::Null,
            error: Some(error.into()),
            created_at: now_millis(),
        }
    }
}

/// Outcome of a call, surfaced as a tagged result rather than by exception
/// subtype: callers pattern-match on the variant.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("invalid rpc call: {0}")]
    InvalidArgument(String),
    #[error("messenger is not connected")]
    NotConnected,
    #[error("rpc client is closed")]
    Closed,
    #[error("failed to send rpc request: {0}")]
    Send(FleetwireError),
    #[error("remote {remote_server} failed {service}#{method}: {message}")]
    Remote {
        request_id: String,
        service: String,
        method: String,
        message: String,
        remote_server: String,
    },
    #[error("rpc request timed out: {service}#{method}")]
    Timeout { service: String, method: String },
    #[error("failed to decode rpc result for {service}#{method}: {message}")]
    Decode {
        service: String,
        method: String,
        message: String,
    },
}

enum CallTarget {
    Proxy,
    Server(String),
}

struct PendingRequest {
    tx: oneshot::Sender<Result<Value, RpcError>>,
    timeout_task: Box<dyn TaskHandle>,
    service: String,
    method: String,
}

struct RpcInner {
    bus: EventBus,
    scheduler: Arc<dyn Scheduler>,
    default_timeout: Duration,
    pending: Mutex<HashMap<String, PendingRequest>>,
    closed: AtomicBool,
}

/// Correlation-id request/response client over the event bus.
///
/// Exactly one round trip per call; there is no built-in retry.
pub struct RpcClient {
    inner: Arc<RpcInner>,
    response_sub: Subscription,
}

impl RpcClient {
    pub fn new(messenger: Arc<dyn Messenger>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self::with_timeout(messenger, scheduler, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        messenger: Arc<dyn Messenger>,
        scheduler: Arc<dyn Scheduler>,
        default_timeout: Duration,
    ) -> Self {
        let default_timeout = if default_timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            default_timeout
        };
        let bus = EventBus::new(messenger);
        let inner = Arc::new(RpcInner {
            bus: bus.clone(),
            scheduler,
            default_timeout,
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        let handler = Arc::clone(&inner);
        let response_sub = bus.register::<RpcResponse, _>(
            RESPONSE_CHANNEL,
            move |response, source_server: &str| {
                handler.handle_response(response, source_server);
            },
        );
        Self {
            inner,
            response_sub,
        }
    }

    pub async fn call_proxy<T: DeserializeOwned>(
        &self,
        service: &str,
        method: &str,
        payload: impl Serialize,
        timeout: Option<Duration>,
    ) -> Result<T, RpcError> {
        self.call(CallTarget::Proxy, service, method, payload, timeout)
            .await
    }

    pub async fn call_server<T: DeserializeOwned>(
        &self,
        server_name: &str,
        service: &str,
        method: &str,
        payload: impl Serialize,
        timeout: Option<Duration>,
    ) -> Result<T, RpcError> {
        if server_name.trim().is_empty() {
            return Err(RpcError::InvalidArgument(
                "server name cannot be blank".to_string(),
            ));
        }
        self.call(
            CallTarget::Server(server_name.to_string()),
            service,
            method,
            payload,
            timeout,
        )
        .await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        target: CallTarget,
        service: &str,
        method: &str,
        payload: impl Serialize,
        timeout: Option<Duration>,
    ) -> Result<T, RpcError> {
        if service.trim().is_empty() {
            return Err(RpcError::InvalidArgument(
                "service cannot be blank".to_string(),
            ));
        }
        if method.trim().is_empty() {
            return Err(RpcError::InvalidArgument(
                "method cannot be blank".to_string(),
            ));
        }
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Closed);
        }
        if !self.inner.bus.messenger().is_connected() {
            return Err(RpcError::NotConnected);
        }

        let payload = serde_json::to_value(payload)
            .map_err(|e| RpcError::Send(FleetwireError::Serialization(e.to_string())))?;

        let effective_timeout = self.inner.effective_timeout(timeout);
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        let timeout_task = {
            let inner = Arc::clone(&self.inner);
            let request_id = request_id.clone();
            self.inner.scheduler.run_later(
                effective_timeout,
                async move {
                    inner.fail_on_timeout(&request_id);
                }
                .boxed(),
            )
        };

        self.inner.pending_lock().insert(
            request_id.clone(),
            PendingRequest {
                tx,
                timeout_task,
                service: service.to_string(),
                method: method.to_string(),
            },
        );

        let request = RpcRequest {
            request_id: request_id.clone(),
            service: service.to_string(),
            method: method.to_string(),
            payload,
            created_at: now_millis(),
        };

        let sent = match &target {
            CallTarget::Proxy => self.inner.bus.send_to_proxy(REQUEST_CHANNEL, &request).await,
            CallTarget::Server(server_name) => {
                self.inner
                    .bus
                    .send_to_server(REQUEST_CHANNEL, server_name, &request)
                    .await
            }
        };
        if let Err(err) = sent {
            if let Some(pending) = self.inner.remove_pending(&request_id) {
                pending.timeout_task.cancel();
            }
            return Err(RpcError::Send(err));
        }

        match rx.await {
            Ok(Ok(result)) => {
                serde_json::from_value(result).map_err(|e| RpcError::Decode {
                    service: service.to_string(),
                    method: method.to_string(),
                    message: e.to_string(),
                })
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(RpcError::Closed),
        }
    }

    /// Unsubscribes from the response channel, cancels every outstanding
    /// timeout, and fails every still-pending call.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.response_sub.close();
        let drained: Vec<PendingRequest> = {
            let mut pending = self.inner.pending_lock();
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            entry.timeout_task.cancel();
            let _ = entry.tx.send(Err(RpcError::Closed));
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl RpcInner {
    fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(timeout) if !timeout.is_zero() => timeout,
            _ => self.default_timeout,
        }
    }

    fn handle_response(&self, response: RpcResponse, source_server: &str) {
        if response.request_id.is_empty() {
            return;
        }
        let Some(pending) = self.remove_pending(&response.request_id) else {
            return;
        };
        pending.timeout_task.cancel();

        if !response.ok {
            let message = response
                .error
                .filter(|error| !error.trim().is_empty())
                .unwrap_or_else(|| "remote returned an error".to_string());
            let _ = pending.tx.send(Err(RpcError::Remote {
                request_id: response.request_id,
                service: pending.service,
                method: pending.method,
                message,
                remote_server: source_server.to_string(),
            }));
            return;
        }

        let _ = pending.tx.send(Ok(response.result));
    }

    fn fail_on_timeout(&self, request_id: &str) {
        let Some(pending) = self.remove_pending(request_id) else {
            return;
        };
        let _ = pending.tx.send(Err(RpcError::Timeout {
            service: pending.service,
            method: pending.method,
        }));
    }

    fn remove_pending(&self, request_id: &str) -> Option<PendingRequest> {
        self.pending_lock().remove(request_id)
    }

    fn pending_lock(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
