use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::interfaces::messenger::Messenger;
use crate::interfaces::scheduler::Scheduler;
use crate::rpc::{RpcClient, RpcError};

pub const SERVICE: &str = "fleetwire:netinfo";

pub const WHO_AM_I: &str = "who_am_i";
pub const LIST_SERVERS: &str = "list_servers";
pub const LIST_PLAYERS: &str = "list_players";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPlayerInfo {
    pub uuid: Uuid,
    pub name: String,
    pub server_name: String,
}

/// Typed facade over the proxy's network-info RPC service.
///
/// Backend servers typically do not know the name the proxy routes them as
/// and must ask; the answer is cached after the first successful call.
pub struct NetworkInfoClient {
    rpc: RpcClient,
    cached_server_name: tokio::sync::Mutex<Option<String>>,
}

impl NetworkInfoClient {
    pub fn new(messenger: Arc<dyn Messenger>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            rpc: RpcClient::new(messenger, scheduler),
            cached_server_name: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_timeout(
        messenger: Arc<dyn Messenger>,
        scheduler: Arc<dyn Scheduler>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            rpc: RpcClient::with_timeout(messenger, scheduler, request_timeout),
            cached_server_name: tokio::sync::Mutex::new(None),
        }
    }

    /// Returns the name this server is known as on the network. Concurrent
    /// callers coalesce on the lock, so the proxy is asked at most once.
    pub async fn network_server_name(&self) -> Result<String, RpcError> {
        let mut cached = self.cached_server_name.lock().await;
        if let Some(name) = cached.as_ref() {
            return Ok(name.clone());
        }
        let name: String = self
            .rpc
            .call_proxy(SERVICE, WHO_AM_I, Value::Null, None)
            .await?;
        if name.trim().is_empty() {
            return Err(RpcError::Decode {
                service: SERVICE.to_string(),
                method: WHO_AM_I.to_string(),
                message: "proxy returned an empty server name".to_string(),
            });
        }
        *cached = Some(name.clone());
        Ok(name)
    }

    pub async fn servers(&self) -> Result<Vec<String>, RpcError> {
        self.rpc
            .call_proxy(SERVICE, LIST_SERVERS, Value::Null, None)
            .await
    }

    pub async fn players(&self) -> Result<Vec<NetworkPlayerInfo>, RpcError> {
        self.rpc
            .call_proxy(SERVICE, LIST_PLAYERS, Value::Null, None)
            .await
    }

    pub fn close(&self) {
        self.rpc.close();
    }
}
