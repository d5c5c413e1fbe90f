mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use fleetwire::bus::EventBus;
use fleetwire::interfaces::scheduler::Scheduler;
use fleetwire::netinfo::{self, NetworkInfoClient, NetworkPlayerInfo};
use fleetwire::rpc::{RpcRequest, RpcResponse, REQUEST_CHANNEL, RESPONSE_CHANNEL};
use fleetwire::services::in_memory::InMemoryMessenger;

use common::ManualScheduler;

/// Proxy-side responder sharing the loopback messenger with the client.
fn install_proxy_responder(bus: &EventBus, who_am_i_calls: Arc<AtomicUsize>) -> fleetwire::bus::Subscription {
    bus.register::<RpcRequest, _>(REQUEST_CHANNEL, {
        let bus = bus.clone();
        move |request, source_server: &str| {
            if request.service != netinfo::SERVICE {
                return;
            }
            let result = match request.method.as_str() {
                netinfo::WHO_AM_I => {
                    who_am_i_calls.fetch_add(1, Ordering::SeqCst);
                    json!("backend-3")
                }
                netinfo::LIST_SERVERS => json!(["backend-1", "backend-3"]),
                netinfo::LIST_PLAYERS => json!([NetworkPlayerInfo {
                    uuid: Uuid::new_v4(),
                    name: "steve".to_string(),
                    server_name: "backend-1".to_string(),
                }]),
                _ => json!(null),
            };
            let bus = bus.clone();
            let source_server = source_server.to_string();
            let response = RpcResponse::success(request.request_id, result);
            tokio::spawn(async move {
                let _ = bus
                    .send_to_server(RESPONSE_CHANNEL, &source_server, &response)
                    .await;
            });
        }
    })
}

#[tokio::test]
async fn resolves_and_caches_the_network_server_name() {
    let messenger = Arc::new(InMemoryMessenger::new("backend-3", "proxy"));
    let scheduler = ManualScheduler::new();

    let proxy_bus = EventBus::new(Arc::clone(&messenger) as _);
    let who_am_i_calls = Arc::new(AtomicUsize::new(0));
    let _responder = install_proxy_responder(&proxy_bus, Arc::clone(&who_am_i_calls));

    let client = NetworkInfoClient::new(
        Arc::clone(&messenger) as _,
        Arc::clone(&scheduler) as Arc<dyn Scheduler>,
    );

    assert_eq!(client.network_server_name().await.unwrap(), "backend-3");
    assert_eq!(client.network_server_name().await.unwrap(), "backend-3");
    assert_eq!(who_am_i_calls.load(Ordering::SeqCst), 1);

    client.close();
}

#[tokio::test]
async fn lists_servers_and_players() {
    let messenger = Arc::new(InMemoryMessenger::new("backend-3", "proxy"));
    let scheduler = ManualScheduler::new();

    let proxy_bus = EventBus::new(Arc::clone(&messenger) as _);
    let _responder = install_proxy_responder(&proxy_bus, Arc::new(AtomicUsize::new(0)));

    let client = NetworkInfoClient::new(
        Arc::clone(&messenger) as _,
        Arc::clone(&scheduler) as Arc<dyn Scheduler>,
    );

    let servers = client.servers().await.unwrap();
    assert_eq!(servers, vec!["backend-1".to_string(), "backend-3".to_string()]);

    let players = client.players().await.unwrap();
    assert_eq!(players.len(), 1);
    assert_eq!(players[0].name, "steve");
    assert_eq!(players[0].server_name, "backend-1");

    client.close();
}
