use async_trait::async_trait;

use crate::error::Result;
use crate::interfaces::messenger::{ListenerSet, MessageListener, Messenger};

/// Synchronous loopback transport: every send is delivered to this process's
/// own listeners with the local server name as the source. Always connected.
pub struct InMemoryMessenger {
    server_name: String,
    proxy_server_name: String,
    listeners: ListenerSet,
}

impl InMemoryMessenger {
    pub fn new(server_name: impl Into<String>, proxy_server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            proxy_server_name: proxy_server_name.into(),
            listeners: ListenerSet::new(),
        }
    }
}

#[async_trait]
impl Messenger for InMemoryMessenger {
    async fn send_to_all(&self, channel: &str, data: &str) -> Result<()> {
        self.listeners.dispatch(channel, data, &self.server_name);
        Ok(())
    }

    async fn send_to_server(&self, channel: &str, _server_name: &str, data: &str) -> Result<()> {
        self.listeners.dispatch(channel, data, &self.server_name);
        Ok(())
    }

    async fn send_to_proxy(&self, channel: &str, data: &str) -> Result<()> {
        self.listeners.dispatch(channel, data, &self.server_name);
        Ok(())
    }

    fn register_listener(&self, channel: &str, listener: MessageListener) {
        self.listeners.add(channel, listener);
    }

    fn unregister_listener(&self, channel: &str, listener: &MessageListener) {
        self.listeners.remove(channel, listener);
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn delivers_sends_to_local_listeners() {
        let messenger = InMemoryMessenger::new("alpha", "proxy");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let listener: MessageListener = {
            let seen = Arc::clone(&seen);
            Arc::new(move |channel, data, source| {
                seen.lock()
                    .unwrap()
                    .push(format!("{channel}|{data}|{source}"));
            })
        };
        messenger.register_listener("ch", Arc::clone(&listener));

        messenger.send_to_all("ch", "a").await.unwrap();
        messenger.send_to_server("ch", "elsewhere", "b").await.unwrap();
        messenger.send_to_proxy("ch", "c").await.unwrap();
        messenger.send_to_all("other", "d").await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["ch|a|alpha", "ch|b|alpha", "ch|c|alpha"]
        );

        messenger.unregister_listener("ch", &listener);
        messenger.send_to_all("ch", "e").await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 3);
    }
}
