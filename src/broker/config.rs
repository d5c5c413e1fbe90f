use std::fmt;
use std::time::Duration;

use crate::error::{FleetwireError, Result};

pub const DEFAULT_TRANSPORT_CHANNEL: &str = "fleetwire:bridge";

/// Connection settings for the external pub/sub broker.
#[derive(Clone)]
pub struct BrokerConfig {
    host: String,
    port: u16,
    tls: bool,
    username: Option<String>,
    password: Option<String>,
    transport_channel: String,
    server_name: String,
    proxy_server_name: String,
    connect_timeout: Duration,
    socket_timeout: Duration,
    reconnect_delay: Duration,
    client_name: Option<String>,
}

impl BrokerConfig {
    pub fn builder() -> BrokerConfigBuilder {
        BrokerConfigBuilder::default()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn tls(&self) -> bool {
        self.tls
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn transport_channel(&self) -> &str {
        &self.transport_channel
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn proxy_server_name(&self) -> &str {
        &self.proxy_server_name
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn socket_timeout(&self) -> Duration {
        self.socket_timeout
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }

    pub fn client_name(&self) -> Option<&str> {
        self.client_name.as_deref()
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("transport_channel", &self.transport_channel)
            .field("server_name", &self.server_name)
            .field("proxy_server_name", &self.proxy_server_name)
            .field("connect_timeout", &self.connect_timeout)
            .field("socket_timeout", &self.socket_timeout)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("client_name", &self.client_name)
            .finish()
    }
}

pub struct BrokerConfigBuilder {
    host: String,
    port: u16,
    tls: bool,
    username: Option<String>,
    password: Option<String>,
    transport_channel: String,
    server_name: String,
    proxy_server_name: String,
    connect_timeout: Duration,
    socket_timeout: Duration,
    reconnect_delay: Duration,
    client_name: Option<String>,
}

impl Default for BrokerConfigBuilder {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            tls: false,
            username: None,
            password: None,
            transport_channel: DEFAULT_TRANSPORT_CHANNEL.to_string(),
            server_name: String::new(),
            proxy_server_name: "proxy".to_string(),
            connect_timeout: Duration::from_secs(5),
            socket_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(2),
            client_name: None,
        }
    }
}

impl BrokerConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = empty_to_none(username.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = empty_to_none(password.into());
        self
    }

    pub fn transport_channel(mut self, transport_channel: impl Into<String>) -> Self {
        self.transport_channel = transport_channel.into();
        self
    }

    pub fn server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }

    pub fn proxy_server_name(mut self, proxy_server_name: impl Into<String>) -> Self {
        self.proxy_server_name = proxy_server_name.into();
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn socket_timeout(mut self, socket_timeout: Duration) -> Self {
        self.socket_timeout = socket_timeout;
        self
    }

    pub fn reconnect_delay(mut self, reconnect_delay: Duration) -> Self {
        self.reconnect_delay = reconnect_delay;
        self
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = empty_to_none(client_name.into());
        self
    }

    pub fn build(self) -> Result<BrokerConfig> {
        let host = require_non_blank(self.host, "host")?;
        let server_name = require_non_blank(self.server_name, "server name")?;
        let transport_channel = require_non_blank(self.transport_channel, "transport channel")?;
        let proxy_server_name = require_non_blank(self.proxy_server_name, "proxy server name")?;
        if self.port == 0 {
            return Err(FleetwireError::Config("port must be between 1 and 65535".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(FleetwireError::Config("connect timeout must be positive".into()));
        }
        let client_name = self
            .client_name
            .unwrap_or_else(|| format!("fleetwire-{server_name}"));

        Ok(BrokerConfig {
            host,
            port: self.port,
            tls: self.tls,
            username: self.username,
            password: self.password,
            transport_channel,
            server_name,
            proxy_server_name,
            connect_timeout: self.connect_timeout,
            socket_timeout: self.socket_timeout,
            reconnect_delay: self.reconnect_delay,
            client_name: Some(client_name),
        })
    }
}

fn require_non_blank(value: String, name: &str) -> Result<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        return Err(FleetwireError::Config(format!("{name} must not be blank")));
    }
    Ok(trimmed)
}

fn empty_to_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
