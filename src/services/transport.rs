use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::error::{FleetwireError, Result};
use crate::interfaces::transport::{BoxedStream, Transport};

/// Plain TCP transport.
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, host: &str, port: u16) -> Result<BoxedStream> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| FleetwireError::Transport(e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| FleetwireError::Transport(e.to_string()))?;
        Ok(Box::new(stream))
    }
}

/// TLS transport using the webpki root set.
pub struct TlsTransport {
    connector: TlsConnector,
}

impl TlsTransport {
    pub fn new() -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            connector: TlsConnector::from(Arc::new(config)),
        }
    }
}

impl Default for TlsTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TlsTransport {
    async fn connect(&self, host: &str, port: u16) -> Result<BoxedStream> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| FleetwireError::Transport(e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| FleetwireError::Transport(e.to_string()))?;
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| FleetwireError::Config(format!("invalid tls host name: {e}")))?;
        let tls = self
            .connector
            .connect(server_name, stream)
            .await
            .map_err(|e| FleetwireError::Transport(e.to_string()))?;
        Ok(Box::new(tls))
    }
}
