use bytes::BytesMut;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

use crate::broker::config::BrokerConfig;
use crate::error::{FleetwireError, Result};
use crate::interfaces::transport::{BoxedStream, Transport};

/// One decoded RESP reply. Error replies surface as `Err` from the reader
/// instead of a frame variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    Simple(String),
    Integer(i64),
    Bulk(Option<String>),
    Array(Option<Vec<Frame>>),
}

/// A single broker connection speaking the array/bulk-string wire protocol.
/// Not safe for concurrent use; callers serialize access.
pub(crate) struct BrokerConnection {
    stream: BufReader<BoxedStream>,
}

impl BrokerConnection {
    pub(crate) async fn connect(
        config: &BrokerConfig,
        transport: &dyn Transport,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(
            config.connect_timeout(),
            transport.connect(config.host(), config.port()),
        )
        .await
        .map_err(|_| {
            FleetwireError::Transport(format!(
                "connect to {}:{} timed out",
                config.host(),
                config.port()
            ))
        })??;

        let mut conn = Self {
            stream: BufReader::new(stream),
        };
        conn.authenticate(config).await?;
        conn.set_client_name(config).await?;
        Ok(conn)
    }

    #[cfg(test)]
    pub(crate) fn from_stream(stream: BoxedStream) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    async fn authenticate(&mut self, config: &BrokerConfig) -> Result<()> {
        let Some(password) = config.password() else {
            return Ok(());
        };
        match config.username() {
            Some(username) => self.send_command(&["AUTH", username, password]).await?,
            None => self.send_command(&["AUTH", password]).await?,
        }
        self.read_reply().await?;
        Ok(())
    }

    async fn set_client_name(&mut self, config: &BrokerConfig) -> Result<()> {
        let Some(client_name) = config.client_name() else {
            return Ok(());
        };
        self.send_command(&["CLIENT", "SETNAME", client_name]).await?;
        self.read_reply().await?;
        Ok(())
    }

    pub(crate) async fn subscribe(&mut self, channel: &str) -> Result<()> {
        self.send_command(&["SUBSCRIBE", channel]).await
    }

    pub(crate) async fn publish(&mut self, channel: &str, payload: &str) -> Result<()> {
        self.send_command(&["PUBLISH", channel, payload]).await?;
        self.read_reply().await?; // integer reply
        Ok(())
    }

    pub(crate) async fn send_command(&mut self, args: &[&str]) -> Result<()> {
        let mut buf = BytesMut::with_capacity(64);
        buf.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
        for arg in args {
            let bytes = arg.as_bytes();
            buf.extend_from_slice(format!("${}\r\n", bytes.len()).as_bytes());
            buf.extend_from_slice(bytes);
            buf.extend_from_slice(b"\r\n");
        }
        self.stream.write_all(&buf).await.map_err(io_error)?;
        self.stream.flush().await.map_err(io_error)?;
        Ok(())
    }

    pub(crate) fn read_reply(&mut self) -> BoxFuture<'_, Result<Frame>> {
        async move {
            let prefix = self.read_byte().await?;
            match prefix {
                b'+' => Ok(Frame::Simple(self.read_line().await?)),
                b'-' => Err(FleetwireError::Transport(format!(
                    "broker error: {}",
                    self.read_line().await?
                ))),
                b':' => {
                    let line = self.read_line().await?;
                    line.parse()
                        .map(Frame::Integer)
                        .map_err(|_| malformed("invalid integer reply"))
                }
                b'$' => self.read_bulk().await,
                b'*' => self.read_array().await,
                other => Err(malformed(&format!(
                    "unexpected frame prefix: {}",
                    other as char
                ))),
            }
        }
        .boxed()
    }

    async fn read_bulk(&mut self) -> Result<Frame> {
        let len: i64 = self
            .read_line()
            .await?
            .parse()
            .map_err(|_| malformed("invalid bulk length"))?;
        if len < 0 {
            return Ok(Frame::Bulk(None));
        }
        let mut buf = vec![0u8; len as usize];
        self.stream.read_exact(&mut buf).await.map_err(io_error)?;
        self.expect_crlf().await?;
        Ok(Frame::Bulk(Some(
            String::from_utf8_lossy(&buf).into_owned(),
        )))
    }

    async fn read_array(&mut self) -> Result<Frame> {
        let count: i64 = self
            .read_line()
            .await?
            .parse()
            .map_err(|_| malformed("invalid array length"))?;
        if count < 0 {
            return Ok(Frame::Array(None));
        }
        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            items.push(self.read_reply().await?);
        }
        Ok(Frame::Array(Some(items)))
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = Vec::new();
        let read = self
            .stream
            .read_until(b'\n', &mut line)
            .await
            .map_err(io_error)?;
        if read == 0 {
            return Err(FleetwireError::Transport("broker connection closed".into()));
        }
        if line.pop() != Some(b'\n') || line.pop() != Some(b'\r') {
            return Err(malformed("invalid line ending"));
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    async fn read_byte(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.stream.read_exact(&mut byte).await.map_err(io_error)?;
        Ok(byte[0])
    }

    async fn expect_crlf(&mut self) -> Result<()> {
        let mut crlf = [0u8; 2];
        self.stream.read_exact(&mut crlf).await.map_err(io_error)?;
        if &crlf != b"\r\n" {
            return Err(malformed("invalid bulk string termination"));
        }
        Ok(())
    }
}

fn io_error(err: std::io::Error) -> FleetwireError {
    FleetwireError::Transport(err.to_string())
}

fn malformed(message: &str) -> FleetwireError {
    FleetwireError::Transport(format!("malformed broker frame: {message}"))
}
