//! The byte stream a session talks over.
//!
//! [`Connector`] opens [`Channel`]s; the session never touches sockets
//! directly, so tests can substitute an in-memory server.

use std::{fmt::Debug, future::Future, time::Duration};

use async_trait::async_trait;
use emissary_common::config::ClientTimeouts;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};

use crate::error::ChannelError;

/// Longest reply line accepted from a server.
pub const MAX_LINE_LENGTH: usize = 4096;

/// A connected, line-oriented duplex stream.
#[async_trait]
pub trait Channel: Send + Sync + Debug {
    /// Writes `bytes` verbatim.
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), ChannelError>;

    /// Reads one line, without its line terminator.
    async fn read_line(&mut self) -> Result<String, ChannelError>;

    /// Closes the stream. Errors are for reporting only; the channel is
    /// unusable afterwards either way.
    async fn terminate(&mut self) -> Result<(), ChannelError>;

    /// Marks whether the next reply is the one following the end-of-data
    /// marker, which servers may take much longer to send.
    fn awaiting_data_reply(&mut self, _awaiting: bool) {}

    /// Writes `line` followed by CRLF.
    async fn write_line(&mut self, line: &str) -> Result<(), ChannelError> {
        let mut bytes = Vec::with_capacity(line.len() + 2);
        bytes.extend_from_slice(line.as_bytes());
        bytes.extend_from_slice(b"\r\n");
        self.write_all(&bytes).await
    }
}

/// Opens channels to remote hosts.
#[async_trait]
pub trait Connector: Send + Sync + Debug {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn Channel>, ChannelError>;
}

/// Plain TCP connections with per-phase timeouts.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    timeouts: ClientTimeouts,
}

impl TcpConnector {
    #[must_use]
    pub const fn new(timeouts: ClientTimeouts) -> Self {
        Self { timeouts }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn Channel>, ChannelError> {
        let stream = with_timeout(self.timeouts.connect(), TcpStream::connect((host, port)))
            .await?
            .map_err(|source| ChannelError::Connect {
                host: host.to_string(),
                port,
                source,
            })?;

        let (reader, writer) = stream.into_split();

        Ok(Box::new(TcpChannel {
            reader: BufReader::new(reader),
            writer,
            timeouts: self.timeouts.clone(),
            awaiting_data_reply: false,
        }))
    }
}

#[derive(Debug)]
pub struct TcpChannel {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    timeouts: ClientTimeouts,
    awaiting_data_reply: bool,
}

#[async_trait]
impl Channel for TcpChannel {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        with_timeout(self.timeouts.command(), async {
            self.writer.write_all(bytes).await?;
            self.writer.flush().await
        })
        .await??;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String, ChannelError> {
        let limit = if self.awaiting_data_reply {
            self.timeouts.data()
        } else {
            self.timeouts.command()
        };

        let mut buffer = Vec::new();
        let mut bounded = (&mut self.reader).take(MAX_LINE_LENGTH as u64 + 1);
        let read = with_timeout(limit, bounded.read_until(b'\n', &mut buffer)).await??;

        if read == 0 {
            return Err(ChannelError::ConnectionClosed);
        }
        if buffer.len() > MAX_LINE_LENGTH {
            return Err(ChannelError::LineTooLong(MAX_LINE_LENGTH));
        }

        while matches!(buffer.last(), Some(b'\n' | b'\r')) {
            buffer.pop();
        }

        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    async fn terminate(&mut self) -> Result<(), ChannelError> {
        self.writer.shutdown().await?;
        Ok(())
    }

    fn awaiting_data_reply(&mut self, awaiting: bool) {
        self.awaiting_data_reply = awaiting;
    }
}

async fn with_timeout<T>(limit: Duration, future: impl Future<Output = T>) -> Result<T, ChannelError> {
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| ChannelError::Timeout(limit))
}
