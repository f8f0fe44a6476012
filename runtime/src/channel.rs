//! Command channel to the simulation agent.
//!
//! One persistent TCP connection per session. Every statement is written
//! as one newline-terminated message; replies are read positionally, so a
//! request is always exactly one send followed by exactly one receive.
//!
//! All operations take `&mut self`. The channel has a single writer, and
//! the borrow checker enforces it: there is no way to interleave two
//! requests on one channel.
//!
//! A request abandoned after its query went out (a poll deadline or a
//! cancellation dropping the future) still gets answered by the agent.
//! The channel counts such replies and reads them off before the next
//! query, so a reply always pairs with the query that asked for it. A
//! write abandoned halfway leaves a partial statement on the wire; the
//! channel is then desynchronized and refuses further I/O.

use std::time::Duration;

use async_trait::async_trait;
use opennet_core::config::AgentConfig;
use opennet_core::error::{NetError, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::script::Statement;

/// Byte transport under an [`AgentChannel`].
#[async_trait]
pub trait Transport: Send {
    /// Write all bytes.
    async fn send(&mut self, bytes: &[u8]) -> std::io::Result<()>;

    /// Read at most `max` bytes. An empty result means end of stream.
    async fn recv(&mut self, max: usize) -> std::io::Result<Vec<u8>>;

    /// Close the transport.
    async fn shutdown(&mut self) -> std::io::Result<()>;
}

/// TCP transport to a remote agent
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Single connection attempt; the caller decides whether to retry.
    pub async fn try_connect(address: &str) -> std::io::Result<Self> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    async fn recv(&mut self, max: usize) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; max];
        let n = self.stream.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        self.stream.shutdown().await
    }
}

/// Reply to one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Sequence number of the request this reply answers
    pub seq: u64,
    pub bytes: Vec<u8>,
}

/// Persistent statement channel to the simulation agent
pub struct AgentChannel {
    peer: String,
    transport: Option<Box<dyn Transport>>,
    next_seq: u64,
    /// Replies owed by the agent for requests nobody waited for
    unanswered: u32,
    /// Set while a write is in progress; still set afterwards if the
    /// write was dropped midway
    writing: bool,
}

impl std::fmt::Debug for AgentChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentChannel")
            .field("peer", &self.peer)
            .field("open", &self.is_open())
            .field("next_seq", &self.next_seq)
            .field("unanswered", &self.unanswered)
            .finish()
    }
}

impl AgentChannel {
    /// Wrap an already-connected transport.
    pub fn from_transport(peer: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        Self {
            peer: peer.into(),
            transport: Some(transport),
            next_seq: 1,
            unanswered: 0,
            writing: false,
        }
    }

    /// Connect to the agent, retrying with exponential backoff.
    ///
    /// Refused or unreachable connections are retried until one succeeds,
    /// the policy's timeout elapses, or `cancel` fires.
    pub async fn connect(config: &AgentConfig, cancel: &CancellationToken) -> Result<Self> {
        let address = config.endpoint();
        let policy = &config.connect;
        let deadline = policy.timeout().map(|t| tokio::time::Instant::now() + t);
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            tracing::info!(agent = %address, attempt = attempts, "Connecting to opennet-agent");

            let last_error = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(NetError::Cancelled(format!("connect to {}", address)));
                }
                result = TcpTransport::try_connect(&address) => match result {
                    Ok(transport) => {
                        tracing::info!(agent = %address, attempts, "Connected to opennet-agent");
                        return Ok(Self::from_transport(address, Box::new(transport)));
                    }
                    Err(e) => e,
                },
            };

            tracing::debug!(agent = %address, error = %last_error, "Agent connect failed, retrying");

            let mut delay = policy.backoff(attempts - 1);
            if let Some(deadline) = deadline {
                let now = tokio::time::Instant::now();
                if now >= deadline {
                    return Err(NetError::Connect {
                        address,
                        attempts,
                        message: last_error.to_string(),
                    });
                }
                delay = delay.min(deadline - now);
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(NetError::Cancelled(format!("connect to {}", address)));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Address of the agent.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    /// Number of sequence numbers handed out so far.
    pub fn sent(&self) -> u64 {
        self.next_seq - 1
    }

    /// Replies still owed for abandoned requests.
    pub fn unanswered(&self) -> u32 {
        self.unanswered
    }

    fn transport(&mut self) -> Result<&mut Box<dyn Transport>> {
        if self.writing {
            return Err(NetError::Protocol(format!(
                "channel to {} desynchronized by an interrupted write",
                self.peer
            )));
        }
        self.transport.as_mut().ok_or(NetError::ChannelClosed)
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.transport()?;
        self.writing = true;
        if let Some(transport) = self.transport.as_mut() {
            transport.send(bytes).await?;
        }
        self.writing = false;
        Ok(())
    }

    /// Read off replies to requests that were abandoned in flight.
    async fn drain(&mut self, max: usize) -> Result<()> {
        while self.unanswered > 0 {
            let late = self.recv(max).await?;
            self.unanswered -= 1;
            tracing::debug!(
                agent = %self.peer,
                reply = %String::from_utf8_lossy(&late),
                "Discarded late reply"
            );
        }
        Ok(())
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Send one already-rendered statement. No acknowledgement is awaited.
    pub async fn send_text(&mut self, text: &str) -> Result<u64> {
        let seq = self.take_seq();
        tracing::debug!(seq, statement = %text.trim_end(), "Sending statement");
        self.write(text.as_bytes()).await?;
        Ok(seq)
    }

    /// Render and send one statement.
    pub async fn send(&mut self, statement: &Statement) -> Result<u64> {
        let text = statement.render()?;
        self.send_text(&text).await
    }

    /// Blocking read of at most `max` bytes.
    pub async fn recv(&mut self, max: usize) -> Result<Vec<u8>> {
        let bytes = self.transport()?.recv(max).await?;
        if bytes.is_empty() {
            return Err(NetError::Protocol(format!(
                "agent {} closed the connection",
                self.peer
            )));
        }
        Ok(bytes)
    }

    /// One query and its reply.
    ///
    /// The query is tagged with its sequence number and the reply carries
    /// it back; the agent itself does not echo it. Late replies to earlier
    /// abandoned requests are consumed first.
    pub async fn request(&mut self, statement: &Statement, max: usize) -> Result<Reply> {
        if !statement.expects_reply() {
            return Err(NetError::Protocol(
                "request() needs a statement the agent answers".to_string(),
            ));
        }
        let text = statement.render_tagged(self.next_seq)?;
        self.drain(max).await?;

        let seq = self.take_seq();
        tracing::trace!(seq, query = %text.lines().next().unwrap_or_default(), "Sending query");
        self.write(text.as_bytes()).await?;
        // Owed until read, including when this future is dropped
        self.unanswered += 1;
        let bytes = self.recv(max).await?;
        self.unanswered -= 1;
        tracing::trace!(seq, reply = %String::from_utf8_lossy(&bytes), "Query reply");
        Ok(Reply { seq, bytes })
    }

    /// Close the connection. A second close, and any I/O afterwards,
    /// fails with [`NetError::ChannelClosed`].
    pub async fn close(&mut self) -> Result<()> {
        let mut transport = self.transport.take().ok_or(NetError::ChannelClosed)?;
        tracing::info!(agent = %self.peer, "Closing agent channel");
        transport.shutdown().await?;
        Ok(())
    }
}

/// Sleep for `delay` unless `cancel` fires first.
pub(crate) async fn cancellable_sleep(
    delay: Duration,
    cancel: &CancellationToken,
) -> std::result::Result<(), ()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(()),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
