//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Heartbeat message model and peer links."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! TCP heartbeat links.
//!
//! Frames are newline-delimited JSON. A client opens with a [`Frame::Hello`] carrying
//! its identity and `hex(HMAC-SHA256(serverkey, identity))`; every following line is a
//! [`Frame::Message`]. Lines longer than [`MAX_FRAME_BYTES`] close the connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use failover_common::config::ServerKey;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::transport::{ConnectionParams, HeartbeatLink, InMemoryBus, LinkConnector};
use crate::{log_message, Message, MessageDirection, MessagingError, Result};

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest inbound frame accepted by [`HeartbeatListener`], newline excluded.
pub const MAX_FRAME_BYTES: usize = 16 * 1024;

/// Wire frame exchanged over a heartbeat connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    /// Opening frame authenticating the connecting instance.
    Hello {
        /// Identity of the connecting instance.
        identity: String,
        /// Hex encoded HMAC of the identity under the listener's server key.
        auth: String,
    },
    /// A published message.
    Message {
        /// The message being delivered.
        message: Message,
    },
}

fn keyed_mac(key: &[u8], identity: &str) -> Result<HmacSha256> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|err| MessagingError::Handshake(err.to_string()))?;
    mac.update(identity.as_bytes());
    Ok(mac)
}

/// Authentication tag a client presents for `identity`.
pub fn handshake_tag(key: &ServerKey, identity: &str) -> Result<String> {
    let mac = keyed_mac(key.as_bytes(), identity)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn verify_handshake(key: &ServerKey, identity: &str, auth: &str) -> Result<()> {
    let tag = hex::decode(auth).map_err(|_| MessagingError::Handshake("malformed tag".into()))?;
    keyed_mac(key.as_bytes(), identity)?
        .verify_slice(&tag)
        .map_err(|_| MessagingError::Handshake(format!("bad credentials for '{}'", identity)))
}

fn encode_frame(frame: &Frame) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    Ok(line)
}

async fn write_bounded<W>(writer: &mut W, bytes: &[u8], limit: Duration) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    match timeout(limit, writer.write_all(bytes)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(MessagingError::Unreachable(err.to_string())),
        Err(_) => Err(MessagingError::Unreachable("write timed out".into())),
    }
}

/// Connector opening authenticated TCP links.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
    write_timeout: Duration,
}

impl TcpConnector {
    /// Connector with default connect and write timeouts.
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// Override the connect and write timeouts.
    pub fn with_timeouts(mut self, connect: Duration, write: Duration) -> Self {
        self.connect_timeout = connect;
        self.write_timeout = write;
        self
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LinkConnector for TcpConnector {
    async fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn HeartbeatLink>> {
        let authority = params.address.authority();
        let stream = match timeout(self.connect_timeout, TcpStream::connect(&authority)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(MessagingError::Unreachable(err.to_string())),
            Err(_) => {
                return Err(MessagingError::Unreachable(format!(
                    "connect to {} timed out",
                    authority
                )))
            }
        };
        stream.set_nodelay(true)?;
        let (_reader, mut writer) = stream.into_split();
        let hello = Frame::Hello {
            identity: params.identity.clone(),
            auth: handshake_tag(&params.serverkey, &params.identity)?,
        };
        write_bounded(&mut writer, &encode_frame(&hello)?, self.write_timeout).await?;
        debug!(peer = %params.address, identity = %params.identity, "tcp heartbeat link established");
        Ok(Box::new(TcpLink {
            writer: Mutex::new(Some(writer)),
            connected: AtomicBool::new(true),
            write_timeout: self.write_timeout,
        }))
    }
}

/// Outbound TCP link produced by [`TcpConnector`].
#[derive(Debug)]
pub struct TcpLink {
    writer: Mutex<Option<OwnedWriteHalf>>,
    connected: AtomicBool,
    write_timeout: Duration,
}

#[async_trait]
impl HeartbeatLink for TcpLink {
    async fn publish(&self, message: Message) -> Result<()> {
        let line = encode_frame(&Frame::Message { message })?;
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(MessagingError::Closed);
        };
        let outcome = write_bounded(writer, &line, self.write_timeout).await;
        if outcome.is_err() {
            self.connected.store(false, Ordering::SeqCst);
        }
        outcome
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

/// Listener accepting heartbeat connections and republishing them on a local bus.
#[derive(Debug)]
pub struct HeartbeatListener {
    listener: TcpListener,
    serverkey: ServerKey,
    bus: InMemoryBus,
}

impl HeartbeatListener {
    /// Bind the listener to `authority` (`host:port`).
    pub async fn bind(authority: &str, serverkey: ServerKey, bus: InMemoryBus) -> Result<Self> {
        let listener = TcpListener::bind(authority).await?;
        Ok(Self {
            listener,
            serverkey,
            bus,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires. Open connections are dropped on exit.
    pub async fn serve(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut connections = JoinSet::new();
        info!(address = ?self.listener.local_addr().ok(), "heartbeat listener accepting connections");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("heartbeat listener shutdown");
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => {
                            let key = self.serverkey.clone();
                            let bus = self.bus.clone();
                            connections.spawn(async move {
                                if let Err(err) = handle_connection(stream, key, bus).await {
                                    warn!(%remote, error = %err, "heartbeat connection closed with error");
                                }
                            });
                        }
                        Err(err) => warn!(error = %err, "failed to accept heartbeat connection"),
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
        connections.shutdown().await;
        Ok(())
    }
}

/// Bind a listener on `authority` and serve it until `shutdown` fires.
pub async fn serve_heartbeats(
    authority: &str,
    serverkey: ServerKey,
    bus: InMemoryBus,
    shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    HeartbeatListener::bind(authority, serverkey, bus)
        .await?
        .serve(shutdown)
        .await
}

async fn handle_connection(stream: TcpStream, key: ServerKey, bus: InMemoryBus) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let first = match timeout(HELLO_TIMEOUT, read_frame(&mut reader)).await {
        Ok(line) => line?,
        Err(_) => return Err(MessagingError::Handshake("no hello received".into())),
    };
    let Some(first) = first else {
        return Ok(());
    };
    let identity = match serde_json::from_str::<Frame>(&first) {
        Ok(Frame::Hello { identity, auth }) => {
            verify_handshake(&key, &identity, &auth)?;
            identity
        }
        Ok(Frame::Message { .. }) => {
            return Err(MessagingError::Handshake("message before hello".into()))
        }
        Err(err) => return Err(MessagingError::Handshake(err.to_string())),
    };
    debug!(peer = %identity, "heartbeat client authenticated");

    while let Some(line) = read_frame(&mut reader).await? {
        match serde_json::from_str::<Frame>(&line) {
            Ok(Frame::Message { message }) => {
                log_message(MessageDirection::Inbound, &message);
                bus.publish(message);
            }
            Ok(Frame::Hello { .. }) => debug!(peer = %identity, "ignoring repeated hello"),
            Err(err) => debug!(peer = %identity, error = %err, "dropping malformed frame"),
        }
    }
    debug!(peer = %identity, "heartbeat client disconnected");
    Ok(())
}

/// Read one newline-terminated frame, buffering at most [`MAX_FRAME_BYTES`] + 1 bytes.
async fn read_frame<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let limit = MAX_FRAME_BYTES as u64 + 1;
    let read = (&mut *reader).take(limit).read_until(b'\n', &mut line).await?;
    if read == 0 {
        return Ok(None);
    }
    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    } else if line.len() > MAX_FRAME_BYTES {
        return Err(MessagingError::FrameTooLong(MAX_FRAME_BYTES));
    }
    String::from_utf8(line).map(Some).map_err(|err| {
        MessagingError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    })
}
