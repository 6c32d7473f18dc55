//! # UI-side connection.
//!
//! [`IpcClient`] owns exactly one transport: it sends HELLO as its first
//! frame, then multiplexes channels both ways over it. [`disconnect`]
//! sends DISCONNECT and closes the transport.
//!
//! [`disconnect`]: IpcClient::disconnect

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::base::{Emitter, Event};
use crate::config::IpcConfig;
use crate::error::ProtocolError;
use crate::ipc::channel::{Channel, ChannelRegistry, Connection, ConnectionId, ServerChannel};
use crate::ipc::protocol::{Frame, FrameReader, FrameSender, Protocol, spawn_writer};

struct Inner {
    ctx: ConnectionId,
    channels: ChannelRegistry,
    connection: Connection,
    sender: FrameSender,
    closed: AtomicBool,
    on_did_disconnect: Emitter<()>,
}

impl Inner {
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.connection.dispose();
        tracing::debug!(target: "splithost::ipc", ctx = %self.ctx, "client disconnected");
        self.on_did_disconnect.emit(&());
        self.on_did_disconnect.dispose();
    }
}

/// One endpoint's connection to the privileged side.
#[derive(Clone)]
pub struct IpcClient {
    inner: Arc<Inner>,
}

impl fmt::Debug for IpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpcClient")
            .field("ctx", &self.inner.ctx)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl IpcClient {
    /// Sends HELLO over `io` and starts serving it.
    pub fn connect<T>(ctx: ConnectionId, io: T, config: &IpcConfig) -> Result<Self, ProtocolError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let sender = spawn_writer(writer, config);
        sender.send(Frame::Hello)?;

        let channels: ChannelRegistry = Arc::default();
        let connection = Connection::new(ctx, Protocol::new(sender.clone()), Arc::clone(&channels));
        let inner = Arc::new(Inner {
            ctx,
            channels,
            connection,
            sender,
            closed: AtomicBool::new(false),
            on_did_disconnect: Emitter::new(),
        });

        let reader_inner = Arc::clone(&inner);
        let config = config.clone();
        tokio::spawn(async move {
            let mut frames = FrameReader::new(reader, &config);
            loop {
                match frames.read_next().await {
                    Ok(Some(Frame::Message(payload))) => {
                        reader_inner.connection.protocol().deliver(&payload);
                    }
                    Ok(Some(other)) => {
                        tracing::warn!(target: "splithost::ipc", frame = ?other, "unexpected frame from server; dropped");
                    }
                    Ok(None) => break,
                    Err(err) if err.is_recoverable() => {
                        tracing::warn!(target: "splithost::ipc", error = %err, "malformed frame dropped");
                    }
                    Err(err) => {
                        tracing::warn!(target: "splithost::ipc", error = %err, "transport closed with error");
                        break;
                    }
                }
            }
            reader_inner.close();
        });

        Ok(Self { inner })
    }

    /// This endpoint's identity.
    #[inline]
    pub fn ctx(&self) -> ConnectionId {
        self.inner.ctx
    }

    /// Proxy for the privileged side's `name` channel.
    pub fn get_channel(&self, name: &str) -> Channel {
        self.inner.connection.channel(name)
    }

    /// Serves `name` to the privileged side.
    pub fn register_channel(&self, name: impl Into<String>, handler: Arc<dyn ServerChannel>) {
        self.inner.channels.lock().insert(name.into(), handler);
    }

    /// True until the transport closes or [`disconnect`](Self::disconnect) runs.
    pub fn is_connected(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
    }

    /// Fires once when the connection ends.
    pub fn on_did_disconnect(&self) -> Event<()> {
        self.inner.on_did_disconnect.event()
    }

    /// Sends DISCONNECT and tears the connection down. Idempotent.
    pub fn disconnect(&self) {
        if self.is_connected() {
            let _ = self.inner.sender.send(Frame::Disconnect);
        }
        self.inner.close();
    }
}
