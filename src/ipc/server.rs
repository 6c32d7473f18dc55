//! # Privileged-side connection registry.
//!
//! [`IpcServer`] accepts any number of transports. Each transport speaks the
//! wire protocol; a HELLO frame installs a live connection under the
//! transport's [`ConnectionId`].
//!
//! ```text
//!  transport ─► reader task ─┬─ HELLO       ─► retire previous state for id,
//!                            │                 install new Connection
//!                            ├─ MESSAGE     ─► current connection (if live)
//!                            ├─ DISCONNECT  ─► retire current state
//!                            └─ EOF / error ─► retire current state, stop
//! ```
//!
//! ## Rules
//! - At most one live connection per id. A second HELLO under the same id
//!   retires the prior state (firing `on_did_remove_connection`) before the
//!   new one is installed.
//! - Each connection state fires `on_did_remove_connection` exactly once,
//!   whether it ends by DISCONNECT, EOF, transport error or reconnect.
//! - The registry belongs to this server instance; two servers never share ids.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;

use crate::base::{Emitter, Event};
use crate::config::IpcConfig;
use crate::error::ChannelError;
use crate::ipc::channel::{Channel, ChannelRegistry, Connection, ConnectionId, ServerChannel, StreamItem};
use crate::ipc::protocol::{Frame, FrameReader, FrameSender, Protocol, spawn_writer};

struct ConnectionState {
    connection: Connection,
    retired: AtomicBool,
}

impl ConnectionState {
    fn is_live(&self) -> bool {
        !self.retired.load(Ordering::Acquire)
    }
}

struct Inner {
    config: IpcConfig,
    channels: ChannelRegistry,
    connections: Mutex<BTreeMap<ConnectionId, Arc<ConnectionState>>>,
    on_did_add_connection: Emitter<ConnectionId>,
    on_did_remove_connection: Emitter<ConnectionId>,
}

impl Inner {
    /// Disposes `state` once and reports it.
    fn retire(&self, state: &ConnectionState) {
        if state.retired.swap(true, Ordering::AcqRel) {
            return;
        }
        state.connection.dispose();
        tracing::debug!(target: "splithost::ipc", ctx = %state.connection.ctx, "connection removed");
        self.on_did_remove_connection.emit(&state.connection.ctx);
    }

    /// Unregisters `state` if it is still the registered one, then retires it.
    fn release(&self, state: &Arc<ConnectionState>) {
        let ctx = state.connection.ctx;
        {
            let mut connections = self.connections.lock();
            if connections.get(&ctx).is_some_and(|cur| Arc::ptr_eq(cur, state)) {
                connections.remove(&ctx);
            }
        }
        self.retire(state);
    }

    fn install(&self, ctx: ConnectionId, sender: &FrameSender) -> Arc<ConnectionState> {
        let previous = self.connections.lock().remove(&ctx);
        if let Some(previous) = previous {
            tracing::debug!(target: "splithost::ipc", %ctx, "reconnect supersedes live connection");
            self.retire(&previous);
        }

        let state = Arc::new(ConnectionState {
            connection: Connection::new(ctx, Protocol::new(sender.clone()), Arc::clone(&self.channels)),
            retired: AtomicBool::new(false),
        });
        self.connections.lock().insert(ctx, Arc::clone(&state));
        tracing::debug!(target: "splithost::ipc", %ctx, "connection added");
        self.on_did_add_connection.emit(&ctx);
        state
    }

    async fn serve<R>(&self, ctx: ConnectionId, reader: R, sender: FrameSender)
    where
        R: AsyncRead + Unpin,
    {
        let mut frames = FrameReader::new(reader, &self.config);
        let mut current: Option<Arc<ConnectionState>> = None;

        loop {
            match frames.read_next().await {
                Ok(Some(Frame::Hello)) => {
                    current = Some(self.install(ctx, &sender));
                }
                Ok(Some(Frame::Message(payload))) => match &current {
                    Some(state) if state.is_live() => state.connection.protocol().deliver(&payload),
                    _ => {
                        tracing::warn!(target: "splithost::ipc", %ctx, "message without live connection; dropped");
                    }
                },
                Ok(Some(Frame::Disconnect)) => {
                    if let Some(state) = current.take() {
                        self.release(&state);
                    }
                }
                Ok(None) => break,
                Err(err) if err.is_recoverable() => {
                    tracing::warn!(
                        target: "splithost::ipc",
                        %ctx,
                        label = err.as_label(),
                        error = %err,
                        "malformed frame dropped"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        target: "splithost::ipc",
                        %ctx,
                        label = err.as_label(),
                        error = %err,
                        "transport closed with error"
                    );
                    break;
                }
            }
        }

        if let Some(state) = current.take() {
            self.release(&state);
        }
    }
}

/// Accepts endpoint transports and routes channel calls to them.
#[derive(Clone)]
pub struct IpcServer {
    inner: Arc<Inner>,
}

impl fmt::Debug for IpcServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpcServer")
            .field("connections", &self.connections())
            .finish()
    }
}

impl Default for IpcServer {
    fn default() -> Self {
        Self::new(IpcConfig::default())
    }
}

impl IpcServer {
    /// Creates a server with its own empty registry.
    pub fn new(config: IpcConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                channels: Arc::default(),
                connections: Mutex::new(BTreeMap::new()),
                on_did_add_connection: Emitter::new(),
                on_did_remove_connection: Emitter::new(),
            }),
        }
    }

    /// Starts serving one endpoint transport.
    ///
    /// `ctx` is the transport's identity. The returned task ends at EOF or on
    /// a transport error.
    pub fn accept<T>(&self, ctx: ConnectionId, io: T) -> JoinHandle<()>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let sender = spawn_writer(writer, &self.inner.config);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.serve(ctx, reader, sender).await })
    }

    /// Installs `handler` for every connection's requests on `name`.
    pub fn register_channel(&self, name: impl Into<String>, handler: Arc<dyn ServerChannel>) {
        self.inner.channels.lock().insert(name.into(), handler);
    }

    /// Proxy for `name` on whichever live connection satisfies `filter`.
    ///
    /// The connection is resolved on every call, so the proxy follows
    /// reconnects.
    pub fn get_channel(
        &self,
        name: impl Into<String>,
        filter: impl Fn(ConnectionId) -> bool + Send + Sync + 'static,
    ) -> RoutedChannel {
        RoutedChannel {
            inner: Arc::clone(&self.inner),
            name: Arc::from(name.into()),
            filter: Arc::new(filter),
        }
    }

    /// Ids of the live connections, ascending.
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.inner.connections.lock().keys().copied().collect()
    }

    /// Fires after a HELLO installs a connection.
    pub fn on_did_add_connection(&self) -> Event<ConnectionId> {
        self.inner.on_did_add_connection.event()
    }

    /// Fires once per connection state when it goes away.
    pub fn on_did_remove_connection(&self) -> Event<ConnectionId> {
        self.inner.on_did_remove_connection.event()
    }

    /// Retires every live connection.
    pub fn dispose(&self) {
        let states: Vec<_> = std::mem::take(&mut *self.inner.connections.lock())
            .into_values()
            .collect();
        for state in states {
            self.inner.retire(&state);
        }
    }
}

/// Channel proxy addressed by a connection filter.
#[derive(Clone)]
pub struct RoutedChannel {
    inner: Arc<Inner>,
    name: Arc<str>,
    filter: Arc<dyn Fn(ConnectionId) -> bool + Send + Sync>,
}

impl fmt::Debug for RoutedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutedChannel").field("name", &self.name).finish()
    }
}

impl RoutedChannel {
    /// First live connection (by id) accepted by the filter.
    pub fn resolve(&self) -> Result<Channel, ChannelError> {
        let live: Vec<Arc<ConnectionState>> = self
            .inner
            .connections
            .lock()
            .values()
            .filter(|state| state.is_live())
            .cloned()
            .collect();

        live.iter()
            .find(|state| (self.filter)(state.connection.ctx))
            .map(|state| state.connection.channel(&self.name))
            .ok_or_else(|| ChannelError::NoConnection {
                channel: self.name.to_string(),
            })
    }

    /// Invokes `command` on the matching connection.
    pub async fn call<A>(&self, command: &str, arg: A) -> Result<Value, ChannelError>
    where
        A: Serialize + Send,
    {
        let channel = self.resolve()?;
        channel.call(command, arg).await
    }

    /// Like [`call`](Self::call), deserializing the result into `T`.
    pub async fn call_as<T, A>(&self, command: &str, arg: A) -> Result<T, ChannelError>
    where
        T: DeserializeOwned,
        A: Serialize + Send,
    {
        let channel = self.resolve()?;
        channel.call_as(command, arg).await
    }

    /// Streams `event` from the matching connection.
    pub fn listen(&self, event: &str, arg: Value) -> Result<Event<StreamItem>, ChannelError> {
        Ok(self.resolve()?.listen(event, arg))
    }
}
