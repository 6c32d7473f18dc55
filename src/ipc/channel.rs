//! # Channel multiplexing over one [`Protocol`].
//!
//! Every live connection runs both halves on each end:
//!
//! ```text
//!                       Protocol (one logical duplex)
//!   ┌───────────────────────────┬──────────────────────────────┐
//!   │ ChannelServer             │ ChannelClient                │
//!   │  request/subscribe/unsub  │  initialize/success/error/   │
//!   │  ─► ServerChannel handler │  event ─► pending calls and  │
//!   │                           │  listen streams, by id       │
//!   └───────────────────────────┴──────────────────────────────┘
//! ```
//!
//! ## Rules
//! - The serving half announces itself with `Initialize`; the client half
//!   queues outgoing requests until it sees the remote one.
//! - Each call and each listen stream gets its own id; responses are matched
//!   by id, never by arrival order.
//! - Unknown channels and commands fail the one call with an error reply.
//! - On disconnect every pending call is rejected with
//!   [`ChannelError::Disconnected`] and every listen stream receives a final
//!   `Err(Disconnected)` before it is torn down.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::base::event::WeakEmitter;
use crate::base::{Emitter, EmitterOptions, Event, Subscription};
use crate::error::{ChannelError, ProtocolError};
use crate::ipc::message::Message;
use crate::ipc::protocol::Protocol;

/// Identity of one connected endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Items streamed by [`Channel::listen`].
pub type StreamItem = Result<Value, ChannelError>;

/// # Handler for one named channel.
///
/// `ctx` identifies the connection the request came from. Dispatch on
/// `command`/`event` with a `match` over the channel's command enum.
#[async_trait]
pub trait ServerChannel: Send + Sync + 'static {
    /// Handles one command invocation.
    async fn call(&self, ctx: ConnectionId, command: &str, arg: Value) -> Result<Value, ChannelError>;

    /// Opens an event stream.
    fn listen(&self, ctx: ConnectionId, event: &str, arg: Value) -> Result<Event<Value>, ChannelError>;
}

/// Channel handlers registered on one end, shared by all of its connections.
pub(crate) type ChannelRegistry = Arc<Mutex<HashMap<String, Arc<dyn ServerChannel>>>>;

impl From<ProtocolError> for ChannelError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::NotConnected => ChannelError::Disconnected,
            other => ChannelError::Codec {
                message: other.to_string(),
            },
        }
    }
}

/// Serving half of a connection.
pub(crate) struct ChannelServer {
    ctx: ConnectionId,
    protocol: Protocol,
    channels: ChannelRegistry,
    streams: Mutex<HashMap<u32, Subscription>>,
    token: CancellationToken,
}

impl ChannelServer {
    pub(crate) fn new(ctx: ConnectionId, protocol: Protocol, channels: ChannelRegistry) -> Arc<Self> {
        let server = Arc::new(Self {
            ctx,
            protocol,
            channels,
            streams: Mutex::new(HashMap::new()),
            token: CancellationToken::new(),
        });
        server.reply(&Message::Initialize);
        server
    }

    fn handler(&self, channel: &str) -> Option<Arc<dyn ServerChannel>> {
        self.channels.lock().get(channel).cloned()
    }

    fn reply(&self, msg: &Message) {
        let sent = msg
            .encode()
            .and_then(|payload| self.protocol.send(payload).map_err(ChannelError::from));
        if let Err(err) = sent {
            tracing::debug!(
                target: "splithost::ipc",
                ctx = %self.ctx,
                error = %err,
                "reply not sent"
            );
        }
    }

    fn handle(self: &Arc<Self>, msg: Message) {
        match msg {
            Message::Request {
                id,
                channel,
                command,
                arg,
            } => {
                let Some(handler) = self.handler(&channel) else {
                    let err = ChannelError::UnknownChannel { channel };
                    self.reply(&Message::Error {
                        id,
                        message: err.as_message(),
                    });
                    return;
                };
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    let outcome = tokio::select! {
                        _ = this.token.cancelled() => return,
                        outcome = handler.call(this.ctx, &command, arg) => outcome,
                    };
                    let reply = match outcome {
                        Ok(data) => Message::Success { id, data },
                        Err(err) => {
                            tracing::debug!(
                                target: "splithost::ipc",
                                ctx = %this.ctx,
                                %channel,
                                %command,
                                label = err.as_label(),
                                "call failed"
                            );
                            Message::Error {
                                id,
                                message: err.as_message(),
                            }
                        }
                    };
                    this.reply(&reply);
                });
            }
            Message::Subscribe {
                id,
                channel,
                event,
                arg,
            } => {
                let opened = match self.handler(&channel) {
                    Some(handler) => handler.listen(self.ctx, &event, arg),
                    None => Err(ChannelError::UnknownChannel { channel }),
                };
                match opened {
                    Ok(source) => {
                        let protocol = self.protocol.clone();
                        let sub = source.subscribe(move |data: &Value| {
                            let forwarded = Message::Event {
                                id,
                                data: data.clone(),
                            }
                            .encode()
                            .and_then(|payload| protocol.send(payload).map_err(ChannelError::from));
                            if let Err(err) = forwarded {
                                tracing::debug!(target: "splithost::ipc", id, error = %err, "event not forwarded");
                            }
                        });
                        let replaced = self.streams.lock().insert(id, sub);
                        if let Some(old) = replaced {
                            old.dispose();
                        }
                    }
                    Err(err) => self.reply(&Message::Error {
                        id,
                        message: err.as_message(),
                    }),
                }
            }
            Message::Unsubscribe { id } => {
                let removed = self.streams.lock().remove(&id);
                if let Some(sub) = removed {
                    sub.dispose();
                }
            }
            _ => {}
        }
    }

    fn dispose(&self) {
        self.token.cancel();
        let streams: Vec<Subscription> = self.streams.lock().drain().map(|(_, sub)| sub).collect();
        for sub in streams {
            sub.dispose();
        }
    }
}

#[derive(Default)]
struct ClientState {
    initialized: bool,
    disposed: bool,
    outbox: Vec<Bytes>,
    pending: HashMap<u32, oneshot::Sender<StreamItem>>,
    /// Open remote streams; an entry lives from Subscribe until Unsubscribe or dispose.
    streams: HashMap<u32, Emitter<StreamItem>>,
}

/// Calling half of a connection.
pub(crate) struct ChannelClient {
    protocol: Protocol,
    state: Mutex<ClientState>,
    next_id: AtomicU32,
}

struct PendingGuard<'a> {
    client: &'a ChannelClient,
    id: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.client.state.lock().pending.remove(&self.id);
    }
}

impl ChannelClient {
    pub(crate) fn new(protocol: Protocol) -> Arc<Self> {
        Arc::new(Self {
            protocol,
            state: Mutex::new(ClientState::default()),
            next_id: AtomicU32::new(0),
        })
    }

    fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends now if initialized, queues otherwise.
    fn dispatch(&self, msg: &Message) -> Result<(), ChannelError> {
        let payload = msg.encode()?;
        let mut state = self.state.lock();
        if state.disposed {
            return Err(ChannelError::Disconnected);
        }
        if !state.initialized {
            state.outbox.push(payload);
            return Ok(());
        }
        self.protocol.send(payload)?;
        Ok(())
    }

    pub(crate) async fn call(&self, channel: &str, command: &str, arg: Value) -> StreamItem {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            if state.disposed {
                return Err(ChannelError::Disconnected);
            }
            state.pending.insert(id, tx);
        }
        let _guard = PendingGuard { client: self, id };

        self.dispatch(&Message::Request {
            id,
            channel: channel.to_string(),
            command: command.to_string(),
            arg,
        })?;

        rx.await.unwrap_or(Err(ChannelError::Disconnected))
    }

    pub(crate) fn listen(self: &Arc<Self>, channel: &str, event: &str, arg: Value) -> Event<StreamItem> {
        let id = self.next_id();
        let target: Arc<OnceLock<WeakEmitter<StreamItem>>> = Arc::new(OnceLock::new());
        let subscribe = Message::Subscribe {
            id,
            channel: channel.to_string(),
            event: event.to_string(),
            arg,
        };

        let open = {
            let client = Arc::downgrade(self);
            let target = Arc::clone(&target);
            move || {
                let (Some(client), Some(emitter)) = (client.upgrade(), target.get()) else {
                    return;
                };
                client.open_stream(id, emitter, &subscribe);
            }
        };
        let close = {
            let client: Weak<Self> = Arc::downgrade(self);
            move || {
                if let Some(client) = client.upgrade() {
                    client.close_stream(id);
                }
            }
        };

        let emitter = Emitter::with_options(
            EmitterOptions::new()
                .on_first_listener(open)
                .on_last_listener_removed(close),
        );
        let _ = target.set(emitter.downgrade());
        emitter.event()
    }

    fn open_stream(&self, id: u32, emitter: &WeakEmitter<StreamItem>, subscribe: &Message) {
        let disposed = {
            let mut state = self.state.lock();
            if !state.disposed {
                if let Some(live) = emitter.upgrade() {
                    state.streams.insert(id, live);
                }
            }
            state.disposed
        };
        if disposed {
            if let Some(live) = emitter.upgrade() {
                live.emit(&Err(ChannelError::Disconnected));
            }
            return;
        }
        if let Err(err) = self.dispatch(subscribe) {
            tracing::debug!(target: "splithost::ipc", id, error = %err, "subscribe not sent");
        }
    }

    fn close_stream(&self, id: u32) {
        let live = {
            let mut state = self.state.lock();
            state.streams.remove(&id).is_some() && !state.disposed
        };
        if live {
            let _ = self.dispatch(&Message::Unsubscribe { id });
        }
    }

    fn stream(&self, id: u32) -> Option<Emitter<StreamItem>> {
        self.state.lock().streams.get(&id).cloned()
    }

    fn handle(&self, msg: Message) {
        match msg {
            Message::Initialize => {
                let mut state = self.state.lock();
                if state.initialized {
                    return;
                }
                state.initialized = true;
                for payload in std::mem::take(&mut state.outbox) {
                    if let Err(err) = self.protocol.send(payload) {
                        tracing::debug!(target: "splithost::ipc", error = %err, "queued request dropped");
                    }
                }
            }
            Message::Success { id, data } => {
                let tx = self.state.lock().pending.remove(&id);
                if let Some(tx) = tx {
                    let _ = tx.send(Ok(data));
                }
            }
            Message::Error { id, message } => {
                let tx = self.state.lock().pending.remove(&id);
                match tx {
                    Some(tx) => {
                        let _ = tx.send(Err(ChannelError::Remote { message }));
                    }
                    None => {
                        if let Some(stream) = self.stream(id) {
                            stream.emit(&Err(ChannelError::Remote { message }));
                        }
                    }
                }
            }
            Message::Event { id, data } => {
                if let Some(stream) = self.stream(id) {
                    stream.emit(&Ok(data));
                }
            }
            _ => {}
        }
    }

    fn dispose(&self) {
        let (pending, streams) = {
            let mut state = self.state.lock();
            state.disposed = true;
            state.outbox.clear();
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.streams),
            )
        };
        for (_, tx) in pending {
            let _ = tx.send(Err(ChannelError::Disconnected));
        }
        for (_, stream) in streams {
            stream.emit(&Err(ChannelError::Disconnected));
            stream.dispose();
        }
    }
}

/// Both halves of one live connection.
pub(crate) struct Connection {
    pub(crate) ctx: ConnectionId,
    protocol: Protocol,
    server: Arc<ChannelServer>,
    client: Arc<ChannelClient>,
    routing: Subscription,
}

impl Connection {
    pub(crate) fn new(ctx: ConnectionId, protocol: Protocol, channels: ChannelRegistry) -> Self {
        let client = ChannelClient::new(protocol.clone());
        let server = ChannelServer::new(ctx, protocol.clone(), channels);

        let (s, c) = (Arc::downgrade(&server), Arc::downgrade(&client));
        let routing = protocol.on_message().subscribe(move |payload: &Bytes| {
            let msg = match Message::decode(payload) {
                Ok(msg) => msg,
                Err(err) => {
                    tracing::warn!(target: "splithost::ipc", %ctx, error = %err, "dropping undecodable message");
                    return;
                }
            };
            if msg.is_request() {
                if let Some(server) = s.upgrade() {
                    server.handle(msg);
                }
            } else if let Some(client) = c.upgrade() {
                client.handle(msg);
            }
        });

        Self {
            ctx,
            protocol,
            server,
            client,
            routing,
        }
    }

    pub(crate) fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub(crate) fn channel(&self, name: &str) -> Channel {
        Channel {
            client: Arc::clone(&self.client),
            name: Arc::from(name),
        }
    }

    pub(crate) fn dispose(&self) {
        self.routing.dispose();
        self.server.dispose();
        self.client.dispose();
        self.protocol.dispose();
    }
}

/// Caller-side proxy for one remote channel.
#[derive(Clone)]
pub struct Channel {
    client: Arc<ChannelClient>,
    name: Arc<str>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("name", &self.name).finish()
    }
}

impl Channel {
    /// Channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invokes `command` remotely and waits for the result.
    pub async fn call<A>(&self, command: &str, arg: A) -> Result<Value, ChannelError>
    where
        A: Serialize + Send,
    {
        let arg = serde_json::to_value(arg)?;
        self.client.call(&self.name, command, arg).await
    }

    /// Like [`call`](Self::call), deserializing the result into `T`.
    pub async fn call_as<T, A>(&self, command: &str, arg: A) -> Result<T, ChannelError>
    where
        T: DeserializeOwned,
        A: Serialize + Send,
    {
        let value = self.call(command, arg).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Streams `event` from the remote channel.
    ///
    /// The remote subscription is opened when the first listener subscribes
    /// and closed when the last one disposes. A disconnect delivers a final
    /// `Err(ChannelError::Disconnected)`.
    pub fn listen(&self, event: &str, arg: Value) -> Event<StreamItem> {
        self.client.listen(&self.name, event, arg)
    }
}
