//! Wire protocol and channel multiplexer.
//!
//! - [`protocol`]: frames over a byte duplex, one logical payload stream per endpoint.
//! - [`message`]: request/response/event envelope inside payload frames.
//! - [`channel`]: [`ServerChannel`] handlers and the caller-side [`Channel`] proxy.
//! - [`server`]: [`IpcServer`], many endpoints addressed by [`ConnectionId`].
//! - [`client`]: [`IpcClient`], one endpoint's connection.

pub mod channel;
pub mod client;
pub mod message;
pub mod protocol;
pub mod server;

pub use channel::{Channel, ConnectionId, ServerChannel, StreamItem};
pub use client::IpcClient;
pub use message::Message;
pub use protocol::{Frame, FrameSender, Protocol};
pub use server::{IpcServer, RoutedChannel};
