//! Multiplexer-level envelope carried inside MESSAGE frames.
//!
//! Encoded as JSON with a `type` tag. Requests flow from a channel client to
//! the remote channel server; responses flow back.
//!
//! ```text
//!   client                         server
//!     │── request{id,channel,cmd} ──►│
//!     │◄──────── success{id,data} ───│  or error{id,message}
//!     │── subscribe{id,channel,ev} ─►│
//!     │◄──────── event{id,data} ─────│  (0..n times)
//!     │── unsubscribe{id} ──────────►│
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ChannelError;

/// One multiplexer message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
    /// Invoke `command` on `channel`.
    Request {
        id: u32,
        channel: String,
        command: String,
        #[serde(default)]
        arg: Value,
    },
    /// Start streaming `event` from `channel`.
    Subscribe {
        id: u32,
        channel: String,
        event: String,
        #[serde(default)]
        arg: Value,
    },
    /// Stop the stream started by `Subscribe { id }`.
    Unsubscribe { id: u32 },
    /// The serving side is ready to take requests.
    Initialize,
    /// Request `id` succeeded.
    Success {
        id: u32,
        #[serde(default)]
        data: Value,
    },
    /// Request `id` failed.
    Error { id: u32, message: String },
    /// One firing of the stream started by `Subscribe { id }`.
    Event {
        id: u32,
        #[serde(default)]
        data: Value,
    },
}

impl Message {
    /// True for messages handled by the serving half of a connection.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Message::Request { .. } | Message::Subscribe { .. } | Message::Unsubscribe { .. }
        )
    }

    /// Encodes to a frame payload.
    pub fn encode(&self) -> Result<Bytes, ChannelError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decodes a frame payload.
    pub fn decode(payload: &[u8]) -> Result<Self, ChannelError> {
        Ok(serde_json::from_slice(payload)?)
    }
}
