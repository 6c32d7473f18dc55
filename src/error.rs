//! Error types used by the protocol, channel and lifecycle layers.
//!
//! - [`ProtocolError`]: framing and transport failures on one byte duplex.
//! - [`ChannelError`]: failures scoped to a single call or subscription.
//! - [`LifecycleError`]: misuse of the lifecycle state machine.
//!
//! Each type provides `as_label` (stable snake_case label for logs) and
//! `as_message`. Failures of user-supplied veto and join futures are plain
//! [`anyhow::Error`] values; they are logged and reported, never propagated.

use thiserror::Error;

use crate::lifecycle::LifecyclePhase;

/// # Errors produced while framing a byte duplex.
///
/// Malformed frames are dropped by the reader and logged; only
/// [`FrameTooLarge`](ProtocolError::FrameTooLarge) and [`Io`](ProtocolError::Io)
/// end a connection.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The frame header carried a kind byte outside HELLO/MESSAGE/DISCONNECT.
    #[error("unknown frame kind {kind}")]
    UnknownFrameKind {
        /// Raw kind byte.
        kind: u8,
    },

    /// A HELLO or DISCONNECT frame carried a payload.
    #[error("frame kind {kind} must not carry a payload ({len} bytes)")]
    UnexpectedPayload {
        /// Raw kind byte.
        kind: u8,
        /// Payload length found.
        len: usize,
    },

    /// The declared payload length exceeds the configured maximum.
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge {
        /// Declared length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Transport failure.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// The writer side is gone.
    #[error("connection is not open")]
    NotConnected,
}

impl ProtocolError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ProtocolError::UnknownFrameKind { .. } => "protocol_unknown_frame_kind",
            ProtocolError::UnexpectedPayload { .. } => "protocol_unexpected_payload",
            ProtocolError::FrameTooLarge { .. } => "protocol_frame_too_large",
            ProtocolError::Io(_) => "protocol_io",
            ProtocolError::NotConnected => "protocol_not_connected",
        }
    }

    /// True if the reader may skip the frame and keep going.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::UnknownFrameKind { .. } | ProtocolError::UnexpectedPayload { .. }
        )
    }
}

/// # Errors scoped to one channel call or subscription.
///
/// Errors raised by a remote handler cross the wire as their display string
/// and surface on the calling side as [`Remote`](ChannelError::Remote).
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// No handler is registered under this channel name.
    #[error("unknown channel '{channel}'")]
    UnknownChannel {
        /// Requested channel name.
        channel: String,
    },

    /// The channel does not implement this command.
    #[error("unknown command '{command}' on channel '{channel}'")]
    UnknownCommand {
        /// Channel name.
        channel: String,
        /// Requested command.
        command: String,
    },

    /// The channel does not expose this event.
    #[error("unknown event '{event}' on channel '{channel}'")]
    UnknownEvent {
        /// Channel name.
        channel: String,
        /// Requested event.
        event: String,
    },

    /// No live connection matched the routing filter.
    #[error("no live connection for channel '{channel}'")]
    NoConnection {
        /// Channel name.
        channel: String,
    },

    /// The connection closed before the call settled.
    #[error("connection disconnected")]
    Disconnected,

    /// The remote handler failed.
    #[error("remote error: {message}")]
    Remote {
        /// Error text as reported by the remote side.
        message: String,
    },

    /// Arguments or results could not be (de)serialized.
    #[error("codec error: {message}")]
    Codec {
        /// Underlying serde message.
        message: String,
    },
}

impl ChannelError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ChannelError::UnknownChannel { .. } => "channel_unknown",
            ChannelError::UnknownCommand { .. } => "channel_unknown_command",
            ChannelError::UnknownEvent { .. } => "channel_unknown_event",
            ChannelError::NoConnection { .. } => "channel_no_connection",
            ChannelError::Disconnected => "channel_disconnected",
            ChannelError::Remote { .. } => "channel_remote",
            ChannelError::Codec { .. } => "channel_codec",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        self.to_string()
    }

    pub(crate) fn unknown_command(channel: &str, command: &str) -> Self {
        ChannelError::UnknownCommand {
            channel: channel.to_string(),
            command: command.to_string(),
        }
    }

    pub(crate) fn unknown_event(channel: &str, event: &str) -> Self {
        ChannelError::UnknownEvent {
            channel: channel.to_string(),
            event: event.to_string(),
        }
    }
}

impl From<serde_json::Error> for ChannelError {
    fn from(err: serde_json::Error) -> Self {
        ChannelError::Codec {
            message: err.to_string(),
        }
    }
}

/// # Errors produced by the lifecycle state machine.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// Attempted to move the phase backwards.
    #[error("lifecycle phase cannot go back from {current:?} to {requested:?}")]
    PhaseRegression {
        /// Phase in effect.
        current: LifecyclePhase,
        /// Phase that was requested.
        requested: LifecyclePhase,
    },

    /// A lifecycle command failed on the channel layer.
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl LifecycleError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            LifecycleError::PhaseRegression { .. } => "lifecycle_phase_regression",
            LifecycleError::Channel(e) => e.as_label(),
        }
    }
}
