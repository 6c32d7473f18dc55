//! # Wire protocol: one byte duplex, three frame kinds.
//!
//! ```text
//!   ┌────────┬──────────────┬───────────────────┐
//!   │ kind u8│ len u32 (BE) │ payload (len B)   │
//!   └────────┴──────────────┴───────────────────┘
//!     1 = HELLO       (no payload)  UI → privileged
//!     2 = MESSAGE     (opaque)      both ways
//!     3 = DISCONNECT  (no payload)  UI → privileged
//! ```
//!
//! The reader consumes a frame's full body before interpreting it, so a frame
//! with an unknown kind or an illegal payload can be skipped without losing
//! sync: [`FrameReader::read_next`] returns a recoverable [`ProtocolError`]
//! and the next call continues with the following frame. An oversized length
//! header or a transport error ends the stream.
//!
//! Outbound frames go through a [`FrameSender`] feeding one writer task per
//! transport, so sending never suspends the caller. Writing a DISCONNECT frame
//! is final: the writer shuts the transport down afterwards.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::base::{Emitter, Event};
use crate::config::IpcConfig;
use crate::error::ProtocolError;

/// Size of the frame header in bytes.
pub const HEADER_LEN: usize = 5;

const KIND_HELLO: u8 = 1;
const KIND_MESSAGE: u8 = 2;
const KIND_DISCONNECT: u8 = 3;

/// One wire-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Register (or re-register) the sending endpoint.
    Hello,
    /// One multiplexer-level message.
    Message(Bytes),
    /// Explicit teardown.
    Disconnect,
}

impl Frame {
    fn kind(&self) -> u8 {
        match self {
            Frame::Hello => KIND_HELLO,
            Frame::Message(_) => KIND_MESSAGE,
            Frame::Disconnect => KIND_DISCONNECT,
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            Frame::Message(bytes) => bytes,
            Frame::Hello | Frame::Disconnect => &[],
        }
    }
}

/// Serializes `frame` into header + payload.
pub fn encode_frame(frame: &Frame, limit: Option<usize>) -> Result<Vec<u8>, ProtocolError> {
    let payload = frame.payload();
    check_len(payload.len(), limit)?;
    let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.push(frame.kind());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Interprets an already consumed frame body.
pub fn decode_frame(kind: u8, body: Bytes) -> Result<Frame, ProtocolError> {
    match kind {
        KIND_MESSAGE => Ok(Frame::Message(body)),
        KIND_HELLO | KIND_DISCONNECT if !body.is_empty() => Err(ProtocolError::UnexpectedPayload {
            kind,
            len: body.len(),
        }),
        KIND_HELLO => Ok(Frame::Hello),
        KIND_DISCONNECT => Ok(Frame::Disconnect),
        other => Err(ProtocolError::UnknownFrameKind { kind: other }),
    }
}

fn check_len(len: usize, limit: Option<usize>) -> Result<(), ProtocolError> {
    match limit {
        Some(max) if len > max => Err(ProtocolError::FrameTooLarge { len, max }),
        _ => Ok(()),
    }
}

/// Reads frames from the inbound half of a transport.
pub struct FrameReader<R> {
    reader: R,
    limit: Option<usize>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wraps `reader` with the limits from `config`.
    pub fn new(reader: R, config: &IpcConfig) -> Self {
        Self {
            reader,
            limit: config.frame_limit(),
        }
    }

    /// Next frame, `Ok(None)` on clean EOF.
    ///
    /// Recoverable errors (see [`ProtocolError::is_recoverable`]) leave the
    /// reader positioned at the next frame.
    pub async fn read_next(&mut self) -> Result<Option<Frame>, ProtocolError> {
        let mut header = [0u8; HEADER_LEN];
        let mut read = 0usize;
        while read < HEADER_LEN {
            let n = self.reader.read(&mut header[read..]).await?;
            if n == 0 {
                if read == 0 {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "frame header truncated",
                )
                .into());
            }
            read += n;
        }

        let kind = header[0];
        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
        check_len(len, self.limit)?;

        let mut body = vec![0u8; len];
        self.reader.read_exact(&mut body).await?;
        decode_frame(kind, Bytes::from(body)).map(Some)
    }
}

/// Writes frames to the outbound half of a transport.
pub struct FrameWriter<W> {
    writer: W,
    limit: Option<usize>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wraps `writer` with the limits from `config`.
    pub fn new(writer: W, config: &IpcConfig) -> Self {
        Self {
            writer,
            limit: config.frame_limit(),
        }
    }

    /// Encodes and flushes one frame.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        let buf = encode_frame(frame, self.limit)?;
        self.writer.write_all(&buf).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Shuts the transport's write side down.
    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Non-blocking handle to a transport's writer task.
#[derive(Clone, Debug)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<Frame>,
    limit: Option<usize>,
}

impl FrameSender {
    /// Queues `frame` for writing.
    ///
    /// Fails fast for oversized payloads and once the writer has stopped.
    pub fn send(&self, frame: Frame) -> Result<(), ProtocolError> {
        check_len(frame.payload().len(), self.limit)?;
        self.tx.send(frame).map_err(|_| ProtocolError::NotConnected)
    }

    /// True once the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawns the writer task for `writer` and returns its sender.
///
/// The task ends when every sender is dropped, after writing a DISCONNECT
/// frame, or on the first transport error.
pub fn spawn_writer<W>(writer: W, config: &IpcConfig) -> FrameSender
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let mut frames = FrameWriter::new(writer, config);

    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let last = frame == Frame::Disconnect;
            if let Err(err) = frames.write_frame(&frame).await {
                tracing::debug!(
                    target: "splithost::ipc",
                    label = err.as_label(),
                    error = %err,
                    "frame writer stopped"
                );
                return;
            }
            if last {
                break;
            }
        }
        rx.close();
        let _ = frames.shutdown().await;
    });

    FrameSender {
        tx,
        limit: config.frame_limit(),
    }
}

/// Logical duplex of opaque payloads for one connected endpoint.
#[derive(Clone, Debug)]
pub struct Protocol {
    sender: FrameSender,
    on_message: Emitter<Bytes>,
}

impl Protocol {
    /// Wraps an outbound frame sender.
    pub fn new(sender: FrameSender) -> Self {
        Self {
            sender,
            on_message: Emitter::new(),
        }
    }

    /// Sends one payload as a MESSAGE frame.
    pub fn send(&self, payload: Bytes) -> Result<(), ProtocolError> {
        self.sender.send(Frame::Message(payload))
    }

    /// Payloads received from the remote endpoint.
    pub fn on_message(&self) -> Event<Bytes> {
        self.on_message.event()
    }

    pub(crate) fn deliver(&self, payload: &Bytes) {
        self.on_message.emit(payload);
    }

    pub(crate) fn dispose(&self) {
        self.on_message.dispose();
    }
}
