//! # splithost
//!
//! **splithost** is the plumbing of a desktop host split into one privileged
//! process and any number of UI processes: typed events, a framed wire
//! protocol, a channel multiplexer on top of it, and a shutdown coordinator
//! that lets every UI participant veto or delay the exit.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!   UI process #1            UI process #2                privileged process
//! ┌──────────────────┐     ┌──────────────────┐     ┌─────────────────────────────┐
//! │ LifecycleParti-  │     │ LifecycleParti-  │     │ LifecycleMain               │
//! │ cipant           │     │ cipant           │     │  - AppHost signals          │
//! │ UpdateClient     │     │                  │     │  - UiTarget per window      │
//! ├──────────────────┤     ├──────────────────┤     │ UpdateChannel<UpdateService>│
//! │ IpcClient        │     │ IpcClient        │     ├─────────────────────────────┤
//! │  Channel proxies │     │  Channel proxies │     │ IpcServer                   │
//! └────────┬─────────┘     └────────┬─────────┘     │  RoutedChannel(filter)      │
//!          │ HELLO/MESSAGE/DISCONNECT frames        └──────────────┬──────────────┘
//!          └────────────────────────┴──────── byte duplex ─────────┘
//! ```
//!
//! ### Layers
//! ```text
//! base::Event/Emitter ─► ipc::protocol (frames) ─► ipc::message (envelopes)
//!                     ─► ipc::channel (call/listen) ─► ipc::server / ipc::client
//!                     ─► lifecycle (veto/join) and update (channel shape)
//! ```
//!
//! ## Features
//! | Area          | Description                                                | Key types                                  |
//! |---------------|------------------------------------------------------------|--------------------------------------------|
//! | **Events**    | Synchronous typed events with lazy derived views.          | [`Emitter`], [`Event`], [`Subscription`]   |
//! | **Sync**      | One-shot barrier and cancellable timeout.                  | [`Barrier`], [`DisposableTimeout`]         |
//! | **IPC**       | Framed duplex, named channels, calls and event streams.    | [`IpcServer`], [`IpcClient`], [`Channel`]  |
//! | **Lifecycle** | Quit, relaunch, kill and unload with participant vetoes.   | [`LifecycleMain`], [`LifecycleParticipant`]|
//! | **Update**    | Update-check commands and updater event stream.            | [`UpdateChannel`], [`UpdateClient`]        |
//! | **Errors**    | Typed errors per layer.                                    | [`ProtocolError`], [`ChannelError`]        |
//! | **Config**    | Frame limits, warning thresholds, kill deadlines.          | [`IpcConfig`], [`LifecycleConfig`]         |
//!
//! ## Example
//! ```rust
//! use splithost::{ConnectionId, IpcClient, IpcConfig, IpcServer, LifecycleConfig, LifecycleParticipant};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = IpcServer::default();
//!     let (privileged_end, ui_end) = tokio::io::duplex(64 * 1024);
//!     server.accept(ConnectionId(1), privileged_end);
//!
//!     let client = IpcClient::connect(ConnectionId(1), ui_end, &IpcConfig::default())?;
//!     let participant = LifecycleParticipant::new(&client, LifecycleConfig::default());
//!     let _keep_open = participant.on_before_shutdown().subscribe(|event| {
//!         event.veto(true, "unsaved-changes");
//!     });
//!
//!     client.disconnect();
//!     Ok(())
//! }
//! ```

pub mod base;
pub mod config;
pub mod error;
pub mod ipc;
pub mod lifecycle;
pub mod update;

// ---- Public re-exports ----

pub use base::{Barrier, DisposableStore, DisposableTimeout, Emitter, EmitterOptions, Event, Subscription};
pub use config::{IpcConfig, LifecycleConfig, Platform};
pub use error::{ChannelError, LifecycleError, ProtocolError};
pub use ipc::{Channel, ConnectionId, IpcClient, IpcServer, RoutedChannel, ServerChannel};
pub use lifecycle::{
    AppHost, BeforeShutdownEvent, LifecycleMain, LifecycleParticipant, LifecyclePhase, Preventable, RelaunchOptions,
    ShutdownReason, TargetId, UiTarget, UnloadReason, Veto, WillShutdownEvent,
};
pub use update::{UpdateChannel, UpdateClient, UpdateEvent, UpdateInfo, UpdateService};
