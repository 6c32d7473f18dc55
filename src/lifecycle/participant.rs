//! # UI-side lifecycle participant.
//!
//! Serves the UI `lifecycle` channel the orchestrator calls during unload:
//!
//! ```text
//!   handleBeforeShutdown(reason)
//!     ─► on_before_shutdown (listeners veto / veto_later)
//!     ─► handle_vetos ── error ─► on_before_shutdown_error
//!          ├─ true  ─► on_shutdown_veto, reply true
//!          └─ false ─► shutdown_reason = reason, reply false
//!
//!   handleWillShutdown(reason)
//!     ─► on_will_shutdown (listeners join)
//!     ─► join_all ─► on_did_shutdown, reply
//! ```
//!
//! Both steps warn (without failing) when sources are still pending after
//! the configured threshold. The participant also proxies `quit`,
//! `relaunch` and `kill` to the privileged side.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::base::{DisposableTimeout, Emitter, Event};
use crate::config::LifecycleConfig;
use crate::error::{ChannelError, LifecycleError};
use crate::ipc::{Channel, ConnectionId, IpcClient, ServerChannel};
use crate::lifecycle::command::{LIFECYCLE_CHANNEL, LifecycleCommand};
use crate::lifecycle::main::RelaunchOptions;
use crate::lifecycle::phase::{LifecyclePhase, PhaseGate};
use crate::lifecycle::veto::{
    BeforeShutdownEvent, PendingIds, UnloadReason, VetoErrorHandler, WillShutdownEvent, handle_vetos, join_all,
};

/// A veto source failed while deciding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeforeShutdownError {
    /// Unload reason being decided.
    pub reason: UnloadReason,
    /// Id the failing source registered under.
    pub id: String,
    /// Error chain, rendered.
    pub message: String,
}

/// Lifecycle participant for one UI process.
pub struct LifecycleParticipant {
    remote: Channel,
    config: LifecycleConfig,
    phase: PhaseGate,
    shutdown_reason: Mutex<Option<UnloadReason>>,
    on_before_shutdown: Emitter<BeforeShutdownEvent>,
    on_before_shutdown_error: Emitter<BeforeShutdownError>,
    on_shutdown_veto: Emitter<()>,
    on_will_shutdown: Emitter<WillShutdownEvent<UnloadReason>>,
    on_did_shutdown: Emitter<()>,
}

impl LifecycleParticipant {
    /// Serves the UI `lifecycle` channel on `client`.
    pub fn new(client: &IpcClient, config: LifecycleConfig) -> Arc<Self> {
        let participant = Arc::new(Self {
            remote: client.get_channel(LIFECYCLE_CHANNEL),
            config,
            phase: PhaseGate::new(),
            shutdown_reason: Mutex::new(None),
            on_before_shutdown: Emitter::new(),
            on_before_shutdown_error: Emitter::new(),
            on_shutdown_veto: Emitter::new(),
            on_will_shutdown: Emitter::new(),
            on_did_shutdown: Emitter::new(),
        });
        client.register_channel(
            LIFECYCLE_CHANNEL,
            Arc::new(ParticipantChannel {
                participant: Arc::downgrade(&participant),
            }),
        );
        participant
    }

    /// Collects vetoes for an unload; `true` = vetoed.
    pub async fn handle_before_shutdown(self: &Arc<Self>, reason: UnloadReason) -> bool {
        let event = BeforeShutdownEvent::new(reason);
        self.on_before_shutdown.emit(&event);
        let vetos = event.take_vetos();

        let pending = PendingIds::default();
        let warning = self.config.before_shutdown_warning().map(|delay| {
            let pending = pending.clone();
            DisposableTimeout::new(delay, move || {
                tracing::warn!(
                    target: "splithost::lifecycle",
                    pending = ?pending.snapshot(),
                    "before-shutdown is taking a while"
                );
            })
        });

        let weak = Arc::downgrade(self);
        let on_error: VetoErrorHandler = Arc::new(move |id: &str, err: &anyhow::Error| {
            if let Some(participant) = weak.upgrade() {
                participant.on_before_shutdown_error.emit(&BeforeShutdownError {
                    reason,
                    id: id.to_string(),
                    message: format!("{err:#}"),
                });
            }
        });

        let veto = handle_vetos(vetos, pending, on_error).await;
        if let Some(warning) = warning {
            warning.dispose();
        }

        if veto {
            tracing::info!(target: "splithost::lifecycle", ?reason, "shutdown vetoed");
            self.on_shutdown_veto.emit(&());
        } else {
            *self.shutdown_reason.lock() = Some(reason);
        }
        veto
    }

    /// Runs will-shutdown joiners, then fires `on_did_shutdown`.
    pub async fn handle_will_shutdown(&self, reason: UnloadReason) {
        let event = WillShutdownEvent::new(reason);
        self.on_will_shutdown.emit(&event);
        let joiners = event.take_joiners();

        let pending = PendingIds::default();
        let warning = self.config.will_shutdown_warning().map(|delay| {
            let pending = pending.clone();
            DisposableTimeout::new(delay, move || {
                tracing::warn!(
                    target: "splithost::lifecycle",
                    pending = ?pending.snapshot(),
                    "will-shutdown is taking a while"
                );
            })
        });

        join_all(joiners, pending).await;
        if let Some(warning) = warning {
            warning.dispose();
        }

        tracing::debug!(target: "splithost::lifecycle", ?reason, "did-shutdown");
        self.on_did_shutdown.emit(&());
    }

    /// Asks the privileged side to quit; resolves the veto.
    pub async fn quit(&self) -> Result<bool, LifecycleError> {
        Ok(self.remote.call_as(LifecycleCommand::Quit.as_str(), ()).await?)
    }

    /// Asks the privileged side to relaunch; resolves the veto.
    pub async fn relaunch(&self, options: RelaunchOptions) -> Result<bool, LifecycleError> {
        Ok(self.remote.call_as(LifecycleCommand::Relaunch.as_str(), options).await?)
    }

    /// Asks the privileged side to exit with `code`.
    pub async fn kill(&self, code: i32) -> Result<(), LifecycleError> {
        self.remote.call(LifecycleCommand::Kill.as_str(), code).await?;
        Ok(())
    }

    /// Reason of the last unload that was not vetoed.
    pub fn shutdown_reason(&self) -> Option<UnloadReason> {
        *self.shutdown_reason.lock()
    }

    /// Phase in effect.
    pub fn phase(&self) -> LifecyclePhase {
        self.phase.phase()
    }

    /// Advances the phase; going backwards fails.
    pub fn set_phase(&self, phase: LifecyclePhase) -> Result<(), LifecycleError> {
        self.phase.set(phase)
    }

    /// Resolves once the phase is at or past `phase`.
    pub async fn when(&self, phase: LifecyclePhase) {
        self.phase.when(phase).await;
    }

    /// Fired on unload; listeners may veto.
    pub fn on_before_shutdown(&self) -> Event<BeforeShutdownEvent> {
        self.on_before_shutdown.event()
    }

    /// Fired when a veto source fails.
    pub fn on_before_shutdown_error(&self) -> Event<BeforeShutdownError> {
        self.on_before_shutdown_error.event()
    }

    /// Fired when an unload got vetoed.
    pub fn on_shutdown_veto(&self) -> Event<()> {
        self.on_shutdown_veto.event()
    }

    /// Fired when unload is certain; listeners may join.
    pub fn on_will_shutdown(&self) -> Event<WillShutdownEvent<UnloadReason>> {
        self.on_will_shutdown.event()
    }

    /// Fired after every joiner settled.
    pub fn on_did_shutdown(&self) -> Event<()> {
        self.on_did_shutdown.event()
    }
}

struct ParticipantChannel {
    participant: Weak<LifecycleParticipant>,
}

#[async_trait]
impl ServerChannel for ParticipantChannel {
    async fn call(&self, ctx: ConnectionId, command: &str, arg: Value) -> Result<Value, ChannelError> {
        let participant = self.participant.upgrade().ok_or_else(|| ChannelError::UnknownChannel {
            channel: LIFECYCLE_CHANNEL.to_string(),
        })?;
        tracing::debug!(target: "splithost::lifecycle", %ctx, command, "lifecycle request");

        match command.parse::<LifecycleCommand>()? {
            LifecycleCommand::HandleBeforeShutdown => {
                let reason: UnloadReason = serde_json::from_value(arg)?;
                Ok(Value::Bool(participant.handle_before_shutdown(reason).await))
            }
            LifecycleCommand::HandleWillShutdown => {
                let reason: UnloadReason = serde_json::from_value(arg)?;
                participant.handle_will_shutdown(reason).await;
                Ok(Value::Null)
            }
            other => Err(ChannelError::unknown_command(LIFECYCLE_CHANNEL, other.as_str())),
        }
    }

    fn listen(&self, _ctx: ConnectionId, event: &str, _arg: Value) -> Result<Event<Value>, ChannelError> {
        Err(ChannelError::unknown_event(LIFECYCLE_CHANNEL, event))
    }
}
