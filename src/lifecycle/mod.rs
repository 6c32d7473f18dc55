//! Lifecycle coordination across the privileged/UI split.
//!
//! - [`phase`]: monotonic [`LifecyclePhase`] with per-phase barriers.
//! - [`command`]: `lifecycle` channel commands.
//! - [`veto`]: shutdown reasons, veto and join collection.
//! - [`host`]: [`AppHost`]/[`UiTarget`] collaborator seams.
//! - [`main`]: [`LifecycleMain`], the privileged orchestrator.
//! - [`participant`]: [`LifecycleParticipant`], the UI side.

pub mod command;
pub mod host;
pub mod main;
pub mod participant;
pub mod phase;
pub mod veto;

pub use command::{LIFECYCLE_CHANNEL, LifecycleCommand};
pub use host::{AppHost, Preventable, TargetId, UiTarget};
pub use main::{LifecycleMain, PendingShutdown, PendingVeto, RelaunchOptions};
pub use participant::{BeforeShutdownError, LifecycleParticipant};
pub use phase::{LifecyclePhase, PhaseGate};
pub use veto::{
    BeforeShutdownEvent, Joiner, PendingIds, ShutdownReason, UnloadReason, Veto, WillShutdownEvent, handle_vetos,
    join_all,
};
