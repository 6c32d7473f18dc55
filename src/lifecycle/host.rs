//! Collaborator seams the orchestrator drives: the native application and
//! its UI targets (windows).

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::base::Event;
use crate::ipc::ConnectionId;

/// Payload of native signals whose default action may be cancelled.
#[derive(Debug, Default)]
pub struct Preventable {
    prevented: AtomicBool,
}

impl Preventable {
    /// A signal whose default action will run.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the default action.
    pub fn prevent_default(&self) {
        self.prevented.store(true, Ordering::Release);
    }

    /// True if any listener cancelled the default action.
    pub fn is_default_prevented(&self) -> bool {
        self.prevented.load(Ordering::Acquire)
    }
}

/// # Native application.
///
/// Signal semantics follow the usual desktop shell order:
/// `quit()` ─► `before-quit` ─► close every window (any prevented close
/// cancels the quit) ─► `will-quit` (preventable) ─► `quit` ─► exit.
pub trait AppHost: Send + Sync + 'static {
    /// Starts the native quit sequence.
    fn quit(&self);

    /// Terminates the process right away with `code`.
    fn exit(&self, code: i32);

    /// Schedules a relaunch with `args` once this process exits.
    fn relaunch(&self, args: Vec<String>);

    /// Process arguments, program name first.
    fn args(&self) -> Vec<String>;

    /// First step of the quit sequence.
    fn on_before_quit(&self) -> Event<()>;

    /// Fired when the last window closed outside a quit sequence.
    fn on_window_all_closed(&self) -> Event<()>;

    /// Fired once windows are gone; preventing it pauses the quit.
    fn on_will_quit(&self) -> Event<Preventable>;

    /// Fired right before the process exits.
    fn on_quit(&self) -> Event<()>;
}

/// Stable identity of one UI target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(pub u64);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "target-{}", self.0)
    }
}

/// # One UI target (window) hosting a lifecycle participant.
pub trait UiTarget: Send + Sync + 'static {
    /// Stable id.
    fn id(&self) -> TargetId;

    /// Connection the target's participant uses. Defaults to the same number as [`id`](Self::id).
    fn connection_id(&self) -> ConnectionId {
        ConnectionId(self.id().0)
    }

    /// True once the native target is gone.
    fn is_destroyed(&self) -> bool;

    /// Requests a close; fires `close-requested` again.
    fn close(&self);

    /// Destroys the target without asking; fires `closed`.
    fn destroy(&self);

    /// Reloads the target's content.
    fn reload(&self);

    /// Fired when something asks the target to close; preventable.
    fn on_close_requested(&self) -> Event<Preventable>;

    /// Fired once the target is closed.
    fn on_closed(&self) -> Event<()>;
}
