//! Commands carried on the `lifecycle` channel.
//!
//! Both ends register a channel under [`LIFECYCLE_CHANNEL`]: the UI side
//! answers the two `handle*` commands, the privileged side answers `quit`,
//! `relaunch` and `kill`.

use std::fmt;
use std::str::FromStr;

use crate::error::ChannelError;

/// Channel name shared by both ends.
pub const LIFECYCLE_CHANNEL: &str = "lifecycle";

/// One lifecycle channel command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleCommand {
    /// Privileged → UI: collect vetoes; replies `bool`.
    HandleBeforeShutdown,
    /// Privileged → UI: run joiners; replies when done.
    HandleWillShutdown,
    /// UI → privileged: request quit; replies the veto.
    Quit,
    /// UI → privileged: quit and relaunch; replies the veto.
    Relaunch,
    /// UI → privileged: force exit with a code.
    Kill,
}

impl LifecycleCommand {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleCommand::HandleBeforeShutdown => "handleBeforeShutdown",
            LifecycleCommand::HandleWillShutdown => "handleWillShutdown",
            LifecycleCommand::Quit => "quit",
            LifecycleCommand::Relaunch => "relaunch",
            LifecycleCommand::Kill => "kill",
        }
    }
}

impl fmt::Display for LifecycleCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleCommand {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "handleBeforeShutdown" => Ok(LifecycleCommand::HandleBeforeShutdown),
            "handleWillShutdown" => Ok(LifecycleCommand::HandleWillShutdown),
            "quit" => Ok(LifecycleCommand::Quit),
            "relaunch" => Ok(LifecycleCommand::Relaunch),
            "kill" => Ok(LifecycleCommand::Kill),
            other => Err(ChannelError::unknown_command(LIFECYCLE_CHANNEL, other)),
        }
    }
}
