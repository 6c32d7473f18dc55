//! # Runtime configuration.
//!
//! [`IpcConfig`] bounds the wire protocol; [`LifecycleConfig`] sets the
//! shutdown warning thresholds, the `kill` deadlines and the platform rules
//! the orchestrator follows.
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use splithost::{LifecycleConfig, Platform};
//!
//! let mut cfg = LifecycleConfig::default();
//! cfg.platform = Platform::MacOs;
//! cfg.kill_destroy_timeout = Duration::from_millis(500);
//!
//! assert!(cfg.platform.keeps_running_without_windows());
//! ```

use std::path::PathBuf;
use std::time::Duration;

/// Wire protocol limits.
#[derive(Clone, Debug)]
pub struct IpcConfig {
    /// Largest accepted payload, in bytes (0 = unlimited).
    pub max_frame_len: usize,
}

impl Default for IpcConfig {
    /// - `max_frame_len = 16 MiB`
    fn default() -> Self {
        Self {
            max_frame_len: 16 * 1024 * 1024,
        }
    }
}

impl IpcConfig {
    /// Returns the frame limit, or `None` if unlimited.
    #[inline]
    pub fn frame_limit(&self) -> Option<usize> {
        (self.max_frame_len > 0).then_some(self.max_frame_len)
    }
}

/// Host operating system family, as far as shutdown rules are concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Platform {
    /// Apps keep running with zero windows.
    MacOs,
    /// Relaunch restores the original working directory.
    Windows,
    /// Everything else.
    Linux,
}

impl Platform {
    /// Platform of the running process.
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Platform::MacOs
        } else if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Linux
        }
    }

    /// True if closing the last window must not end the app on its own.
    #[inline]
    pub fn keeps_running_without_windows(self) -> bool {
        matches!(self, Platform::MacOs)
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::current()
    }
}

/// Shutdown coordination settings.
#[derive(Clone, Debug)]
pub struct LifecycleConfig {
    /// Warn if before-shutdown vetoes are still pending after this long (0 = never).
    pub before_shutdown_warning: Duration,
    /// Warn if will-shutdown joiners are still pending after this long (0 = never).
    pub will_shutdown_warning: Duration,
    /// Deadline for the will-shutdown join step inside `kill`.
    pub kill_join_timeout: Duration,
    /// Deadline for destroying every UI target inside `kill`.
    pub kill_destroy_timeout: Duration,
    /// Platform rules to apply.
    pub platform: Platform,
    /// Working directory restored before a relaunch on Windows (`None` = leave as is).
    pub startup_dir: Option<PathBuf>,
}

impl Default for LifecycleConfig {
    /// - `before_shutdown_warning = 5s`
    /// - `will_shutdown_warning = 5s`
    /// - `kill_join_timeout = 1s`
    /// - `kill_destroy_timeout = 1s`
    /// - `platform = Platform::current()`
    /// - `startup_dir` = working directory at construction time
    fn default() -> Self {
        Self {
            before_shutdown_warning: Duration::from_secs(5),
            will_shutdown_warning: Duration::from_secs(5),
            kill_join_timeout: Duration::from_secs(1),
            kill_destroy_timeout: Duration::from_secs(1),
            platform: Platform::current(),
            startup_dir: std::env::current_dir().ok(),
        }
    }
}

impl LifecycleConfig {
    /// Returns the before-shutdown warning threshold, or `None` if disabled.
    #[inline]
    pub fn before_shutdown_warning(&self) -> Option<Duration> {
        (!self.before_shutdown_warning.is_zero()).then_some(self.before_shutdown_warning)
    }

    /// Returns the will-shutdown warning threshold, or `None` if disabled.
    #[inline]
    pub fn will_shutdown_warning(&self) -> Option<Duration> {
        (!self.will_shutdown_warning.is_zero()).then_some(self.will_shutdown_warning)
    }
}
