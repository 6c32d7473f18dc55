//! Monotonic lifecycle phase with one barrier per phase.
//!
//! ```text
//!   Starting ──set(Ready)──► Ready
//!      │                       │
//!   barrier[Starting]       barrier[Ready]
//!   (open from creation)    (opened by set)
//! ```

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::base::Barrier;
use crate::error::LifecycleError;

/// Totally ordered lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecyclePhase {
    /// Services are being created.
    Starting = 1,
    /// The first UI target is ready.
    Ready = 2,
}

impl LifecyclePhase {
    /// Every phase, ascending.
    pub const ALL: [LifecyclePhase; 2] = [LifecyclePhase::Starting, LifecyclePhase::Ready];

    #[inline]
    fn index(self) -> usize {
        self as usize - 1
    }
}

/// Current phase plus the barriers waiters block on.
#[derive(Debug)]
pub struct PhaseGate {
    current: Mutex<LifecyclePhase>,
    barriers: [Barrier; 2],
}

impl Default for PhaseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseGate {
    /// Starts in [`LifecyclePhase::Starting`] with its barrier open.
    pub fn new() -> Self {
        let gate = Self {
            current: Mutex::new(LifecyclePhase::Starting),
            barriers: [Barrier::new(), Barrier::new()],
        };
        gate.barriers[LifecyclePhase::Starting.index()].open();
        gate
    }

    /// Phase in effect.
    #[inline]
    pub fn phase(&self) -> LifecyclePhase {
        *self.current.lock()
    }

    /// Advances to `phase`, releasing waiters on it and on every earlier phase.
    ///
    /// Setting the current phase again is a no-op; going backwards fails.
    pub fn set(&self, phase: LifecyclePhase) -> Result<(), LifecycleError> {
        {
            let mut current = self.current.lock();
            if phase < *current {
                return Err(LifecycleError::PhaseRegression {
                    current: *current,
                    requested: phase,
                });
            }
            if phase == *current {
                return Ok(());
            }
            *current = phase;
        }

        tracing::debug!(target: "splithost::lifecycle", ?phase, "phase changed");
        for earlier in LifecyclePhase::ALL.iter().filter(|p| **p <= phase) {
            self.barriers[earlier.index()].open();
        }
        Ok(())
    }

    /// Resolves once the phase is at or past `phase`.
    pub async fn when(&self, phase: LifecyclePhase) {
        self.barriers[phase.index()].wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn when_ready_waits_for_assignment() {
        let gate = Arc::new(PhaseGate::new());
        gate.when(LifecyclePhase::Starting).await;

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.when(LifecyclePhase::Ready).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        gate.set(LifecyclePhase::Ready).unwrap();
        waiter.await.unwrap();
        gate.when(LifecyclePhase::Starting).await;
    }

    #[test]
    fn phase_never_goes_back() {
        let gate = PhaseGate::new();
        gate.set(LifecyclePhase::Ready).unwrap();
        gate.set(LifecyclePhase::Ready).unwrap();

        let err = gate.set(LifecyclePhase::Starting).unwrap_err();
        assert_eq!(
            err,
            LifecycleError::PhaseRegression {
                current: LifecyclePhase::Ready,
                requested: LifecyclePhase::Starting,
            }
        );
        assert_eq!(gate.phase(), LifecyclePhase::Ready);
    }
}
