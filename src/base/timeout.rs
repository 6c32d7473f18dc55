//! Cancellable delayed callback.
//!
//! ```text
//!   new(delay, f) ──spawn──► select! { cancelled ─► drop f
//!                                     sleep     ─► f() }
//! ```
//!
//! Firing and cancelling race on one atomic state word, so `f` runs at most
//! once and never after `dispose()` has returned.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Runs a callback after `delay` unless disposed first.
///
/// Must be created inside a tokio runtime.
#[derive(Debug)]
pub struct DisposableTimeout {
    token: CancellationToken,
    state: Arc<AtomicU8>,
}

impl DisposableTimeout {
    /// Schedules `f` to run after `delay`.
    pub fn new(delay: Duration, f: impl FnOnce() + Send + 'static) -> Self {
        let token = CancellationToken::new();
        let state = Arc::new(AtomicU8::new(PENDING));

        let task_token = token.clone();
        let task_state = Arc::clone(&state);
        tokio::spawn(async move {
            tokio::select! {
                _ = task_token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if task_state
                        .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        f();
                    }
                }
            }
        });

        Self { token, state }
    }

    /// Cancels the callback if it has not fired. Idempotent.
    pub fn dispose(&self) {
        let _ = self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire);
        self.token.cancel();
    }

    /// True if the callback ran (or is running).
    #[inline]
    pub fn has_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == FIRED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let timeout = DisposableTimeout::new(Duration::from_secs(5), move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(4_999)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(timeout.has_fired());

        timeout.dispose();
        assert!(timeout.has_fired());
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_before_deadline_suppresses_callback() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let timeout = DisposableTimeout::new(Duration::from_secs(1), move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        timeout.dispose();
        timeout.dispose();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(!timeout.has_fired());
    }
}
