//! One-shot gate: closed until opened, then open forever.

use tokio_util::sync::CancellationToken;

/// Once opened, stays open; every waiter (past and future) resolves.
#[derive(Clone, Debug, Default)]
pub struct Barrier {
    token: CancellationToken,
}

impl Barrier {
    /// Creates a closed barrier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the barrier. Idempotent.
    pub fn open(&self) {
        self.token.cancel();
    }

    /// True once opened.
    #[inline]
    pub fn is_open(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the barrier is open (immediately if it already is).
    pub async fn wait(&self) {
        self.token.cancelled().await;
    }
}
