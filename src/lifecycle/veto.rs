//! # Veto and join collection.
//!
//! Shutdown notifications carry a collector. Listeners run synchronously and
//! register work on it; the emitter then drains the collector and awaits:
//!
//! ```text
//!   BeforeShutdownEvent ── veto(bool) / veto_later(fut) ──► handle_vetos
//!                                                          first `true` wins
//!   WillShutdownEvent   ── join(fut) ─────────────────────► join_all
//!                                                          all settle, errors logged
//! ```
//!
//! ## Rules
//! - `handle_vetos` resolves `true` as soon as any veto is `true` or fails;
//!   futures still pending are driven to settlement on a background task so
//!   their failures are still reported.
//! - `join_all` never fails: a failing joiner is logged and skipped.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Why the whole application is going down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ShutdownReason {
    /// Regular quit.
    Quit = 1,
    /// Forced exit via `kill`.
    Kill = 2,
}

impl From<ShutdownReason> for u8 {
    fn from(reason: ShutdownReason) -> Self {
        reason as u8
    }
}

impl TryFrom<u8> for ShutdownReason {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ShutdownReason::Quit),
            2 => Ok(ShutdownReason::Kill),
            other => Err(format!("invalid shutdown reason {other}")),
        }
    }
}

/// Why one UI target is being unloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum UnloadReason {
    /// The target is closing.
    Close = 1,
    /// The application is quitting.
    Quit = 2,
    /// The target is reloading.
    Reload = 3,
}

impl From<UnloadReason> for u8 {
    fn from(reason: UnloadReason) -> Self {
        reason as u8
    }
}

impl TryFrom<u8> for UnloadReason {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(UnloadReason::Close),
            2 => Ok(UnloadReason::Quit),
            3 => Ok(UnloadReason::Reload),
            other => Err(format!("invalid unload reason {other}")),
        }
    }
}

/// One objection to a shutdown.
pub enum Veto {
    /// Decided right away.
    Now(bool),
    /// Decided later; an error counts as a veto.
    Later(BoxFuture<'static, anyhow::Result<bool>>),
}

/// A future registered during will-shutdown.
pub type Joiner = BoxFuture<'static, anyhow::Result<()>>;

/// Ids of veto/join sources that have not settled yet.
#[derive(Clone, Debug, Default)]
pub struct PendingIds(Arc<Mutex<BTreeSet<String>>>);

impl PendingIds {
    fn insert(&self, id: &str) {
        self.0.lock().insert(id.to_string());
    }

    fn remove(&self, id: &str) {
        self.0.lock().remove(id);
    }

    /// Unsettled ids, sorted.
    pub fn snapshot(&self) -> Vec<String> {
        self.0.lock().iter().cloned().collect()
    }

    /// True if everything settled.
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

/// Fired before the UI side unloads; listeners may veto.
pub struct BeforeShutdownEvent {
    reason: UnloadReason,
    vetos: Mutex<Vec<(String, Veto)>>,
}

impl BeforeShutdownEvent {
    pub(crate) fn new(reason: UnloadReason) -> Self {
        Self {
            reason,
            vetos: Mutex::new(Vec::new()),
        }
    }

    /// Why the unload happens.
    #[inline]
    pub fn reason(&self) -> UnloadReason {
        self.reason
    }

    /// Registers an immediate decision under `id`.
    pub fn veto(&self, value: bool, id: impl Into<String>) {
        self.vetos.lock().push((id.into(), Veto::Now(value)));
    }

    /// Registers a deferred decision under `id`.
    pub fn veto_later(
        &self,
        decision: impl Future<Output = anyhow::Result<bool>> + Send + 'static,
        id: impl Into<String>,
    ) {
        self.vetos.lock().push((id.into(), Veto::Later(decision.boxed())));
    }

    pub(crate) fn take_vetos(&self) -> Vec<(String, Veto)> {
        std::mem::take(&mut *self.vetos.lock())
    }
}

/// Fired when shutdown is certain; listeners may register joiners.
pub struct WillShutdownEvent<R> {
    reason: R,
    joiners: Mutex<Vec<(String, Joiner)>>,
}

impl<R: Copy> WillShutdownEvent<R> {
    pub(crate) fn new(reason: R) -> Self {
        Self {
            reason,
            joiners: Mutex::new(Vec::new()),
        }
    }

    /// Why the shutdown happens.
    #[inline]
    pub fn reason(&self) -> R {
        self.reason
    }

    /// Delays shutdown until `work` settles.
    pub fn join(
        &self,
        id: impl Into<String>,
        work: impl Future<Output = anyhow::Result<()>> + Send + 'static,
    ) {
        self.joiners.lock().push((id.into(), work.boxed()));
    }

    pub(crate) fn take_joiners(&self) -> Vec<(String, Joiner)> {
        std::mem::take(&mut *self.joiners.lock())
    }
}

/// Reports a failing veto source: `(id, error)`.
pub type VetoErrorHandler = Arc<dyn Fn(&str, &anyhow::Error) + Send + Sync>;

/// Resolves `true` on the first `true` (or failing) veto, `false` if none.
pub async fn handle_vetos(vetos: Vec<(String, Veto)>, pending: PendingIds, on_error: VetoErrorHandler) -> bool {
    let mut deferred = FuturesUnordered::new();
    let mut vetoed = false;

    for (id, veto) in vetos {
        match veto {
            Veto::Now(true) => {
                tracing::debug!(target: "splithost::lifecycle", %id, "shutdown vetoed");
                vetoed = true;
            }
            Veto::Now(false) => {}
            Veto::Later(decision) => {
                pending.insert(&id);
                deferred.push(async move { (id, decision.await) }.boxed());
            }
        }
    }

    while !vetoed {
        let Some((id, outcome)) = deferred.next().await else {
            break;
        };
        pending.remove(&id);
        vetoed = settle(&id, outcome, &on_error);
    }

    if !deferred.is_empty() {
        tokio::spawn(async move {
            while let Some((id, outcome)) = deferred.next().await {
                pending.remove(&id);
                settle(&id, outcome, &on_error);
            }
        });
    }

    vetoed
}

fn settle(id: &str, outcome: anyhow::Result<bool>, on_error: &VetoErrorHandler) -> bool {
    match outcome {
        Ok(true) => {
            tracing::debug!(target: "splithost::lifecycle", %id, "shutdown vetoed");
            true
        }
        Ok(false) => false,
        Err(err) => {
            tracing::error!(target: "splithost::lifecycle", %id, error = %format!("{err:#}"), "veto failed");
            on_error(id, &err);
            true
        }
    }
}

/// Awaits every joiner; failures are logged, never propagated.
pub async fn join_all(joiners: Vec<(String, Joiner)>, pending: PendingIds) {
    let mut running: FuturesUnordered<_> = joiners
        .into_iter()
        .map(|(id, work)| {
            pending.insert(&id);
            async move { (id, work.await) }
        })
        .collect();

    while let Some((id, outcome)) = running.next().await {
        pending.remove(&id);
        if let Err(err) = outcome {
            tracing::error!(target: "splithost::lifecycle", %id, error = %format!("{err:#}"), "shutdown joiner failed");
        }
    }
}
