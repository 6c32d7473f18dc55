//! # Privileged-side shutdown orchestrator.
//!
//! [`LifecycleMain`] listens to the native application and to every
//! registered UI target and turns their signals into one shutdown sequence.
//! Each target's participant is reached over the `lifecycle` channel of the
//! connection returned by [`UiTarget::connection_id`].
//!
//! ```text
//!  app.quit() ─► before-quit ─► quit_requested = true, on_before_shutdown
//!                    │
//!                    ▼ (per target) close-requested [prevented]
//!               unload(target) ── handleBeforeShutdown ──► participant
//!                    │                 veto? ── yes ─► keep open, quit_requested = false,
//!                    │                                 pending quit resolves `true`
//!                    │ no
//!                    ├── handleWillShutdown ───────────► participant (joins)
//!                    ▼
//!               target.close() [allowed] ─► closed ─► last one? ─► will_shutdown(Quit)
//!                                                                   │
//!  window-all-closed ─► app.quit() ─► will-quit [prevented] ─► await will_shutdown
//!                                                 ─► pending quit resolves `false` ─► app.quit()
//! ```
//!
//! ## Rules
//! - `before-quit` is handled once; repeats are ignored.
//! - `will_shutdown` runs once per process; later calls return the same future.
//! - `unload` is deduplicated per target while in flight.
//! - `quit` returns the same future while a quit is pending.
//! - `kill` never waits for vetoes and exits within the configured deadlines.
//! - A target whose participant is unreachable or already destroyed cannot veto.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::base::{DisposableStore, Emitter, Event};
use crate::config::{LifecycleConfig, Platform};
use crate::error::{ChannelError, LifecycleError};
use crate::ipc::{ConnectionId, IpcServer, RoutedChannel, ServerChannel};
use crate::lifecycle::command::{LIFECYCLE_CHANNEL, LifecycleCommand};
use crate::lifecycle::host::{AppHost, Preventable, TargetId, UiTarget};
use crate::lifecycle::phase::{LifecyclePhase, PhaseGate};
use crate::lifecycle::veto::{Joiner, PendingIds, ShutdownReason, UnloadReason, WillShutdownEvent, join_all};

/// Shared future resolving to a veto (`true` = vetoed).
pub type PendingVeto = Shared<BoxFuture<'static, bool>>;

/// Shared future resolving once will-shutdown joiners settled.
pub type PendingShutdown = Shared<BoxFuture<'static, ()>>;

/// Argument adjustments for [`LifecycleMain::relaunch`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelaunchOptions {
    /// Appended to the current arguments.
    #[serde(default)]
    pub add_args: Vec<String>,
    /// First occurrence of each is removed from the current arguments.
    #[serde(default)]
    pub remove_args: Vec<String>,
}

struct PendingQuit {
    future: PendingVeto,
    resolve: oneshot::Sender<bool>,
}

struct TargetEntry {
    target: Arc<dyn UiTarget>,
    listeners: DisposableStore,
}

#[derive(Default)]
struct ShutdownState {
    quit_requested: bool,
    will_restart: bool,
    window_count: usize,
    close_confirmed: HashSet<TargetId>,
    targets: HashMap<TargetId, TargetEntry>,
    pending_quit: Option<PendingQuit>,
    pending_will_shutdown: Option<PendingShutdown>,
    pending_unload: HashMap<TargetId, PendingVeto>,
}

/// Shutdown coordinator for the privileged process.
pub struct LifecycleMain {
    app: Arc<dyn AppHost>,
    ipc: IpcServer,
    config: LifecycleConfig,
    phase: PhaseGate,
    state: Mutex<ShutdownState>,
    app_listeners: DisposableStore,
    on_before_shutdown: Emitter<()>,
    on_will_shutdown: Emitter<WillShutdownEvent<ShutdownReason>>,
    on_before_close_window: Emitter<TargetId>,
}

impl LifecycleMain {
    /// Hooks into `app` and serves the privileged `lifecycle` channel on `ipc`.
    pub fn new(app: Arc<dyn AppHost>, ipc: IpcServer, config: LifecycleConfig) -> Arc<Self> {
        let main = Arc::new(Self {
            app,
            ipc,
            config,
            phase: PhaseGate::new(),
            state: Mutex::new(ShutdownState::default()),
            app_listeners: DisposableStore::new(),
            on_before_shutdown: Emitter::new(),
            on_will_shutdown: Emitter::new(),
            on_before_close_window: Emitter::new(),
        });
        main.listen_to_app();
        main.ipc.register_channel(
            LIFECYCLE_CHANNEL,
            Arc::new(MainChannel {
                main: Arc::downgrade(&main),
            }),
        );
        main
    }

    fn listen_to_app(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.app_listeners.add(self.app.on_before_quit().subscribe(move |_| {
            if let Some(main) = weak.upgrade() {
                main.before_quit();
            }
        }));

        let weak = Arc::downgrade(self);
        self.app_listeners.add(self.app.on_window_all_closed().subscribe(move |_| {
            if let Some(main) = weak.upgrade() {
                main.window_all_closed();
            }
        }));

        let weak = Arc::downgrade(self);
        self.app_listeners
            .add(self.app.on_will_quit().once().subscribe(move |event: &Preventable| {
                if let Some(main) = weak.upgrade() {
                    event.prevent_default();
                    main.will_quit();
                }
            }));
    }

    fn before_quit(&self) {
        let window_count = {
            let mut state = self.state.lock();
            if state.quit_requested {
                return;
            }
            state.quit_requested = true;
            state.window_count
        };

        tracing::info!(target: "splithost::lifecycle", window_count, "before-quit");
        self.on_before_shutdown.emit(&());

        // Nothing left to veto when the app runs windowless.
        if self.config.platform.keeps_running_without_windows() && window_count == 0 {
            let _ = self.will_shutdown(ShutdownReason::Quit);
        }
    }

    fn window_all_closed(&self) {
        let quit_requested = self.state.lock().quit_requested;
        if quit_requested || !self.config.platform.keeps_running_without_windows() {
            tracing::debug!(target: "splithost::lifecycle", "all windows closed; quitting");
            self.app.quit();
        }
    }

    fn will_quit(self: &Arc<Self>) {
        tracing::debug!(target: "splithost::lifecycle", "will-quit deferred until shutdown joins settle");
        let shutdown = self.will_shutdown(ShutdownReason::Quit);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            shutdown.await;
            this.resolve_pending_quit(false);
            this.app_listeners.dispose();
            this.app.quit();
        });
    }

    /// Fires `on_will_shutdown` once and awaits every registered joiner.
    ///
    /// Later calls (for any reason) return the in-flight future.
    pub fn will_shutdown(&self, reason: ShutdownReason) -> PendingShutdown {
        let (joiners_tx, joiners_rx) = oneshot::channel::<Vec<(String, Joiner)>>();
        let shutdown = {
            let mut state = self.state.lock();
            if let Some(pending) = &state.pending_will_shutdown {
                return pending.clone();
            }
            let shutdown: PendingShutdown = async move {
                let joiners = joiners_rx.await.unwrap_or_default();
                join_all(joiners, PendingIds::default()).await;
            }
            .boxed()
            .shared();
            state.pending_will_shutdown = Some(shutdown.clone());
            shutdown
        };

        tracing::info!(target: "splithost::lifecycle", ?reason, "will-shutdown");
        let event = WillShutdownEvent::new(reason);
        self.on_will_shutdown.emit(&event);
        let joiners = event.take_joiners();
        tracing::debug!(target: "splithost::lifecycle", joiners = joiners.len(), "awaiting shutdown joiners");
        let _ = joiners_tx.send(joiners);

        tokio::spawn(shutdown.clone());
        shutdown
    }

    /// Tracks `target`: its close requests go through [`unload`](Self::unload)
    /// and its `closed` signal counts towards shutdown.
    pub fn register_target(self: &Arc<Self>, target: Arc<dyn UiTarget>) {
        let id = target.id();
        let listeners = DisposableStore::new();

        let weak = Arc::downgrade(self);
        let weak_target = Arc::downgrade(&target);
        listeners.add(target.on_close_requested().subscribe(move |event: &Preventable| {
            if let (Some(main), Some(target)) = (weak.upgrade(), weak_target.upgrade()) {
                main.close_requested(&target, event);
            }
        }));

        let weak = Arc::downgrade(self);
        listeners.add(target.on_closed().once().subscribe(move |_| {
            if let Some(main) = weak.upgrade() {
                main.closed(id);
            }
        }));

        let previous = {
            let mut state = self.state.lock();
            let previous = state.targets.insert(id, TargetEntry { target, listeners });
            if previous.is_none() {
                state.window_count += 1;
            }
            previous
        };
        if let Some(previous) = previous {
            previous.listeners.dispose();
        }
        tracing::debug!(target: "splithost::lifecycle", target_id = %id, "target registered");
    }

    fn close_requested(self: &Arc<Self>, target: &Arc<dyn UiTarget>, event: &Preventable) {
        let id = target.id();
        if self.state.lock().close_confirmed.remove(&id) {
            tracing::debug!(target: "splithost::lifecycle", target_id = %id, "close confirmed");
            return;
        }

        event.prevent_default();
        let unload = self.unload(target, UnloadReason::Close);
        let this = Arc::clone(self);
        let target = Arc::clone(target);
        tokio::spawn(async move {
            if unload.await {
                this.state.lock().close_confirmed.remove(&id);
                return;
            }
            this.state.lock().close_confirmed.insert(id);
            this.on_before_close_window.emit(&id);
            target.close();
        });
    }

    fn closed(&self, id: TargetId) {
        let (entry, remaining, quit_requested) = {
            let mut state = self.state.lock();
            let entry = state.targets.remove(&id);
            if entry.is_some() {
                state.window_count = state.window_count.saturating_sub(1);
            }
            state.close_confirmed.remove(&id);
            (entry, state.window_count, state.quit_requested)
        };
        let Some(entry) = entry else {
            return;
        };
        entry.listeners.dispose();
        tracing::debug!(target: "splithost::lifecycle", target_id = %id, remaining, "target closed");

        if remaining == 0 && (quit_requested || !self.config.platform.keeps_running_without_windows()) {
            let _ = self.will_shutdown(ShutdownReason::Quit);
        }
    }

    /// Asks the target's participant whether it may unload.
    ///
    /// While an unload for the same target is in flight, returns that one.
    pub fn unload(self: &Arc<Self>, target: &Arc<dyn UiTarget>, reason: UnloadReason) -> PendingVeto {
        let id = target.id();
        let mut state = self.state.lock();
        if let Some(pending) = state.pending_unload.get(&id) {
            return pending.clone();
        }

        let this = Arc::clone(self);
        let target = Arc::clone(target);
        let unload: PendingVeto = async move {
            let veto = this.do_unload(target.as_ref(), reason).await;
            this.state.lock().pending_unload.remove(&id);
            veto
        }
        .boxed()
        .shared();
        state.pending_unload.insert(id, unload.clone());
        drop(state);

        tokio::spawn(unload.clone());
        unload
    }

    async fn do_unload(&self, target: &dyn UiTarget, reason: UnloadReason) -> bool {
        if target.is_destroyed() {
            return false;
        }
        let reason = if self.state.lock().quit_requested {
            UnloadReason::Quit
        } else {
            reason
        };

        let id = target.id();
        let participant = self.participant(target.connection_id());
        let veto = match participant
            .call_as::<bool, _>(LifecycleCommand::HandleBeforeShutdown.as_str(), reason)
            .await
        {
            Ok(veto) => veto,
            Err(err) => {
                tracing::debug!(
                    target: "splithost::lifecycle",
                    target_id = %id,
                    label = err.as_label(),
                    "participant unreachable; unload not vetoed"
                );
                false
            }
        };

        if veto {
            tracing::info!(target: "splithost::lifecycle", target_id = %id, ?reason, "unload vetoed");
            self.handle_unload_veto();
            return true;
        }

        if let Err(err) = participant
            .call(LifecycleCommand::HandleWillShutdown.as_str(), reason)
            .await
        {
            tracing::debug!(
                target: "splithost::lifecycle",
                target_id = %id,
                label = err.as_label(),
                "will-shutdown not acknowledged"
            );
        }
        false
    }

    fn participant(&self, ctx: ConnectionId) -> RoutedChannel {
        self.ipc.get_channel(LIFECYCLE_CHANNEL, move |candidate| candidate == ctx)
    }

    fn handle_unload_veto(&self) {
        let pending = {
            let mut state = self.state.lock();
            state.quit_requested = false;
            state.will_restart = false;
            state.pending_quit.take()
        };
        if let Some(pending) = pending {
            let _ = pending.resolve.send(true);
        }
    }

    fn resolve_pending_quit(&self, veto: bool) {
        let pending = self.state.lock().pending_quit.take();
        if let Some(pending) = pending {
            let _ = pending.resolve.send(veto);
        }
    }

    /// Starts the native quit sequence; resolves `true` if it got vetoed.
    ///
    /// While a quit is pending, returns that one.
    pub fn quit(&self, will_restart: bool) -> PendingVeto {
        let quit = {
            let mut state = self.state.lock();
            if let Some(pending) = &state.pending_quit {
                return pending.future.clone();
            }
            state.will_restart |= will_restart;
            let (tx, rx) = oneshot::channel();
            let future: PendingVeto = async move { rx.await.unwrap_or(false) }.boxed().shared();
            state.pending_quit = Some(PendingQuit {
                future: future.clone(),
                resolve: tx,
            });
            future
        };

        tracing::info!(target: "splithost::lifecycle", will_restart, "quit requested");
        self.app.quit();
        quit
    }

    /// Quits and, unless vetoed, relaunches with adjusted arguments.
    ///
    /// Returns the veto.
    pub async fn relaunch(&self, options: RelaunchOptions) -> bool {
        let mut args: Vec<String> = self.app.args().into_iter().skip(1).collect();
        args.extend(options.add_args);
        for arg in &options.remove_args {
            if let Some(pos) = args.iter().position(|a| a == arg) {
                args.remove(pos);
            }
        }

        let app = Arc::clone(&self.app);
        let restore_dir = match self.config.platform {
            Platform::Windows => self.config.startup_dir.clone(),
            _ => None,
        };
        let relauncher = self.app.on_quit().once().subscribe(move |_| {
            if let Some(dir) = &restore_dir {
                if let Err(err) = std::env::set_current_dir(dir) {
                    tracing::warn!(target: "splithost::lifecycle", error = %err, "could not restore working directory");
                }
            }
            app.relaunch(args.clone());
        });

        let veto = self.quit(true).await;
        if veto {
            relauncher.dispose();
        }
        veto
    }

    /// Forced exit: joins shutdown participants and destroys every target,
    /// each within its deadline, then exits with `code`.
    pub async fn kill(&self, code: i32) {
        tracing::info!(target: "splithost::lifecycle", code, "kill requested");

        let joins = self.will_shutdown(ShutdownReason::Kill);
        if tokio::time::timeout(self.config.kill_join_timeout, joins).await.is_err() {
            tracing::warn!(target: "splithost::lifecycle", "shutdown joiners still pending at kill deadline");
        }

        let targets: Vec<Arc<dyn UiTarget>> = self
            .state
            .lock()
            .targets
            .values()
            .map(|entry| Arc::clone(&entry.target))
            .collect();
        let destroyed = futures::future::join_all(targets.into_iter().filter(|t| !t.is_destroyed()).map(|target| {
            let closed = target.on_closed().next();
            target.destroy();
            closed
        }));
        if tokio::time::timeout(self.config.kill_destroy_timeout, destroyed).await.is_err() {
            tracing::warn!(target: "splithost::lifecycle", "targets not confirmed destroyed at kill deadline");
        }

        self.app.exit(code);
    }

    /// Unloads `target` for a reload and reloads it unless vetoed.
    pub async fn reload(self: &Arc<Self>, target: &Arc<dyn UiTarget>) -> bool {
        let veto = self.unload(target, UnloadReason::Reload).await;
        if !veto {
            target.reload();
        }
        veto
    }

    /// True between `before-quit` and a veto.
    pub fn quit_requested(&self) -> bool {
        self.state.lock().quit_requested
    }

    /// True while a quit requested with `will_restart` has not been vetoed.
    pub fn is_restarting(&self) -> bool {
        self.state.lock().will_restart
    }

    /// Registered targets not yet closed.
    pub fn window_count(&self) -> usize {
        self.state.lock().window_count
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

    /// Fired once when quitting starts.
    pub fn on_before_shutdown(&self) -> Event<()> {
        self.on_before_shutdown.event()
    }

    /// Fired once when shutdown is certain; listeners may join.
    pub fn on_will_shutdown(&self) -> Event<WillShutdownEvent<ShutdownReason>> {
        self.on_will_shutdown.event()
    }

    /// Fired right before a target that was not vetoed closes.
    pub fn on_before_close_window(&self) -> Event<TargetId> {
        self.on_before_close_window.event()
    }
}

/// Privileged `lifecycle` channel: `quit`, `relaunch`, `kill`.
struct MainChannel {
    main: Weak<LifecycleMain>,
}

#[async_trait]
impl ServerChannel for MainChannel {
    async fn call(&self, ctx: ConnectionId, command: &str, arg: Value) -> Result<Value, ChannelError> {
        let main = self.main.upgrade().ok_or_else(|| ChannelError::UnknownChannel {
            channel: LIFECYCLE_CHANNEL.to_string(),
        })?;
        tracing::debug!(target: "splithost::lifecycle", %ctx, command, "lifecycle request");

        match command.parse::<LifecycleCommand>()? {
            LifecycleCommand::Quit => Ok(Value::Bool(main.quit(false).await)),
            LifecycleCommand::Relaunch => {
                let options: RelaunchOptions = if arg.is_null() {
                    RelaunchOptions::default()
                } else {
                    serde_json::from_value(arg)?
                };
                Ok(Value::Bool(main.relaunch(options).await))
            }
            LifecycleCommand::Kill => {
                let code: i32 = if arg.is_null() { 0 } else { serde_json::from_value(arg)? };
                main.kill(code).await;
                Ok(Value::Null)
            }
            other => Err(ChannelError::unknown_command(LIFECYCLE_CHANNEL, other.as_str())),
        }
    }

    fn listen(&self, _ctx: ConnectionId, event: &str, _arg: Value) -> Result<Event<Value>, ChannelError> {
        Err(ChannelError::unknown_event(LIFECYCLE_CHANNEL, event))
    }
}
