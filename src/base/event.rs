//! # Push-based events.
//!
//! [`Emitter`] owns an ordered list of listeners; [`Event`] is the
//! subscribe-only view handed to consumers. Derived events (`map`, `filter`,
//! `signal`, `once`, `any`) are lazy: they subscribe to their source only while
//! they themselves have a subscriber, and disposing the derived subscription
//! disposes the source subscription exactly once.
//!
//! ## Rules
//! - `emit(&v)` calls every listener registered **at the moment of the call**,
//!   in registration order (the list is snapshotted, then the lock released).
//! - Listeners may subscribe/dispose while an emission is running; changes
//!   apply to the next emission.
//! - A panicking listener is caught and logged; the remaining listeners still run.
//! - Emitting with no listeners is a no-op.
//!
//! ```text
//!   Emitter<T> ──event()──► Event<T> ──map/filter/once──► Event<U>
//!        │                     │
//!   emit(&T)              subscribe(fn) ──► Subscription::dispose()
//! ```

use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::dispose::Subscription;

/// Shared listener callback.
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

type Hook = Box<dyn Fn() + Send + Sync>;

/// Hooks invoked when an emitter gains its first / loses its last listener.
///
/// Used to attach and detach upstream resources lazily (native listeners,
/// remote subscriptions).
#[derive(Default)]
pub struct EmitterOptions {
    on_first_listener: Option<Hook>,
    on_last_listener_removed: Option<Hook>,
}

impl EmitterOptions {
    /// Options without hooks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs right after the listener list goes from empty to non-empty.
    pub fn on_first_listener(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_first_listener = Some(Box::new(hook));
        self
    }

    /// Runs right after the listener list goes from non-empty to empty.
    pub fn on_last_listener_removed(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_last_listener_removed = Some(Box::new(hook));
        self
    }
}

struct Listeners<T> {
    entries: Vec<(u64, Listener<T>)>,
    next_id: u64,
    disposed: bool,
}

struct Shared<T> {
    listeners: Mutex<Listeners<T>>,
    options: EmitterOptions,
}

impl<T: 'static> Shared<T> {
    fn add(this: &Arc<Self>, listener: Listener<T>) -> Subscription {
        let (id, first) = {
            let mut l = this.listeners.lock();
            if l.disposed {
                return Subscription::empty();
            }
            let id = l.next_id;
            l.next_id += 1;
            l.entries.push((id, listener));
            (id, l.entries.len() == 1)
        };

        if first {
            if let Some(hook) = &this.options.on_first_listener {
                hook();
            }
        }

        // The handle keeps the listener list alive until it is disposed.
        let shared = Arc::clone(this);
        Subscription::new(move || shared.remove(id))
    }

    fn remove(&self, id: u64) {
        let became_empty = {
            let mut l = self.listeners.lock();
            let before = l.entries.len();
            l.entries.retain(|(entry, _)| *entry != id);
            before != l.entries.len() && l.entries.is_empty()
        };
        if became_empty {
            if let Some(hook) = &self.options.on_last_listener_removed {
                hook();
            }
        }
    }
}

/// Owning side of an event.
pub struct Emitter<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: 'static> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Emitter<T> {
    /// Creates an emitter without hooks.
    pub fn new() -> Self {
        Self::with_options(EmitterOptions::default())
    }

    /// Creates an emitter with first/last listener hooks.
    pub fn with_options(options: EmitterOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                listeners: Mutex::new(Listeners {
                    entries: Vec::new(),
                    next_id: 0,
                    disposed: false,
                }),
                options,
            }),
        }
    }

    /// Subscribe-only view of this emitter.
    pub fn event(&self) -> Event<T> {
        let shared = Arc::clone(&self.shared);
        Event::from_fn(move |listener| Shared::add(&shared, listener))
    }

    /// Synchronously delivers `value` to every current listener.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Listener<T>> = self
            .shared
            .listeners
            .lock()
            .entries
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(value))).is_err() {
                tracing::error!(target: "splithost::base", "event listener panicked");
            }
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.shared.listeners.lock().entries.len()
    }

    /// True if at least one listener is registered.
    pub fn has_listeners(&self) -> bool {
        self.listener_count() > 0
    }

    /// Drops every listener; later subscriptions are ignored.
    pub fn dispose(&self) {
        let removed = {
            let mut l = self.shared.listeners.lock();
            l.disposed = true;
            std::mem::take(&mut l.entries)
        };
        if !removed.is_empty() {
            if let Some(hook) = &self.shared.options.on_last_listener_removed {
                hook();
            }
        }
    }

    pub(crate) fn downgrade(&self) -> WeakEmitter<T> {
        WeakEmitter(Arc::downgrade(&self.shared))
    }
}

impl<T> fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("listeners", &self.shared.listeners.lock().entries.len())
            .finish()
    }
}

/// Non-owning emitter reference used by hooks that must not keep it alive.
pub(crate) struct WeakEmitter<T>(Weak<Shared<T>>);

impl<T> WeakEmitter<T> {
    pub(crate) fn upgrade(&self) -> Option<Emitter<T>> {
        self.0.upgrade().map(|shared| Emitter { shared })
    }
}

/// Subscribe-only handle to a stream of values.
pub struct Event<T> {
    subscribe: Arc<dyn Fn(Listener<T>) -> Subscription + Send + Sync>,
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self {
            subscribe: Arc::clone(&self.subscribe),
        }
    }
}

impl<T> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Event")
    }
}

impl<T: 'static> Event<T> {
    /// Builds an event from a raw subscribe function.
    pub fn from_fn(f: impl Fn(Listener<T>) -> Subscription + Send + Sync + 'static) -> Self {
        Self {
            subscribe: Arc::new(f),
        }
    }

    /// An event that never fires.
    pub fn none() -> Self {
        Self::from_fn(|_| Subscription::empty())
    }

    /// Registers `listener`; it stays active until the returned handle is disposed.
    ///
    /// The handle keeps the underlying emitter alive, so subscribing to a
    /// temporary event is fine.
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        (self.subscribe)(Arc::new(listener))
    }

    fn subscribe_shared(&self, listener: Listener<T>) -> Subscription {
        (self.subscribe)(listener)
    }

    /// Forwards `f(value)` for every firing of `self`.
    pub fn map<U: 'static>(&self, f: impl Fn(&T) -> U + Send + Sync + 'static) -> Event<U> {
        let source = self.clone();
        let f = Arc::new(f);
        Event::from_fn(move |listener: Listener<U>| {
            let f = Arc::clone(&f);
            source.subscribe(move |value| listener(&f(value)))
        })
    }

    /// Forwards only the values for which `predicate` holds.
    pub fn filter(&self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Event<T> {
        let source = self.clone();
        let predicate = Arc::new(predicate);
        Event::from_fn(move |listener: Listener<T>| {
            let predicate = Arc::clone(&predicate);
            source.subscribe(move |value| {
                if predicate(value) {
                    listener(value);
                }
            })
        })
    }

    /// Forwards every firing, discarding the value.
    pub fn signal(&self) -> Event<()> {
        self.map(|_| ())
    }

    /// Forwards the first firing only, then unsubscribes from the source.
    pub fn once(&self) -> Event<T> {
        let source = self.clone();
        Event::from_fn(move |listener: Listener<T>| {
            let fired = Arc::new(AtomicBool::new(false));
            let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

            let sub = {
                let fired = Arc::clone(&fired);
                let slot = Arc::clone(&slot);
                source.subscribe(move |value| {
                    if fired.swap(true, Ordering::SeqCst) {
                        return;
                    }
                    let own = slot.lock().take();
                    if let Some(own) = own {
                        own.dispose();
                    }
                    listener(value);
                })
            };

            if fired.load(Ordering::SeqCst) {
                sub.dispose();
            } else {
                *slot.lock() = Some(sub.clone());
            }
            sub
        })
    }

    /// Fires whenever any of `events` fires, forwarding that value.
    pub fn any(events: impl IntoIterator<Item = Event<T>>) -> Event<T> {
        let events: Vec<Event<T>> = events.into_iter().collect();
        Event::from_fn(move |listener: Listener<T>| {
            let subs = events
                .iter()
                .map(|event| event.subscribe_shared(Arc::clone(&listener)))
                .collect();
            Subscription::combine(subs)
        })
    }

    /// Resolves with the next value, or `None` if the source is torn down first.
    ///
    /// The subscription is made when this method is called, not when the
    /// returned future is first polled.
    pub fn next(&self) -> impl Future<Output = Option<T>> + Send + 'static + use<T>
    where
        T: Clone + Send,
    {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let sub = self.once().subscribe(move |value: &T| {
            let tx = tx.lock().take();
            if let Some(tx) = tx {
                let _ = tx.send(value.clone());
            }
        });
        let guard = DisposeOnDrop(sub);
        async move {
            let _guard = guard;
            rx.await.ok()
        }
    }

    /// Adapts a foreign add/remove-listener source.
    ///
    /// The native listener is attached when the first subscriber arrives and
    /// removed when the last one leaves.
    pub fn from_source<P, S>(
        source: Arc<S>,
        name: impl Into<String>,
        mapper: impl Fn(&P) -> T + Send + Sync + 'static,
    ) -> Event<T>
    where
        P: 'static,
        S: ExternalSource<P> + ?Sized,
    {
        let name: Arc<str> = Arc::from(name.into());
        let mapper: Arc<dyn Fn(&P) -> T + Send + Sync> = Arc::new(mapper);
        let target: Arc<OnceLock<WeakEmitter<T>>> = Arc::new(OnceLock::new());
        let token: Arc<Mutex<Option<ListenerToken>>> = Arc::new(Mutex::new(None));

        let attach = {
            let (source, name, token) = (Arc::clone(&source), Arc::clone(&name), Arc::clone(&token));
            let (mapper, target) = (Arc::clone(&mapper), Arc::clone(&target));
            move || {
                let (mapper, target) = (Arc::clone(&mapper), Arc::clone(&target));
                let native: Listener<P> = Arc::new(move |payload: &P| {
                    if let Some(emitter) = target.get().and_then(WeakEmitter::upgrade) {
                        emitter.emit(&mapper(payload));
                    }
                });
                *token.lock() = Some(source.add_listener(&name, native));
            }
        };
        let detach = move || {
            let taken = token.lock().take();
            if let Some(taken) = taken {
                source.remove_listener(&name, taken);
            }
        };

        let emitter = Emitter::with_options(
            EmitterOptions::new()
                .on_first_listener(attach)
                .on_last_listener_removed(detach),
        );
        let _ = target.set(emitter.downgrade());
        emitter.event()
    }
}

struct DisposeOnDrop(Subscription);

impl Drop for DisposeOnDrop {
    fn drop(&mut self) {
        self.0.dispose();
    }
}

/// Identifies a listener registered on an [`ExternalSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(pub u64);

/// A foreign push-style source with named add/remove listener calls.
pub trait ExternalSource<P>: Send + Sync + 'static {
    /// Attaches `listener` to the native event `name`.
    fn add_listener(&self, name: &str, listener: Listener<P>) -> ListenerToken;

    /// Detaches the listener identified by `token`.
    fn remove_listener(&self, name: &str, token: ListenerToken);
}
