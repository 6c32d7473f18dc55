//! # Explicit disposal handles.
//!
//! Everything in the crate that can be torn down hands out a [`Subscription`]:
//! event listeners, native-source adapters, channel listeners. Disposal is
//! always explicit and idempotent; dropping a handle does **not** dispose it.
//!
//! [`DisposableStore`] groups handles owned by one component and releases them
//! in reverse registration order.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

type DisposeFn = Box<dyn FnOnce() + Send>;

/// Handle that releases a resource exactly once.
///
/// Cloning yields another handle to the **same** resource; disposing any clone
/// disposes all of them.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<Mutex<Option<DisposeFn>>>,
}

impl Subscription {
    /// Wraps a teardown closure.
    pub fn new(dispose: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(Box::new(dispose)))),
        }
    }

    /// A handle with nothing to release.
    pub fn empty() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }

    /// Combines several handles into one; disposal runs in reverse order.
    pub fn combine(subs: Vec<Subscription>) -> Self {
        Self::new(move || {
            for sub in subs.iter().rev() {
                sub.dispose();
            }
        })
    }

    /// Runs the teardown closure if it has not run yet.
    ///
    /// The closure is taken out of the lock before it runs, so it may freely
    /// dispose other handles (or this one again).
    pub fn dispose(&self) {
        let teardown = self.inner.lock().take();
        if let Some(teardown) = teardown {
            teardown();
        }
    }

    /// True once [`dispose`](Self::dispose) has been called on any clone.
    pub fn is_disposed(&self) -> bool {
        self.inner.lock().is_none()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Owner-scoped collection of handles.
///
/// ### Rules
/// - `dispose()` releases handles in **reverse** registration order.
/// - Adding to an already disposed store disposes the handle immediately.
#[derive(Default)]
pub struct DisposableStore {
    state: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    items: Vec<Subscription>,
    disposed: bool,
}

impl DisposableStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handle; returns a clone for convenience.
    pub fn add(&self, sub: Subscription) -> Subscription {
        let mut state = self.state.lock();
        if state.disposed {
            drop(state);
            tracing::warn!(
                target: "splithost::base",
                "handle added to a disposed store; disposing it right away"
            );
            sub.dispose();
            return sub;
        }
        state.items.push(sub.clone());
        sub
    }

    /// Releases every handle (reverse order). Idempotent.
    pub fn dispose(&self) {
        let items = {
            let mut state = self.state.lock();
            state.disposed = true;
            std::mem::take(&mut state.items)
        };
        for item in items.iter().rev() {
            item.dispose();
        }
    }

    /// True after [`dispose`](Self::dispose).
    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// Number of handles currently held.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// True if no handles are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
