//! Event and async building blocks shared by the IPC and lifecycle layers.
//!
//! - [`event`]: [`Emitter`]/[`Event`] with lazy derived events and native-source adapters.
//! - [`dispose`]: [`Subscription`] handles and [`DisposableStore`].
//! - [`barrier`]: one-shot [`Barrier`].
//! - [`timeout`]: cancellable [`DisposableTimeout`].

pub mod barrier;
pub mod dispose;
pub mod event;
pub mod timeout;

pub use barrier::Barrier;
pub use dispose::{DisposableStore, Subscription};
pub use event::{Emitter, EmitterOptions, Event, ExternalSource, Listener, ListenerToken};
pub use timeout::DisposableTimeout;
