#![deny(missing_docs)]

//! Fine-grained reactive value propagation
//!
//! A directed graph of [`Signal`]s (mutable leaf cells), [`Computed`]s
//! (memoized derivations) and [`Effect`]s (side-effecting observers),
//! with two guarantees:
//!
//! - **Glitch-freedom**: no observer ever sees a mix of old and new
//!   upstream values. Propagation is two-phase: a write eagerly *marks*
//!   everything downstream, then values are *pulled* up to date, bottom
//!   up, when something reads them.
//! - **Minimal recomputation**: a node re-evaluates only when a source it
//!   actually read has changed. Dependencies are rediscovered on every
//!   run, so a branch not taken this time costs nothing next time.
//!
//! # Quick start
//!
//! ```ignore
//! use quiver::{signal, computed, effect, batch};
//!
//! let price = signal(10.0);
//! let quantity = signal(2.0);
//!
//! let total = computed({
//!     let (price, quantity) = (price.clone(), quantity.clone());
//!     move || price.get() * quantity.get()
//! });
//!
//! let logger = effect({
//!     let total = total.clone();
//!     move || println!("total: {}", total.get())
//! }); // prints "total: 20"
//!
//! price.set(12.0)?; // prints "total: 24", once, before set returns
//!
//! batch(|| {
//!     price.set(1.0)?;
//!     quantity.set(100.0)?;
//!     Ok::<_, quiver::ReactiveError>(())
//! }); // prints "total: 100", once, at batch exit
//!
//! drop(logger); // stops the printing
//! ```
//!
//! # Reading without subscribing
//!
//! ```ignore
//! let v = price.peek();                  // never registers a dependency
//! let v = quiver::untracked(|| price.get()); // same, for a whole block
//! ```
//!
//! # Lifecycle
//!
//! Every node exposes `dispose()`, `on_dispose(cb)` and a stable
//! `global_id()`. Disposing freezes a node: reads keep returning the last
//! value (with a logged warning), writes fail with
//! [`ReactiveError::WriteAfterDispose`]. Nodes built with
//! `auto_dispose(true)` dispose themselves when their last subscriber
//! goes away.

// Internal modules
pub(crate) mod arena;
mod batch;
mod computed;
mod effect;
mod error;
mod hash;
mod observer;
mod signal;

// Core types
pub use computed::{Computed, ComputedBuilder};
pub use effect::{DisposeHandle, Effect, Subscription};
pub use error::ReactiveError;
pub use signal::{Signal, SignalBuilder};

// Key functions
pub use batch::batch;
pub use effect::{flush_effects, scheduled_effects, untracked};

// Devtools integration
pub use arena::NodeKind;
pub use observer::{register_observer, NodeInfo, Observer, ObserverHandle};

/// Create a [`Signal`] holding `initial`. Shorthand for
/// [`Signal::new`]; use [`Signal::builder`] for options.
pub fn signal<T: Clone + PartialEq + Send + Sync + 'static>(initial: T) -> Signal<T> {
    Signal::new(initial)
}

/// Create a [`Computed`] from a compute function. Shorthand for
/// [`Computed::new`]; use [`Computed::builder`] for options.
pub fn computed<T, F>(compute: F) -> Computed<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    F: FnMut() -> T + Send + 'static,
{
    Computed::new(compute)
}

/// Create an [`Effect`] and run it once immediately. The returned handle
/// is the dispose token.
pub fn effect<F>(f: F) -> Effect
where
    F: FnMut() + Send + 'static,
{
    Effect::new(f)
}

#[cfg(test)]
mod tests;
