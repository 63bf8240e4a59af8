use std::mem;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::arena::{
    add_dispose_callback, bump_global_version, dispose_node, edge_arena, node_arena_insert,
    node_arena_remove, notify, NodeId, NodeKind, NodeMetadata, DISPOSED,
};
use crate::effect::{maybe_flush, DisposeHandle, Subscription};
use crate::error::ReactiveError;
use crate::observer;

/// Pluggable equality predicate. A write that compares equal to the
/// current value is a complete no-op.
pub(crate) type EqFn<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

pub(crate) fn structural_equality<T: PartialEq>() -> EqFn<T> {
    Arc::new(|a: &T, b: &T| a == b)
}

/// Comparator failure is treated as "unequal": a broken predicate must
/// never suppress a propagation.
pub(crate) fn values_equal<T>(eq: &EqFn<T>, a: &T, b: &T) -> bool {
    std::panic::catch_unwind(AssertUnwindSafe(|| eq(a, b))).unwrap_or(false)
}

struct ValueCell<T> {
    current: T,
    previous: T,
    initial: T,
}

struct SignalInner<T> {
    node: NodeId,
    cell: RwLock<ValueCell<T>>,
    eq: EqFn<T>,
}

impl<T> Drop for SignalInner<T> {
    fn drop(&mut self) {
        dispose_node(self.node);
        edge_arena::drop_links(self.node);
        node_arena_remove(self.node);
    }
}

/// A mutable leaf cell of the reactive graph.
///
/// Writes that change the value (under the equality predicate) bump the
/// signal's version and the global version, mark every dependent
/// outdated, and run any scheduled effects before the write returns
/// (unless a [`batch`](crate::batch) is open).
///
/// Handles are cheap clones of one shared cell; the signal is disposed
/// when [`dispose`](Signal::dispose) is called or the last handle drops.
///
/// # Example
/// ```ignore
/// let count = quiver::signal(0);
/// let doubled = quiver::computed({
///     let count = count.clone();
///     move || count.get() * 2
/// });
/// count.set(3)?;
/// assert_eq!(doubled.get(), 6);
/// ```
pub struct Signal<T: Clone + Send + Sync + 'static> {
    inner: Arc<SignalInner<T>>,
}

impl<T: Clone + Send + Sync + 'static> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Options for constructing a [`Signal`].
pub struct SignalBuilder<T> {
    initial: T,
    label: Option<Arc<str>>,
    auto_dispose: bool,
}

impl<T: Clone + Send + Sync + 'static> SignalBuilder<T> {
    /// Attach a debug label, surfaced in errors and diagnostics.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(Arc::from(label.into()));
        self
    }

    /// Dispose the signal automatically when it loses its last subscriber.
    pub fn auto_dispose(mut self, auto_dispose: bool) -> Self {
        self.auto_dispose = auto_dispose;
        self
    }

    /// Build the signal with the default structural equality.
    pub fn build(self) -> Signal<T>
    where
        T: PartialEq,
    {
        self.finish(structural_equality::<T>())
    }

    /// Build the signal with a custom equality predicate. This is the
    /// constructor for value types that do not implement `PartialEq`.
    pub fn build_with_equality(
        self,
        eq: impl Fn(&T, &T) -> bool + Send + Sync + 'static,
    ) -> Signal<T> {
        self.finish(Arc::new(eq))
    }

    fn finish(self, eq: EqFn<T>) -> Signal<T> {
        let metadata = NodeMetadata::new(NodeKind::Signal, self.label, self.auto_dispose);
        let node = node_arena_insert(metadata);
        let initial = self.initial;
        let inner = Arc::new(SignalInner {
            node,
            cell: RwLock::new(ValueCell {
                current: initial.clone(),
                previous: initial.clone(),
                initial,
            }),
            eq,
        });
        observer::signal_created(node);
        Signal { inner }
    }
}

impl<T: Clone + Send + Sync + 'static> Signal<T> {
    /// Create a signal holding `initial`, compared with `PartialEq`.
    pub fn new(initial: T) -> Self
    where
        T: PartialEq,
    {
        Self::builder(initial).build()
    }

    /// Start building a signal with non-default options.
    pub fn builder(initial: T) -> SignalBuilder<T> {
        SignalBuilder {
            initial,
            label: None,
            auto_dispose: false,
        }
    }

    pub(crate) fn node_id(&self) -> NodeId {
        self.inner.node
    }

    /// Read the current value, registering a dependency when called from
    /// inside a computed or effect.
    ///
    /// Reading a disposed signal logs a warning and returns the frozen
    /// last value.
    pub fn get(&self) -> T {
        let node = self.inner.node;
        if node.flags() & DISPOSED != 0 {
            tracing::warn!(
                target: "quiver",
                id = node.global_id(),
                label = node.label().as_deref().unwrap_or_default(),
                "read of a disposed signal returns its frozen value"
            );
            return self.inner.cell.read().current.clone();
        }
        edge_arena::add_dependency(node);
        self.inner.cell.read().current.clone()
    }

    /// Read the current value without registering a dependency.
    pub fn peek(&self) -> T {
        self.inner.cell.read().current.clone()
    }

    /// The value the signal held before the most recent accepted write.
    pub fn previous_value(&self) -> T {
        self.inner.cell.read().previous.clone()
    }

    /// The value the signal was created with.
    pub fn initial_value(&self) -> T {
        self.inner.cell.read().initial.clone()
    }

    /// Write a new value. A value equal to the current one (under the
    /// equality predicate) changes nothing and notifies nobody.
    pub fn set(&self, value: T) -> Result<(), ReactiveError> {
        self.write(value, false)
    }

    /// Write unconditionally, bypassing the equality predicate.
    pub fn force_set(&self, value: T) -> Result<(), ReactiveError> {
        self.write(value, true)
    }

    /// Derive the next value from the current one and write it.
    pub fn update(&self, f: impl FnOnce(&T) -> T) -> Result<(), ReactiveError> {
        let next = {
            let cell = self.inner.cell.read();
            f(&cell.current)
        };
        self.set(next)
    }

    fn write(&self, value: T, force: bool) -> Result<(), ReactiveError> {
        let node = self.inner.node;
        if node.flags() & DISPOSED != 0 {
            return Err(ReactiveError::WriteAfterDispose {
                label: node.label(),
            });
        }
        if !force {
            let cell = self.inner.cell.read();
            if values_equal(&self.inner.eq, &cell.current, &value) {
                return Ok(());
            }
        }
        {
            let mut cell = self.inner.cell.write();
            cell.previous = mem::replace(&mut cell.current, value);
        }
        node.bump_version();
        bump_global_version();
        if observer::active() {
            let current = self.inner.cell.read().current.clone();
            observer::signal_updated(node, &current);
        }
        for dependent in edge_arena::target_dependents(node) {
            notify(dependent);
        }
        maybe_flush()
    }

    /// Local version: bumped once per accepted write.
    pub fn version(&self) -> u64 {
        self.inner.node.version()
    }

    /// Stable identity, unique for the process lifetime.
    pub fn global_id(&self) -> u64 {
        self.inner.node.global_id()
    }

    /// Debug label, if one was given.
    pub fn label(&self) -> Option<Arc<str>> {
        self.inner.node.label()
    }

    /// Whether the signal has been disposed.
    pub fn disposed(&self) -> bool {
        self.inner.node.flags() & DISPOSED != 0
    }

    /// Run `f` with every future value of this signal.
    ///
    /// Installs an effect that reads the signal; `f` runs once
    /// immediately and again after each accepted write. Dropping the
    /// returned [`Subscription`] stops the calls.
    pub fn subscribe(&self, mut f: impl FnMut(T) + Send + 'static) -> Subscription {
        let this = self.clone();
        Subscription::wrap(crate::effect::Effect::new(move || f(this.get())))
    }

    /// Register a callback to run when the signal is disposed. Callbacks
    /// run in insertion order, exactly once.
    pub fn on_dispose(&self, callback: impl FnOnce() + Send + 'static) -> DisposeHandle {
        let token = add_dispose_callback(self.inner.node, Box::new(callback));
        DisposeHandle::new(self.inner.node, token)
    }

    /// Dispose the signal: freeze its value, run dispose callbacks, and
    /// drop every edge. Idempotent.
    pub fn dispose(&self) {
        dispose_node(self.inner.node);
    }
}

impl<T: Clone + Send + Sync + Serialize + 'static> Signal<T> {
    /// Serialize the current value (without registering a dependency).
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.peek()).unwrap_or(serde_json::Value::Null)
    }
}

impl<T: Clone + Send + Sync + std::fmt::Debug + 'static> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.global_id())
            .field("value", &self.peek())
            .field("version", &self.version())
            .finish()
    }
}
