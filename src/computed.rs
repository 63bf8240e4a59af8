use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::arena::{
    add_dispose_callback, bump_global_version, dispose_node, edge_arena, node_arena_insert,
    node_arena_remove, notify, recompute_in_place, refresh, NodeId, NodeKind, NodeMetadata,
    DISPOSED, HAS_ERROR, RUNNING,
};
use crate::effect::{maybe_flush, DisposeHandle, Subscription};
use crate::error::ReactiveError;
use crate::observer;
use crate::signal::{structural_equality, values_equal, EqFn};

/// Turn a panic payload back into a [`ReactiveError`].
///
/// Reads of erroring or cyclic computeds panic with the error itself as
/// payload, so a compute function that observed such a read transparently
/// caches the original error instead of a stringified copy.
fn error_from_panic(payload: Box<dyn Any + Send>) -> ReactiveError {
    match payload.downcast::<ReactiveError>() {
        Ok(err) => *err,
        Err(payload) => {
            let message = if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "compute function panicked".to_string()
            };
            ReactiveError::Compute { message }
        }
    }
}

struct ComputedCell<T> {
    current: Option<T>,
    previous: Option<T>,
    initial: Option<T>,
}

struct ComputedInner<T> {
    node: NodeId,
    cell: Arc<RwLock<ComputedCell<T>>>,
    /// When set, the next driver run stores its result unconditionally,
    /// bypassing the equality predicate. Used by [`Computed::recompute`].
    force_next: Arc<AtomicBool>,
}

impl<T> Drop for ComputedInner<T> {
    fn drop(&mut self) {
        dispose_node(self.node);
        edge_arena::drop_links(self.node);
        node_arena_remove(self.node);
    }
}

/// A lazy, memoized derivation over other nodes.
///
/// The compute function runs on first read, not on creation, and the set
/// of dependencies is rediscovered on every run: only the sources the
/// function actually read this time stay subscribed. A computed
/// re-evaluates only when one of those sources has genuinely changed
/// since the value was cached.
///
/// A panic inside the compute function is caught and cached; every
/// subsequent read reports it (as `Err` from [`try_get`](Self::try_get),
/// as a panic from [`get`](Self::get)) until an evaluation succeeds.
pub struct Computed<T: Clone + Send + Sync + 'static> {
    inner: Arc<ComputedInner<T>>,
}

impl<T: Clone + Send + Sync + 'static> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Options for constructing a [`Computed`].
pub struct ComputedBuilder<T> {
    compute: Box<dyn FnMut() -> T + Send>,
    label: Option<Arc<str>>,
    auto_dispose: bool,
}

impl<T: Clone + Send + Sync + 'static> ComputedBuilder<T> {
    /// Attach a debug label, surfaced in errors and diagnostics.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(Arc::from(label.into()));
        self
    }

    /// Dispose the computed automatically when it loses its last
    /// subscriber.
    pub fn auto_dispose(mut self, auto_dispose: bool) -> Self {
        self.auto_dispose = auto_dispose;
        self
    }

    /// Build the computed with the default structural equality. The
    /// compute function does not run yet.
    pub fn build(self) -> Computed<T>
    where
        T: PartialEq,
    {
        self.finish(structural_equality::<T>())
    }

    /// Build the computed with a custom equality predicate. This is the
    /// constructor for value types that do not implement `PartialEq`.
    pub fn build_with_equality(
        self,
        eq: impl Fn(&T, &T) -> bool + Send + Sync + 'static,
    ) -> Computed<T> {
        self.finish(Arc::new(eq))
    }

    fn finish(self, eq: EqFn<T>) -> Computed<T> {
        let metadata = NodeMetadata::new(NodeKind::Computed, self.label, self.auto_dispose);
        let node = node_arena_insert(metadata);

        let cell = Arc::new(RwLock::new(ComputedCell {
            current: None,
            previous: None,
            initial: None,
        }));
        let force_next = Arc::new(AtomicBool::new(false));

        let driver_cell = Arc::clone(&cell);
        let driver_force = Arc::clone(&force_next);
        let mut compute = self.compute;
        node.install_driver(Box::new(move || {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| compute()));
            let value = match result {
                Ok(value) => value,
                Err(payload) => return crate::arena::DriveOutcome::Failed(error_from_panic(payload)),
            };
            let forced = driver_force.swap(false, Ordering::AcqRel);
            let report = if observer::active() {
                Some(value.clone())
            } else {
                None
            };
            let changed = {
                let mut cell = driver_cell.write();
                match cell.current.take() {
                    None => {
                        cell.initial = Some(value.clone());
                        cell.previous = Some(value.clone());
                        cell.current = Some(value);
                        true
                    }
                    Some(current) => {
                        if !forced && values_equal(&eq, &current, &value) {
                            cell.current = Some(current);
                            false
                        } else {
                            cell.previous = Some(current);
                            cell.current = Some(value);
                            true
                        }
                    }
                }
            };
            if changed {
                if let Some(reported) = report {
                    observer::computed_updated(node, &reported);
                }
                crate::arena::DriveOutcome::Changed
            } else {
                crate::arena::DriveOutcome::Unchanged
            }
        }));

        observer::computed_created(node);
        Computed {
            inner: Arc::new(ComputedInner {
                node,
                cell,
                force_next,
            }),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Computed<T> {
    /// Create a computed from a compute function, compared with
    /// `PartialEq`. Nothing runs until the first read.
    pub fn new(compute: impl FnMut() -> T + Send + 'static) -> Self
    where
        T: PartialEq,
    {
        Self::builder(compute).build()
    }

    /// Start building a computed with non-default options.
    pub fn builder(compute: impl FnMut() -> T + Send + 'static) -> ComputedBuilder<T> {
        ComputedBuilder {
            compute: Box::new(compute),
            label: None,
            auto_dispose: false,
        }
    }

    pub(crate) fn node_id(&self) -> NodeId {
        self.inner.node
    }

    /// Read the value, refreshing it if an upstream source changed, and
    /// register a dependency when called from a computed or effect.
    ///
    /// Errors are reported as values: a cycle through this computed, or a
    /// cached compute failure.
    pub fn try_get(&self) -> Result<T, ReactiveError> {
        let node = self.inner.node;
        if node.flags() & DISPOSED != 0 {
            tracing::warn!(
                target: "quiver",
                id = node.global_id(),
                label = node.label().as_deref().unwrap_or_default(),
                "read of a disposed computed returns its frozen value"
            );
            return self.inner.cell.read().current.clone().ok_or_else(|| {
                ReactiveError::Compute {
                    message: "computed was disposed before its first evaluation".to_string(),
                }
            });
        }
        if node.flags() & RUNNING != 0 {
            return Err(ReactiveError::Cycle {
                label: node.label(),
            });
        }
        let edge = edge_arena::add_dependency(node);
        if !refresh(node) {
            return Err(ReactiveError::Cycle {
                label: node.label(),
            });
        }
        // Re-record what the caller actually observed, now that the
        // refresh may have moved our version.
        if let Some(edge) = edge {
            edge_arena::record_version(edge, node.version());
        }
        if node.flags() & HAS_ERROR != 0 {
            return Err(node.cached_error().unwrap_or_else(|| ReactiveError::Compute {
                message: "compute failed".to_string(),
            }));
        }
        Ok(self
            .inner
            .cell
            .read()
            .current
            .clone()
            .expect("computed value is present after a successful refresh"))
    }

    /// Read the value, panicking on a cycle or a cached compute failure.
    ///
    /// The panic payload is the [`ReactiveError`] itself, so an enclosing
    /// computed that performed this read caches the original error.
    pub fn get(&self) -> T {
        match self.try_get() {
            Ok(value) => value,
            Err(err) => std::panic::panic_any(err),
        }
    }

    /// Read the freshest value without registering a dependency.
    ///
    /// Panics under the same conditions as [`get`](Self::get).
    pub fn peek(&self) -> T {
        let node = self.inner.node;
        if node.flags() & DISPOSED != 0 {
            tracing::warn!(
                target: "quiver",
                id = node.global_id(),
                "peek of a disposed computed returns its frozen value"
            );
        } else {
            if !refresh(node) {
                std::panic::panic_any(ReactiveError::Cycle {
                    label: node.label(),
                });
            }
            if node.flags() & HAS_ERROR != 0 {
                if let Some(err) = node.cached_error() {
                    std::panic::panic_any(err);
                }
            }
        }
        self.inner
            .cell
            .read()
            .current
            .clone()
            .expect("computed value is present after a successful refresh")
    }

    /// The value cached before the most recent change, if any.
    pub fn previous_value(&self) -> Option<T> {
        self.inner.cell.read().previous.clone()
    }

    /// The value produced by the first evaluation, if one has happened.
    pub fn initial_value(&self) -> Option<T> {
        self.inner.cell.read().initial.clone()
    }

    /// Force a re-evaluation: first refresh through the normal path (so
    /// sources are consistent and re-registered), then run the compute
    /// function once more, storing its result unconditionally and
    /// notifying dependents.
    pub fn recompute(&self) -> Result<(), ReactiveError> {
        let node = self.inner.node;
        if node.flags() & DISPOSED != 0 {
            return Ok(());
        }
        if node.flags() & RUNNING != 0 {
            return Err(ReactiveError::Cycle {
                label: node.label(),
            });
        }
        let edge = edge_arena::add_dependency(node);
        if !refresh(node) {
            return Err(ReactiveError::Cycle {
                label: node.label(),
            });
        }

        self.inner.force_next.store(true, Ordering::Release);
        node.set_flags(RUNNING);
        let changed = recompute_in_place(node);
        if let Some(edge) = edge {
            edge_arena::record_version(edge, node.version());
        }
        if changed {
            bump_global_version();
            for dependent in edge_arena::target_dependents(node) {
                notify(dependent);
            }
            maybe_flush()?;
        }
        if node.flags() & HAS_ERROR != 0 {
            if let Some(err) = node.cached_error() {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Testing hook: refresh, then overwrite both current and previous
    /// value with `value`, keeping identity and edges intact. Dependents
    /// are notified as for a write.
    pub fn override_with(&self, value: T) -> Result<(), ReactiveError> {
        let node = self.inner.node;
        if node.flags() & DISPOSED != 0 {
            return Ok(());
        }
        // Bring the cache up to date first; an evaluation failure is
        // acceptable here since the override replaces the value anyway.
        let _ = self.try_get();
        {
            let mut cell = self.inner.cell.write();
            if cell.initial.is_none() {
                cell.initial = Some(value.clone());
            }
            cell.previous = Some(value.clone());
            cell.current = Some(value);
        }
        node.clear_error();
        node.clear_flags(HAS_ERROR);
        node.bump_version();
        bump_global_version();
        for dependent in edge_arena::target_dependents(node) {
            notify(dependent);
        }
        maybe_flush()
    }

    /// Local version: bumped when an evaluation changes the value (or
    /// fails, so dependents observe the failure).
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

    /// Whether the computed has been disposed.
    pub fn disposed(&self) -> bool {
        self.inner.node.flags() & DISPOSED != 0
    }

    /// Run `f` with every future value of this computed.
    ///
    /// Installs an effect that reads the computed, which also gives the
    /// computed live demand (it starts tracking its sources eagerly).
    pub fn subscribe(&self, mut f: impl FnMut(T) + Send + 'static) -> Subscription {
        let this = self.clone();
        Subscription::wrap(crate::effect::Effect::new(move || f(this.get())))
    }

    /// Register a callback to run when the computed is disposed.
    pub fn on_dispose(&self, callback: impl FnOnce() + Send + 'static) -> DisposeHandle {
        let token = add_dispose_callback(self.inner.node, Box::new(callback));
        DisposeHandle::new(self.inner.node, token)
    }

    /// Dispose the computed: freeze its cache, run dispose callbacks, and
    /// drop every edge on both sides. Idempotent.
    pub fn dispose(&self) {
        dispose_node(self.inner.node);
    }
}

impl<T: Clone + Send + Sync + Serialize + 'static> Computed<T> {
    /// Serialize the freshest value (without registering a dependency).
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.peek()).unwrap_or(serde_json::Value::Null)
    }
}
