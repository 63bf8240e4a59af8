//! Devtools observer hooks.
//!
//! Inspection tooling can register an [`Observer`] to be told when nodes
//! are created, when values move and when effects fire. Hooks are purely
//! informational: they run synchronously at the call site, after the
//! graph state they describe has been committed, and must not assume they
//! can mutate the graph re-entrantly.

use std::any::Any;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::arena::{NodeId, NodeKind};

/// Snapshot of a node's identity handed to observer hooks.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// Stable process-wide identity of the node.
    pub global_id: u64,
    /// Debug label, if one was set at construction.
    pub label: Option<Arc<str>>,
    /// Whether the node is a signal, computed or effect.
    pub kind: NodeKind,
    /// The node's local version at the time of the event.
    pub version: u64,
}

impl NodeInfo {
    pub(crate) fn of(node: NodeId) -> Self {
        Self {
            global_id: node.global_id(),
            label: node.label(),
            kind: node.kind().unwrap_or(NodeKind::Signal),
            version: node.version(),
        }
    }
}

/// Inspection hooks for developer tooling. Every method has an empty
/// default body; implement only what you need.
pub trait Observer: Send + Sync {
    /// A signal was created.
    fn signal_created(&self, _info: &NodeInfo) {}
    /// A signal's value changed. `value` is the new value.
    fn signal_updated(&self, _info: &NodeInfo, _value: &dyn Any) {}
    /// A computed was created (not yet evaluated).
    fn computed_created(&self, _info: &NodeInfo) {}
    /// A computed produced a value different from its cached one.
    fn computed_updated(&self, _info: &NodeInfo, _value: &dyn Any) {}
    /// An effect was created.
    fn effect_created(&self, _info: &NodeInfo) {}
    /// An effect body is about to run.
    fn effect_called(&self, _info: &NodeInfo) {}
}

static REGISTRY: LazyLock<RwLock<Vec<(u64, Arc<dyn Observer>)>>> =
    LazyLock::new(|| RwLock::new(Vec::new()));
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);
static ACTIVE: AtomicUsize = AtomicUsize::new(0);

/// Register an observer. The observer stays registered until the handle
/// is dropped or [`ObserverHandle::unregister`] is called.
pub fn register_observer(observer: Arc<dyn Observer>) -> ObserverHandle {
    let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
    REGISTRY.write().push((token, observer));
    ACTIVE.fetch_add(1, Ordering::Release);
    ObserverHandle {
        token,
        released: false,
    }
}

/// Removal token returned by [`register_observer`]. Dropping it removes
/// the observer.
#[derive(Debug)]
pub struct ObserverHandle {
    token: u64,
    released: bool,
}

impl ObserverHandle {
    /// Remove the observer this handle refers to.
    pub fn unregister(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut registry = REGISTRY.write();
        let before = registry.len();
        registry.retain(|(token, _)| *token != self.token);
        if registry.len() < before {
            ACTIVE.fetch_sub(1, Ordering::Release);
        }
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[inline]
pub(crate) fn active() -> bool {
    ACTIVE.load(Ordering::Acquire) > 0
}

// Snapshot the registry before calling out so a hook that registers or
// unregisters observers does not deadlock on the registry lock.
fn snapshot() -> SmallVec<[Arc<dyn Observer>; 2]> {
    REGISTRY
        .read()
        .iter()
        .map(|(_, observer)| observer.clone())
        .collect()
}

pub(crate) fn signal_created(node: NodeId) {
    if !active() {
        return;
    }
    let info = NodeInfo::of(node);
    for observer in snapshot() {
        observer.signal_created(&info);
    }
}

pub(crate) fn signal_updated(node: NodeId, value: &dyn Any) {
    if !active() {
        return;
    }
    let info = NodeInfo::of(node);
    for observer in snapshot() {
        observer.signal_updated(&info, value);
    }
}

pub(crate) fn computed_created(node: NodeId) {
    if !active() {
        return;
    }
    let info = NodeInfo::of(node);
    for observer in snapshot() {
        observer.computed_created(&info);
    }
}

pub(crate) fn computed_updated(node: NodeId, value: &dyn Any) {
    if !active() {
        return;
    }
    let info = NodeInfo::of(node);
    for observer in snapshot() {
        observer.computed_updated(&info, value);
    }
}

pub(crate) fn effect_created(node: NodeId) {
    if !active() {
        return;
    }
    let info = NodeInfo::of(node);
    for observer in snapshot() {
        observer.effect_created(&info);
    }
}

pub(crate) fn effect_called(node: NodeId) {
    if !active() {
        return;
    }
    let info = NodeInfo::of(node);
    for observer in snapshot() {
        observer.effect_called(&info);
    }
}
