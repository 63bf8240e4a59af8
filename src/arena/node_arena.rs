// Node arena - storage for reactive node metadata
//
// Every signal, computed and effect owns one slot in a global slab. The
// slot carries the graph-facing state of the node: its flag word, local
// version, global-version snapshot, debug identity and the type-erased
// driver closure that recomputes a computed or runs an effect body. The
// typed value itself lives outside the arena in the handle structs, which
// keeps the arena lightweight and uniform across node kinds.
//
// PROPAGATION MODEL (two-phase):
// - notify: eager and mark-only. A write walks dependents, sets
//   OUTDATED|NOTIFIED and places reachable effects on the scheduled set.
//   No user code runs during the walk.
// - refresh: lazy and pull-based. A read (or an effect flush) walks
//   sources bottom-up and recomputes a node only when an upstream version
//   actually moved past the version recorded on the connecting edge.
//
// A single process-wide global version counter short-circuits refreshes:
// a node whose snapshot equals the current global version cannot have any
// stale input, whatever the graph shape.

use crate::arena::edge_arena;
use crate::error::ReactiveError;
use crate::hash::FastHashBuilder;
use indexmap::IndexSet;
use papaya::HashMap as PapayaHashMap;
use parking_lot::{Mutex, RwLock};
use slab::Slab;
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, LazyLock};

/// Cached value may be stale; cleared only by a successful refresh.
pub const OUTDATED: u8 = 1 << 0;
/// The node has live demand (a subscriber, direct or transitive) and
/// therefore keeps its edges installed on the source side.
pub const TRACKING: u8 = 1 << 1;
/// The node's own evaluation is in progress; seeing this on a re-entrant
/// read means the graph has a cycle.
pub const RUNNING: u8 = 1 << 2;
/// The node has already been marked during the current notify walk.
pub const NOTIFIED: u8 = 1 << 3;
/// The last evaluation failed; the error is cached on the node.
pub const HAS_ERROR: u8 = 1 << 4;
/// The node has been disposed. Reads return the frozen value, writes fail.
pub const DISPOSED: u8 = 1 << 5;
/// Dispose automatically when the last subscriber goes away.
pub const AUTO_DISPOSE: u8 = 1 << 6;

/// What kind of reactive node a slot holds.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    /// Mutable leaf cell; always authoritative, never outdated.
    Signal,
    /// Memoized derivation with a dynamically discovered source set.
    Computed,
    /// Eager observer; re-runs when a source it read changes.
    Effect,
}

/// Result of running a node's driver closure.
pub enum DriveOutcome {
    /// The produced value differs from the cached one (or is the first).
    Changed,
    /// The produced value compared equal to the cached one.
    Unchanged,
    /// The user closure panicked; the payload is preserved as an error.
    Failed(ReactiveError),
}

type DriverFn = Box<dyn FnMut() -> DriveOutcome + Send>;
type DisposeFn = Box<dyn FnOnce() + Send>;

/// Global node arena - one slot per live signal/computed/effect.
static NODE_ARENA: RwLock<Slab<NodeMetadata>> = RwLock::new(Slab::new());

/// Global version counter, bumped by every value-changing write.
///
/// Starts at 1 so that a fresh node can snapshot `global_version() - 1`
/// and be guaranteed to miss the short-circuit on its first refresh.
static GLOBAL_VERSION: AtomicU64 = AtomicU64::new(1);

/// Monotone source of stable per-node identities.
static NEXT_GLOBAL_ID: AtomicU64 = AtomicU64::new(1);

// Side table: node -> dispose callbacks. Slots keep insertion order; a
// removed callback leaves a hole so later tokens stay valid.
static DISPOSE_CALLBACKS: LazyLock<PapayaHashMap<NodeId, Mutex<Vec<Option<DisposeFn>>>>> =
    LazyLock::new(PapayaHashMap::new);

thread_local! {
    // The tracker: the computed or effect currently evaluating on this
    // thread. Reads route into edges against this node.
    static CURRENT_EVALUATOR: Cell<Option<NodeId>> = const { Cell::new(None) };

    // Effects waiting for the next flush on this thread. Scheduling is
    // per-thread because the graph is single-threaded cooperative; a set
    // keeps re-notifications of the same effect coalesced.
    static SCHEDULED_EFFECTS: RefCell<IndexSet<NodeId, FastHashBuilder>> =
        RefCell::new(IndexSet::default());
}

/// Read the current global version.
pub fn global_version() -> u64 {
    GLOBAL_VERSION.load(Ordering::Acquire)
}

/// Bump the global version. Called by every value-changing write.
pub fn bump_global_version() -> u64 {
    GLOBAL_VERSION.fetch_add(1, Ordering::AcqRel) + 1
}

/// Get the node currently evaluating on this thread, if any.
pub fn current_evaluator() -> Option<NodeId> {
    CURRENT_EVALUATOR.with(Cell::get)
}

/// Swap the current evaluator, returning the previous one.
pub fn set_current_evaluator(node: Option<NodeId>) -> Option<NodeId> {
    CURRENT_EVALUATOR.with(|c| c.replace(node))
}

/// RAII guard that restores the evaluator slot when dropped, so nested
/// evaluations unwind LIFO even when user code panics.
pub struct EvalGuard {
    previous: Option<NodeId>,
}

impl EvalGuard {
    /// Install `node` as the current evaluator until the guard drops.
    pub fn new(node: Option<NodeId>) -> Self {
        let previous = set_current_evaluator(node);
        Self { previous }
    }
}

impl Drop for EvalGuard {
    fn drop(&mut self) {
        set_current_evaluator(self.previous);
    }
}

/// Unique identifier for a node in the arena.
///
/// A zero-cost wrapper around a slab index. The slot is reclaimed when
/// the last typed handle drops; accessing a reclaimed id returns `None`
/// (or an inert default) rather than touching another node's slot.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct NodeId(u32);

impl NodeId {
    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    /// Access the node metadata with a closure (read-only slot access).
    ///
    /// Returns `None` if the node has been removed (stale access).
    pub fn with<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&NodeMetadata) -> R,
    {
        let arena = NODE_ARENA.read();
        arena.get(self.index()).map(f)
    }

    /// The kind of node this id refers to.
    pub fn kind(self) -> Option<NodeKind> {
        self.with(|meta| meta.kind)
    }

    /// Current flag word. A reclaimed slot reads as disposed so callers
    /// short-circuit instead of resurrecting it.
    pub fn flags(self) -> u8 {
        self.with(|meta| meta.flags.load(Ordering::Acquire))
            .unwrap_or(DISPOSED)
    }

    /// Set the given flag bits.
    pub fn set_flags(self, bits: u8) {
        self.with(|meta| meta.flags.fetch_or(bits, Ordering::AcqRel));
    }

    /// Clear the given flag bits.
    pub fn clear_flags(self, bits: u8) {
        self.with(|meta| meta.flags.fetch_and(!bits, Ordering::AcqRel));
    }

    /// Set flag bits, returning the previous flag word.
    pub fn fetch_or_flags(self, bits: u8) -> u8 {
        self.with(|meta| meta.flags.fetch_or(bits, Ordering::AcqRel))
            .unwrap_or(DISPOSED)
    }

    /// Local version: increases iff a write or recompute actually changed
    /// the value (or a compute failed, so dependents see the failure).
    pub fn version(self) -> u64 {
        self.with(|meta| meta.version.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub(crate) fn bump_version(self) {
        self.with(|meta| meta.version.fetch_add(1, Ordering::AcqRel));
    }

    pub(crate) fn global_seen(self) -> u64 {
        self.with(|meta| meta.global_seen.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub(crate) fn set_global_seen(self, v: u64) {
        self.with(|meta| meta.global_seen.store(v, Ordering::Release));
    }

    /// Stable identity, unique for the process lifetime.
    pub fn global_id(self) -> u64 {
        self.with(|meta| meta.global_id).unwrap_or(0)
    }

    /// Debug label, if one was given at construction.
    pub fn label(self) -> Option<Arc<str>> {
        self.with(|meta| meta.label.clone()).flatten()
    }

    pub(crate) fn set_error(self, err: ReactiveError) {
        self.with(|meta| *meta.error.lock() = Some(err));
    }

    pub(crate) fn clear_error(self) {
        self.with(|meta| *meta.error.lock() = None);
    }

    /// The cached evaluation failure, if the node is in the error state.
    pub fn cached_error(self) -> Option<ReactiveError> {
        self.with(|meta| meta.error.lock().clone()).flatten()
    }

    pub(crate) fn install_driver(self, driver: DriverFn) {
        self.with(|meta| *meta.driver.lock() = Some(driver));
    }

    /// Run the driver closure stored in the arena for this node.
    ///
    /// The closure is taken out of the slot before running so the arena
    /// lock is not held across user code (which may create nodes, hence
    /// need the write lock). A drop guard puts it back even on panic.
    pub(crate) fn run_driver(self) -> Option<DriveOutcome> {
        struct DriverGuard {
            node: NodeId,
            driver: Option<DriverFn>,
        }

        impl Drop for DriverGuard {
            fn drop(&mut self) {
                if let Some(driver) = self.driver.take() {
                    let arena = NODE_ARENA.read();
                    if let Some(meta) = arena.get(self.node.index()) {
                        *meta.driver.lock() = Some(driver);
                    }
                }
            }
        }

        let driver = {
            let arena = NODE_ARENA.read();
            arena.get(self.index()).and_then(|meta| meta.driver.lock().take())
        };

        let mut guard = DriverGuard {
            node: self,
            driver,
        };
        guard.driver.as_mut().map(|driver| driver())
    }
}

/// Metadata for one reactive node.
///
/// Value storage deliberately lives outside this struct, in the typed
/// handle (`Signal<T>` / `Computed<T>`); the arena only knows how to
/// drive the node and how its versions relate to the rest of the graph.
pub struct NodeMetadata {
    kind: NodeKind,
    flags: AtomicU8,
    version: AtomicU64,
    global_seen: AtomicU64,
    global_id: u64,
    label: Option<Arc<str>>,
    driver: Mutex<Option<DriverFn>>,
    error: Mutex<Option<ReactiveError>>,
}

impl NodeMetadata {
    /// Create metadata for a node of the given kind.
    ///
    /// Computeds start OUTDATED so the first read evaluates; effects start
    /// TRACKING because they are live demand by definition. The
    /// global-version snapshot starts one behind so a fresh node can never
    /// take the unchanged-tick short-circuit.
    pub fn new(kind: NodeKind, label: Option<Arc<str>>, auto_dispose: bool) -> Self {
        let mut flags = match kind {
            NodeKind::Signal => 0,
            NodeKind::Computed => OUTDATED,
            NodeKind::Effect => TRACKING,
        };
        if auto_dispose {
            flags |= AUTO_DISPOSE;
        }
        Self {
            kind,
            flags: AtomicU8::new(flags),
            version: AtomicU64::new(0),
            global_seen: AtomicU64::new(global_version().wrapping_sub(1)),
            global_id: NEXT_GLOBAL_ID.fetch_add(1, Ordering::Relaxed),
            label,
            driver: Mutex::new(None),
            error: Mutex::new(None),
        }
    }
}

/// Insert a node into the arena and return its id.
pub fn node_arena_insert(metadata: NodeMetadata) -> NodeId {
    let mut arena = NODE_ARENA.write();
    let entry = arena.vacant_entry();
    let key = entry.key();
    entry.insert(metadata);
    NodeId::new(key as u32)
}

/// Remove a node from the arena. Called when the last handle drops.
pub fn node_arena_remove(id: NodeId) -> Option<NodeMetadata> {
    let mut arena = NODE_ARENA.write();
    if arena.contains(id.index()) {
        Some(arena.remove(id.index()))
    } else {
        None
    }
}

// ============================================================================
// Scheduled-effect set
// ============================================================================

/// Put an effect on this thread's scheduled set.
pub fn schedule_effect(node: NodeId) {
    SCHEDULED_EFFECTS.with(|set| {
        set.borrow_mut().insert(node);
    });
}

/// Atomically drain the scheduled set, preserving scheduling order.
pub fn take_scheduled() -> Vec<NodeId> {
    SCHEDULED_EFFECTS.with(|set| set.borrow_mut().drain(..).collect())
}

/// Number of effects currently awaiting a flush on this thread.
pub fn scheduled_count() -> usize {
    SCHEDULED_EFFECTS.with(|set| set.borrow().len())
}

/// Drop an effect from the scheduled set (used on dispose).
pub fn remove_from_scheduled(node: NodeId) {
    SCHEDULED_EFFECTS.with(|set| {
        set.borrow_mut().swap_remove(&node);
    });
}

// ============================================================================
// Dispose callbacks
// ============================================================================

/// Register a dispose callback, returning its removal token.
pub fn add_dispose_callback(node: NodeId, callback: DisposeFn) -> usize {
    let map = DISPOSE_CALLBACKS.pin();
    let slots = map.get_or_insert_with(node, || Mutex::new(Vec::new()));
    let mut slots = slots.lock();
    slots.push(Some(callback));
    slots.len() - 1
}

/// Cancel a previously registered dispose callback. A token for an
/// already-disposed node is a no-op.
pub fn remove_dispose_callback(node: NodeId, token: usize) {
    let map = DISPOSE_CALLBACKS.pin();
    if let Some(slots) = map.get(&node) {
        if let Some(slot) = slots.lock().get_mut(token) {
            *slot = None;
        }
    }
}

fn run_dispose_callbacks(node: NodeId) {
    // Take ownership of the callbacks, then drop the map entry, so user
    // callbacks run with no internal locks held.
    let callbacks = {
        let map = DISPOSE_CALLBACKS.pin();
        match map.get(&node) {
            Some(slots) => {
                let taken = std::mem::take(&mut *slots.lock());
                map.remove(&node);
                taken
            }
            None => return,
        }
    };
    for callback in callbacks.into_iter().flatten() {
        callback();
    }
}

// ============================================================================
// Propagation
// ============================================================================

/// Notify phase: mark a dependent and everything downstream of it.
///
/// Mark-only by design; the NOTIFIED bit deduplicates re-entry during a
/// single walk, so diamonds are marked once. Effects go on the scheduled
/// set instead of recursing (they have no targets of their own).
pub fn notify(node: NodeId) {
    let flags = node.flags();
    if flags & (NOTIFIED | DISPOSED) != 0 {
        return;
    }
    node.set_flags(OUTDATED | NOTIFIED);
    match node.kind() {
        Some(NodeKind::Effect) => {
            cov_mark::hit!(effect_scheduled);
            schedule_effect(node);
        }
        Some(_) => {
            for dependent in edge_arena::target_dependents(node) {
                notify(dependent);
            }
        }
        None => {}
    }
}

/// Refresh phase: bring a computed's cached value up to date.
///
/// Returns `false` when the node is part of a cycle (its own evaluation
/// is already running further up the stack); `true` otherwise, including
/// when the cached value was already valid.
pub fn refresh(node: NodeId) -> bool {
    if !matches!(node.kind(), Some(NodeKind::Computed)) {
        // Signals are always authoritative and effects are never read.
        return true;
    }
    node.clear_flags(NOTIFIED);

    let flags = node.flags();
    if flags & RUNNING != 0 {
        return false;
    }
    // A tracked node that nobody marked is valid by construction: any
    // upstream change would have reached it through the notify walk.
    if flags & TRACKING != 0 && flags & OUTDATED == 0 {
        return true;
    }
    node.clear_flags(OUTDATED);

    if node.global_seen() == global_version() {
        cov_mark::hit!(refresh_same_tick);
        return true;
    }
    node.set_global_seen(global_version());

    node.set_flags(RUNNING);
    if node.version() > 0 && !needs_to_recompute(node) {
        cov_mark::hit!(refresh_sources_unchanged);
        node.clear_flags(RUNNING);
        return true;
    }
    recompute_in_place(node);
    true
}

/// Decide whether a node's inputs actually moved.
///
/// Walks the sources in list order; each computed source is refreshed
/// first, then the edge's recorded version is compared against the
/// source's current version. The version is checked on both sides of the
/// refresh so a cheap mismatch skips the recursive work.
pub fn needs_to_recompute(node: NodeId) -> bool {
    if node.flags() & HAS_ERROR != 0 {
        return true;
    }
    for (source, recorded) in edge_arena::source_entries(node) {
        if source.version() != recorded {
            return true;
        }
        if !refresh(source) {
            // A cycle below us: recompute so the error surfaces here.
            return true;
        }
        if source.version() != recorded {
            return true;
        }
    }
    false
}

/// Guard that finishes an evaluation on all exit paths: drops edges that
/// were not re-read this run, then clears RUNNING. Runs after the
/// evaluator slot has been restored (guards are declared in that order).
pub struct RunGuard {
    node: NodeId,
}

impl RunGuard {
    pub(crate) fn new(node: NodeId) -> Self {
        Self { node }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let disposals = edge_arena::cleanup_sources(self.node);
        self.node.clear_flags(RUNNING);
        for node in disposals {
            dispose_node(node);
        }
    }
}

/// Re-evaluate a computed right now, rediscovering its source set.
///
/// Returns `true` when the node's version was bumped (the value changed
/// or the compute failed). Flag bookkeeping for RUNNING is owned by the
/// caller's context: `refresh` sets it before calling in, and the
/// `RunGuard` clears it.
pub fn recompute_in_place(node: NodeId) -> bool {
    edge_arena::prepare_sources(node);
    let _finish = RunGuard::new(node);
    let _eval = EvalGuard::new(Some(node));
    match node.run_driver() {
        Some(DriveOutcome::Changed) => {
            node.clear_error();
            node.clear_flags(HAS_ERROR);
            node.bump_version();
            true
        }
        Some(DriveOutcome::Unchanged) => {
            node.clear_error();
            node.clear_flags(HAS_ERROR);
            false
        }
        Some(DriveOutcome::Failed(err)) => {
            node.set_error(err);
            node.set_flags(HAS_ERROR);
            // Dependents must observe the failure as a change.
            node.bump_version();
            true
        }
        None => false,
    }
}

/// Dispose a node: run its dispose callbacks exactly once in insertion
/// order, tear down every edge on both sides, and drop it from the
/// scheduled set. Idempotent.
pub fn dispose_node(node: NodeId) {
    let previous = node.fetch_or_flags(DISPOSED);
    if previous & DISPOSED != 0 {
        return;
    }
    tracing::debug!(
        target: "quiver",
        id = node.global_id(),
        label = node.label().as_deref().unwrap_or_default(),
        "disposing node"
    );
    run_dispose_callbacks(node);
    remove_from_scheduled(node);
    let disposals = edge_arena::teardown_node(node);
    node.clear_flags(OUTDATED | NOTIFIED | TRACKING);
    for follower in disposals {
        dispose_node(follower);
    }
}
