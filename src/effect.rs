use std::cell::Cell;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::arena::node_arena::RunGuard;
use crate::arena::{
    add_dispose_callback, current_evaluator, dispose_node, edge_arena, global_version,
    needs_to_recompute, node_arena_insert, node_arena_remove, remove_dispose_callback,
    scheduled_count, take_scheduled, DriveOutcome, EvalGuard, NodeId, NodeKind, NodeMetadata,
    DISPOSED, NOTIFIED, OUTDATED, RUNNING,
};
use crate::batch;
use crate::error::ReactiveError;
use crate::observer;

type CleanupFn = Box<dyn FnOnce() + Send>;

thread_local! {
    // Guards against re-entrant flushing: a write performed by an effect
    // body schedules into the already-running flush loop instead of
    // starting a nested one.
    static FLUSHING: Cell<bool> = const { Cell::new(false) };
}

/// Upper bound on fixed-point passes per flush. Effects that keep
/// rescheduling each other past this many rounds are not converging.
const MAX_FLUSH_PASSES: usize = 1000;

pub(crate) fn is_flushing() -> bool {
    FLUSHING.with(Cell::get)
}

/// Run all effects scheduled on this thread, to a fixed point.
///
/// Effects scheduled while the flush is in progress (an effect body
/// writing some other signal) are picked up by subsequent passes.
/// Returns the number of effect runs performed, or
/// [`ReactiveError::UnstablePropagation`] when the passes stop
/// converging.
pub fn flush_effects() -> Result<usize, ReactiveError> {
    if is_flushing() {
        return Ok(0);
    }
    struct FlushGuard;
    impl Drop for FlushGuard {
        fn drop(&mut self) {
            FLUSHING.with(|f| f.set(false));
        }
    }
    FLUSHING.with(|f| f.set(true));
    let _guard = FlushGuard;

    let mut total = 0usize;
    let mut passes = 0usize;
    loop {
        let scheduled = take_scheduled();
        if scheduled.is_empty() {
            break;
        }
        passes += 1;
        if passes > MAX_FLUSH_PASSES {
            return Err(ReactiveError::UnstablePropagation { runs: total });
        }
        for node in scheduled {
            if node.flags() & DISPOSED != 0 {
                continue;
            }
            run_effect(node);
            total += 1;
        }
    }
    Ok(total)
}

/// Flush unless someone upstream will: an open batch, an evaluation in
/// progress, or the flush loop itself.
pub(crate) fn maybe_flush() -> Result<(), ReactiveError> {
    if batch::in_batch() || current_evaluator().is_some() || is_flushing() {
        return Ok(());
    }
    flush_effects().map(|_| ())
}

/// Number of effects currently waiting for a flush on this thread.
pub fn scheduled_effects() -> usize {
    scheduled_count()
}

/// Run `f` with the tracker cleared: reads inside do not register
/// dependencies on the surrounding computed or effect.
pub fn untracked<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = EvalGuard::new(None);
    f()
}

/// Run one effect, honoring the pull discipline: the body is skipped
/// entirely when a walk over the recorded source versions proves nothing
/// upstream actually changed (an equality-suppressed computed between us
/// and the write).
pub(crate) fn run_effect(node: NodeId) {
    if node.flags() & (DISPOSED | RUNNING) != 0 {
        return;
    }
    node.clear_flags(NOTIFIED);
    if node.version() > 0 && !needs_to_recompute(node) {
        cov_mark::hit!(effect_skip_unchanged);
        node.clear_flags(OUTDATED);
        return;
    }
    node.clear_flags(OUTDATED);
    node.set_global_seen(global_version());
    node.set_flags(RUNNING);
    edge_arena::prepare_sources(node);
    let _finish = RunGuard::new(node);
    let _eval = EvalGuard::new(Some(node));
    observer::effect_called(node);
    node.run_driver();
    node.bump_version();
}

struct EffectInner {
    node: NodeId,
}

impl Drop for EffectInner {
    fn drop(&mut self) {
        dispose_node(self.node);
        edge_arena::drop_links(self.node);
        node_arena_remove(self.node);
    }
}

/// An eager observer.
///
/// The body runs once at creation, subscribing to every source it reads;
/// whenever one of those sources changes, the effect is scheduled and
/// re-run (synchronously within the triggering write, unless a
/// [`batch`](crate::batch) defers it). The handle doubles as the dispose
/// token: dropping the last clone, or calling [`dispose`](Self::dispose),
/// stops the effect and runs its final cleanup.
pub struct Effect {
    inner: Arc<EffectInner>,
}

impl Clone for Effect {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Effect {
    /// Create an effect and run it once immediately.
    pub fn new<F>(mut f: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        Self::create(Box::new(move || {
            f();
            None
        }))
    }

    /// Create an effect whose body returns a cleanup closure. The cleanup
    /// runs before the next re-run and once more on dispose.
    pub fn with_cleanup<F>(mut f: F) -> Self
    where
        F: FnMut() -> CleanupFn + Send + 'static,
    {
        Self::create(Box::new(move || Some(f())))
    }

    fn create(mut body: Box<dyn FnMut() -> Option<CleanupFn> + Send>) -> Self {
        let metadata = NodeMetadata::new(NodeKind::Effect, None, false);
        let node = node_arena_insert(metadata);

        let cleanup: Arc<Mutex<Option<CleanupFn>>> = Arc::new(Mutex::new(None));
        let driver_cleanup = Arc::clone(&cleanup);
        node.install_driver(Box::new(move || {
            if let Some(previous) = driver_cleanup.lock().take() {
                previous();
            }
            if let Some(next) = body() {
                *driver_cleanup.lock() = Some(next);
            }
            DriveOutcome::Changed
        }));
        // Registered first so the final cleanup precedes user on_dispose
        // callbacks added later.
        add_dispose_callback(
            node,
            Box::new(move || {
                if let Some(last) = cleanup.lock().take() {
                    last();
                }
            }),
        );

        observer::effect_created(node);
        let effect = Effect {
            inner: Arc::new(EffectInner { node }),
        };
        // Initial run. A panicking body disposes the half-built effect
        // before the panic continues to the caller.
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| run_effect(node)));
        if let Err(payload) = result {
            effect.dispose();
            std::panic::resume_unwind(payload);
        }
        effect
    }

    #[allow(dead_code)]
    pub(crate) fn node_id(&self) -> NodeId {
        self.inner.node
    }

    /// Stable identity, unique for the process lifetime.
    pub fn global_id(&self) -> u64 {
        self.inner.node.global_id()
    }

    /// Whether the effect has been disposed.
    pub fn disposed(&self) -> bool {
        self.inner.node.flags() & DISPOSED != 0
    }

    /// Stop the effect: run its cleanup, drop its subscriptions, and
    /// remove it from the schedule. Idempotent.
    pub fn dispose(&self) {
        dispose_node(self.inner.node);
    }

    /// Register an extra callback to run when the effect is disposed.
    pub fn on_dispose(&self, callback: impl FnOnce() + Send + 'static) -> DisposeHandle {
        let token = add_dispose_callback(self.inner.node, Box::new(callback));
        DisposeHandle::new(self.inner.node, token)
    }
}

/// Cleanup token returned by `subscribe`. Dropping it (or calling
/// [`unsubscribe`](Self::unsubscribe)) disposes the underlying effect.
pub struct Subscription {
    effect: Effect,
}

impl Subscription {
    pub(crate) fn wrap(effect: Effect) -> Self {
        Self { effect }
    }

    /// Stop receiving values.
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.effect.dispose();
    }
}

/// Removal token for a dispose callback registered with `on_dispose`.
pub struct DisposeHandle {
    node: NodeId,
    token: usize,
}

impl DisposeHandle {
    pub(crate) fn new(node: NodeId, token: usize) -> Self {
        Self { node, token }
    }

    /// Cancel the callback. A no-op if the node already disposed.
    pub fn remove(self) {
        remove_dispose_callback(self.node, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::Signal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn effect_runs_immediately_and_on_change() {
        let s = Signal::new(0);
        let runs = Arc::new(AtomicUsize::new(0));

        let runs_in = runs.clone();
        let s_in = s.clone();
        let _effect = Effect::new(move || {
            s_in.get();
            runs_in.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(runs.load(Ordering::Relaxed), 1);

        s.set(1).unwrap();
        assert_eq!(runs.load(Ordering::Relaxed), 2, "effects run inside the write");
    }

    #[test]
    fn suppressed_write_schedules_nothing() {
        let s = Signal::new(5);
        let runs = Arc::new(AtomicUsize::new(0));

        let runs_in = runs.clone();
        let s_in = s.clone();
        let _effect = Effect::new(move || {
            s_in.get();
            runs_in.fetch_add(1, Ordering::Relaxed);
        });

        s.set(5).unwrap();
        assert_eq!(runs.load(Ordering::Relaxed), 1);
        assert_eq!(scheduled_effects(), 0);
    }

    #[test]
    fn disposed_effect_stops_rerunning() {
        let s = Signal::new(0);
        let runs = Arc::new(AtomicUsize::new(0));

        let runs_in = runs.clone();
        let s_in = s.clone();
        let effect = Effect::new(move || {
            s_in.get();
            runs_in.fetch_add(1, Ordering::Relaxed);
        });

        effect.dispose();
        assert!(effect.disposed());
        s.set(1).unwrap();
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn cleanup_runs_before_next_run_and_on_dispose() {
        let s = Signal::new(0);
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let log_in = log.clone();
        let s_in = s.clone();
        let effect = Effect::with_cleanup(move || {
            let v = s_in.get();
            log_in.lock().push(format!("run {v}"));
            let log_cleanup = log_in.clone();
            Box::new(move || log_cleanup.lock().push(format!("cleanup {v}")))
        });

        s.set(1).unwrap();
        effect.dispose();

        assert_eq!(
            *log.lock(),
            vec!["run 0", "cleanup 0", "run 1", "cleanup 1"],
            "cleanup interleaves between runs and fires once more on dispose"
        );
    }

    #[test]
    fn untracked_reads_do_not_subscribe() {
        let tracked = Signal::new(0);
        let ignored = Signal::new(0);
        let runs = Arc::new(AtomicUsize::new(0));

        let runs_in = runs.clone();
        let tracked_in = tracked.clone();
        let ignored_in = ignored.clone();
        let _effect = Effect::new(move || {
            tracked_in.get();
            untracked(|| ignored_in.get());
            runs_in.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(runs.load(Ordering::Relaxed), 1);

        ignored.set(9).unwrap();
        assert_eq!(runs.load(Ordering::Relaxed), 1, "untracked source must not re-run us");

        tracked.set(9).unwrap();
        assert_eq!(runs.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn panicking_initial_run_disposes_the_effect() {
        let result = std::panic::catch_unwind(|| {
            Effect::new(|| panic!("first run exploded"));
        });
        assert!(result.is_err());
    }

    #[test]
    fn self_writing_effect_is_reported_as_unstable() {
        let s = Signal::new(0);

        let s_in = s.clone();
        let _effect = Effect::new(move || {
            let v = s_in.get();
            if v > 0 {
                // Writing our own dependency keeps rescheduling us.
                let _ = s_in.set(v + 1);
            }
        });

        let err = s.set(1).unwrap_err();
        assert!(matches!(err, ReactiveError::UnstablePropagation { .. }), "got {err:?}");
    }
}
