use std::cell::Cell;

use crate::effect::flush_effects;

thread_local! {
    // Batch depth. While > 0, writes mark and schedule but do not flush;
    // the outermost batch exit flushes once.
    static BATCH_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Whether a batch is currently open on this thread.
pub(crate) fn in_batch() -> bool {
    BATCH_DEPTH.with(|d| d.get() > 0)
}

// Guard so the depth unwinds and the outermost exit flushes even when the
// batched closure panics.
struct BatchGuard;

impl Drop for BatchGuard {
    fn drop(&mut self) {
        let depth = BATCH_DEPTH.with(|d| {
            let depth = d.get().saturating_sub(1);
            d.set(depth);
            depth
        });
        if depth == 0 {
            if let Err(err) = flush_effects() {
                tracing::error!(target: "quiver", %err, "flush at batch exit failed");
            }
        }
    }
}

/// Run `f` with effect flushing deferred.
///
/// Every write inside the batch still marks dependents immediately, but
/// effects run once, when the outermost batch exits. Nested batches
/// coalesce into the outermost one.
///
/// ```ignore
/// quiver::batch(|| {
///     a.set(1)?;
///     b.set(2)?;
///     Ok::<_, quiver::ReactiveError>(())
/// });
/// // effects depending on both a and b ran once, here
/// ```
pub fn batch<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    BATCH_DEPTH.with(|d| d.set(d.get() + 1));
    let _guard = BatchGuard;
    f()
}
