use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced by the reactive graph.
///
/// Compute failures are cached on the computed that produced them and
/// handed back on every read until a later evaluation succeeds. All other
/// variants are reported at the call site that triggered them.
#[derive(Debug, Clone, Error)]
pub enum ReactiveError {
    /// A computed read itself, directly or through other nodes, while its
    /// own evaluation was still in progress.
    #[error("dependency cycle detected while evaluating `{}`", .label.as_deref().unwrap_or("<unlabeled>"))]
    Cycle {
        /// Debug label of the computed that closed the cycle, if any.
        label: Option<Arc<str>>,
    },

    /// A write was attempted on a signal that has been disposed.
    #[error("write to disposed signal `{}`", .label.as_deref().unwrap_or("<unlabeled>"))]
    WriteAfterDispose {
        /// Debug label of the disposed signal, if any.
        label: Option<Arc<str>>,
    },

    /// The compute function of a computed panicked. The panic payload is
    /// preserved as a message.
    #[error("compute function failed: {message}")]
    Compute {
        /// Stringified panic payload.
        message: String,
    },

    /// Effects kept rescheduling each other without reaching a fixed
    /// point, which usually means an effect writes one of its own
    /// dependencies.
    #[error("effects did not settle after {runs} runs; an effect likely writes its own dependency")]
    UnstablePropagation {
        /// Number of effect runs performed before giving up.
        runs: usize,
    },
}
