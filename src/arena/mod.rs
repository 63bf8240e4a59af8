// Arena-based storage for the reactive graph
//
// Two slabs back the whole graph:
// - Node arena: per-node metadata (flag word, versions, identity, the
//   type-erased driver closure) plus the propagation machinery.
// - Edge arena: pooled dependency edges threaded through both adjacency
//   lists, with the dynamic-tracking protocol.
//
// NodeId and EdgeId are lightweight newtypes indexing into the slabs.

// node_arena is declared first; edge_arena depends on NodeId.
pub mod edge_arena;
pub mod node_arena;

pub use node_arena::{
    add_dispose_callback, bump_global_version, current_evaluator, dispose_node, global_version,
    needs_to_recompute, node_arena_insert, node_arena_remove, notify, recompute_in_place, refresh,
    remove_dispose_callback, remove_from_scheduled, schedule_effect, scheduled_count,
    take_scheduled, DriveOutcome, EvalGuard, NodeId, NodeKind, NodeMetadata, AUTO_DISPOSE,
    DISPOSED, HAS_ERROR, NOTIFIED, OUTDATED, RUNNING, TRACKING,
};
