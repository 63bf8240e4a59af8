// Edge arena - pooled storage for dependency edges
//
// One edge exists per (source, dependent) pair currently in use. An edge
// is simultaneously a member of two intrusive doubly-linked lists: the
// source's targets list and the dependent's sources list; membership in
// one implies membership in the other's bookkeeping. Lists are threaded
// through prev/next indices into a single slab, so unlinking from both
// sides is O(1) and needs no allocation.
//
// All topology state (the edge slab and every node's list heads) lives
// under one lock so a mutation can never observe the two lists out of
// sync. Lock order is TOPOLOGY before the node arena; node-arena
// operations never reach back into this module.
//
// DYNAMIC TRACKING PROTOCOL:
// - prepare_sources: entering an evaluation marks every existing edge as
//   a removal candidate and plants an O(1) reuse hint on each edge's
//   source (the hint's previous value is stashed on the edge so nested
//   evaluations restore correctly).
// - add_dependency: a read inside an evaluation either revives the hinted
//   edge (moving it to the head of the sources list) or allocates a fresh
//   edge at the head. The edge joins the source's targets list only when
//   the dependent has live demand (TRACKING).
// - cleanup_sources: leaving the evaluation frees every edge that was not
//   read this run and restores the hints.
//
// Allocation therefore amortizes to O(1) per stable dependency: a
// dependency read on every run keeps its edge across evaluations.

use crate::arena::node_arena::{
    current_evaluator, NodeId, NodeKind, AUTO_DISPOSE, DISPOSED, OUTDATED, TRACKING,
};
use crate::hash::FastHashBuilder;
use parking_lot::RwLock;
use slab::Slab;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Identifier of an edge in the pooled slab.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct EdgeId(u32);

impl EdgeId {
    fn new(index: usize) -> Self {
        Self(index as u32)
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

/// One dependency edge. `recorded_version` is the source's version at the
/// moment the dependent last observed it; a mismatch on refresh is what
/// makes the dependent recompute.
struct Edge {
    source: NodeId,
    dependent: NodeId,
    recorded_version: u64,
    /// Removal candidate: set on evaluation entry, cleared by a read.
    stale: bool,
    /// Whether the edge is currently linked into the source's targets
    /// list (true iff the dependent side has live demand).
    in_targets: bool,
    prev_source: Option<EdgeId>,
    next_source: Option<EdgeId>,
    prev_target: Option<EdgeId>,
    next_target: Option<EdgeId>,
    /// The source's previous reuse hint, restored when this evaluation
    /// finishes.
    hint_rollback: Option<Option<EdgeId>>,
}

#[derive(Default, Clone, Copy)]
struct NodeLinks {
    sources_head: Option<EdgeId>,
    targets_head: Option<EdgeId>,
    /// Reuse hint: during an evaluation, the edge from this source to the
    /// current evaluator, if one existed before the run.
    eval_hint: Option<EdgeId>,
}

struct Topology {
    edges: Slab<Edge>,
    links: HashMap<NodeId, NodeLinks, FastHashBuilder>,
}

static TOPOLOGY: LazyLock<RwLock<Topology>> = LazyLock::new(|| {
    RwLock::new(Topology {
        edges: Slab::new(),
        links: HashMap::with_hasher(FastHashBuilder),
    })
});

fn push_sources_head(t: &mut Topology, dependent: NodeId, e: EdgeId) {
    let old = {
        let links = t.links.entry(dependent).or_default();
        let old = links.sources_head;
        links.sources_head = Some(e);
        old
    };
    {
        let edge = &mut t.edges[e.index()];
        edge.prev_source = None;
        edge.next_source = old;
    }
    if let Some(o) = old {
        t.edges[o.index()].prev_source = Some(e);
    }
}

fn unlink_source(t: &mut Topology, e: EdgeId) {
    let (dependent, prev, next) = {
        let edge = &t.edges[e.index()];
        (edge.dependent, edge.prev_source, edge.next_source)
    };
    match prev {
        Some(p) => t.edges[p.index()].next_source = next,
        None => {
            t.links.entry(dependent).or_default().sources_head = next;
        }
    }
    if let Some(n) = next {
        t.edges[n.index()].prev_source = prev;
    }
    let edge = &mut t.edges[e.index()];
    edge.prev_source = None;
    edge.next_source = None;
}

fn move_to_sources_head(t: &mut Topology, dependent: NodeId, e: EdgeId) {
    let head = t.links.get(&dependent).and_then(|l| l.sources_head);
    if head == Some(e) {
        return;
    }
    unlink_source(t, e);
    push_sources_head(t, dependent, e);
}

/// Link an edge into its source's targets list, promoting the source to
/// TRACKING (and recursively its own sources) when this is the first
/// demand it sees.
fn attach_target(t: &mut Topology, source: NodeId, e: EdgeId) {
    let first = {
        let links = t.links.entry(source).or_default();
        let first = links.targets_head.is_none();
        let old = links.targets_head;
        links.targets_head = Some(e);
        let edge = &mut t.edges[e.index()];
        edge.prev_target = None;
        edge.next_target = old;
        edge.in_targets = true;
        if let Some(o) = old {
            t.edges[o.index()].prev_target = Some(e);
        }
        first
    };
    if first && matches!(source.kind(), Some(NodeKind::Computed)) {
        // Demand just materialized: the source must re-validate on the
        // next read and begin holding its own upstream subscriptions.
        source.set_flags(OUTDATED | TRACKING);
        let mut cur = t.links.get(&source).and_then(|l| l.sources_head);
        while let Some(se) = cur {
            let next = t.edges[se.index()].next_source;
            if !t.edges[se.index()].in_targets {
                let upstream = t.edges[se.index()].source;
                attach_target(t, upstream, se);
            }
            cur = next;
        }
    }
}

/// Unlink an edge from its source's targets list. A source left without
/// demand demotes out of TRACKING (releasing its own upstream edges) and
/// is reported for auto-dispose when it opted in.
fn detach_target(t: &mut Topology, e: EdgeId, disposals: &mut SmallVec<[NodeId; 4]>) {
    let (source, prev, next) = {
        let edge = &t.edges[e.index()];
        (edge.source, edge.prev_target, edge.next_target)
    };
    match prev {
        Some(p) => t.edges[p.index()].next_target = next,
        None => {
            t.links.entry(source).or_default().targets_head = next;
        }
    }
    if let Some(n) = next {
        t.edges[n.index()].prev_target = prev;
    }
    {
        let edge = &mut t.edges[e.index()];
        edge.prev_target = None;
        edge.next_target = None;
        edge.in_targets = false;
    }

    let now_empty = t
        .links
        .get(&source)
        .map_or(true, |l| l.targets_head.is_none());
    if !now_empty {
        return;
    }
    if matches!(source.kind(), Some(NodeKind::Computed)) && source.flags() & TRACKING != 0 {
        source.clear_flags(TRACKING);
        let mut cur = t.links.get(&source).and_then(|l| l.sources_head);
        while let Some(se) = cur {
            let next = t.edges[se.index()].next_source;
            if t.edges[se.index()].in_targets {
                detach_target(t, se, disposals);
            }
            cur = next;
        }
    }
    let flags = source.flags();
    if flags & AUTO_DISPOSE != 0 && flags & DISPOSED == 0 {
        disposals.push(source);
    }
}

/// Register a read of `source` against the evaluator currently on the
/// tracker, creating or reviving the connecting edge.
///
/// Returns the edge so callers can re-record the source version after a
/// refresh. No-op outside an evaluation.
pub fn add_dependency(source: NodeId) -> Option<EdgeId> {
    let dependent = current_evaluator()?;
    let mut guard = TOPOLOGY.write();
    let t = &mut *guard;

    let hint = t.links.get(&source).and_then(|l| l.eval_hint);
    if let Some(e) = hint {
        let belongs_here = t
            .edges
            .get(e.index())
            .is_some_and(|edge| edge.dependent == dependent && edge.source == source);
        if belongs_here {
            if t.edges[e.index()].stale {
                t.edges[e.index()].stale = false;
                move_to_sources_head(t, dependent, e);
            }
            t.edges[e.index()].recorded_version = source.version();
            return Some(e);
        }
    }

    let key = t.edges.insert(Edge {
        source,
        dependent,
        recorded_version: source.version(),
        stale: false,
        in_targets: false,
        prev_source: None,
        next_source: None,
        prev_target: None,
        next_target: None,
        hint_rollback: Some(hint),
    });
    let e = EdgeId::new(key);
    push_sources_head(t, dependent, e);
    t.links.entry(source).or_default().eval_hint = Some(e);
    if dependent.flags() & TRACKING != 0 {
        attach_target(t, source, e);
    }
    Some(e)
}

/// Overwrite the version recorded on an edge. Used after a read refreshed
/// the source, so the edge reflects what the dependent actually saw.
pub fn record_version(e: EdgeId, version: u64) {
    let mut guard = TOPOLOGY.write();
    if let Some(edge) = guard.edges.get_mut(e.index()) {
        edge.recorded_version = version;
    }
}

/// Enter an evaluation: mark every existing edge as a removal candidate
/// and plant the reuse hints.
pub fn prepare_sources(node: NodeId) {
    let mut guard = TOPOLOGY.write();
    let t = &mut *guard;
    let mut cur = t.links.get(&node).and_then(|l| l.sources_head);
    while let Some(e) = cur {
        let next = t.edges[e.index()].next_source;
        let source = t.edges[e.index()].source;
        let previous_hint = {
            let links = t.links.entry(source).or_default();
            let previous = links.eval_hint;
            links.eval_hint = Some(e);
            previous
        };
        {
            let edge = &mut t.edges[e.index()];
            edge.stale = true;
            edge.hint_rollback = Some(previous_hint);
        }
        cur = next;
    }
}

/// Leave an evaluation: free every edge that was not read this run,
/// unsubscribing the source side where demand was installed, and restore
/// the reuse hints. Returns nodes whose auto-dispose should now fire.
pub fn cleanup_sources(node: NodeId) -> SmallVec<[NodeId; 4]> {
    let mut disposals = SmallVec::new();
    let mut guard = TOPOLOGY.write();
    let t = &mut *guard;
    let mut cur = t.links.get(&node).and_then(|l| l.sources_head);
    while let Some(e) = cur {
        let next = t.edges[e.index()].next_source;
        let source = t.edges[e.index()].source;
        if let Some(rollback) = t.edges[e.index()].hint_rollback.take() {
            t.links.entry(source).or_default().eval_hint = rollback;
        }
        if t.edges[e.index()].stale {
            if t.edges[e.index()].in_targets {
                detach_target(t, e, &mut disposals);
            }
            unlink_source(t, e);
            t.edges.remove(e.index());
        }
        cur = next;
    }
    disposals
}

/// Remove every edge on both sides of a node. Dependents silently lose
/// their edge (their next evaluation simply no longer sees this source);
/// sources lose this node's demand, which may cascade auto-disposals.
pub fn teardown_node(node: NodeId) -> SmallVec<[NodeId; 4]> {
    let mut disposals = SmallVec::new();
    let mut guard = TOPOLOGY.write();
    let t = &mut *guard;

    let mut cur = t.links.get(&node).and_then(|l| l.sources_head);
    while let Some(e) = cur {
        let next = t.edges[e.index()].next_source;
        if t.edges[e.index()].in_targets {
            detach_target(t, e, &mut disposals);
        }
        unlink_source(t, e);
        t.edges.remove(e.index());
        cur = next;
    }

    let mut cur = t.links.get(&node).and_then(|l| l.targets_head);
    while let Some(e) = cur {
        let next = t.edges[e.index()].next_target;
        unlink_source(t, e);
        t.edges.remove(e.index());
        cur = next;
    }
    if let Some(links) = t.links.get_mut(&node) {
        links.sources_head = None;
        links.targets_head = None;
    }
    disposals
}

/// Drop a node's list-head entry entirely. Called after teardown when the
/// last handle goes away.
pub fn drop_links(node: NodeId) {
    TOPOLOGY.write().links.remove(&node);
}

/// Snapshot the dependents currently subscribed to `node`, in list order.
pub fn target_dependents(node: NodeId) -> SmallVec<[NodeId; 8]> {
    let guard = TOPOLOGY.read();
    let mut out = SmallVec::new();
    let mut cur = guard.links.get(&node).and_then(|l| l.targets_head);
    while let Some(e) = cur {
        let edge = &guard.edges[e.index()];
        out.push(edge.dependent);
        cur = edge.next_target;
    }
    out
}

/// Snapshot `(source, recorded_version)` for every edge in `node`'s
/// sources list, in list order.
pub fn source_entries(node: NodeId) -> SmallVec<[(NodeId, u64); 8]> {
    let guard = TOPOLOGY.read();
    let mut out = SmallVec::new();
    let mut cur = guard.links.get(&node).and_then(|l| l.sources_head);
    while let Some(e) = cur {
        let edge = &guard.edges[e.index()];
        out.push((edge.source, edge.recorded_version));
        cur = edge.next_source;
    }
    out
}

/// Whether any dependent currently subscribes to `node`.
pub fn has_targets(node: NodeId) -> bool {
    TOPOLOGY
        .read()
        .links
        .get(&node)
        .and_then(|l| l.targets_head)
        .is_some()
}
