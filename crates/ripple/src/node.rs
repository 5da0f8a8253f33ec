#![forbid(unsafe_code)]

//! Vertices of the dependency graph.
//!
//! Every stream owns a [`Node`]; edges ([`Target`]) point at the node of the
//! thing listening downstream. The scheduler orders work by each node's
//! **rank**, a topological-depth integer maintained eagerly as edges are
//! added.
//!
//! # Invariants
//!
//! 1. For every live target `u → v`, `v.rank() > u.rank()` (except the
//!    shared null node, which is pinned at the maximum rank).
//! 2. Target lists and ranks are only mutated under the global listeners
//!    lock; the per-node mutex is just the container.
//! 3. Rank raises propagate transitively; a visited set terminates the
//!    traversal if the graph transiently contains a cycle (loop setup).
//! 4. A target's handler reference is weak. The subscriber's `Listener`
//!    owns the strong reference; a lapsed handler is skipped at dispatch.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use ahash::AHashSet;

use crate::sync::lock;

/// Rank of the shared null node: greater than every real node, so
/// I/O-side listeners run after all internal propagation.
pub(crate) const NULL_RANK: u64 = u64::MAX;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_TARGET_ID: AtomicU64 = AtomicU64::new(1);

/// Serializes all edge and rank mutation across the whole graph.
///
/// Lock order: this lock is acquired before any per-node mutex, never
/// after one.
static LISTENERS_LOCK: Mutex<()> = Mutex::new(());

// ─── Target ──────────────────────────────────────────────────────────────────

/// An outgoing edge: the downstream node plus a weak, type-erased handler.
///
/// `action` is `None` for rank-only edges (the internal merge's left node
/// links to the output purely so rank maintenance sees the dependency).
pub(crate) struct Target {
    pub(crate) id: u64,
    pub(crate) node: Node,
    pub(crate) action: Option<Weak<dyn Any + Send + Sync>>,
}

impl Clone for Target {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            node: self.node.clone(),
            action: self.action.clone(),
        }
    }
}

// ─── Node ────────────────────────────────────────────────────────────────────

struct NodeData {
    id: u64,
    rank: AtomicU64,
    targets: Mutex<Vec<Target>>,
}

/// A vertex in the dependency DAG. Cheap to clone (shared interior).
///
/// Nodes of equal rank are *not* interchangeable: every container of nodes
/// keys on [`Node::id`], never on rank.
pub(crate) struct Node {
    data: Arc<NodeData>,
}

impl Clone for Node {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
        }
    }
}

impl Node {
    pub(crate) fn new(rank: u64) -> Self {
        Self {
            data: Arc::new(NodeData {
                id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
                rank: AtomicU64::new(rank),
                targets: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The shared max-rank node used as the downstream of I/O-side
    /// listeners. Its own target list stays empty forever.
    pub(crate) fn null() -> Self {
        static NULL_NODE: OnceLock<Node> = OnceLock::new();
        NULL_NODE.get_or_init(|| Node::new(NULL_RANK)).clone()
    }

    #[must_use]
    pub(crate) fn id(&self) -> u64 {
        self.data.id
    }

    #[must_use]
    pub(crate) fn rank(&self) -> u64 {
        self.data.rank.load(Ordering::SeqCst)
    }

    /// Add an edge from `self` to `target`, raising `target`'s rank (and
    /// transitively its listeners') so invariant 1 holds.
    ///
    /// Returns whether any rank changed — the caller flags the current
    /// transaction for queue regeneration — along with the installed edge.
    pub(crate) fn link_to(
        &self,
        action: Option<Weak<dyn Any + Send + Sync>>,
        target: &Node,
    ) -> (bool, Target) {
        let _graph = lock(&LISTENERS_LOCK);
        let changed = ensure_bigger_than(target, self.rank());
        let entry = Target {
            id: NEXT_TARGET_ID.fetch_add(1, Ordering::Relaxed),
            node: target.clone(),
            action,
        };
        lock(&self.data.targets).push(entry.clone());
        (changed, entry)
    }

    /// Remove the given edge. Idempotent: unknown targets are ignored.
    pub(crate) fn unlink_to(&self, target: &Target) {
        let _graph = lock(&LISTENERS_LOCK);
        lock(&self.data.targets).retain(|t| t.id != target.id);
    }

    /// Snapshot of the current outgoing edges.
    pub(crate) fn targets(&self) -> Vec<Target> {
        lock(&self.data.targets).clone()
    }

    /// Downstream nodes, for rank traversal. Caller holds the listeners
    /// lock already; the per-node mutex alone makes the read coherent.
    fn listener_nodes(&self) -> Vec<Node> {
        lock(&self.data.targets)
            .iter()
            .map(|t| t.node.clone())
            .collect()
    }
}

/// Raise `start`'s rank above `limit`, then propagate to its listeners.
///
/// Explicit work-list rather than recursion: loop networks can be deep and
/// the visited set must terminate the walk when a cycle is (transiently)
/// present during loop setup. A revisited node is left as-is.
fn ensure_bigger_than(start: &Node, limit: u64) -> bool {
    let mut visited: AHashSet<u64> = AHashSet::new();
    let mut work: Vec<(Node, u64)> = vec![(start.clone(), limit)];
    let mut changed = false;

    while let Some((node, limit)) = work.pop() {
        if node.rank() > limit || !visited.insert(node.id()) {
            continue;
        }
        let raised = limit.saturating_add(1);
        node.data.rank.store(raised, Ordering::SeqCst);
        changed = true;
        for child in node.listener_nodes() {
            work.push((child, raised));
        }
    }
    changed
}

// ─── Tests ───────────────────────────────────────────────────────────────────
