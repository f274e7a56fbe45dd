// SPDX-License-Identifier: MPL-2.0

//! The lock-order DAG: a static registry of named lock nodes plus an
//! allowed-edge matrix, the runtime witness for the documented lock
//! ordering (page allocator → ownership table → borrow registry →
//! exchange list, see §5 of spec.md).
//!
//! Nodes register themselves lazily on first acquire. Edge `from → to`
//! asserts "it is acceptable to acquire `to` while already holding `from`";
//! acquiring an edge not in the matrix prints a diagnostic but does not
//! fail the acquire (spec.md B6).

use bitvec::prelude::{bitarr, BitArr};
use log::warn;
use spin::Once;

use crate::{config::LOCKDAG_MAX_NODES, process::ProcessId, sync::SpinLock};

/// A statically-allocated node in the lock-order DAG. Embed one of these as
/// a `static` next to every [`crate::lock::BorrowLock`] that should
/// participate in ordering checks, the same way the original embeds a
/// `LockDagNode lockdag_exchange_prepared = LOCKDAG_NODE("exchange-prepared")`.
pub struct LockDagNode {
    name: &'static str,
    id: Once<usize>,
}

impl LockDagNode {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            id: Once::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn id(&self) -> Option<usize> {
        self.id.get().copied()
    }
}

/// An entry on a process's held-lock stack: which node, and the exact key
/// (lock address) it was acquired at.
#[derive(Clone, Copy)]
pub struct LockDagEntry {
    pub node: &'static LockDagNode,
    pub key: usize,
}

struct LockDagInner {
    nodes: [Option<&'static LockDagNode>; LOCKDAG_MAX_NODES],
    next_id: usize,
    edges: [BitArr!(for LOCKDAG_MAX_NODES); LOCKDAG_MAX_NODES],
}

impl LockDagInner {
    const fn new() -> Self {
        Self {
            nodes: [None; LOCKDAG_MAX_NODES],
            next_id: 0,
            edges: [bitarr![0; LOCKDAG_MAX_NODES]; LOCKDAG_MAX_NODES],
        }
    }
}

/// The process-wide lock-order DAG singleton.
pub struct LockDag {
    inner: SpinLock<LockDagInner>,
}

impl LockDag {
    const fn new() -> Self {
        Self {
            inner: SpinLock::new(LockDagInner::new()),
        }
    }

    /// Assigns `node` a small integer id on first call; subsequent calls
    /// are no-ops and return the previously-assigned id. Returns `None` if
    /// the node table is full (spec.md: `LOCKDAG_MAX_NODES` capacity).
    pub fn register_node(&self, node: &'static LockDagNode) -> Option<usize> {
        if let Some(id) = node.id() {
            return Some(id);
        }
        let mut inner = self.inner.lock();
        if let Some(id) = node.id() {
            return Some(id);
        }
        if inner.next_id >= LOCKDAG_MAX_NODES {
            warn!(
                "lockdag: cannot register node {}, limit reached",
                node.name
            );
            return None;
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.nodes[id] = Some(node);
        node.id.call_once(|| id);
        Some(id)
    }

    /// Declares that it is acceptable to acquire `to` while holding `from`.
    pub fn allow_edge(&self, from: &'static LockDagNode, to: &'static LockDagNode) {
        let (Some(from_id), Some(to_id)) = (self.register_node(from), self.register_node(to))
        else {
            return;
        };
        let mut inner = self.inner.lock();
        inner.edges[from_id].set(to_id, true);
    }

    fn edge_allowed(&self, from_id: Option<usize>, to_id: usize) -> bool {
        let Some(from_id) = from_id else {
            // Unknown predecessor: treat as allowed, mirroring the original's
            // "from < 0 || to < 0 => always allowed".
            return true;
        };
        self.inner.lock().edges[from_id][to_id]
    }

    /// Records that `pid` just acquired `node` at `key`, checking the
    /// previous top-of-stack node against the allowed-edge matrix and
    /// pushing onto `pid`'s held-lock stack.
    pub fn record_acquire(&self, pid: ProcessId, node: &'static LockDagNode, key: usize) {
        let Some(node_id) = self.register_node(node) else {
            return;
        };
        let ctx = crate::process::context(pid);
        let prev = ctx.top_lock();
        if let Some((prev_node, _prev_key)) = prev {
            if !self.edge_allowed(prev_node.id(), node_id) {
                warn!(
                    "lockdag: suspicious edge {} -> {} (pid {:?}, key={:#x})",
                    prev_node.name(),
                    node.name(),
                    pid,
                    key
                );
            }
        }
        ctx.push_lock(node, key);
    }

    /// Records that `pid` released `node` at `key`.
    pub fn record_release(&self, pid: ProcessId, node: &'static LockDagNode, key: usize) {
        let ctx = crate::process::context(pid);
        ctx.pop_lock(node, key);
    }
}

impl Default for LockDag {
    fn default() -> Self {
        Self::new()
    }
}

/// The single process-wide lock-order DAG.
pub static LOCK_DAG: LockDag = LockDag::new();

#[cfg(test)]
mod tests {
    use super::*;

    static A: LockDagNode = LockDagNode::new("a");
    static B: LockDagNode = LockDagNode::new("b");
    static C: LockDagNode = LockDagNode::new("c");

    #[test]
    fn registration_is_idempotent() {
        let dag = LockDag::new();
        let id1 = dag.register_node(&A).unwrap();
        let id2 = dag.register_node(&A).unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn acquire_push_and_release_pop() {
        crate::process::contexts_init();
        let dag = LockDag::new();
        dag.allow_edge(&B, &C);
        let pid = ProcessId::from_raw(777);
        dag.record_acquire(pid, &B, 0x10);
        dag.record_acquire(pid, &C, 0x20);
        let ctx = crate::process::context(pid);
        assert_eq!(ctx.top_lock().unwrap().0.name(), "c");
        dag.record_release(pid, &C, 0x20);
        assert_eq!(ctx.top_lock().unwrap().0.name(), "b");
        dag.record_release(pid, &B, 0x10);
        assert!(ctx.top_lock().is_none());
    }

    #[test]
    fn stack_overflow_is_counted_not_fatal() {
        crate::process::contexts_init();
        let dag = LockDag::new();
        static NODES: [LockDagNode; 40] = [
            LockDagNode::new("n0"), LockDagNode::new("n1"), LockDagNode::new("n2"),
            LockDagNode::new("n3"), LockDagNode::new("n4"), LockDagNode::new("n5"),
            LockDagNode::new("n6"), LockDagNode::new("n7"), LockDagNode::new("n8"),
            LockDagNode::new("n9"), LockDagNode::new("n10"), LockDagNode::new("n11"),
            LockDagNode::new("n12"), LockDagNode::new("n13"), LockDagNode::new("n14"),
            LockDagNode::new("n15"), LockDagNode::new("n16"), LockDagNode::new("n17"),
            LockDagNode::new("n18"), LockDagNode::new("n19"), LockDagNode::new("n20"),
            LockDagNode::new("n21"), LockDagNode::new("n22"), LockDagNode::new("n23"),
            LockDagNode::new("n24"), LockDagNode::new("n25"), LockDagNode::new("n26"),
            LockDagNode::new("n27"), LockDagNode::new("n28"), LockDagNode::new("n29"),
            LockDagNode::new("n30"), LockDagNode::new("n31"), LockDagNode::new("n32"),
            LockDagNode::new("n33"), LockDagNode::new("n34"), LockDagNode::new("n35"),
            LockDagNode::new("n36"), LockDagNode::new("n37"), LockDagNode::new("n38"),
            LockDagNode::new("n39"),
        ];
        let pid = ProcessId::from_raw(778);
        for node in NODES.iter() {
            dag.record_acquire(pid, node, 0);
        }
        let ctx = crate::process::context(pid);
        assert!(ctx.overflow_count() > 0);
    }
}
