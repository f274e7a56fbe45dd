// SPDX-License-Identifier: MPL-2.0

//! The process identity and per-process context the ownership/borrow core
//! touches.
//!
//! The core never constructs a full scheduler-owned `Task`/`Proc` object —
//! consistent with spec.md's statement that scheduler internals are an
//! external collaborator. Instead it stores only a `ProcessId`, a small
//! `Copy` handle, inside every ownership/borrow/lock record, and looks the
//! real process up by id on demand. This breaks the cyclic reference
//! between a process and the records that name it: a stale id left behind
//! by a crashed process is simply never resolved to a live process again.

use alloc::collections::BTreeMap;

use id_alloc::IdAlloc;
use spin::Once;

use crate::{
    borrow::BorrowRegistry,
    config::LOCKDAG_STACK_DEPTH,
    lockdag::{LockDagEntry, LockDagNode},
    sync::SpinLock,
};

const MAX_PROCESSES: usize = 4096;

/// A small `Copy` handle identifying a process to the ownership/borrow
/// core. Allocated by the same bitmap-allocator idiom the task module uses
/// for task ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(usize);

impl ProcessId {
    /// Constructs a `ProcessId` from a raw value.
    ///
    /// Exposed for tests and for bridging externally-assigned scheduler
    /// pids; callers that mint ids for real processes should go through
    /// [`alloc_process_id`].
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> usize {
        self.0
    }
}

static PROCESS_IDS: Once<SpinLock<IdAlloc>> = Once::new();

pub(crate) fn init() {
    PROCESS_IDS.call_once(|| SpinLock::new(IdAlloc::with_capacity(MAX_PROCESSES)));
}

/// Allocates a fresh `ProcessId`. Returns `None` once `MAX_PROCESSES` ids
/// are live simultaneously.
pub fn alloc_process_id() -> Option<ProcessId> {
    PROCESS_IDS.get()?.lock().alloc().map(ProcessId)
}

/// Returns a previously allocated `ProcessId` to the free pool. Callers
/// must have already run [`cleanup`] for this id.
pub fn free_process_id(id: ProcessId) {
    if let Some(alloc) = PROCESS_IDS.get() {
        alloc.lock().free(id.0);
    }
}

/// The per-process state the ownership/borrow core needs: the deadlock
/// detector's `waiting_for_key` cell and the lock-order DAG's held-lock
/// stack (spec.md §4.G, §4.H).
pub struct ProcessContext {
    waiting_for_key: SpinLock<Option<usize>>,
    lockdag_stack: SpinLock<([Option<LockDagEntry>; LOCKDAG_STACK_DEPTH], usize, u64)>,
}

impl ProcessContext {
    const fn new() -> Self {
        Self {
            waiting_for_key: SpinLock::new(None),
            lockdag_stack: SpinLock::new(([None; LOCKDAG_STACK_DEPTH], 0, 0)),
        }
    }

    pub fn waiting_for_key(&self) -> Option<usize> {
        *self.waiting_for_key.lock()
    }

    pub fn set_waiting_for_key(&self, key: Option<usize>) {
        *self.waiting_for_key.lock() = key;
    }

    /// Pushes a node onto the held-lock stack. On overflow the stack stops
    /// growing and an overflow counter is bumped instead, matching
    /// spec.md §4.H's "further acquires are untracked" rule.
    pub fn push_lock(&self, node: &'static LockDagNode, key: usize) {
        let mut guard = self.lockdag_stack.lock();
        let (stack, depth, overflow) = &mut *guard;
        if *depth >= LOCKDAG_STACK_DEPTH {
            *overflow += 1;
            return;
        }
        stack[*depth] = Some(LockDagEntry { node, key });
        *depth += 1;
    }

    /// Pops the matching `(node, key)` entry, searching from the top of the
    /// stack down (mirrors the original's `lockdag_pop` linear scan — locks
    /// are not always released in strict LIFO order by buggy callers, and
    /// the original tolerates that).
    pub fn pop_lock(&self, node: &'static LockDagNode, key: usize) {
        let mut guard = self.lockdag_stack.lock();
        let (stack, depth, _overflow) = &mut *guard;
        for i in (0..*depth).rev() {
            if let Some(entry) = &stack[i] {
                if core::ptr::eq(entry.node, node) && entry.key == key {
                    *depth = i;
                    return;
                }
            }
        }
    }

    pub fn top_lock(&self) -> Option<(&'static LockDagNode, usize)> {
        let guard = self.lockdag_stack.lock();
        let (stack, depth, _) = &*guard;
        if *depth == 0 {
            None
        } else {
            stack[*depth - 1].map(|e| (e.node, e.key))
        }
    }

    pub fn overflow_count(&self) -> u64 {
        self.lockdag_stack.lock().2
    }
}

static PROCESS_CONTEXTS: Once<SpinLock<BTreeMap<ProcessId, alloc::sync::Arc<ProcessContext>>>> =
    Once::new();

pub(crate) fn contexts_init() {
    PROCESS_CONTEXTS.call_once(|| SpinLock::new(BTreeMap::new()));
}

/// Returns (creating on first use) the [`ProcessContext`] for `pid`.
pub fn context(pid: ProcessId) -> alloc::sync::Arc<ProcessContext> {
    let mut map = PROCESS_CONTEXTS.get().unwrap().lock();
    map.entry(pid)
        .or_insert_with(|| alloc::sync::Arc::new(ProcessContext::new()))
        .clone()
}

/// Process-death cleanup, invoked in the order spec.md §4.J requires.
///
/// 1. MMU release is the caller's responsibility (it owns the
///    `PageTable`/`tables: Vec<VmFrame>`, dropping it deallocates the
///    process's page-table frames via `VmFrame::drop`).
/// 2. [`crate::pageown::cleanup_process`], plus [`crate::exchange::cleanup_process`]
///    for any `PreparedPage` the dying process never accepted or cancelled.
/// 3. [`crate::borrow::BorrowRegistry::cleanup_process`] on the lock
///    registry.
pub fn cleanup(pid: ProcessId, lock_registry: &BorrowRegistry<usize>) {
    crate::pageown::cleanup_process(pid);
    crate::exchange::cleanup_process(pid);
    lock_registry.cleanup_process(pid);
    if let Some(map) = PROCESS_CONTEXTS.get() {
        map.lock().remove(&pid);
    }
    free_process_id(pid);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_reusable() {
        init();
        let a = alloc_process_id().unwrap();
        let b = alloc_process_id().unwrap();
        assert_ne!(a, b);
        free_process_id(a);
        let c = alloc_process_id().unwrap();
        assert_eq!(a, c);
        free_process_id(b);
        free_process_id(c);
    }

    #[test]
    fn context_waiting_key_roundtrip() {
        contexts_init();
        let ctx = context(ProcessId::from_raw(42));
        assert_eq!(ctx.waiting_for_key(), None);
        ctx.set_waiting_for_key(Some(0x1000));
        assert_eq!(ctx.waiting_for_key(), Some(0x1000));
    }
}
