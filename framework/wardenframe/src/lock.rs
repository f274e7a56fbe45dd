// SPDX-License-Identifier: MPL-2.0

//! A borrow-aware spinlock: ordinary mutual exclusion plus the same
//! ownership bookkeeping `pageown` applies to pages, so a lock acquire
//! can be checked against the lock-order DAG and a waiting acquirer can
//! be cycle-detected before it ever blocks (spec.md §4.G).
//!
//! [`BorrowLock`] is meant to sit behind a `static`, the same way the
//! original pins each `BorrowLock` next to its own `LockDagNode`:
//! ```ignore
//! static FREELIST_NODE: LockDagNode = LockDagNode::new("freelist");
//! static FREELIST: BorrowLock<FreeList> = BorrowLock::new(&FREELIST_NODE, FreeList::new());
//! ```

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
};

use log::error;

use crate::{
    borrow::BorrowRegistry,
    config::LOCKDAG_DEADLOCK_CHAIN_LIMIT,
    lockdag::{LockDagNode, LOCK_DAG},
    process::{context, ProcessId},
    sync::SpinLock,
    timer::read_monotonic_milli_seconds,
};

/// Registry of every live [`BorrowLock`] acquisition, keyed by the lock's
/// own address. Shared across all `BorrowLock` instances process-wide,
/// mirroring the original's single global `lock_borrow` ownership table
/// (as distinct from the per-page `pageown` table it sits below in the
/// lock order, see spec.md §5).
static LOCK_REGISTRY: BorrowRegistry<usize> = BorrowRegistry::new();

/// Returns the shared lock-ownership registry, for [`crate::process::cleanup`]
/// to sweep on process exit.
pub fn lock_registry() -> &'static BorrowRegistry<usize> {
    &LOCK_REGISTRY
}

/// A spinlock instrumented with deadlock detection and lock-order tracking.
pub struct BorrowLock<T> {
    node: &'static LockDagNode,
    inner: SpinLock<()>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for BorrowLock<T> {}
unsafe impl<T: Send> Sync for BorrowLock<T> {}

/// Raised when a lock acquire would complete a wait-for cycle. The caller
/// caused this by acquiring locks out of the declared order against
/// another process; panicking is the only sound recovery, matching the
/// original's `panic("lock_borrow: deadlock ...")`.
#[derive(Debug, Clone, Copy)]
pub struct DeadlockDetected {
    pub key: usize,
    pub chain_len: usize,
}

impl<T> BorrowLock<T> {
    pub const fn new(node: &'static LockDagNode, data: T) -> Self {
        Self {
            node,
            inner: SpinLock::new(()),
            data: UnsafeCell::new(data),
        }
    }

    fn key(&self) -> usize {
        self as *const _ as usize
    }

    /// Walks the wait-for chain starting at `start_key`: the process
    /// currently holding `start_key` might itself be waiting on some other
    /// key, whose holder might be waiting too, and so on. If `pid` appears
    /// anywhere on that chain, acquiring `start_key` would deadlock.
    /// Bounded to [`LOCKDAG_DEADLOCK_CHAIN_LIMIT`] hops, matching the
    /// original `borrow_check_deadlock`'s `for(i = 0; i < 100; i++)` bound —
    /// a chain longer than that is treated as "no deadlock found", not as
    /// an error, since a bounded walk cannot prove a negative.
    fn check_deadlock(&self, pid: ProcessId, start_key: usize) -> Result<(), DeadlockDetected> {
        let mut key = start_key;
        for step in 0..LOCKDAG_DEADLOCK_CHAIN_LIMIT {
            let Some(holder) = LOCK_REGISTRY.get_owner(key) else {
                return Ok(());
            };
            if holder == pid {
                return Err(DeadlockDetected {
                    key: start_key,
                    chain_len: step + 1,
                });
            }
            let Some(next_key) = context(holder).waiting_for_key() else {
                return Ok(());
            };
            key = next_key;
        }
        Ok(())
    }

    /// Acquires the lock on behalf of `pid`.
    ///
    /// Panics if the wait-for chain proves a deadlock (step 2 below) or if
    /// the internal ownership registry is left in an inconsistent state
    /// (steps 4-5) — both indicate a caller bug, not a recoverable runtime
    /// condition, exactly as the original's `lock_borrow` aborts rather
    /// than returning an error.
    pub fn lock(&'static self, pid: ProcessId) -> BorrowLockGuard<'static, T> {
        let key = self.key();
        let ctx = context(pid);

        // 1. Announce what we're about to wait for.
        ctx.set_waiting_for_key(Some(key));

        // 2. Walk the wait-for chain before blocking.
        if let Err(dl) = self.check_deadlock(pid, key) {
            panic!(
                "lock: deadlock detected acquiring {:?} lock {:#x} (chain length {})",
                self.node.name(),
                dl.key,
                dl.chain_len
            );
        }

        // 3. Acquire the real spinlock. This is where we would actually
        // block if contended; the deadlock check above ran first so that a
        // caller never blocks forever on a cycle the DAG could already see.
        let guard = self.inner.lock();

        // 4. No longer waiting; register as owner.
        ctx.set_waiting_for_key(None);
        let now_ns = read_monotonic_milli_seconds() * 1_000_000;
        if let Err(e) = LOCK_REGISTRY.acquire(pid, key, now_ns) {
            error!(
                "lock: registry acquire failed for {:?} lock {:#x}: {:?}",
                self.node.name(),
                key,
                e
            );
            panic!("lock: ownership registry inconsistent");
        }

        // 5. Record the edge in the lock-order DAG.
        LOCK_DAG.record_acquire(pid, self.node, key);

        BorrowLockGuard {
            lock: self,
            pid,
            _inner: guard,
        }
    }

    /// Attempts to acquire without blocking. Still runs the deadlock check
    /// and registry bookkeeping on success; on failure to get the
    /// underlying spinlock, simply returns `None` without side effects.
    pub fn try_lock(&'static self, pid: ProcessId) -> Option<BorrowLockGuard<'static, T>> {
        let key = self.key();
        let ctx = context(pid);
        ctx.set_waiting_for_key(Some(key));
        if self.check_deadlock(pid, key).is_err() {
            ctx.set_waiting_for_key(None);
            return None;
        }
        let guard = self.inner.try_lock()?;
        ctx.set_waiting_for_key(None);
        let now_ns = read_monotonic_milli_seconds() * 1_000_000;
        LOCK_REGISTRY.acquire(pid, key, now_ns).ok()?;
        LOCK_DAG.record_acquire(pid, self.node, key);
        Some(BorrowLockGuard {
            lock: self,
            pid,
            _inner: guard,
        })
    }

    fn unlock(&'static self, pid: ProcessId) {
        let key = self.key();
        if let Err(e) = LOCK_REGISTRY.release(pid, key) {
            error!(
                "lock: registry release failed for {:?} lock {:#x}: {:?}",
                self.node.name(),
                key,
                e
            );
        }
        LOCK_DAG.record_release(pid, self.node, key);
    }
}

/// RAII guard returned by [`BorrowLock::lock`]. Releasing drops the
/// underlying spinlock guard after the ownership registry/DAG bookkeeping
/// has been undone, so a concurrent acquirer never observes the real lock
/// as free while still counted as held in the registry.
pub struct BorrowLockGuard<'a, T: 'a> {
    lock: &'a BorrowLock<T>,
    pid: ProcessId,
    _inner: crate::sync::SpinLockGuard<'a, ()>,
}

impl<'a, T> Deref for BorrowLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for BorrowLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for BorrowLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock(self.pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static NODE_A: LockDagNode = LockDagNode::new("test-a");
    static LOCK_A: BorrowLock<u32> = BorrowLock::new(&NODE_A, 0);

    static NODE_B: LockDagNode = LockDagNode::new("test-b");
    static LOCK_B: BorrowLock<u32> = BorrowLock::new(&NODE_B, 0);

    #[test]
    fn basic_lock_unlock_and_mutation() {
        crate::process::init();
        crate::process::contexts_init();
        let pid = ProcessId::from_raw(1);
        {
            let mut guard = LOCK_A.lock(pid);
            *guard = 42;
        }
        let guard = LOCK_A.lock(pid);
        assert_eq!(*guard, 42);
    }

    #[test]
    fn sequential_reacquire_by_same_process_does_not_deadlock() {
        crate::process::contexts_init();
        let pid = ProcessId::from_raw(2);
        {
            let _g = LOCK_B.lock(pid);
        }
        {
            let _g = LOCK_B.lock(pid);
        }
    }

    #[test]
    #[should_panic(expected = "deadlock detected")]
    fn recursive_acquire_by_same_holder_panics() {
        crate::process::contexts_init();
        static NODE_D: LockDagNode = LockDagNode::new("test-d");
        static LOCK_D: BorrowLock<u32> = BorrowLock::new(&NODE_D, 0);
        let pid = ProcessId::from_raw(5);
        let _g1 = LOCK_D.lock(pid);
        let _g2 = LOCK_D.lock(pid);
    }

    #[test]
    fn try_lock_fails_while_held() {
        crate::process::contexts_init();
        static NODE_C: LockDagNode = LockDagNode::new("test-c");
        static LOCK_C: BorrowLock<u32> = BorrowLock::new(&NODE_C, 0);
        let pid1 = ProcessId::from_raw(3);
        let pid2 = ProcessId::from_raw(4);
        let _g = LOCK_C.lock(pid1);
        assert!(LOCK_C.try_lock(pid2).is_none());
    }
}
