// SPDX-License-Identifier: MPL-2.0

//! A generic ownership/borrow registry, keyed by an arbitrary `Copy + Ord`
//! value, implementing the Rust aliasing discipline (exactly one writer XOR
//! any number of readers) as a runtime-checked state machine.
//!
//! This is the generalization the page ownership table (`pageown`) and the
//! borrow-aware lock (`lock`) both build on: `pageown::PageOwnTable` is a
//! `BorrowRegistry<Pfn>` plus page-specific bookkeeping, and `lock::BorrowLock`
//! uses a second instance keyed by lock address.

use alloc::collections::BTreeMap;
use core::fmt::Debug;

use crate::{config::MAX_SHARED_BORROWS, process::ProcessId, sync::SpinLock};

/// The state of a single owned resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BorrowState {
    /// Unowned; the slot is absent from the registry in practice, but kept
    /// as an explicit variant for callers inspecting a snapshot.
    Free,
    /// Owned exclusively, no outstanding borrows.
    Exclusive,
    /// Owned, lent out to one or more shared (read-only) borrowers.
    SharedOwned,
    /// Owned, lent out to exactly one mutable (read-write) borrower.
    MutLent,
}

/// Errors raised by [`BorrowRegistry`] operations.
///
/// None of these represent a kernel-internal bug: they are always the result
/// of a caller violating the aliasing discipline, and the syscall/device
/// bridges are expected to propagate them to user space unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BorrowError {
    /// A static precondition was violated (nil key, etc).
    Inval,
    /// `acquire` on a key that is already owned.
    Already,
    /// Caller is not the registered owner.
    NotOwner,
    /// Owner-level operation attempted while a borrow is outstanding.
    Borrowed,
    /// Shared borrow attempted while a mutable borrow exists.
    MutBorrow,
    /// Mutable borrow attempted while shared borrows exist.
    SharedBorrow,
    /// `return_*` by a process not on record as a borrower.
    NotBorrowed,
    /// The shared-borrower set is full.
    NoMem,
    /// No record exists for this key.
    NotFound,
}

/// One owned resource, keyed by `K`.
///
/// This is the page-independent shape spec.md calls "generic borrow owner":
/// invariants (1)-(4) of the page ownership record apply verbatim with the
/// page-specific geometry (`owner_vaddr`, cache coloring, ...) removed.
#[derive(Debug, Clone)]
pub struct Owner<K> {
    key: K,
    owner: Option<ProcessId>,
    state: BorrowState,
    shared_borrowers: alloc::vec::Vec<ProcessId>,
    mut_borrower: Option<ProcessId>,
    acquired_ns: u64,
    transfer_count: u64,
    borrow_count: u64,
}

impl<K: Copy> Owner<K> {
    fn new(key: K, owner: ProcessId, acquired_ns: u64) -> Self {
        Self {
            key,
            owner: Some(owner),
            state: BorrowState::Exclusive,
            shared_borrowers: alloc::vec::Vec::new(),
            mut_borrower: None,
            acquired_ns,
            transfer_count: 0,
            borrow_count: 0,
        }
    }

    pub fn key(&self) -> K {
        self.key
    }

    pub fn owner(&self) -> Option<ProcessId> {
        self.owner
    }

    pub fn state(&self) -> BorrowState {
        self.state
    }

    pub fn shared_count(&self) -> usize {
        self.shared_borrowers.len()
    }

    pub fn shared_borrowers(&self) -> &[ProcessId] {
        &self.shared_borrowers
    }

    pub fn mut_borrower(&self) -> Option<ProcessId> {
        self.mut_borrower
    }

    pub fn transfer_count(&self) -> u64 {
        self.transfer_count
    }

    pub fn borrow_count(&self) -> u64 {
        self.borrow_count
    }

    /// Checks invariants (1)-(4) of spec.md's `PageOwner` shape, with the
    /// page-specific fields removed. Only compiled into debug builds, per
    /// the "must hold outside a critical section" contract.
    #[cfg(debug_assertions)]
    fn check_invariants(&self) {
        match self.state {
            BorrowState::Free => {
                debug_assert!(self.owner.is_none());
                debug_assert_eq!(self.shared_borrowers.len(), 0);
                debug_assert!(self.mut_borrower.is_none());
            }
            BorrowState::Exclusive => {
                debug_assert!(self.owner.is_some());
                debug_assert_eq!(self.shared_borrowers.len(), 0);
                debug_assert!(self.mut_borrower.is_none());
            }
            BorrowState::SharedOwned => {
                debug_assert!(self.owner.is_some());
                debug_assert!(!self.shared_borrowers.is_empty());
                debug_assert!(self.mut_borrower.is_none());
            }
            BorrowState::MutLent => {
                debug_assert!(self.owner.is_some());
                debug_assert_eq!(self.shared_borrowers.len(), 0);
                debug_assert!(self.mut_borrower.is_some());
                debug_assert_ne!(self.mut_borrower, self.owner);
            }
        }
    }

    #[cfg(not(debug_assertions))]
    fn check_invariants(&self) {}
}

/// A hashed/ordered map from `K` to [`Owner<K>`], one spinlock covering the
/// whole table. Contention is not a practical concern: registry operations
/// run under a single short critical section and are never on the hot path
/// of an ordinary page fault (see spec.md §4.E).
pub struct BorrowRegistry<K> {
    inner: SpinLock<BTreeMap<K, Owner<K>>>,
}

impl<K: Copy + Ord + Debug> BorrowRegistry<K> {
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(BTreeMap::new()),
        }
    }

    /// `acquire(p, key)` — Rust `let x = T::new()`.
    pub fn acquire(&self, p: ProcessId, key: K, now_ns: u64) -> Result<(), BorrowError> {
        let mut map = self.inner.lock();
        if map.contains_key(&key) {
            return Err(BorrowError::Already);
        }
        let owner = Owner::new(key, p, now_ns);
        owner.check_invariants();
        map.insert(key, owner);
        Ok(())
    }

    /// `release(p, key)` — Rust `drop(x)`.
    pub fn release(&self, p: ProcessId, key: K) -> Result<(), BorrowError> {
        let mut map = self.inner.lock();
        let owner = map.get(&key).ok_or(BorrowError::NotFound)?;
        if owner.owner != Some(p) {
            return Err(BorrowError::NotOwner);
        }
        if owner.shared_borrowers.len() > 0 || owner.mut_borrower.is_some() {
            return Err(BorrowError::Borrowed);
        }
        map.remove(&key);
        Ok(())
    }

    /// Unconditionally drops `key`'s entry, regardless of current owner or
    /// outstanding borrowers. Used only where there is no process context
    /// to check against, such as the frame allocator reclaiming a page
    /// whose reference count has already hit zero.
    pub fn force_release(&self, key: K) {
        self.inner.lock().remove(&key);
    }

    /// `transfer(from, to, key)` — Rust move, `let b = a;`.
    pub fn transfer(
        &self,
        from: ProcessId,
        to: ProcessId,
        key: K,
        now_ns: u64,
    ) -> Result<(), BorrowError> {
        let mut map = self.inner.lock();
        let owner = map.get_mut(&key).ok_or(BorrowError::NotFound)?;
        if owner.owner != Some(from) {
            return Err(BorrowError::NotOwner);
        }
        if owner.shared_borrowers.len() > 0 || owner.mut_borrower.is_some() {
            return Err(BorrowError::Borrowed);
        }
        owner.owner = Some(to);
        owner.acquired_ns = now_ns;
        owner.transfer_count += 1;
        owner.check_invariants();
        Ok(())
    }

    /// `borrow_shared(owner, borrower, key)` — Rust `&T`.
    pub fn borrow_shared(
        &self,
        owner_pid: ProcessId,
        borrower: ProcessId,
        key: K,
    ) -> Result<(), BorrowError> {
        let mut map = self.inner.lock();
        let owner = map.get_mut(&key).ok_or(BorrowError::NotFound)?;
        if owner.owner != Some(owner_pid) {
            return Err(BorrowError::NotOwner);
        }
        if owner.mut_borrower.is_some() {
            return Err(BorrowError::MutBorrow);
        }
        if owner.shared_borrowers.len() >= MAX_SHARED_BORROWS {
            return Err(BorrowError::NoMem);
        }
        owner.shared_borrowers.push(borrower);
        owner.borrow_count += 1;
        owner.state = BorrowState::SharedOwned;
        owner.check_invariants();
        Ok(())
    }

    /// `borrow_mut(owner, borrower, key)` — Rust `&mut T`.
    pub fn borrow_mut(
        &self,
        owner_pid: ProcessId,
        borrower: ProcessId,
        key: K,
    ) -> Result<(), BorrowError> {
        let mut map = self.inner.lock();
        let owner = map.get_mut(&key).ok_or(BorrowError::NotFound)?;
        if owner.owner != Some(owner_pid) {
            return Err(BorrowError::NotOwner);
        }
        if borrower == owner_pid {
            return Err(BorrowError::Inval);
        }
        if !owner.shared_borrowers.is_empty() {
            return Err(BorrowError::SharedBorrow);
        }
        if owner.mut_borrower.is_some() {
            return Err(BorrowError::MutBorrow);
        }
        owner.mut_borrower = Some(borrower);
        owner.borrow_count += 1;
        owner.state = BorrowState::MutLent;
        owner.check_invariants();
        Ok(())
    }

    /// `return_shared(borrower, key)` — end of a `&T` borrow's scope.
    pub fn return_shared(&self, borrower: ProcessId, key: K) -> Result<(), BorrowError> {
        let mut map = self.inner.lock();
        let owner = map.get_mut(&key).ok_or(BorrowError::NotFound)?;
        let pos = owner
            .shared_borrowers
            .iter()
            .position(|b| *b == borrower)
            .ok_or(BorrowError::NotBorrowed)?;
        owner.shared_borrowers.remove(pos);
        if owner.shared_borrowers.is_empty() {
            owner.state = BorrowState::Exclusive;
        }
        owner.check_invariants();
        Ok(())
    }

    /// `return_mut(borrower, key)` — end of a `&mut T` borrow's scope.
    pub fn return_mut(&self, borrower: ProcessId, key: K) -> Result<(), BorrowError> {
        let mut map = self.inner.lock();
        let owner = map.get_mut(&key).ok_or(BorrowError::NotFound)?;
        if owner.mut_borrower != Some(borrower) {
            return Err(BorrowError::NotBorrowed);
        }
        owner.mut_borrower = None;
        owner.state = BorrowState::Exclusive;
        owner.check_invariants();
        Ok(())
    }

    pub fn get_owner(&self, key: K) -> Option<ProcessId> {
        self.inner.lock().get(&key).and_then(|o| o.owner)
    }

    pub fn state(&self, key: K) -> BorrowState {
        self.inner
            .lock()
            .get(&key)
            .map(|o| o.state)
            .unwrap_or(BorrowState::Free)
    }

    pub fn snapshot(&self, key: K) -> Option<Owner<K>> {
        self.inner.lock().get(&key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Process-exit "drop" semantics: walk every record, force-release
    /// records owned by `p`, clear borrows held by `p`, and drop now-empty
    /// records. Returns the number of records touched.
    pub fn cleanup_process(&self, p: ProcessId) -> usize {
        let mut map = self.inner.lock();
        let mut touched = 0usize;
        let mut to_remove = alloc::vec::Vec::new();
        for (key, owner) in map.iter_mut() {
            let mut dirty = false;
            if owner.owner == Some(p) {
                owner.owner = None;
                owner.state = BorrowState::Free;
                owner.shared_borrowers.clear();
                owner.mut_borrower = None;
                dirty = true;
            }
            if owner.mut_borrower == Some(p) {
                owner.mut_borrower = None;
                if owner.state == BorrowState::MutLent {
                    owner.state = BorrowState::Exclusive;
                }
                dirty = true;
            }
            if let Some(pos) = owner.shared_borrowers.iter().position(|b| *b == p) {
                owner.shared_borrowers.remove(pos);
                if owner.shared_borrowers.is_empty() && owner.state == BorrowState::SharedOwned {
                    owner.state = BorrowState::Exclusive;
                }
                dirty = true;
            }
            if dirty {
                touched += 1;
            }
            if owner.state == BorrowState::Free {
                to_remove.push(*key);
            }
        }
        for key in to_remove {
            map.remove(&key);
        }
        touched
    }
}

impl<K: Copy + Ord + Debug> Default for BorrowRegistry<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(n: usize) -> ProcessId {
        ProcessId::from_raw(n)
    }

    #[test]
    fn acquire_release_round_trip() {
        let reg: BorrowRegistry<usize> = BorrowRegistry::new();
        reg.acquire(pid(1), 0xdead, 0).unwrap();
        assert_eq!(reg.state(0xdead), BorrowState::Exclusive);
        reg.release(pid(1), 0xdead).unwrap();
        assert_eq!(reg.state(0xdead), BorrowState::Free);
    }

    #[test]
    fn release_by_non_owner_fails() {
        let reg: BorrowRegistry<usize> = BorrowRegistry::new();
        reg.acquire(pid(1), 1, 0).unwrap();
        assert_eq!(reg.release(pid(2), 1), Err(BorrowError::NotOwner));
    }

    #[test]
    fn transfer_round_trip() {
        let reg: BorrowRegistry<usize> = BorrowRegistry::new();
        reg.acquire(pid(1), 7, 0).unwrap();
        reg.transfer(pid(1), pid(2), 7, 1).unwrap();
        assert_eq!(reg.get_owner(7), Some(pid(2)));
        reg.transfer(pid(2), pid(1), 7, 2).unwrap();
        assert_eq!(reg.get_owner(7), Some(pid(1)));
        assert_eq!(reg.snapshot(7).unwrap().transfer_count(), 2);
    }

    #[test]
    fn shared_borrow_fanout_and_max() {
        let reg: BorrowRegistry<usize> = BorrowRegistry::new();
        reg.acquire(pid(1), 9, 0).unwrap();
        for i in 0..MAX_SHARED_BORROWS {
            reg.borrow_shared(pid(1), pid(10 + i), 9).unwrap();
        }
        assert_eq!(reg.state(9), BorrowState::SharedOwned);
        assert_eq!(
            reg.borrow_shared(pid(1), pid(999), 9),
            Err(BorrowError::NoMem)
        );
        assert_eq!(
            reg.borrow_mut(pid(1), pid(1000), 9),
            Err(BorrowError::SharedBorrow)
        );
    }

    #[test]
    fn shared_borrow_round_trip() {
        let reg: BorrowRegistry<usize> = BorrowRegistry::new();
        reg.acquire(pid(1), 3, 0).unwrap();
        reg.borrow_shared(pid(1), pid(2), 3).unwrap();
        reg.return_shared(pid(2), 3).unwrap();
        assert_eq!(reg.state(3), BorrowState::Exclusive);
    }

    #[test]
    fn mut_borrow_excludes_everything() {
        let reg: BorrowRegistry<usize> = BorrowRegistry::new();
        reg.acquire(pid(1), 4, 0).unwrap();
        reg.borrow_mut(pid(1), pid(2), 4).unwrap();
        assert_eq!(reg.state(4), BorrowState::MutLent);
        assert_eq!(
            reg.borrow_shared(pid(1), pid(3), 4),
            Err(BorrowError::MutBorrow)
        );
        assert_eq!(
            reg.borrow_mut(pid(1), pid(3), 4),
            Err(BorrowError::MutBorrow)
        );
        assert_eq!(reg.release(pid(1), 4), Err(BorrowError::Borrowed));
        reg.return_mut(pid(2), 4).unwrap();
        assert_eq!(reg.state(4), BorrowState::Exclusive);
    }

    #[test]
    fn mut_borrow_from_self_is_inval() {
        let reg: BorrowRegistry<usize> = BorrowRegistry::new();
        reg.acquire(pid(1), 5, 0).unwrap();
        assert_eq!(reg.borrow_mut(pid(1), pid(1), 5), Err(BorrowError::Inval));
        assert_eq!(reg.state(5), BorrowState::Exclusive);
    }

    #[test]
    fn cleanup_process_clears_every_role() {
        let reg: BorrowRegistry<usize> = BorrowRegistry::new();
        reg.acquire(pid(1), 100, 0).unwrap();
        reg.acquire(pid(2), 200, 0).unwrap();
        reg.borrow_shared(pid(2), pid(1), 200).unwrap();

        reg.cleanup_process(pid(1));

        assert_eq!(reg.get_owner(100), None);
        assert_eq!(reg.snapshot(200).unwrap().shared_count(), 0);
        assert_eq!(reg.state(200), BorrowState::Exclusive);
    }
}
