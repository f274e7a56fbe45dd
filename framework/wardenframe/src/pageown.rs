// SPDX-License-Identifier: MPL-2.0

//! The page ownership table: [`borrow::BorrowRegistry`] specialized to
//! physical page frame numbers, plus the page-specific bookkeeping the
//! generic registry doesn't carry (the owning virtual address, and the
//! `npages`/`nowned`/`nshared`/`nmut` counters the `/dev/pageown/stat`
//! device surface reports).
//!
//! This is the "page ownership table" component of spec.md §4.E, resolved
//! per SPEC_FULL.md's Open Question #1: rather than a bespoke
//! `PageOwnPool`, it is `BorrowRegistry<Pfn>` plus a small side table of
//! [`PageExtra`] records keyed the same way.

use alloc::collections::BTreeMap;

use log::info;
use spin::Once;

use crate::{
    borrow::{BorrowError, BorrowRegistry, BorrowState},
    config::PAGE_SIZE,
    lockdag::LockDagNode,
    process::ProcessId,
    sync::SpinLock,
    timer::read_monotonic_milli_seconds,
};

/// A physical page frame number: `paddr >> PAGE_SIZE_BITS`.
pub type Pfn = usize;

/// Alias matching spec.md's naming for the table's reported state, exactly
/// [`BorrowState`] since no page-specific state is needed.
pub type PageOwnerState = BorrowState;

/// Errors surfaced by the ownership table, one-to-one with spec.md's
/// `PageOwnError` enum (`POWN_*` in the original).
pub type PageOwnError = BorrowError;

/// Page-specific metadata the generic [`Owner`](crate::borrow::Owner)
/// doesn't carry: the virtual address the owner mapped the page at, and
/// the exchange subsystem's claim (if any) that this page is mid-transfer.
#[derive(Debug, Clone, Copy, Default)]
struct PageExtra {
    owner_vaddr: usize,
}

static LOCKDAG_PAGEOWN_NODE: LockDagNode = LockDagNode::new("pageown");

/// Returns the static lock-order DAG node every `pageown` critical section
/// is attributed to, for callers (e.g. the frame allocator wrapper) that
/// need to declare an edge against it.
pub fn lockdag_node() -> &'static LockDagNode {
    &LOCKDAG_PAGEOWN_NODE
}

struct PageOwnTableInner {
    registry: BorrowRegistry<Pfn>,
    extra: SpinLock<BTreeMap<Pfn, PageExtra>>,
    npages: usize,
}

/// The process-wide page ownership table.
pub struct PageOwnTable {
    inner: Once<PageOwnTableInner>,
}

impl PageOwnTable {
    const fn new() -> Self {
        Self { inner: Once::new() }
    }

    fn inner(&self) -> &PageOwnTableInner {
        self.inner.get().expect("pageown: table not initialized")
    }

    /// Sizes the table from the total page count derived from the Limine
    /// memory map, mirroring the original `pageowninit`'s sanity caps: more
    /// than 1M pages, or a `Pfn -> Owner` table over 128MiB, disables page
    /// ownership tracking rather than panicking (a degraded-but-booting
    /// kernel beats a boot failure over a sizing heuristic).
    pub fn init(&self, npages: usize) {
        const MAX_PAGES: usize = 1024 * 1024;
        const MAX_TABLE_BYTES: usize = 128 * 1024 * 1024;
        // A BTreeMap entry's real footprint isn't `size_of::<Owner>()`, but
        // the same order-of-magnitude sanity cap the original applies to
        // its flat array still serves its purpose: refuse implausible page
        // counts (a misparsed memory map) rather than silently running
        // unbounded.
        let approx_entry_bytes = 128;
        if npages == 0 {
            info!("pageown: no usable pages reported, ownership tracking disabled");
            self.inner.call_once(|| PageOwnTableInner {
                registry: BorrowRegistry::new(),
                extra: SpinLock::new(BTreeMap::new()),
                npages: 0,
            });
            return;
        }
        if npages > MAX_PAGES || npages.saturating_mul(approx_entry_bytes) > MAX_TABLE_BYTES {
            info!(
                "pageown: unreasonably large npages = {}, ownership tracking disabled",
                npages
            );
            self.inner.call_once(|| PageOwnTableInner {
                registry: BorrowRegistry::new(),
                extra: SpinLock::new(BTreeMap::new()),
                npages: 0,
            });
            return;
        }
        info!("pageown: tracking {} pages ({} bytes)", npages, npages * PAGE_SIZE);
        self.inner.call_once(|| PageOwnTableInner {
            registry: BorrowRegistry::new(),
            extra: SpinLock::new(BTreeMap::new()),
            npages,
        });
    }

    fn check_pfn(&self, pfn: Pfn) -> Result<(), PageOwnError> {
        if pfn >= self.inner().npages {
            Err(BorrowError::Inval)
        } else {
            Ok(())
        }
    }

    /// `pageown_acquire` — claim exclusive ownership of `pfn` for `p`,
    /// mapped at `vaddr`.
    pub fn acquire(&self, p: ProcessId, pfn: Pfn, vaddr: usize) -> Result<(), PageOwnError> {
        self.check_pfn(pfn)?;
        let now_ns = read_monotonic_milli_seconds() * 1_000_000;
        self.inner().registry.acquire(p, pfn, now_ns)?;
        self.inner()
            .extra
            .lock()
            .insert(pfn, PageExtra { owner_vaddr: vaddr });
        Ok(())
    }

    /// `pageown_release`.
    pub fn release(&self, p: ProcessId, pfn: Pfn) -> Result<(), PageOwnError> {
        self.inner().registry.release(p, pfn)?;
        self.inner().extra.lock().remove(&pfn);
        Ok(())
    }

    /// A process-less variant of [`release`](Self::release) used only by
    /// the frame allocator's `put_page`, after a frame's reference count
    /// has reached zero and it is being returned to the free list. Unlike
    /// `release`, this does not check that a specific process still holds
    /// the page — by the time the allocator calls this, the page has no
    /// remaining handle owner to check against.
    pub fn release_for_reclaim(&self, pfn: Pfn) {
        self.inner().registry.force_release(pfn);
        self.inner().extra.lock().remove(&pfn);
    }

    /// `pageown_transfer`.
    pub fn transfer(
        &self,
        from: ProcessId,
        to: ProcessId,
        pfn: Pfn,
        new_vaddr: usize,
    ) -> Result<(), PageOwnError> {
        let now_ns = read_monotonic_milli_seconds() * 1_000_000;
        self.inner().registry.transfer(from, to, pfn, now_ns)?;
        self.inner()
            .extra
            .lock()
            .insert(pfn, PageExtra { owner_vaddr: new_vaddr });
        Ok(())
    }

    /// `pageown_borrow_shared`.
    pub fn borrow_shared(
        &self,
        owner: ProcessId,
        borrower: ProcessId,
        pfn: Pfn,
    ) -> Result<(), PageOwnError> {
        self.inner().registry.borrow_shared(owner, borrower, pfn)
    }

    /// `pageown_borrow_mut`.
    pub fn borrow_mut(
        &self,
        owner: ProcessId,
        borrower: ProcessId,
        pfn: Pfn,
    ) -> Result<(), PageOwnError> {
        self.inner().registry.borrow_mut(owner, borrower, pfn)
    }

    /// `pageown_return_shared`.
    pub fn return_shared(&self, borrower: ProcessId, pfn: Pfn) -> Result<(), PageOwnError> {
        self.inner().registry.return_shared(borrower, pfn)
    }

    /// `pageown_return_mut`.
    pub fn return_mut(&self, borrower: ProcessId, pfn: Pfn) -> Result<(), PageOwnError> {
        self.inner().registry.return_mut(borrower, pfn)
    }

    pub fn is_owned(&self, pfn: Pfn) -> bool {
        self.inner().registry.state(pfn) != BorrowState::Free
    }

    pub fn get_owner(&self, pfn: Pfn) -> Option<ProcessId> {
        self.inner().registry.get_owner(pfn)
    }

    pub fn get_state(&self, pfn: Pfn) -> PageOwnerState {
        self.inner().registry.state(pfn)
    }

    pub fn owner_vaddr(&self, pfn: Pfn) -> Option<usize> {
        self.inner().extra.lock().get(&pfn).map(|e| e.owner_vaddr)
    }

    /// Number of live shared borrowers of `pfn`, for `vmowninfo`.
    pub fn shared_count(&self, pfn: Pfn) -> usize {
        self.inner()
            .registry
            .snapshot(pfn)
            .map(|o| o.shared_count())
            .unwrap_or(0)
    }

    /// The current mutable borrower of `pfn`, if any, for `vmowninfo`.
    pub fn mut_borrower(&self, pfn: Pfn) -> Option<ProcessId> {
        self.inner()
            .registry
            .snapshot(pfn)
            .and_then(|o| o.mut_borrower())
    }

    /// Number of times `pfn` has changed owner via [`transfer`](Self::transfer)
    /// since it was first acquired, for `vmowninfo` and exchange-handoff tests.
    pub fn transfer_count(&self, pfn: Pfn) -> u64 {
        self.inner()
            .registry
            .snapshot(pfn)
            .map(|o| o.transfer_count())
            .unwrap_or(0)
    }

    pub fn can_borrow_shared(&self, pfn: Pfn) -> bool {
        match self.inner().registry.snapshot(pfn) {
            Some(owner) => owner.state() != BorrowState::Free && owner.mut_borrower().is_none(),
            None => false,
        }
    }

    pub fn can_borrow_mut(&self, pfn: Pfn) -> bool {
        match self.inner().registry.snapshot(pfn) {
            Some(owner) => {
                owner.state() != BorrowState::Free
                    && owner.shared_count() == 0
                    && owner.mut_borrower().is_none()
            }
            None => false,
        }
    }

    /// `pageown_cleanup_process`, composed from the generic registry's
    /// cleanup plus dropping this process's `PageExtra` entries.
    pub fn cleanup_process(&self, p: ProcessId) -> usize {
        let touched = self.inner().registry.cleanup_process(p);
        if touched > 0 {
            let mut extra = self.inner().extra.lock();
            let live: alloc::vec::Vec<Pfn> = extra.keys().copied().collect();
            for pfn in live {
                if self.inner().registry.get_owner(pfn).is_none() {
                    extra.remove(&pfn);
                }
            }
        }
        touched
    }

    pub fn npages(&self) -> usize {
        self.inner().npages
    }

    pub fn nowned(&self) -> usize {
        self.inner().registry.len()
    }

    /// Formats the same four counters the original's `pageown_stats`
    /// prints, for the `/dev/pageown/stat` device surface (spec.md §4.K).
    pub fn stats(&self) -> PageOwnStats {
        let inner = self.inner();
        let mut nshared = 0usize;
        let mut nmut = 0usize;
        // `BorrowRegistry` doesn't track shared/mut totals directly; derive
        // them from a snapshot pass, acceptable since stats are a cold path.
        for pfn in 0..inner.npages {
            if let Some(owner) = inner.registry.snapshot(pfn) {
                match owner.state() {
                    BorrowState::SharedOwned => nshared += 1,
                    BorrowState::MutLent => nmut += 1,
                    _ => {}
                }
            }
        }
        PageOwnStats {
            npages: inner.npages,
            nowned: inner.registry.len(),
            nshared,
            nmut,
        }
    }
}

impl Default for PageOwnTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of the four counters `pageown_stats` prints.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageOwnStats {
    pub npages: usize,
    pub nowned: usize,
    pub nshared: usize,
    pub nmut: usize,
}

/// The single process-wide page ownership table.
pub static PAGE_OWN_TABLE: PageOwnTable = PageOwnTable::new();

/// Process-death hook called by [`crate::process::cleanup`].
pub fn cleanup_process(pid: ProcessId) {
    if PAGE_OWN_TABLE.inner.get().is_some() {
        let cleaned = PAGE_OWN_TABLE.cleanup_process(pid);
        if cleaned > 0 {
            info!("pageown: cleaned {} pages for {:?}", cleaned, pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(n: usize) -> ProcessId {
        ProcessId::from_raw(n)
    }

    fn fresh_table(npages: usize) -> PageOwnTable {
        let table = PageOwnTable::new();
        table.init(npages);
        table
    }

    #[test]
    fn acquire_and_release_round_trip() {
        let table = fresh_table(16);
        table.acquire(pid(1), 3, 0x1000).unwrap();
        assert_eq!(table.get_owner(3), Some(pid(1)));
        assert_eq!(table.owner_vaddr(3), Some(0x1000));
        table.release(pid(1), 3).unwrap();
        assert_eq!(table.get_owner(3), None);
    }

    #[test]
    fn out_of_range_pfn_is_inval() {
        let table = fresh_table(4);
        assert_eq!(table.acquire(pid(1), 99, 0), Err(BorrowError::Inval));
    }

    #[test]
    fn borrow_shared_then_cleanup_on_owner_death() {
        let table = fresh_table(8);
        table.acquire(pid(1), 1, 0).unwrap();
        table.borrow_shared(pid(1), pid(2), 1).unwrap();
        table.cleanup_process(pid(1));
        assert_eq!(table.get_owner(1), None);
        assert_eq!(table.owner_vaddr(1), None);
    }

    #[test]
    fn oversized_npages_disables_tracking() {
        let table = fresh_table(2_000_000);
        assert_eq!(table.npages(), 0);
    }
}
