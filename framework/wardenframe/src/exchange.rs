// SPDX-License-Identifier: MPL-2.0

//! The exchange channel: page-granularity, zero-copy handoff of physical
//! pages between processes, built directly on [`crate::pageown`].
//!
//! This module owns the *ownership-table* side of a handoff only — whether
//! a page may move, and who it belongs to afterwards. Unmapping it out of
//! the source address space and mapping it into the destination one is the
//! caller's job (the syscall bridge, which holds both processes'
//! `VmSpace`s); `exchange.rs` never touches a page table directly, mirroring
//! how `pageown` itself stays below the page-table layer in the lock order
//! (spec.md §5: `freelist -> pageown -> exchange-prepared`).

use alloc::collections::BTreeMap;

use crate::{
    lock::BorrowLock,
    lockdag::LockDagNode,
    pageown::{PageOwnError, Pfn, PAGE_OWN_TABLE},
    process::ProcessId,
    vm::PAGE_SIZE,
};

/// An opaque handle identifying a page mid-exchange — the page's frame
/// number, exactly the original's "physical address as exchange handle".
pub type ExchangeHandle = Pfn;

/// Errors raised by the exchange protocol, one-to-one with the original's
/// `EXCHANGE_*` constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeError {
    Inval,
    NotOwner,
    Borrowed,
    Already,
    NotExchange,
}

impl From<PageOwnError> for ExchangeError {
    fn from(e: PageOwnError) -> Self {
        match e {
            PageOwnError::NotOwner => ExchangeError::NotOwner,
            PageOwnError::Borrowed => ExchangeError::Borrowed,
            PageOwnError::Already => ExchangeError::Already,
            _ => ExchangeError::Inval,
        }
    }
}

/// Bookkeeping for a page that has been prepared but not yet accepted or
/// cancelled.
#[derive(Clone, Copy)]
struct PreparedPage {
    original_vaddr: usize,
    owner: ProcessId,
}

/// An entry in the prepared-page table. A handle stays `Claimed` after a
/// successful accept instead of being unlinked outright, so a second accept
/// on the same handle can report `Already` rather than being mistaken for a
/// handle that never existed. A fresh `exchange_prepare` on the same pfn
/// overwrites a `Claimed` tombstone, since that prepare is itself authoritative.
enum PreparedEntry {
    Prepared(PreparedPage),
    Claimed,
}

static LOCKDAG_EXCHANGE_PREPARED_NODE: LockDagNode = LockDagNode::new("exchange-prepared");
static PREPARED: BorrowLock<BTreeMap<ExchangeHandle, PreparedEntry>> =
    BorrowLock::new(&LOCKDAG_EXCHANGE_PREPARED_NODE, BTreeMap::new());

/// Returns the lock-order DAG node this module's prepared-page table locks
/// under, for [`crate::vm::init`] to declare the allowed acquisition order
/// against the page ownership table.
pub fn lockdag_node() -> &'static LockDagNode {
    &LOCKDAG_EXCHANGE_PREPARED_NODE
}

/// Since the prepared-page table is a pure bookkeeping structure with no
/// per-process identity of its own, every caller locks it as this fixed
/// pseudo-process. Real ownership is still enforced by `pageown` itself —
/// this pid only identifies the lock's own acquirer for deadlock tracking.
const EXCHANGE_PID: ProcessId = ProcessId::from_raw(usize::MAX);

fn is_page_aligned(vaddr: usize) -> bool {
    vaddr % PAGE_SIZE == 0
}

/// `exchange_prepare`: removes `pfn` (currently mapped at `vaddr` in
/// `owner`'s address space) from circulation, returning a handle that can
/// be handed to another process via [`exchange_accept`].
///
/// The caller must already have unmapped the page from `owner`'s page
/// table and flushed the TLB before calling this — `exchange_prepare` only
/// records the intent to hand the page off; it does not itself own the
/// page table.
pub fn exchange_prepare(
    owner: ProcessId,
    pfn: Pfn,
    vaddr: usize,
) -> Result<ExchangeHandle, ExchangeError> {
    if !is_page_aligned(vaddr) {
        return Err(ExchangeError::Inval);
    }
    if PAGE_OWN_TABLE.get_owner(pfn) != Some(owner) {
        return Err(ExchangeError::NotOwner);
    }
    if !PAGE_OWN_TABLE.can_borrow_mut(pfn) {
        return Err(ExchangeError::Borrowed);
    }

    let mut guard = PREPARED.lock(EXCHANGE_PID);
    guard.insert(
        pfn,
        PreparedEntry::Prepared(PreparedPage {
            original_vaddr: vaddr,
            owner,
        }),
    );
    drop(guard);
    // The page sits in limbo between prepare and accept/cancel: no PTE
    // anywhere maps it, but ownership stays with `owner` in the table the
    // whole time. `exchange_accept` claims it with `pageown_transfer`
    // rather than a release-then-reacquire, so `transfer_count` keeps
    // tracking the handoff instead of getting reset by a fresh `Owner`.
    Ok(pfn)
}

/// `exchange_accept`: claims a handle previously returned by
/// [`exchange_prepare`], acquiring ownership for `acceptor` mapped at
/// `dest_vaddr`. The caller still has to perform the actual page-table
/// mapping; this only updates the ownership table and marks the prepared
/// record claimed, so a second accept on the same handle reports `Already`
/// instead of looking like a handle that never existed.
pub fn exchange_accept(
    acceptor: ProcessId,
    handle: ExchangeHandle,
    dest_vaddr: usize,
) -> Result<(), ExchangeError> {
    if handle == 0 || !is_page_aligned(dest_vaddr) {
        return Err(ExchangeError::Inval);
    }
    if handle >= PAGE_OWN_TABLE.npages() {
        return Err(ExchangeError::NotExchange);
    }

    let pp = {
        let guard = PREPARED.lock(EXCHANGE_PID);
        match guard.get(&handle) {
            None => return Err(ExchangeError::Inval),
            Some(PreparedEntry::Claimed) => return Err(ExchangeError::Already),
            Some(PreparedEntry::Prepared(pp)) => *pp,
        }
    };

    PAGE_OWN_TABLE
        .transfer(pp.owner, acceptor, handle, dest_vaddr)
        .map_err(ExchangeError::from)?;

    // Only mark the handle claimed once the transfer itself succeeded, so a
    // failed accept leaves the record intact for the caller to retry or cancel.
    PREPARED
        .lock(EXCHANGE_PID)
        .insert(handle, PreparedEntry::Claimed);
    Ok(())
}

/// `exchange_cancel`: undoes a prepare, restoring ownership to the
/// original owner and returning the virtual address so the caller can
/// remap the page back into that owner's page table.
pub fn exchange_cancel(handle: ExchangeHandle) -> Result<(ProcessId, usize), ExchangeError> {
    if handle == 0 {
        return Err(ExchangeError::Inval);
    }
    let mut guard = PREPARED.lock(EXCHANGE_PID);
    let pp = match guard.get(&handle) {
        None | Some(PreparedEntry::Claimed) => return Err(ExchangeError::Inval),
        Some(PreparedEntry::Prepared(pp)) => *pp,
    };
    guard.remove(&handle);
    drop(guard);
    // Ownership never left `pp.owner` in the table; cancel only needs to
    // unlink the `PreparedPage` record above and hand back where the
    // caller should remap the page.
    Ok((pp.owner, pp.original_vaddr))
}

/// `exchange_transfer`: the direct process-to-process handoff path that
/// skips the prepare/accept dance, used when both ends are known up
/// front (e.g. a single syscall moving a page between a parent and a
/// freshly-forked child).
pub fn exchange_transfer(
    from: ProcessId,
    to: ProcessId,
    handle: ExchangeHandle,
    to_vaddr: usize,
) -> Result<(), ExchangeError> {
    if handle == 0 || !is_page_aligned(to_vaddr) {
        return Err(ExchangeError::Inval);
    }
    PAGE_OWN_TABLE
        .transfer(from, to, handle, to_vaddr)
        .map_err(ExchangeError::from)
}

/// `exchange_is_valid`: whether `handle` currently names an owned page.
pub fn exchange_is_valid(handle: ExchangeHandle) -> bool {
    handle != 0 && handle < PAGE_OWN_TABLE.npages() && PAGE_OWN_TABLE.is_owned(handle)
}

/// `exchange_get_owner`.
pub fn exchange_get_owner(handle: ExchangeHandle) -> Option<ProcessId> {
    if handle == 0 {
        None
    } else {
        PAGE_OWN_TABLE.get_owner(handle)
    }
}

/// Process-death hook: any handle still outstanding for `pid` is a page
/// that was detached from `pid`'s address space but never accepted or
/// cancelled. `pid` still owns the page in [`PAGE_OWN_TABLE`] at this
/// point — [`crate::pageown::cleanup_process`] (called separately, see
/// [`crate::process::cleanup`]) is what actually frees it — so this only
/// has to drop the now-dangling `PreparedPage` record, matching spec.md
/// §4.I's "if the owner dies first, cleanup_process frees the page and
/// the handle is silently invalidated on next lookup". Returns the number
/// of handles dropped.
pub fn cleanup_process(pid: ProcessId) -> usize {
    let mut guard = PREPARED.lock(EXCHANGE_PID);
    let stale: alloc::vec::Vec<ExchangeHandle> = guard
        .iter()
        .filter_map(|(handle, entry)| match entry {
            PreparedEntry::Prepared(pp) if pp.owner == pid => Some(*handle),
            _ => None,
        })
        .collect();
    for handle in &stale {
        guard.remove(handle);
    }
    stale.len()
}

/// `exchange_prepare_range`: prepares every page in `[vaddr, vaddr+len)`,
/// rolling back (cancelling everything already prepared) on the first
/// failure. `pfn_of` resolves a virtual address to the frame currently
/// mapped there, since this module has no page-table access of its own.
pub fn exchange_prepare_range(
    owner: ProcessId,
    vaddr: usize,
    len: usize,
    pfn_of: impl Fn(usize) -> Option<Pfn>,
) -> Result<alloc::vec::Vec<ExchangeHandle>, ExchangeError> {
    const MAX_RANGE: usize = 1 << 30; // 1 GiB, matching the original's cap.
    if !is_page_aligned(vaddr) || len == 0 || len > MAX_RANGE {
        return Err(ExchangeError::Inval);
    }

    let mut handles = alloc::vec::Vec::new();
    let mut offset = 0usize;
    while offset < len {
        let va = vaddr + offset;
        let result = pfn_of(va)
            .ok_or(ExchangeError::Inval)
            .and_then(|pfn| exchange_prepare(owner, pfn, va));
        match result {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                for h in &handles {
                    let _ = exchange_cancel(*h);
                }
                return Err(e);
            }
        }
        offset += PAGE_SIZE;
    }
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;

    // `PAGE_OWN_TABLE` is a process-wide singleton; these tests all
    // re-`init` it, so they must not interleave with each other.
    static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn pid(n: usize) -> ProcessId {
        ProcessId::from_raw(n)
    }

    fn fresh_pageown(npages: usize) {
        crate::pageown::PAGE_OWN_TABLE.init(npages);
    }

    #[test]
    fn prepare_then_accept_moves_ownership() {
        let _g = TEST_LOCK.lock().unwrap();
        fresh_pageown(4);
        PAGE_OWN_TABLE.acquire(pid(1), 2, 0x4000).unwrap();
        let handle = exchange_prepare(pid(1), 2, 0x4000).unwrap();
        // Prepare is bookkeeping only: the original owner still holds the
        // page in the table right up until accept claims it.
        assert_eq!(PAGE_OWN_TABLE.get_owner(2), Some(pid(1)));
        exchange_accept(pid(2), handle, 0x5000).unwrap();
        assert_eq!(PAGE_OWN_TABLE.get_owner(2), Some(pid(2)));
        // A prepare+accept round trip is one handoff: transfer_count must
        // land at 1, not 0 (a release-then-reacquire would lose this).
        assert_eq!(PAGE_OWN_TABLE.transfer_count(2), 1);
        PAGE_OWN_TABLE.release(pid(2), 2).unwrap();
    }

    #[test]
    fn cancel_returns_original_owner_and_vaddr() {
        let _g = TEST_LOCK.lock().unwrap();
        fresh_pageown(4);
        PAGE_OWN_TABLE.acquire(pid(1), 1, 0x1000).unwrap();
        let handle = exchange_prepare(pid(1), 1, 0x1000).unwrap();
        let (owner, vaddr) = exchange_cancel(handle).unwrap();
        assert_eq!(owner, pid(1));
        assert_eq!(vaddr, 0x1000);
        // The table entry was never disturbed by prepare, so cancel leaves
        // it exactly as it was — no transfer, no reacquire.
        assert_eq!(PAGE_OWN_TABLE.get_owner(1), Some(pid(1)));
        assert_eq!(PAGE_OWN_TABLE.transfer_count(1), 0);
        PAGE_OWN_TABLE.release(pid(1), 1).unwrap();
    }

    #[test]
    fn accept_on_already_accepted_handle_fails() {
        let _g = TEST_LOCK.lock().unwrap();
        fresh_pageown(4);
        PAGE_OWN_TABLE.acquire(pid(1), 3, 0x6000).unwrap();
        let handle = exchange_prepare(pid(1), 3, 0x6000).unwrap();
        exchange_accept(pid(2), handle, 0x7000).unwrap();
        // The first accept leaves a `Claimed` tombstone behind instead of
        // unlinking the record, so a second accept is told the handle was
        // already used rather than that it never existed.
        assert_eq!(
            exchange_accept(pid(3), handle, 0x8000),
            Err(ExchangeError::Already)
        );
        PAGE_OWN_TABLE.release(pid(2), 3).unwrap();
    }

    #[test]
    fn cleanup_process_drops_prepared_pages_of_dead_owner() {
        let _g = TEST_LOCK.lock().unwrap();
        fresh_pageown(4);
        PAGE_OWN_TABLE.acquire(pid(1), 2, 0x4000).unwrap();
        let handle = exchange_prepare(pid(1), 2, 0x4000).unwrap();
        assert_eq!(cleanup_process(pid(1)), 1);
        // The handle is now silently invalid; neither cancel nor accept
        // finds a record for it.
        assert_eq!(exchange_cancel(handle), Err(ExchangeError::Inval));
    }

    #[test]
    fn prepare_by_non_owner_fails() {
        let _g = TEST_LOCK.lock().unwrap();
        fresh_pageown(4);
        PAGE_OWN_TABLE.acquire(pid(1), 0, 0).unwrap();
        assert_eq!(
            exchange_prepare(pid(2), 0, 0x2000),
            Err(ExchangeError::NotOwner)
        );
        PAGE_OWN_TABLE.release(pid(1), 0).unwrap();
    }
}
