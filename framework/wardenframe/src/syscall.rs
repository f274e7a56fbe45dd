// SPDX-License-Identifier: MPL-2.0

//! Syscall bridges for page ownership, borrowing, and exchange.
//!
//! Each function here is the direct Rust counterpart of one `sys*`
//! handler in the original (`sysvmexchange`, `sysvmlend_shared`, ...):
//! the `va_list` argument unpacking is gone, replaced by ordinary typed
//! parameters, and `error(...)` longjmps become `Result` returns. Callers
//! still get the original's error strings back via [`error_string`], for
//! a device or debug surface that wants the 9P-style text rather than the
//! crate-wide [`Error`] variant.
//!
//! None of these functions touch a page table: `pfn_of` (read: `mmuwalk`)
//! and `unmap`/`remap` callbacks stand in for direct PTE manipulation, the
//! same abstraction `exchange.rs` uses and for the same reason — this
//! crate's ownership core is a layer below the page-table manager, not a
//! replacement for it.

use crate::{
    error::Error,
    exchange::{self, ExchangeError, ExchangeHandle},
    pageown::{PageOwnError, Pfn, PageOwnerState, PAGE_OWN_TABLE},
    process::ProcessId,
    vm::PAGE_SIZE,
};

const MAX_RANGE_BYTES: usize = 1 << 30;

fn is_page_aligned(vaddr: usize) -> bool {
    vaddr % PAGE_SIZE == 0
}

fn check_range(vaddr: usize, len: usize) -> Result<(), Error> {
    if !is_page_aligned(vaddr) {
        return Err(Error::InvalidArgs);
    }
    if len == 0 || len > MAX_RANGE_BYTES {
        return Err(Error::InvalidArgs);
    }
    Ok(())
}

fn map_pageown_err(e: PageOwnError) -> Error {
    match e {
        PageOwnError::NotOwner | PageOwnError::NotBorrowed => Error::AccessDenied,
        PageOwnError::Borrowed | PageOwnError::MutBorrow | PageOwnError::SharedBorrow => {
            Error::AccessDenied
        }
        PageOwnError::NoMem => Error::NoMemory,
        _ => Error::InvalidArgs,
    }
}

fn map_exchange_err(e: ExchangeError) -> Error {
    match e {
        ExchangeError::NotOwner | ExchangeError::Borrowed => Error::AccessDenied,
        ExchangeError::Already => Error::InvalidArgs,
        ExchangeError::NotExchange | ExchangeError::Inval => Error::InvalidArgs,
    }
}

/// A static error string matching the original's `error("vmexchange: ...")`
/// calls, for a side channel (e.g. a device read) that wants 9P-style text
/// rather than the crate-wide [`Error`] enum.
pub fn error_string(e: PageOwnError) -> &'static str {
    match e {
        PageOwnError::Inval => "vm: invalid argument",
        PageOwnError::Already => "vm: page already owned",
        PageOwnError::NotOwner => "vm: not owner of page",
        PageOwnError::Borrowed => "vm: page is borrowed",
        PageOwnError::MutBorrow => "vm: has mutable borrow",
        PageOwnError::SharedBorrow => "vm: has shared borrows",
        PageOwnError::NotBorrowed => "vm: not a borrowed page",
        PageOwnError::NoMem => "vm: out of borrow slots",
        PageOwnError::NotFound => "vm: no such page",
    }
}

/// `sysvmexchange`: moves ownership of every page in `[vaddr, vaddr+len)`
/// from `from` to `to`. `pfn_of` resolves each source virtual address to
/// its current frame; `unmap` tears down the source mapping once transfer
/// succeeds. Returns the page count transferred.
pub fn vmexchange(
    from: ProcessId,
    to: ProcessId,
    vaddr: usize,
    len: usize,
    pfn_of: impl Fn(usize) -> Option<Pfn>,
    mut unmap: impl FnMut(usize),
) -> Result<i64, Error> {
    check_range(vaddr, len)?;
    if from == to {
        return Err(Error::InvalidArgs);
    }

    let mut npages = 0i64;
    let mut offset = 0usize;
    while offset < len {
        let va = vaddr + offset;
        let pfn = pfn_of(va).ok_or(Error::PageFault)?;
        PAGE_OWN_TABLE
            .transfer(from, to, pfn, va)
            .map_err(map_pageown_err)?;
        unmap(va);
        npages += 1;
        offset += PAGE_SIZE;
    }
    Ok(npages)
}

/// `sysvmlend_shared`: lends every page in the range to `to` as a shared
/// (read-only) borrower. `downgrade` drops write permission on the
/// owner's own mapping, mirroring the original clearing `PTEWRITE`.
pub fn vmlend_shared(
    from: ProcessId,
    to: ProcessId,
    vaddr: usize,
    len: usize,
    pfn_of: impl Fn(usize) -> Option<Pfn>,
    mut downgrade: impl FnMut(usize),
) -> Result<i64, Error> {
    check_range(vaddr, len)?;
    if from == to {
        return Err(Error::InvalidArgs);
    }

    let mut npages = 0i64;
    let mut offset = 0usize;
    while offset < len {
        let va = vaddr + offset;
        let pfn = pfn_of(va).ok_or(Error::PageFault)?;
        PAGE_OWN_TABLE
            .borrow_shared(from, to, pfn)
            .map_err(map_pageown_err)?;
        downgrade(va);
        npages += 1;
        offset += PAGE_SIZE;
    }
    Ok(npages)
}

/// `sysvmlend_mut`: lends every page in the range to `to` as the sole
/// mutable borrower, unmapping it from `from` in the process.
pub fn vmlend_mut(
    from: ProcessId,
    to: ProcessId,
    vaddr: usize,
    len: usize,
    pfn_of: impl Fn(usize) -> Option<Pfn>,
    mut unmap: impl FnMut(usize),
) -> Result<i64, Error> {
    check_range(vaddr, len)?;
    if from == to {
        return Err(Error::InvalidArgs);
    }

    let mut npages = 0i64;
    let mut offset = 0usize;
    while offset < len {
        let va = vaddr + offset;
        let pfn = pfn_of(va).ok_or(Error::PageFault)?;
        PAGE_OWN_TABLE
            .borrow_mut(from, to, pfn)
            .map_err(map_pageown_err)?;
        unmap(va);
        npages += 1;
        offset += PAGE_SIZE;
    }
    Ok(npages)
}

/// `sysvmreturn`: ends a borrow (shared or mutable, whichever `borrower`
/// currently holds) over every page in the range. `restore` remaps or
/// re-permissions the page on the owner's side once the borrow ends,
/// mirroring the original's `PTEWRITE`/full-remap restoration.
pub fn vmreturn(
    borrower: ProcessId,
    vaddr: usize,
    len: usize,
    pfn_of: impl Fn(usize) -> Option<Pfn>,
    mut restore: impl FnMut(usize, PageOwnerState),
) -> Result<i64, Error> {
    check_range(vaddr, len)?;

    let mut npages = 0i64;
    let mut offset = 0usize;
    while offset < len {
        let va = vaddr + offset;
        let pfn = pfn_of(va).ok_or(Error::PageFault)?;

        let owner = PAGE_OWN_TABLE.get_owner(pfn).ok_or(Error::InvalidArgs)?;
        if owner == borrower {
            return Err(Error::InvalidArgs);
        }

        match PAGE_OWN_TABLE.get_state(pfn) {
            crate::borrow::BorrowState::SharedOwned => {
                PAGE_OWN_TABLE
                    .return_shared(borrower, pfn)
                    .map_err(map_pageown_err)?;
            }
            crate::borrow::BorrowState::MutLent => {
                PAGE_OWN_TABLE
                    .return_mut(borrower, pfn)
                    .map_err(map_pageown_err)?;
            }
            _ => return Err(Error::InvalidArgs),
        }
        restore(va, PAGE_OWN_TABLE.get_state(pfn));
        npages += 1;
        offset += PAGE_SIZE;
    }
    Ok(npages)
}

/// Snapshot matching the original's `struct VmOwnInfo`.
#[derive(Debug, Clone, Copy)]
pub struct VmOwnInfo {
    pub owner: Option<ProcessId>,
    pub state: PageOwnerState,
    pub shared_count: usize,
    pub mut_borrower: Option<ProcessId>,
}

/// `sysvmowninfo`.
pub fn vmowninfo(vaddr: usize, pfn_of: impl Fn(usize) -> Option<Pfn>) -> Result<VmOwnInfo, Error> {
    if !is_page_aligned(vaddr) {
        return Err(Error::InvalidArgs);
    }
    let pfn = pfn_of(vaddr).ok_or(Error::PageFault)?;
    Ok(VmOwnInfo {
        owner: PAGE_OWN_TABLE.get_owner(pfn),
        state: PAGE_OWN_TABLE.get_state(pfn),
        shared_count: PAGE_OWN_TABLE.shared_count(pfn),
        mut_borrower: PAGE_OWN_TABLE.mut_borrower(pfn),
    })
}

/// `sysexchangeprepare`.
pub fn syscall_exchange_prepare(
    owner: ProcessId,
    pfn: Pfn,
    vaddr: usize,
) -> Result<ExchangeHandle, Error> {
    exchange::exchange_prepare(owner, pfn, vaddr).map_err(map_exchange_err)
}

/// `sysexchangeaccept`.
pub fn syscall_exchange_accept(
    acceptor: ProcessId,
    handle: ExchangeHandle,
    dest_vaddr: usize,
) -> Result<(), Error> {
    exchange::exchange_accept(acceptor, handle, dest_vaddr).map_err(map_exchange_err)
}

/// `sysexchangecancel`.
pub fn syscall_exchange_cancel(handle: ExchangeHandle) -> Result<(ProcessId, usize), Error> {
    exchange::exchange_cancel(handle).map_err(map_exchange_err)
}

/// `sysexchangepreparerange`.
pub fn syscall_exchange_prepare_range(
    owner: ProcessId,
    vaddr: usize,
    len: usize,
    pfn_of: impl Fn(usize) -> Option<Pfn>,
) -> Result<alloc::vec::Vec<ExchangeHandle>, Error> {
    exchange::exchange_prepare_range(owner, vaddr, len, pfn_of).map_err(map_exchange_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(n: usize) -> ProcessId {
        ProcessId::from_raw(n)
    }

    #[test]
    fn vmexchange_rejects_misaligned_vaddr() {
        let err = vmexchange(pid(1), pid(2), 1, PAGE_SIZE, |_| Some(0), |_| {});
        assert_eq!(err, Err(Error::InvalidArgs));
    }

    #[test]
    fn vmexchange_rejects_self_target() {
        let err = vmexchange(pid(1), pid(1), 0, PAGE_SIZE, |_| Some(0), |_| {});
        assert_eq!(err, Err(Error::InvalidArgs));
    }

    #[test]
    fn vmexchange_moves_ownership_and_unmaps() {
        // Uses a pfn disjoint from `exchange.rs`'s tests, which share this
        // same process-wide `PAGE_OWN_TABLE` singleton.
        PAGE_OWN_TABLE.init(8);
        PAGE_OWN_TABLE.acquire(pid(10), 7, 0x1000).unwrap();
        let mut unmapped = alloc::vec::Vec::new();
        let n = vmexchange(pid(10), pid(11), 0x1000, PAGE_SIZE, |_va| Some(7), |va| {
            unmapped.push(va)
        })
        .unwrap();
        assert_eq!(n, 1);
        assert_eq!(unmapped, alloc::vec![0x1000]);
        assert_eq!(PAGE_OWN_TABLE.get_owner(7), Some(pid(11)));
        PAGE_OWN_TABLE.release(pid(11), 7).unwrap();
    }
}
