// SPDX-License-Identifier: MPL-2.0

use align_ext::AlignExt;
use core::ops::Range;

use super::{
    is_page_aligned,
    page_table::{AddressWidth, PageTable, PageTableConfig, PageTableError, UserMode},
    VmFrameVec, VmIo, PAGE_SIZE,
};
use crate::{
    arch::mm::{is_user_vaddr, PageTableEntry, PageTableFlags},
    error::Error,
    prelude::Result,
    sync::SpinLock,
    vm::page_table::PageTableFlagsTrait,
    vm::Vaddr,
};

/// Virtual memory space.
///
/// A virtual memory space (`VmSpace`) can be created and assigned to a user
/// space so that the virtual memory of the user space can be manipulated
/// safely. A newly-created `VmSpace` is not backed by any physical memory
/// pages; frames are mapped in one at a time via [`map`](Self::map).
pub struct VmSpace {
    pt: SpinLock<PageTable<PageTableEntry, UserMode>>,
}

impl VmSpace {
    /// Creates a new, empty VM address space.
    pub fn new() -> Self {
        Self {
            pt: SpinLock::new(PageTable::new(PageTableConfig {
                address_width: AddressWidth::Level4,
            })),
        }
    }

    /// Activates this address space's page table on the current CPU.
    ///
    /// # Safety
    ///
    /// The caller must ensure switching to this page table does not
    /// invalidate memory the currently executing code depends on.
    pub unsafe fn activate(&self) {
        let root_paddr = self.pt.lock().root_paddr();
        crate::arch::mm::activate_page_table(
            root_paddr,
            x86_64::registers::control::Cr3Flags::empty(),
        );
    }

    /// Maps the given physical frames into this address space starting at
    /// `options.addr`, according to `options.flags`. The ownership of the
    /// frames is transferred to the `VmSpace`.
    pub fn map(&self, frames: VmFrameVec, options: &VmMapOptions) -> Result<Vaddr> {
        let addr = options.addr.ok_or(Error::InvalidArgs)?;
        if addr % PAGE_SIZE != 0 || !is_user_vaddr(addr) {
            return Err(Error::InvalidArgs);
        }

        let mut pt = self.pt.lock();
        for (i, frame) in frames.iter().enumerate() {
            pt.map(addr + i * PAGE_SIZE, frame, options.flags)
                .map_err(page_table_err_to_error)?;
        }
        Ok(addr)
    }

    /// Unmaps the virtual address range, skipping any gap that is already
    /// unmapped.
    pub fn unmap(&self, range: &Range<Vaddr>) -> Result<()> {
        if !is_page_aligned(range.start) || !is_page_aligned(range.end) {
            return Err(Error::InvalidArgs);
        }
        let mut pt = self.pt.lock();
        let mut vaddr = range.start;
        while vaddr < range.end {
            match pt.unmap(vaddr) {
                Ok(()) | Err(PageTableError::InvalidModification) => {}
                Err(e) => return Err(page_table_err_to_error(e)),
            }
            vaddr += PAGE_SIZE;
        }
        Ok(())
    }

    /// Returns whether `vaddr` currently has a mapping.
    pub fn is_mapped(&self, vaddr: Vaddr) -> bool {
        self.pt.lock().is_mapped(vaddr)
    }

    /// Updates the permission flags mapped at `vaddr`. Skipped (not an
    /// error) if nothing is currently mapped there.
    pub fn protect(&self, vaddr: Vaddr, flags: PageTableFlags) -> Result<()> {
        let mut pt = self.pt.lock();
        match pt.protect(vaddr, flags) {
            Ok(_) | Err(PageTableError::InvalidModification) => Ok(()),
            Err(e) => Err(page_table_err_to_error(e)),
        }
    }
}

impl Default for VmSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl VmIo for VmSpace {
    fn read_bytes(&self, vaddr: usize, buf: &mut [u8]) -> Result<()> {
        // SAFETY: the caller-supplied `vaddr` is only dereferenced after
        // this address space has been activated on the current CPU, which
        // the syscall bridge guarantees for user-mapped addresses.
        if !self.is_mapped(vaddr.align_down(PAGE_SIZE)) {
            return Err(Error::AccessDenied);
        }
        unsafe {
            core::ptr::copy_nonoverlapping(vaddr as *const u8, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    fn write_bytes(&self, vaddr: usize, buf: &[u8]) -> Result<()> {
        if !self.is_mapped(vaddr.align_down(PAGE_SIZE)) {
            return Err(Error::AccessDenied);
        }
        unsafe {
            core::ptr::copy_nonoverlapping(buf.as_ptr(), vaddr as *mut u8, buf.len());
        }
        Ok(())
    }
}

fn page_table_err_to_error(e: PageTableError) -> Error {
    match e {
        PageTableError::InvalidModification => Error::InvalidArgs,
        PageTableError::InvalidVaddr => Error::InvalidArgs,
    }
}

/// Options for mapping physical memory pages into a VM address space.
/// See [`VmSpace::map`].
#[derive(Clone, Debug)]
pub struct VmMapOptions {
    addr: Option<Vaddr>,
    flags: PageTableFlags,
}

impl VmMapOptions {
    /// Creates the default options: unmapped (no address chosen yet),
    /// present, read-only, user-accessible.
    pub fn new() -> Self {
        Self {
            addr: None,
            flags: PageTableFlags::new()
                .set_present(true)
                .set_accessible_by_user(true),
        }
    }

    /// Sets the permissions of the mapping.
    pub fn flags(&mut self, flags: PageTableFlags) -> &mut Self {
        self.flags = flags;
        self
    }

    /// Sets the address of the new mapping.
    pub fn addr(&mut self, addr: Option<Vaddr>) -> &mut Self {
        self.addr = addr;
        self
    }
}

impl Default for VmMapOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// The result of querying a single page's mapping status.
#[derive(Debug, Clone)]
pub enum VmQueryResult {
    NotMapped { vaddr: Vaddr },
    Mapped { vaddr: Vaddr, flags: PageTableFlags },
}
