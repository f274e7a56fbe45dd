// SPDX-License-Identifier: MPL-2.0

use alloc::{vec, vec::Vec};
use core::{fmt::Debug, marker::PhantomData, mem::size_of};

use log::trace;
use pod::Pod;
use spin::Once;

use super::{paddr_to_vaddr, Paddr, Vaddr, VmAllocOptions};
use crate::{
    arch::mm::{is_kernel_vaddr, is_user_vaddr, tlb_flush, PageTableEntry, NR_ENTRIES_PER_PAGE},
    config::{HHDM_MAPPED_BYTES, KERNEL_OFFSET, PHYS_OFFSET},
    sync::SpinLock,
    vm::{VmFrame, PAGE_SIZE},
};

pub trait PageTableFlagsTrait: Clone + Copy + Sized + Pod + Debug {
    fn new() -> Self;

    fn set_present(self, present: bool) -> Self;

    fn set_writable(self, writable: bool) -> Self;

    fn set_readable(self, readable: bool) -> Self;

    fn set_accessible_by_user(self, accessible: bool) -> Self;

    fn set_executable(self, executable: bool) -> Self;

    fn set_huge(self, huge: bool) -> Self;

    /// Marks the entry as present in every address space, so it is not
    /// flushed from the TLB on a CR3 switch. Only meaningful for kernel
    /// mappings.
    fn set_global(self, global: bool) -> Self;

    /// Marks the entry as already accessed, so the CPU never has to take a
    /// fault to set this bit itself. Boot-time kernel mappings set this
    /// eagerly since nothing walks them to "discover" access.
    fn set_accessed(self, accessed: bool) -> Self;

    /// Marks the entry as already dirty, the write-side counterpart of
    /// [`set_accessed`](Self::set_accessed).
    fn set_dirty(self, dirty: bool) -> Self;

    fn is_present(&self) -> bool;

    fn writable(&self) -> bool;

    fn readable(&self) -> bool;

    fn executable(&self) -> bool;

    fn has_accessed(&self) -> bool;

    fn is_dirty(&self) -> bool;

    fn is_huge(&self) -> bool;

    fn accessible_by_user(&self) -> bool;

    /// Returns a new set of flags, containing any flags present in either self or other. It is similar to the OR operation.
    fn union(&self, other: &Self) -> Self;

    /// Remove the specified flags.
    fn remove(&mut self, flags: &Self);

    /// Insert the specified flags.
    fn insert(&mut self, flags: &Self);
}

pub trait PageTableEntryTrait: Clone + Copy + Sized + Pod + Debug {
    type F: PageTableFlagsTrait;

    fn new(paddr: Paddr, flags: Self::F) -> Self;

    fn paddr(&self) -> Paddr;

    fn flags(&self) -> Self::F;

    fn update(&mut self, paddr: Paddr, flags: Self::F);

    /// To determine whether the PTE is used, it usually checks whether it is 0.
    ///
    /// The page table will first use this value to determine whether a new page needs to be created to complete the mapping.
    fn is_used(&self) -> bool;

    /// Clear the PTE and reset it to the initial state, which is usually 0.
    fn clear(&mut self);

    /// The index of the next PTE is determined based on the virtual address and the current level, and the level range is [1,5].
    ///
    /// For example, in x86 we use the following expression to get the index (NR_ENTRIES_PER_PAGE is 512):
    /// ```
    /// va >> (12 + 9 * (level - 1)) & (NR_ENTRIES_PER_PAGE - 1)
    /// ```
    ///
    fn page_index(va: Vaddr, level: usize) -> usize;
}

#[derive(Debug, Clone, Copy)]
pub struct PageTableConfig {
    pub address_width: AddressWidth,
}

#[derive(Debug, Clone, Copy)]
#[repr(usize)]
pub enum AddressWidth {
    Level3 = 3,
    Level4 = 4,
    Level5 = 5,
}

#[derive(Debug)]
pub enum PageTableError {
    /// Modifications to page tables (map, unmap, protect, etc.) are invalid for the following reasons:
    ///
    /// 1. The mapping is present before map operation.
    /// 2. The mapping is already invalid before unmap operation.
    /// 3. The mapping is not exists before protect operation.
    InvalidModification,
    InvalidVaddr,
}

pub static KERNEL_PAGE_TABLE: Once<SpinLock<PageTable<PageTableEntry, KernelMode>>> = Once::new();

#[derive(Clone)]
pub struct UserMode {}

#[derive(Clone)]
pub struct KernelMode {}

/// The page table used by iommu maps the device address
/// space to the physical address space.
#[derive(Clone)]
pub struct DeviceMode {}

#[derive(Clone, Debug)]
pub struct PageTable<T: PageTableEntryTrait, M = UserMode> {
    root_paddr: Paddr,
    /// store all the physical frame that the page table need to map all the frame e.g. the frame of the root_pa
    tables: Vec<VmFrame>,
    config: PageTableConfig,
    _phantom: PhantomData<(T, M)>,
}

impl<T: PageTableEntryTrait> PageTable<T, UserMode> {
    pub fn new(config: PageTableConfig) -> Self {
        let root_frame = VmAllocOptions::new(1).alloc_single().unwrap();
        Self {
            root_paddr: root_frame.start_paddr(),
            tables: vec![root_frame],
            config,
            _phantom: PhantomData,
        }
    }

    pub fn map(
        &mut self,
        vaddr: Vaddr,
        frame: &VmFrame,
        flags: T::F,
    ) -> Result<(), PageTableError> {
        if is_kernel_vaddr(vaddr) {
            return Err(PageTableError::InvalidVaddr);
        }
        // Safety:
        // 1. The vaddr belongs to user mode program and does not affect the kernel mapping.
        // 2. The area where the physical address islocated at untyped memory and does not affect kernel security.
        unsafe { self.do_map(vaddr, frame.start_paddr(), flags) }
    }

    pub fn unmap(&mut self, vaddr: Vaddr) -> Result<(), PageTableError> {
        if is_kernel_vaddr(vaddr) {
            return Err(PageTableError::InvalidVaddr);
        }
        // Safety: The vaddr belongs to user mode program and does not affect the kernel mapping.
        unsafe { self.do_unmap(vaddr) }
    }

    pub fn protect(&mut self, vaddr: Vaddr, flags: T::F) -> Result<T::F, PageTableError> {
        if is_kernel_vaddr(vaddr) {
            return Err(PageTableError::InvalidVaddr);
        }
        // Safety: The vaddr belongs to user mode program and does not affect the kernel mapping.
        unsafe { self.do_protect(vaddr, flags) }
    }

    /// Add a new mapping directly in the root page table.
    ///
    /// # Safety
    ///
    /// User must guarantee the validity of the PTE.
    pub(crate) unsafe fn add_root_mapping(&mut self, index: usize, pte: &T) {
        debug_assert!((index + 1) * size_of::<T>() <= PAGE_SIZE);
        // Safety: The root_paddr is refer to the root of a valid page table.
        let root_ptes: &mut [T] = table_of(self.root_paddr).unwrap();
        root_ptes[index] = *pte;
    }
}

impl<T: PageTableEntryTrait> PageTable<T, KernelMode> {
    /// Builds a fresh, empty kernel page table with its own root frame —
    /// used once at boot to construct the kernel's own PML4, rather than
    /// borrowing whatever table the bootloader happened to install.
    pub fn new(config: PageTableConfig) -> Self {
        let root_frame = VmAllocOptions::new(1).alloc_single().unwrap();
        Self {
            root_paddr: root_frame.start_paddr(),
            tables: vec![root_frame],
            config,
            _phantom: PhantomData,
        }
    }

    /// Maps `[vaddr, vaddr + size)` to `[paddr, paddr + size)`, choosing the
    /// largest leaf size (4 KiB or 2 MiB) that fits both the alignment and
    /// the remaining size at each step, splitting across as many page-table
    /// entries as the range needs. `accessed`/`dirty` are always set since
    /// kernel mappings are never faulted in lazily; `global` is set when
    /// `vaddr` falls in the kernel half, so the mapping survives a CR3
    /// switch instead of being flushed from the TLB.
    ///
    /// # Safety
    ///
    /// Modifying kernel mappings is considered unsafe, and incorrect operation may cause crashes.
    /// User must take care of the consequences when using this API.
    pub unsafe fn map_range(
        &mut self,
        vaddr: Vaddr,
        paddr: Paddr,
        size: usize,
        flags: T::F,
    ) -> Result<(), PageTableError> {
        if is_user_vaddr(vaddr) {
            return Err(PageTableError::InvalidVaddr);
        }
        let mut flags = flags.set_accessed(true).set_dirty(true);
        if is_kernel_vaddr(vaddr) {
            flags = flags.set_global(true);
        }
        self.do_map_range(vaddr, paddr, size, flags)
    }

    /// Unmaps `[vaddr, vaddr + size)`, splitting any 2 MiB leaf the range
    /// only partially covers before clearing the entries it does cover.
    ///
    /// # Safety
    ///
    /// Modifying kernel mappings is considered unsafe, and incorrect operation may cause crashes.
    /// User must take care of the consequences when using this API.
    pub unsafe fn unmap_range(&mut self, vaddr: Vaddr, size: usize) -> Result<(), PageTableError> {
        if is_user_vaddr(vaddr) {
            return Err(PageTableError::InvalidVaddr);
        }
        self.do_unmap_range(vaddr, size)
    }

    /// Mapping `vaddr` to `paddr` with flags. The `vaddr` should not be at the low address
    ///  (memory belonging to the user mode program).
    ///
    /// # Safety
    ///
    /// Modifying kernel mappings is considered unsafe, and incorrect operation may cause crashes.
    /// User must take care of the consequences when using this API.
    pub unsafe fn map(
        &mut self,
        vaddr: Vaddr,
        paddr: Paddr,
        flags: T::F,
    ) -> Result<(), PageTableError> {
        if is_user_vaddr(vaddr) {
            return Err(PageTableError::InvalidVaddr);
        }
        self.do_map(vaddr, paddr, flags)
    }

    /// Unmap `vaddr`. The `vaddr` should not be at the low address
    ///  (memory belonging to the user mode program).
    ///
    /// # Safety
    ///
    /// Modifying kernel mappings is considered unsafe, and incorrect operation may cause crashes.
    /// User must take care of the consequences when using this API.
    pub unsafe fn unmap(&mut self, vaddr: Vaddr) -> Result<(), PageTableError> {
        if is_user_vaddr(vaddr) {
            return Err(PageTableError::InvalidVaddr);
        }
        self.do_unmap(vaddr)
    }

    /// Modify the flags mapped at `vaddr`. The `vaddr` should not be at the low address
    ///  (memory belonging to the user mode program).
    /// If the modification succeeds, it will return the old flags of `vaddr`.
    ///
    /// # Safety
    ///
    /// Modifying kernel mappings is considered unsafe, and incorrect operation may cause crashes.
    /// User must take care of the consequences when using this API.
    pub unsafe fn protect(&mut self, vaddr: Vaddr, flags: T::F) -> Result<T::F, PageTableError> {
        if is_user_vaddr(vaddr) {
            return Err(PageTableError::InvalidVaddr);
        }
        self.do_protect(vaddr, flags)
    }
}

impl<T: PageTableEntryTrait> PageTable<T, DeviceMode> {
    pub fn new(config: PageTableConfig) -> Self {
        let root_frame = VmAllocOptions::new(1).alloc_single().unwrap();
        Self {
            root_paddr: root_frame.start_paddr(),
            tables: vec![root_frame],
            config,
            _phantom: PhantomData,
        }
    }

    /// Mapping directly from a virtual address to a physical address.
    /// The virtual address should be in the device address space.
    ///
    /// # Safety
    ///
    /// User must ensure the given paddr is a valid one (e.g. from the VmSegment).
    pub unsafe fn map_with_paddr(
        &mut self,
        vaddr: Vaddr,
        paddr: Paddr,
        flags: T::F,
    ) -> Result<(), PageTableError> {
        self.do_map(vaddr, paddr, flags)
    }

    pub fn unmap(&mut self, vaddr: Vaddr) -> Result<(), PageTableError> {
        // Safety: the `vaddr` is in the device address space.
        unsafe { self.do_unmap(vaddr) }
    }
}

impl<T: PageTableEntryTrait, M> PageTable<T, M> {
    /// Mapping `vaddr` to `paddr` with flags.
    ///
    /// # Safety
    ///
    /// This function allows arbitrary modifications to the page table.
    /// Incorrect modifications may cause the kernel to crash (e.g., changing the linear mapping.).
    unsafe fn do_map(
        &mut self,
        vaddr: Vaddr,
        paddr: Paddr,
        flags: T::F,
    ) -> Result<(), PageTableError> {
        let last_entry = self.do_page_walk_mut(vaddr, true).unwrap();
        trace!(
            "Page Table: Map vaddr:{:x?}, paddr:{:x?}, flags:{:x?}",
            vaddr,
            paddr,
            flags
        );
        if last_entry.is_used() && last_entry.flags().is_present() {
            return Err(PageTableError::InvalidModification);
        }
        last_entry.update(paddr, flags);
        tlb_flush(vaddr);
        Ok(())
    }

    /// Find the last PTE and return its mutable reference.
    ///
    /// If create is set, it will create the next table until the last PTE.
    /// If not, it will return `None` if it cannot reach the last PTE.
    fn do_page_walk_mut(&mut self, vaddr: Vaddr, create: bool) -> Option<&mut T> {
        let mut level = self.config.address_width as usize;
        // Safety: The offset does not exceed the value of PAGE_SIZE.
        // It only change the memory controlled by page table.
        let mut current: &mut T =
            unsafe { &mut *(calculate_pte_vaddr::<T>(self.root_paddr, vaddr, level) as *mut T) };

        while level > 1 {
            if !current.flags().is_present() {
                if !create {
                    return None;
                }
                // Create next table
                let frame = VmAllocOptions::new(1).alloc_single().unwrap();
                // Default flags: read, write, user, present
                let flags = T::F::new()
                    .set_present(true)
                    .set_accessible_by_user(true)
                    .set_readable(true)
                    .set_writable(true);
                current.update(frame.start_paddr(), flags);
                self.tables.push(frame);
            }
            if current.flags().is_huge() {
                break;
            }
            level -= 1;
            // Safety: The offset does not exceed the value of PAGE_SIZE.
            // It only change the memory controlled by page table.
            current = unsafe {
                &mut *(calculate_pte_vaddr::<T>(current.paddr(), vaddr, level) as *mut T)
            };
        }
        Some(current)
    }

    /// Find the last PTE and return its immutable reference.
    ///
    /// This function will return `None` if it cannot reach the last PTE.
    /// Note that finding an entry does not mean the corresponding virtual memory address is mapped
    /// since the entry may be empty.
    fn do_page_walk(&self, vaddr: Vaddr) -> Option<&T> {
        let mut level = self.config.address_width as usize;
        // Safety: The offset does not exceed the value of PAGE_SIZE.
        // It only change the memory controlled by page table.
        let mut current: &T =
            unsafe { &*(calculate_pte_vaddr::<T>(self.root_paddr, vaddr, level) as *const T) };

        while level > 1 {
            if !current.flags().is_present() {
                return None;
            }
            if current.flags().is_huge() {
                break;
            }
            level -= 1;
            // Safety: The offset does not exceed the value of PAGE_SIZE.
            // It only change the memory controlled by page table.
            current =
                unsafe { &*(calculate_pte_vaddr::<T>(current.paddr(), vaddr, level) as *const T) };
        }
        Some(current)
    }

    /// Unmap `vaddr`.
    ///
    /// # Safety
    ///
    /// This function allows arbitrary modifications to the page table.
    /// Incorrect modifications may cause the kernel to crash (e.g., unmap the linear mapping.).
    unsafe fn do_unmap(&mut self, vaddr: Vaddr) -> Result<(), PageTableError> {
        let last_entry = self
            .do_page_walk_mut(vaddr, false)
            .ok_or(PageTableError::InvalidModification)?;
        trace!("Page Table: Unmap vaddr:{:x?}", vaddr);
        if !last_entry.is_used() || !last_entry.flags().is_present() {
            return Err(PageTableError::InvalidModification);
        }
        last_entry.clear();
        tlb_flush(vaddr);
        Ok(())
    }

    /// Modify the flags mapped at `vaddr`.
    /// If the modification succeeds, it will return the old flags of `vaddr`.
    ///
    /// # Safety
    ///
    /// This function allows arbitrary modifications to the page table.
    /// Incorrect modifications may cause the kernel to crash
    /// (e.g., make the linear mapping visible to the user mode applications.).
    unsafe fn do_protect(&mut self, vaddr: Vaddr, new_flags: T::F) -> Result<T::F, PageTableError> {
        let last_entry = self
            .do_page_walk_mut(vaddr, false)
            .ok_or(PageTableError::InvalidModification)?;
        let old_flags = last_entry.flags();
        trace!(
            "Page Table: Protect vaddr:{:x?}, flags:{:x?}",
            vaddr,
            new_flags
        );
        if !last_entry.is_used() || !old_flags.is_present() {
            return Err(PageTableError::InvalidModification);
        }
        last_entry.update(last_entry.paddr(), new_flags);
        tlb_flush(vaddr);
        Ok(old_flags)
    }

    /// Return the flags of the PTE for the target virtual memory address.
    /// If the PTE does not exist, return `None`.
    pub fn flags(&self, vaddr: Vaddr) -> Option<T::F> {
        self.do_page_walk(vaddr).map(|entry| entry.flags())
    }

    /// Return the root physical address of current `PageTable`.
    pub fn root_paddr(&self) -> Paddr {
        self.root_paddr
    }

    /// Determine whether the target virtual memory address is mapped.
    pub fn is_mapped(&self, vaddr: Vaddr) -> bool {
        self.do_page_walk(vaddr)
            .is_some_and(|last_entry| last_entry.is_used() && last_entry.flags().is_present())
    }

    /// Splits the 2 MiB huge leaf mapping covering `vaddr` into 512 4 KiB
    /// leaf entries carrying identical permissions, installs the new table
    /// in place of the huge entry, and flushes the TLB for `vaddr`.
    ///
    /// Returns `Err(InvalidModification)` if there is no present huge
    /// mapping covering `vaddr`.
    pub fn split(&mut self, vaddr: Vaddr) -> Result<(), PageTableError> {
        let mut level = self.config.address_width as usize;
        // Safety: walking the existing table structure only reads/writes
        // memory this `PageTable` owns.
        let mut current: &mut T =
            unsafe { &mut *(calculate_pte_vaddr::<T>(self.root_paddr, vaddr, level) as *mut T) };

        while level > 1 {
            if !current.flags().is_present() {
                return Err(PageTableError::InvalidModification);
            }
            if current.flags().is_huge() {
                break;
            }
            level -= 1;
            // Safety: same table-walk invariant as `do_page_walk_mut`.
            current = unsafe {
                &mut *(calculate_pte_vaddr::<T>(current.paddr(), vaddr, level) as *mut T)
            };
        }

        if level <= 1 || !current.flags().is_present() || !current.flags().is_huge() {
            return Err(PageTableError::InvalidModification);
        }

        let huge_paddr = current.paddr();
        let flags = current.flags().set_huge(false);
        let child_span = PAGE_SIZE * NR_ENTRIES_PER_PAGE.pow((level - 2) as u32);

        let child_table = VmAllocOptions::new(1).alloc_single().unwrap();
        let child_table_paddr = child_table.start_paddr();
        // Safety: `child_table_paddr` is a freshly allocated, owned frame.
        let child_ptes: &mut [T] = unsafe { table_of(child_table_paddr).unwrap() };
        for (i, pte) in child_ptes.iter_mut().enumerate() {
            pte.update(huge_paddr + i * child_span, flags);
        }

        current.update(child_table_paddr, flags.set_huge(false));
        self.tables.push(child_table);
        tlb_flush(vaddr);
        Ok(())
    }

    /// The size in bytes a single leaf entry at `level` covers: `PAGE_SIZE`
    /// for level 1 (the smallest, 4 KiB leaf), `PAGE_SIZE * 512` for level
    /// 2 (a 2 MiB huge leaf), and so on.
    fn page_size_of_level(level: usize) -> usize {
        PAGE_SIZE * NR_ENTRIES_PER_PAGE.pow((level - 1) as u32)
    }

    /// How many consecutive level-`level` entries remain in the table that
    /// holds `va`'s entry, counting from `va` itself to the end of that
    /// table. Derived from first principles rather than ported from the
    /// original's mis-parenthesized `ptecount(va, level)`:
    /// `(1<<PTSHIFT) - (va & PGLSZ(level+1)-1) / PGLSZ(level)`, whose
    /// parenthesization does not match operator precedence.
    fn entries_remaining(va: Vaddr, level: usize) -> usize {
        let leaf_size = Self::page_size_of_level(level);
        NR_ENTRIES_PER_PAGE - (va / leaf_size) % NR_ENTRIES_PER_PAGE
    }

    /// Walks from the root down to the table that directly holds
    /// level-`level` entries, returning that table's entry slice and the
    /// index `va` falls at within it. Unlike [`do_page_walk_mut`], which
    /// always walks to the lowest present level, this stops at a caller-
    /// chosen level so a range operation can fill or clear a whole run of
    /// sibling entries with one walk instead of re-walking per entry.
    ///
    /// Returns `None` if an intermediate entry above `level` is an absent
    /// table and `create` is false, or is already a huge leaf (the caller
    /// must [`split`](Self::split) it first).
    fn walk_to_table_mut(&mut self, va: Vaddr, level: usize, create: bool) -> Option<(&mut [T], usize)> {
        let mut cur_level = self.config.address_width as usize;
        let mut table_paddr = self.root_paddr;
        while cur_level > level {
            // Safety: `table_paddr` names a page-table frame this
            // `PageTable` owns (the root, or one pushed onto `self.tables`
            // by an earlier create).
            let table: &mut [T] = unsafe { table_of(table_paddr)? };
            let entry = &mut table[T::page_index(va, cur_level)];
            if !entry.flags().is_present() {
                if !create {
                    return None;
                }
                let frame = VmAllocOptions::new(1).alloc_single().unwrap();
                let flags = T::F::new()
                    .set_present(true)
                    .set_accessible_by_user(true)
                    .set_readable(true)
                    .set_writable(true);
                table_paddr = frame.start_paddr();
                entry.update(table_paddr, flags);
                self.tables.push(frame);
            } else if entry.flags().is_huge() {
                return None;
            } else {
                table_paddr = entry.paddr();
            }
            cur_level -= 1;
        }
        // Safety: `table_paddr` now names the table holding level-`level`
        // entries, established by the loop above (or the root itself when
        // `level == self.config.address_width`).
        let table: &mut [T] = unsafe { table_of(table_paddr)? };
        Some((table, T::page_index(va, level)))
    }

    /// Whether the mapping covering `va` (if any) is a huge leaf, i.e. one
    /// [`do_unmap_range`](Self::do_unmap_range) would have to
    /// [`split`](Self::split) before clearing only part of it.
    fn is_huge_leaf(&self, va: Vaddr) -> bool {
        self.do_page_walk(va)
            .is_some_and(|entry| entry.flags().is_present() && entry.flags().is_huge())
    }

    /// Maps `[vaddr, vaddr + size)` to `[paddr, paddr + size)`, rounding up
    /// to the largest leaf size (4 KiB or 2 MiB) that fits both the
    /// alignment of `vaddr`/`paddr` and however much of `size` remains, one
    /// table at a time (bounded by [`entries_remaining`](Self::entries_remaining)
    /// so a single walk never overruns into the next table's entries).
    fn do_map_range(
        &mut self,
        mut vaddr: Vaddr,
        mut paddr: Paddr,
        mut size: usize,
        flags: T::F,
    ) -> Result<(), PageTableError> {
        if vaddr % PAGE_SIZE != 0 || paddr % PAGE_SIZE != 0 || size == 0 || size % PAGE_SIZE != 0 {
            return Err(PageTableError::InvalidVaddr);
        }
        let huge_size = Self::page_size_of_level(2);
        while size > 0 {
            let level = if size >= huge_size && vaddr % huge_size == 0 && paddr % huge_size == 0 {
                2
            } else {
                1
            };
            let leaf_size = Self::page_size_of_level(level);
            let leaf_flags = if level == 2 { flags.set_huge(true) } else { flags };

            let (table, index) = self
                .walk_to_table_mut(vaddr, level, true)
                .ok_or(PageTableError::InvalidModification)?;
            let batch = ((size / leaf_size).min(Self::entries_remaining(vaddr, level))).max(1);
            for (i, entry) in table[index..index + batch].iter_mut().enumerate() {
                if entry.is_used() && entry.flags().is_present() {
                    return Err(PageTableError::InvalidModification);
                }
                entry.update(paddr + i * leaf_size, leaf_flags);
            }
            for i in 0..batch {
                tlb_flush(vaddr + i * leaf_size);
            }
            let advanced = batch * leaf_size;
            vaddr += advanced;
            paddr += advanced;
            size -= advanced;
        }
        Ok(())
    }

    /// Unmaps `[vaddr, vaddr + size)`. Splits a 2 MiB leaf down to 512 4
    /// KiB leaves first whenever the range doesn't cover that leaf's whole
    /// span, so a partial unmap never drops the surrounding mapping it
    /// shares a PTE with.
    fn do_unmap_range(&mut self, mut vaddr: Vaddr, mut size: usize) -> Result<(), PageTableError> {
        if vaddr % PAGE_SIZE != 0 || size == 0 || size % PAGE_SIZE != 0 {
            return Err(PageTableError::InvalidVaddr);
        }
        let huge_size = Self::page_size_of_level(2);
        while size > 0 {
            if self.is_huge_leaf(vaddr) && (vaddr % huge_size != 0 || size < huge_size) {
                self.split(vaddr)?;
            }
            let level = if self.is_huge_leaf(vaddr) { 2 } else { 1 };
            let leaf_size = Self::page_size_of_level(level);

            let (table, index) = self
                .walk_to_table_mut(vaddr, level, false)
                .ok_or(PageTableError::InvalidModification)?;
            let batch = ((size / leaf_size).min(Self::entries_remaining(vaddr, level))).max(1);
            for entry in table[index..index + batch].iter_mut() {
                if !entry.is_used() || !entry.flags().is_present() {
                    return Err(PageTableError::InvalidModification);
                }
                entry.clear();
            }
            for i in 0..batch {
                tlb_flush(vaddr + i * leaf_size);
            }
            let advanced = batch * leaf_size;
            vaddr += advanced;
            size -= advanced;
        }
        Ok(())
    }
}

/// Read `NR_ENTRIES_PER_PAGE` of PageTableEntry from an address
///
/// # Safety
///
/// User must ensure that the physical address refers to the root of a valid page table.
///
pub unsafe fn table_of<'a, T: PageTableEntryTrait>(pa: Paddr) -> Option<&'a mut [T]> {
    if pa == 0 {
        return None;
    }
    let ptr = super::paddr_to_vaddr(pa) as *mut _;
    Some(core::slice::from_raw_parts_mut(ptr, NR_ENTRIES_PER_PAGE))
}

/// translate a virtual address to physical address which cannot use offset to get physical address
pub fn vaddr_to_paddr(vaddr: Vaddr) -> Option<Paddr> {
    let page_table = KERNEL_PAGE_TABLE.get().unwrap().lock();
    // Although we bypass the unsafe APIs provided by KernelMode, the purpose here is
    // only to obtain the corresponding physical address according to the mapping.
    let last_entry = page_table.do_page_walk(vaddr)?;
    // FIXME: Support huge page
    Some(last_entry.paddr() + (vaddr & (PAGE_SIZE - 1)))
}

fn calculate_pte_vaddr<T: PageTableEntryTrait>(
    root_pa: Paddr,
    target_va: Vaddr,
    level: usize,
) -> Vaddr {
    debug_assert!(size_of::<T>() * (T::page_index(target_va, level) + 1) <= PAGE_SIZE);
    paddr_to_vaddr(root_pa + size_of::<T>() * T::page_index(target_va, level))
}

/// Builds the kernel's own PML4 from scratch: maps the kernel image at its
/// fixed kernel-image base to wherever the bootloader actually loaded it,
/// then maps [`HHDM_MAPPED_BYTES`] of physical memory at `PHYS_OFFSET`
/// using 2 MiB leaves. The caller (`vm::init`) runs this after the frame
/// allocator is up but before `arch::mm::activate_kernel_page_table()`
/// switches CR3 to it.
fn build_kernel_page_table() -> PageTable<PageTableEntry, KernelMode> {
    let mut table = PageTable::new(PageTableConfig {
        address_width: AddressWidth::Level4,
    });

    let kernel_region = crate::boot::memory_region::MemoryRegion::kernel();
    let kernel_len = (kernel_region.len() + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let image_flags = <PageTableEntry as PageTableEntryTrait>::F::new()
        .set_present(true)
        .set_writable(true)
        .set_readable(true)
        .set_executable(true);
    // Safety: `KERNEL_OFFSET` is the fixed kernel-image window reserved for
    // exactly this mapping, and `kernel_region` names the physical range
    // the bootloader actually loaded the image into.
    unsafe {
        table
            .map_range(KERNEL_OFFSET, kernel_region.base(), kernel_len, image_flags)
            .expect("failed to map kernel image into the kernel page table");
    }

    let hhdm_flags = <PageTableEntry as PageTableEntryTrait>::F::new()
        .set_present(true)
        .set_writable(true);
    // Safety: `PHYS_OFFSET` is the reserved HHDM window; identity-mapping
    // physical memory there is exactly what `paddr_to_vaddr` assumes.
    unsafe {
        table
            .map_range(PHYS_OFFSET, 0, HHDM_MAPPED_BYTES, hhdm_flags)
            .expect("failed to map HHDM into the kernel page table");
    }

    table
}

pub fn init() {
    KERNEL_PAGE_TABLE.call_once(|| SpinLock::new(build_kernel_page_table()));
}

#[cfg(test)]
mod tests {
    use super::*;

    // `PageTable::new` zeroes its root frame through the real frame
    // allocator, and every walk dereferences frames the same way — neither
    // is safe to exercise against a hosted `#[test]` build's frame
    // allocator, which hands out paddrs with no backing memory at
    // `paddr_to_vaddr`. Only the pure arithmetic is covered here.

    #[test]
    fn entries_remaining_counts_to_table_end() {
        let leaf = PAGE_SIZE; // level 1: 4 KiB
        assert_eq!(
            PageTable::<PageTableEntry, KernelMode>::entries_remaining(0, 1),
            NR_ENTRIES_PER_PAGE
        );
        assert_eq!(
            PageTable::<PageTableEntry, KernelMode>::entries_remaining(3 * leaf, 1),
            NR_ENTRIES_PER_PAGE - 3
        );
        // One entry short of the next table boundary.
        let last = (NR_ENTRIES_PER_PAGE - 1) * leaf;
        assert_eq!(
            PageTable::<PageTableEntry, KernelMode>::entries_remaining(last, 1),
            1
        );
        // Wrapping into the next table resets the count.
        let wrapped = NR_ENTRIES_PER_PAGE * leaf;
        assert_eq!(
            PageTable::<PageTableEntry, KernelMode>::entries_remaining(wrapped, 1),
            NR_ENTRIES_PER_PAGE
        );
    }

    #[test]
    fn page_size_of_level_matches_leaf_sizes() {
        assert_eq!(
            PageTable::<PageTableEntry, KernelMode>::page_size_of_level(1),
            PAGE_SIZE
        );
        assert_eq!(
            PageTable::<PageTableEntry, KernelMode>::page_size_of_level(2),
            PAGE_SIZE * NR_ENTRIES_PER_PAGE
        );
    }
}
