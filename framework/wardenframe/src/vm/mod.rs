// SPDX-License-Identifier: MPL-2.0

//! Virtual memory (VM).

/// Virtual addresses.
pub type Vaddr = usize;

/// Physical addresses.
pub type Paddr = usize;

pub(crate) mod dma;
mod frame;
mod frame_allocator;
pub(crate) mod heap_allocator;
pub(crate) mod hhdm;
mod io;
mod options;
pub(crate) mod page_table;
mod space;

use alloc::{borrow::ToOwned, vec::Vec};

use spin::Once;

pub use self::{
    dma::{DmaCoherent, DmaDirection, DmaStream, HasDaddr},
    frame::{VmFrame, VmFrameVec, VmFrameVecIter, VmReader, VmSegment, VmWriter},
    frame_allocator::{
        cache_del, cache_page, image_reclaim, look_page, new_page, put_page, uncache_page,
        CacheKey, ImageId,
    },
    io::VmIo,
    options::VmAllocOptions,
    page_table::PageTable,
    space::{VmMapOptions, VmQueryResult, VmSpace},
};
use crate::{
    boot::memory_region::{MemoryRegion, MemoryRegionType},
    config::{KERNEL_OFFSET, PAGE_SIZE, PHYS_OFFSET},
};

/// Get physical address trait
pub trait HasPaddr {
    fn paddr(&self) -> Paddr;
}

pub fn vaddr_to_paddr(va: Vaddr) -> Option<Paddr> {
    if (PHYS_OFFSET..=KERNEL_OFFSET).contains(&va) {
        // can use offset to get the physical address
        Some(va - PHYS_OFFSET)
    } else {
        page_table::vaddr_to_paddr(va)
    }
}

pub const fn is_page_aligned(p: usize) -> bool {
    (p & (PAGE_SIZE - 1)) == 0
}

/// Convert physical address to virtual address using offset, only available inside aster-frame
pub(crate) fn paddr_to_vaddr(pa: usize) -> usize {
    pa + PHYS_OFFSET
}

/// Only available inside aster-frame
pub(crate) static MEMORY_REGIONS: Once<Vec<MemoryRegion>> = Once::new();

pub static FRAMEBUFFER_REGIONS: Once<Vec<MemoryRegion>> = Once::new();

pub(crate) fn init() {
    let memory_regions = crate::boot::memory_regions().to_owned();
    frame_allocator::init(&memory_regions);
    page_table::init();
    dma::init();

    let mut framebuffer_regions = Vec::new();
    let mut usable_bytes = 0usize;
    for i in memory_regions.iter() {
        if i.typ() == MemoryRegionType::Framebuffer {
            framebuffer_regions.push(*i);
        }
        if i.typ() == MemoryRegionType::Usable {
            usable_bytes += i.len();
        }
    }
    FRAMEBUFFER_REGIONS.call_once(|| framebuffer_regions);

    MEMORY_REGIONS.call_once(|| memory_regions);

    crate::xalloc::XALLOC.init();
    crate::process::init();
    crate::process::contexts_init();
    crate::pageown::PAGE_OWN_TABLE.init(usable_bytes / PAGE_SIZE);
    init_lock_order();
}

/// Declares the allowed lock-acquisition order between the core
/// subsystems' own locks, so an acquire outside this order is flagged as
/// suspicious rather than silently risking deadlock: the page ownership
/// table sits below the exchange channel's own prepared-page bookkeeping,
/// matching what `exchange.rs` itself documents.
fn init_lock_order() {
    use crate::lockdag::LOCK_DAG;

    let freelist = frame_allocator::lockdag_node();
    let pageown = crate::pageown::lockdag_node();
    let exchange_prepared = crate::exchange::lockdag_node();

    LOCK_DAG.allow_edge(freelist, pageown);
    LOCK_DAG.allow_edge(pageown, exchange_prepared);
}
