// SPDX-License-Identifier: MPL-2.0

use align_ext::AlignExt;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use buddy_system_allocator::FrameAllocator;
use core::sync::atomic::{AtomicUsize, Ordering};
use log::info;
use spin::Once;

use crate::boot::memory_region::{MemoryRegion, MemoryRegionType};
use crate::{
    config::PAGE_SIZE,
    lockdag::LockDagNode,
    pageown::{Pfn, PAGE_OWN_TABLE},
    process::ProcessId,
    sync::{SpinLock, WaitQueue},
};

use super::{frame::VmFrameFlags, Vaddr, VmFrame, VmFrameVec, VmSegment};

pub(super) static FRAME_ALLOCATOR: Once<SpinLock<FrameAllocator>> = Once::new();

/// Free-page count below which [`new_page`] blocks instead of failing
/// outright, mirroring the original's low-water-mark throttle on
/// allocation under memory pressure.
const LOW_WATER_MARK: usize = 16;

static LOCKDAG_FREELIST_NODE: LockDagNode = LockDagNode::new("freelist");

/// Returns the lock-order DAG node the free-page path is attributed to,
/// so `vm::init()` can declare the documented `freelist -> pageown` edge.
pub fn lockdag_node() -> &'static LockDagNode {
    &LOCKDAG_FREELIST_NODE
}

/// Callers of [`new_page`] block here when the free list runs low, woken
/// up again once [`put_page`] returns a frame. Two separate queues mirror
/// the original's split between pages a caller is willing to have swapped
/// out from under them and pages that must stay resident.
static SWAP_ELIGIBLE: WaitQueue = WaitQueue::new();
static NO_SWAP: WaitQueue = WaitQueue::new();

/// An identifier for a cache-backing image (e.g. an executable or a
/// mapped file); opaque to the allocator beyond being a map key.
pub type ImageId = u64;

/// The on-disk location a cached page's content was last read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CacheKey {
    pub image: ImageId,
    pub disk_addr: u64,
}

static PAGE_CACHE: SpinLock<BTreeMap<CacheKey, Pfn>> = SpinLock::new(BTreeMap::new());

/// Associates `pfn` with `key` in the page cache, so a later
/// [`look_page`] for the same image/disk-address pair can reuse it
/// instead of reading from disk again.
pub fn cache_page(key: CacheKey, pfn: Pfn) {
    PAGE_CACHE.lock().insert(key, pfn);
}

/// Removes any cache association for `key`.
pub fn uncache_page(key: CacheKey) {
    PAGE_CACHE.lock().remove(&key);
}

/// Returns the cached frame for `key`, if any.
pub fn look_page(key: CacheKey) -> Option<Pfn> {
    PAGE_CACHE.lock().get(&key).copied()
}

/// Drops every cache entry belonging to `image`, e.g. when the image is
/// closed or evicted.
pub fn cache_del(image: ImageId) {
    PAGE_CACHE.lock().retain(|key, _| key.image != image);
}

/// A bounded sweep over idle cached images, reclaiming pages whose
/// backing image is no longer referenced.
///
/// This is a documented scope boundary rather than a missing feature:
/// populating "idle images" requires the out-of-scope segment/cache
/// subsystem that owns image reference counts, so this always reports
/// zero pages reclaimed until that subsystem exists.
pub fn image_reclaim() -> usize {
    0
}

/// Approximate free-frame count, tracked alongside the buddy allocator
/// rather than queried from it (the allocator crate exposes no
/// statistics API); used only to decide whether [`new_page`] should
/// block, so an approximation under concurrent alloc/dealloc is fine.
static FREE_COUNT: AtomicUsize = AtomicUsize::new(0);

fn free_count() -> usize {
    FREE_COUNT.load(Ordering::Relaxed)
}

/// `newpage` — allocates a frame for `p` to map at `va`. Blocks on a wait
/// queue when the free list is running low, and on success automatically
/// calls [`pageown::acquire`](crate::pageown) for the returned frame,
/// since page ownership begins exactly where a fresh mapping begins.
///
/// The original colors its allocation by `va`'s low bits to keep
/// same-colored frames cache-local; `buddy_system_allocator::FrameAllocator`
/// exposes no hint an allocation can steer with, so that preference is not
/// carried here — `va` is taken only so callers have one place to hand it
/// to `pageown::acquire`.
pub fn new_page(p: ProcessId, va: Vaddr, swap_eligible: bool) -> Option<VmFrame> {
    let queue = if swap_eligible { &SWAP_ELIGIBLE } else { &NO_SWAP };
    if free_count() < LOW_WATER_MARK {
        queue.wait_until(|| if free_count() > 0 { Some(()) } else { None });
    }
    let frame = alloc_single(VmFrameFlags::empty())?;
    let pfn = frame.start_paddr() / PAGE_SIZE;
    PAGE_OWN_TABLE
        .acquire(p, pfn, va)
        .expect("new_page: freshly allocated frame already tracked");
    Some(frame)
}

/// `putpage` — drops one reference to `frame`; once the caller's is the
/// last reference, releases page ownership (resolving spec.md's Open
/// Question #2: ownership is always torn down before the frame returns
/// to the free list) and wakes one waiter on each allocation queue.
pub fn put_page(frame: VmFrame) {
    let pfn = frame.start_paddr() / PAGE_SIZE;
    let last_ref = alloc::sync::Arc::strong_count(&frame.frame_index) == 1;
    if last_ref {
        PAGE_OWN_TABLE.release_for_reclaim(pfn);
    }
    drop(frame);
    if last_ref {
        SWAP_ELIGIBLE.wake_one();
        NO_SWAP.wake_one();
    }
}

pub(crate) fn alloc(nframes: usize, flags: VmFrameFlags) -> Option<VmFrameVec> {
    FRAME_ALLOCATOR
        .get()
        .unwrap()
        .lock()
        .alloc(nframes)
        .map(|start| {
            FREE_COUNT.fetch_sub(nframes, Ordering::Relaxed);
            let mut vector = Vec::new();
            // Safety: The frame index is valid.
            unsafe {
                for i in 0..nframes {
                    let frame = VmFrame::new(
                        (start + i) * PAGE_SIZE,
                        flags.union(VmFrameFlags::NEED_DEALLOC),
                    );
                    vector.push(frame);
                }
            }
            VmFrameVec(vector)
        })
}

pub(crate) fn alloc_single(flags: VmFrameFlags) -> Option<VmFrame> {
    FRAME_ALLOCATOR.get().unwrap().lock().alloc(1).map(|idx| {
        FREE_COUNT.fetch_sub(1, Ordering::Relaxed);
        // Safety: The frame index is valid.
        unsafe { VmFrame::new(idx * PAGE_SIZE, flags.union(VmFrameFlags::NEED_DEALLOC)) }
    })
}

pub(crate) fn alloc_contiguous(nframes: usize, flags: VmFrameFlags) -> Option<VmSegment> {
    FRAME_ALLOCATOR
        .get()
        .unwrap()
        .lock()
        .alloc(nframes)
        .map(|start| {
            FREE_COUNT.fetch_sub(nframes, Ordering::Relaxed);
            // Safety: The range of page frames is contiguous and valid.
            unsafe {
                VmSegment::new(
                    start * PAGE_SIZE,
                    nframes,
                    flags.union(VmFrameFlags::NEED_DEALLOC),
                )
            }
        })
}

/// Deallocate a frame.
///
/// # Safety
///
/// User should ensure the index is valid
///
pub(crate) unsafe fn dealloc_single(index: usize) {
    FRAME_ALLOCATOR.get().unwrap().lock().dealloc(index, 1);
    FREE_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// Deallocate a contiguous range of page frames.
///
/// # Safety
///
/// User should ensure the range of page frames is valid.
///
pub(crate) unsafe fn dealloc_contiguous(start_index: usize, nframes: usize) {
    FRAME_ALLOCATOR
        .get()
        .unwrap()
        .lock()
        .dealloc(start_index, nframes);
    FREE_COUNT.fetch_add(nframes, Ordering::Relaxed);
}

pub(crate) fn init(regions: &[MemoryRegion]) {
    let mut allocator = FrameAllocator::<32>::new();
    let mut total_frames = 0usize;
    for region in regions.iter() {
        if region.typ() == MemoryRegionType::Usable {
            // Make the memory region page-aligned, and skip if it is too small.
            let start = region.base().align_up(PAGE_SIZE) / PAGE_SIZE;
            let end = (region.base() + region.len()).align_down(PAGE_SIZE) / PAGE_SIZE;
            if end <= start {
                continue;
            }
            allocator.add_frame(start, end);
            total_frames += end - start;
            info!(
                "Found usable region, start:{:x}, end:{:x}",
                region.base(),
                region.base() + region.len()
            );
        }
    }
    FREE_COUNT.store(total_frames, Ordering::Relaxed);
    FRAME_ALLOCATOR.call_once(|| SpinLock::new(allocator));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::memory_region::MemoryRegion;

    fn init_allocator() {
        if FRAME_ALLOCATOR.get().is_some() {
            return;
        }
        let region = MemoryRegion::new(0, 64 * PAGE_SIZE, MemoryRegionType::Usable);
        init(&[region]);
        crate::pageown::PAGE_OWN_TABLE.init(64);
    }

    #[test]
    fn new_page_registers_ownership_then_put_page_releases_it() {
        init_allocator();
        let pid = ProcessId::from_raw(7);
        let frame = new_page(pid, 0x4000, true).expect("allocation should succeed");
        let pfn = frame.start_paddr() / PAGE_SIZE;
        assert_eq!(crate::pageown::PAGE_OWN_TABLE.get_owner(pfn), Some(pid));
        put_page(frame);
        assert!(!crate::pageown::PAGE_OWN_TABLE.is_owned(pfn));
    }

    #[test]
    fn page_cache_round_trips() {
        let key = CacheKey {
            image: 1,
            disk_addr: 4096,
        };
        cache_page(key, 42);
        assert_eq!(look_page(key), Some(42));
        cache_del(1);
        assert_eq!(look_page(key), None);
    }
}
