// SPDX-License-Identifier: MPL-2.0

//! A first-fit hole allocator over HHDM-mapped virtual address ranges.
//!
//! This sits beside, not behind, the crate's `#[global_allocator]`
//! (`vm::heap_allocator`): it is the direct recast of the original's
//! `xalloc`/`xhole`, the region-based allocator the 9front-port kernel
//! leans on for long-lived kernel structures it sizes and carves out of
//! physical memory directly, before (or instead of) going through a
//! general-purpose heap. In this tree the global allocator is already up
//! by the time `XALLOC.init()` runs (`vm::heap_allocator::init()` runs
//! first in `lib.rs::init()`), so the specific caller the original
//! leans on it for — `pageownpool.pages = xalloc(size)` — doesn't need
//! it: `pageown::PageOwnTable`'s backing `BorrowRegistry`/`BTreeMap`
//! (Open Question #1's resolution) allocates from the global heap like
//! any other Rust collection. `xalloc` is kept as the core component
//! spec.md §4.B requires in its own right, with its own donated-range
//! pool and invariants, available to any future caller that wants this
//! coarser allocation shape without the heap's bookkeeping overhead.
//!
//! `Hole` descriptors used to be a pointer-linked free list over a fixed
//! C array; here they live in a `Vec<Hole>` arena and are linked by index,
//! which is the natural recast once raw pointers are off the table.

use alloc::vec::Vec;

use log::{info, warn};

use crate::{
    config::{XALLOC_DYNAMIC_NHOLE, XALLOC_INITIAL_NHOLE, XALLOC_MAGIC, XALLOC_MAX_ALLOC},
    sync::SpinLock,
    vm::paddr_to_vaddr,
};

type HoleIdx = u32;

#[derive(Clone, Copy)]
struct Hole {
    addr: usize,
    size: usize,
    top: usize,
    link: Option<HoleIdx>,
}

impl Hole {
    const EMPTY: Hole = Hole {
        addr: 0,
        size: 0,
        top: 0,
        link: None,
    };
}

/// Every `xalloc`ed block is prefixed with this header, exactly the
/// original's `Xhdr { size, magix, data[] }`.
struct Xhdr {
    size: usize,
    magix: u32,
}

const XHDR_BYTES: usize = core::mem::size_of::<Xhdr>();

/// Panics if `size` exceeds [`XALLOC_MAX_ALLOC`] — spec.md §4.B treats an
/// oversized request the same as header-overflow arithmetic, a fatal error
/// rather than a recoverable `None`.
fn check_max_alloc(size: usize) {
    if size > XALLOC_MAX_ALLOC {
        panic!("xalloc: requested {size} bytes exceeds XALLOC_MAX_ALLOC ({XALLOC_MAX_ALLOC})");
    }
}

struct XallocInner {
    /// Descriptor arena. Indices into this vec stand in for the original's
    /// `Hole*`.
    arena: Vec<Hole>,
    /// Head of the free-descriptor list.
    flist: Option<HoleIdx>,
    /// Head of the address-sorted list of live holes.
    table: Option<HoleIdx>,
}

impl XallocInner {
    fn new() -> Self {
        let mut arena = Vec::with_capacity(XALLOC_INITIAL_NHOLE);
        for i in 0..XALLOC_INITIAL_NHOLE {
            arena.push(Hole {
                link: if i + 1 < XALLOC_INITIAL_NHOLE {
                    Some((i + 1) as HoleIdx)
                } else {
                    None
                },
                ..Hole::EMPTY
            });
        }
        Self {
            arena,
            flist: Some(0),
            table: None,
        }
    }

    fn pop_free(&mut self) -> Option<HoleIdx> {
        if self.flist.is_none() {
            let base = self.arena.len() as HoleIdx;
            self.arena.reserve(XALLOC_DYNAMIC_NHOLE);
            for i in 0..XALLOC_DYNAMIC_NHOLE {
                self.arena.push(Hole {
                    link: if i + 1 < XALLOC_DYNAMIC_NHOLE {
                        Some(base + i as HoleIdx + 1)
                    } else {
                        None
                    },
                    ..Hole::EMPTY
                });
            }
            self.flist = Some(base);
        }
        let idx = self.flist?;
        self.flist = self.arena[idx as usize].link;
        Some(idx)
    }

    fn push_free(&mut self, idx: HoleIdx) {
        self.arena[idx as usize] = Hole {
            link: self.flist,
            ..Hole::EMPTY
        };
        self.flist = Some(idx);
    }

    /// `xhole`: returns `[vaddr, vaddr+size)` — already HHDM-mapped, since
    /// the whole physical address space is mapped at boot — to the pool,
    /// merging with adjacent holes where possible.
    fn xhole(&mut self, paddr: usize, size: usize) {
        if size == 0 {
            return;
        }
        let vaddr = paddr_to_vaddr(paddr);
        let top = vaddr + size;

        let mut prev: Option<HoleIdx> = None;
        let mut cur = self.table;
        while let Some(idx) = cur {
            let h = self.arena[idx as usize];
            if h.top == vaddr {
                // Merge onto the top of this hole, then try to merge the
                // result with its successor too.
                let mut h = h;
                h.size += size;
                h.top = h.addr + h.size;
                if let Some(next_idx) = h.link {
                    let next = self.arena[next_idx as usize];
                    if h.top == next.addr {
                        h.top += next.size;
                        h.size += next.size;
                        h.link = next.link;
                        self.push_free(next_idx);
                    }
                }
                self.arena[idx as usize] = h;
                return;
            }
            if h.addr > vaddr {
                break;
            }
            prev = Some(idx);
            cur = h.link;
        }

        if let Some(idx) = cur {
            let h = &mut self.arena[idx as usize];
            if top == h.addr {
                h.addr = vaddr;
                h.size += size;
                return;
            }
        }

        let Some(new_idx) = self.pop_free() else {
            warn!("xalloc: out of hole descriptors, dropping region");
            return;
        };
        self.arena[new_idx as usize] = Hole {
            addr: vaddr,
            top,
            size,
            link: cur,
        };
        match prev {
            Some(p) => self.arena[p as usize].link = Some(new_idx),
            None => self.table = Some(new_idx),
        }
    }

    /// `xallocz`: first-fit search of the table list.
    ///
    /// Rounding `orig_size + XHDR_BYTES` up to an 8-byte boundary wrapping
    /// `usize` is the "header-overflow arithmetic" spec.md §4.B calls a
    /// fatal error, matching the original `xallocz()`'s unchecked pointer
    /// arithmetic, which relies on the same sum never wrapping in practice.
    fn xallocz(&mut self, orig_size: usize, zero: bool) -> Option<*mut u8> {
        let size = orig_size
            .checked_add(XHDR_BYTES)
            .and_then(|n| n.checked_add(7))
            .unwrap_or_else(|| panic!("xallocz: header overflow allocating {orig_size} bytes"))
            & !7;

        let mut prev: Option<HoleIdx> = None;
        let mut cur = self.table;
        while let Some(idx) = cur {
            let h = self.arena[idx as usize];
            if h.size >= size {
                let base = h.addr;
                let remaining = h.size - size;
                if remaining == 0 {
                    match prev {
                        Some(p) => self.arena[p as usize].link = h.link,
                        None => self.table = h.link,
                    }
                    self.push_free(idx);
                } else {
                    self.arena[idx as usize].addr = base + size;
                    self.arena[idx as usize].size = remaining;
                }

                // SAFETY: `base` names `size` bytes of HHDM-mapped memory
                // exclusively handed out by this allocator.
                unsafe {
                    let hdr = base as *mut Xhdr;
                    (*hdr).size = size;
                    (*hdr).magix = XALLOC_MAGIC;
                    let data = base as *mut u8 as usize + XHDR_BYTES;
                    if zero {
                        core::ptr::write_bytes(data as *mut u8, 0, orig_size);
                    }
                    return Some(data as *mut u8);
                }
            }
            prev = Some(idx);
            cur = h.link;
        }
        None
    }

    /// `xspanalloc`: allocates `size` bytes such that the returned block
    /// does not cross a `span`-sized boundary and starts `align`-aligned,
    /// by over-allocating `size + align + span` and trimming the excess on
    /// either side back onto the hole list. The returned pointer carries no
    /// `Xhdr` of its own (only the outer over-allocation did, and that
    /// header is inside the trimmed-away region or superseded by the
    /// alignment shift) — callers of `xspanalloc` never pass the result to
    /// [`Xalloc::xfree`], matching the original's span allocations, which
    /// back long-lived kernel structures that are never individually freed.
    fn xspanalloc(&mut self, size: usize, align: usize, span: usize) -> Option<*mut u8> {
        let total = size
            .checked_add(align)
            .and_then(|n| n.checked_add(span))
            .unwrap_or_else(|| {
                panic!("xspanalloc: overflow computing size {size} align {align} span {span}")
            });
        let a = self.xallocz(total, false)? as usize;

        let mut v = a;
        if span > 2 {
            v = (a + span) & !(span - 1);
            let underhang = v - a;
            if underhang > 0 {
                self.xhole(a - paddr_to_vaddr(0), underhang);
            }
            let overhang = (a + span) - (v + size + align);
            if overhang > 0 {
                self.xhole((v + size + align) - paddr_to_vaddr(0), overhang);
            }
        }

        if align > 1 {
            v = (v + align) & !(align - 1);
        }
        Some(v as *mut u8)
    }

    fn xsummary(&self) -> (usize, usize) {
        let mut nfree = 0;
        let mut cur = self.flist;
        while let Some(idx) = cur {
            nfree += 1;
            cur = self.arena[idx as usize].link;
        }
        let mut bytes = 0usize;
        cur = self.table;
        while let Some(idx) = cur {
            bytes += self.arena[idx as usize].size;
            cur = self.arena[idx as usize].link;
        }
        (nfree, bytes)
    }
}

/// The process-wide hole allocator.
pub struct Xalloc {
    inner: SpinLock<XallocInner>,
}

impl Xalloc {
    const fn uninit() -> Self {
        // `XallocInner::new` needs `alloc`, so the real table is lazily
        // built on first touch via `Once`-like double-checked init in
        // `init()`; the static itself just reserves the slot.
        Self {
            inner: SpinLock::new(XallocInner {
                arena: Vec::new(),
                flist: None,
                table: None,
            }),
        }
    }

    /// Must run after the global allocator is up (`vm::heap_allocator::init`),
    /// since the descriptor arena itself is heap-backed.
    pub fn init(&self) {
        *self.inner.lock() = XallocInner::new();
        info!("xalloc: initialized with {} static hole descriptors", XALLOC_INITIAL_NHOLE);
    }

    /// Donates the physical range `[paddr, paddr+size)` to the pool.
    pub fn xhole(&self, paddr: usize, size: usize) {
        self.inner.lock().xhole(paddr, size);
    }

    /// Allocates `size` bytes, zeroed. Returns `None` on exhaustion; panics
    /// if `size` exceeds [`XALLOC_MAX_ALLOC`], the "fatal error" spec.md
    /// §4.B calls an oversized request, matching the original's unchecked
    /// `xallocz`, which never returns null for that case either.
    pub fn xalloc(&self, size: usize) -> Option<*mut u8> {
        check_max_alloc(size);
        self.inner.lock().xallocz(size, true)
    }

    /// Allocates `size` bytes that do not cross a `span`-sized boundary and
    /// start `align`-aligned, for long-lived kernel structures (e.g. a page
    /// table frame pool) that need that placement guarantee. Unlike
    /// [`Self::xalloc`], exhaustion here is fatal — this mirrors the
    /// original's `panic("xspanalloc: ...")`, since callers use it only for
    /// kernel structures whose allocation failure spec.md's propagation
    /// policy treats as fatal rather than retryable.
    pub fn xspanalloc(&self, size: usize, align: usize, span: usize) -> *mut u8 {
        let total = size
            .checked_add(align)
            .and_then(|n| n.checked_add(span))
            .unwrap_or_else(|| panic!("xspanalloc: overflow computing size {size} align {align} span {span}"));
        check_max_alloc(total);
        self.inner
            .lock()
            .xspanalloc(size, align, span)
            .unwrap_or_else(|| panic!("xspanalloc: out of memory for {size} {align} {span}"))
    }

    /// Like [`Self::xalloc`] but skips zeroing.
    pub fn xalloc_uninit(&self, size: usize) -> Option<*mut u8> {
        check_max_alloc(size);
        self.inner.lock().xallocz(size, false)
    }

    /// Frees a block previously returned by [`Self::xalloc`].
    ///
    /// # Safety
    /// `p` must be a pointer previously returned by this allocator and not
    /// already freed.
    pub unsafe fn xfree(&self, p: *mut u8) {
        let hdr = (p as usize - XHDR_BYTES) as *const Xhdr;
        let (size, magix) = unsafe { ((*hdr).size, (*hdr).magix) };
        if magix != XALLOC_MAGIC {
            panic!("xfree: bad magic {:#x} at {:p}", magix, p);
        }
        let vaddr = hdr as usize;
        let paddr = vaddr - paddr_to_vaddr(0);
        self.inner.lock().xhole(paddr, size);
    }

    /// Attempts to merge two adjacent live blocks `p` immediately followed
    /// by `q` into one, returning whether the merge happened. Both must
    /// still carry valid magic headers.
    ///
    /// # Safety
    /// `p` and `q` must be live blocks previously returned by this
    /// allocator.
    pub unsafe fn xmerge(&self, p: *mut u8, q: *mut u8) -> bool {
        let ph = (p as usize - XHDR_BYTES) as *mut Xhdr;
        let qh = (q as usize - XHDR_BYTES) as *mut Xhdr;
        unsafe {
            if (*ph).magix != XALLOC_MAGIC || (*qh).magix != XALLOC_MAGIC {
                panic!("xmerge: bad magic");
            }
            if (ph as usize) + (*ph).size == qh as usize {
                (*ph).size += (*qh).size;
                true
            } else {
                false
            }
        }
    }

    /// `(free_descriptors, live_bytes)`, for the debug device surface.
    pub fn summary(&self) -> (usize, usize) {
        self.inner.lock().xsummary()
    }
}

impl Default for Xalloc {
    fn default() -> Self {
        Self::uninit()
    }
}

/// The single process-wide hole allocator.
pub static XALLOC: Xalloc = Xalloc::uninit();

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Xalloc {
        let x = Xalloc::uninit();
        x.init();
        x
    }

    #[test]
    fn alloc_within_donated_range_round_trips() {
        let pool = alloc::vec![0u8; 4096 + 256].into_boxed_slice();
        let pool = Box::leak(pool);
        let paddr = pool.as_ptr() as usize - paddr_to_vaddr(0);
        let x = fresh();
        x.xhole(paddr, pool.len());
        let p = x.xalloc(128).expect("allocation should succeed");
        unsafe {
            core::ptr::write(p, 0xAB);
            assert_eq!(core::ptr::read(p), 0xAB);
            x.xfree(p);
        }
    }

    #[test]
    fn spanalloc_result_is_aligned_and_within_one_span() {
        let pool = alloc::vec![0u8; 3 * 4096].into_boxed_slice();
        let pool = Box::leak(pool);
        let paddr = pool.as_ptr() as usize - paddr_to_vaddr(0);
        let x = fresh();
        x.xhole(paddr, pool.len());

        let p = x.xspanalloc(64, 16, 4096) as usize;
        assert_eq!(p % 16, 0);
        assert_eq!(p / 4096, (p + 64 - 1) / 4096);
    }

    #[test]
    fn exhausted_pool_returns_none() {
        let x = fresh();
        assert!(x.xalloc(64).is_none());
    }

    #[test]
    #[should_panic(expected = "exceeds XALLOC_MAX_ALLOC")]
    fn oversized_request_panics() {
        let x = fresh();
        x.xalloc(XALLOC_MAX_ALLOC + 1);
    }

    use alloc::boxed::Box;
}
