#![allow(unused)]

use log::Level;

pub const USER_STACK_SIZE: usize = PAGE_SIZE * 4;
pub const KERNEL_STACK_SIZE: usize = PAGE_SIZE * 64;
pub const KERNEL_HEAP_SIZE: usize = PAGE_SIZE * 256;

pub const KERNEL_OFFSET: usize = 0xffffffff80000000;

pub const PHYS_OFFSET: usize = 0xFFFF800000000000;
pub const ENTRY_COUNT: usize = 512;

/// How much physical memory the kernel's boot-time page table maps at
/// `PHYS_OFFSET` via 2 MiB leaves (spec.md's HHDM step).
pub const HHDM_MAPPED_BYTES: usize = 4 * 1024 * 1024 * 1024;

pub const PAGE_SIZE: usize = 0x1000;
pub const PAGE_SIZE_BITS: usize = 0xc;

pub const KVA_START: usize = (usize::MAX) << PAGE_SIZE_BITS;

pub const DEFAULT_LOG_LEVEL: Level = Level::Error;
/// Whether to enable the debug log in scheduling.
/// Only work when `DEFAULT_LOG_LEVEL` is `Debug`.
/// Excessive scheduling logs can overwhelm other logs, so disabled by default.
pub const SCHED_DEBUG_LOG: bool = false;
/// This value represent the base timer frequency in Hz
pub const TIMER_FREQ: u64 = 500;

pub const REAL_TIME_TASK_PRI: u16 = 100;

/// Whether the child process should run first for the first time in scheduling.
/// This option provides a preference for scheduling, not a guarantee.
/// todo: defaulted as false
pub const CHILD_RUN_FIRST: bool = true;

// --- Page ownership / borrow checker (see `pageown`, `borrow`) ---

/// Maximum number of simultaneous shared borrowers of a single page.
pub const MAX_SHARED_BORROWS: usize = 16;

// --- Lock-order DAG (see `lockdag`) ---

/// Static capacity of the lock-order DAG's node table.
pub const LOCKDAG_MAX_NODES: usize = 128;
/// Depth of the per-process held-lock stack tracked by the DAG.
pub const LOCKDAG_STACK_DEPTH: usize = 32;
/// Upper bound on the wait-for chain walked by deadlock detection.
pub const LOCKDAG_DEADLOCK_CHAIN_LIMIT: usize = 100;

// --- Hole allocator (see `xalloc`) ---

/// Number of statically-embedded `Hole` descriptors.
pub const XALLOC_INITIAL_NHOLE: usize = 128;
/// Size of a descriptor batch allocated once the static pool is exhausted.
pub const XALLOC_DYNAMIC_NHOLE: usize = 256;
/// Largest single allocation `xalloc` will satisfy.
pub const XALLOC_MAX_ALLOC: usize = 128 * 1024 * 1024;
/// Magic value stamped into the 8-byte header of every live `xalloc` block.
pub const XALLOC_MAGIC: u32 = 0x484F_4C45; // "HOLE"
/// Bytes of HHDM-backed memory handed to the hole allocator at boot, carved
/// out of the first usable region before the rest goes to the frame
/// allocator (mirrors the original `xinit`'s kpages/upages split).
pub const XALLOC_BOOT_POOL_SIZE: usize = PAGE_SIZE * 256;
