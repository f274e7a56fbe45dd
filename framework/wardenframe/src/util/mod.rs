// SPDX-License-Identifier: MPL-2.0

//! Small standalone collection helpers used by task/process bookkeeping.

mod recycle_allocator;
mod type_map;

pub use recycle_allocator::RecycleAllocator;
pub use type_map::TypeMap;
