// SPDX-License-Identifier: MPL-2.0

//! The higher-half direct map (HHDM): a single fixed offset, handed to us by
//! the bootloader before the kernel's own page tables are installed, that
//! maps every physical page into the kernel's address space.
//!
//! The page ownership table (`crate::vm::pageown`) and the exchange channel
//! (`crate::vm::exchange`) both need to read and write physical pages they
//! do not otherwise have a mapping for; the HHDM is what lets `pa_to_va`
//! hand them a usable pointer without allocating a page table entry.

use spin::Once;

use crate::config::PHYS_OFFSET;

use super::{Paddr, Vaddr};

static HHDM_BASE: Once<usize> = Once::new();

/// Records the HHDM offset reported by the bootloader.
///
/// Must be called exactly once, before any other code in the crate calls
/// [`va`] or [`pa`]. Panics if called twice or if the offset disagrees with
/// the compiled-in [`PHYS_OFFSET`], since the rest of the crate treats that
/// constant as if it were the live HHDM base.
pub(crate) fn init(offset: usize) {
    assert_eq!(
        offset, PHYS_OFFSET,
        "bootloader HHDM offset does not match the compiled-in PHYS_OFFSET"
    );
    HHDM_BASE.call_once(|| offset);
}

/// Translates a physical address to its HHDM virtual address.
pub fn va(pa: Paddr) -> Vaddr {
    *HHDM_BASE.get().expect("HHDM not initialized") + pa
}

/// Translates an HHDM virtual address back to the physical address it maps.
///
/// Returns `None` if `va` does not fall within the HHDM window.
pub fn pa(va: Vaddr) -> Option<Paddr> {
    let base = *HHDM_BASE.get().expect("HHDM not initialized");
    va.checked_sub(base)
}

/// Whether the HHDM has been initialized. Used by early boot code paths
/// that may run before or after the handoff, depending on bootloader.
pub fn is_initialized() -> bool {
    HHDM_BASE.get().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_within_window() {
        HHDM_BASE.call_once(|| PHYS_OFFSET);
        let pa_in = 0x1234_5000;
        let va_out = va(pa_in);
        assert_eq!(pa(va_out), Some(pa_in));
    }

    #[test]
    fn rejects_address_below_base() {
        HHDM_BASE.call_once(|| PHYS_OFFSET);
        assert_eq!(pa(PHYS_OFFSET - 1), None);
    }
}
