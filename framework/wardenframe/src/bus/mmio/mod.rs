// SPDX-License-Identifier: MPL-2.0

//! Virtio over MMIO.
//!
//! Device discovery on this platform build only probes PCI
//! ([`crate::bus::pci`]); MMIO-transport virtio devices are outside the
//! capability set this crate implements, so [`init`] is a no-op kept for
//! the same call site the PCI bus uses.

pub fn init() {}
