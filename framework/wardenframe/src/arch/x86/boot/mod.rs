// SPDX-License-Identifier: MPL-2.0

//! The x86 boot module defines the entrypoint of wardenframe and registers
//! the boot-information callbacks the architecture-independent `crate::boot`
//! module exposes.
//!
//! We support the Limine boot protocol exclusively: it is the only protocol
//! that hands the kernel a ready-made higher-half direct map, which the
//! page ownership table (`crate::vm::pageown`) relies on to address any
//! physical page without a dedicated mapping.

pub mod limine;
