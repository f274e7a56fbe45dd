// SPDX-License-Identifier: MPL-2.0

//! IOMMU support.
//!
//! Device address translation is outside the scope of the capabilities this
//! crate implements; DMA callers only ever reach this module through
//! [`has_iommu`], which always reports no hardware present, so [`map`] and
//! [`unmap`] are never exercised on this platform build.

use crate::vm::{dma::Daddr, Paddr};

/// An enumeration representing possible errors related to IOMMU.
#[derive(Debug)]
pub enum IommuError {
    /// No IOMMU is available.
    NoIommu,
}

/// Mapping device address to physical address.
///
/// # Safety
///
/// Mapping an incorrect address may lead to a kernel data leak.
pub(crate) unsafe fn map(_daddr: Daddr, _paddr: Paddr) -> Result<(), IommuError> {
    Err(IommuError::NoIommu)
}

pub(crate) fn unmap(_daddr: Daddr) -> Result<(), IommuError> {
    Err(IommuError::NoIommu)
}

pub(crate) fn init() -> Result<(), IommuError> {
    Err(IommuError::NoIommu)
}

pub(crate) fn has_iommu() -> bool {
    false
}
