// SPDX-License-Identifier: MPL-2.0

//! Reads the Limine boot protocol's response structures and registers them
//! as the architecture-independent boot-information callbacks that
//! `crate::boot` exposes to the rest of the crate.
//!
//! We use `println!`-style early printing rather than `log` here since the
//! logger is not yet initialized this early in boot.

use alloc::{string::String, vec::Vec};
use spin::Once;

use limine::{
    LimineBootInfoRequest, LimineHhdmRequest, LimineMemmapRequest, LimineMemoryMapEntryType,
    LimineModuleRequest, LimineRsdpRequest, LimineStackSizeRequest,
};

use crate::{
    boot::{
        kcmdline::KCmdlineArg,
        memory_region::{MemoryRegion, MemoryRegionType},
        BootloaderAcpiArg, BootloaderFramebufferArg,
    },
    config::PAGE_SIZE,
};

static BOOTLOADER_INFO_REQUEST: LimineBootInfoRequest = LimineBootInfoRequest::new(0);
static HHDM_REQUEST: LimineHhdmRequest = LimineHhdmRequest::new(0);
static MEMMAP_REQUEST: LimineMemmapRequest = LimineMemmapRequest::new(0);
static MODULE_REQUEST: LimineModuleRequest = LimineModuleRequest::new(0);
static RSDP_REQUEST: LimineRsdpRequest = LimineRsdpRequest::new(0);
static STACK_REQUEST: LimineStackSizeRequest = {
    let req = LimineStackSizeRequest::new(0);
    req.stack_size(64 * PAGE_SIZE as u64)
};

/// Reads every Limine response we need and registers the callbacks that
/// populate `crate::boot`'s global boot-information statics, then records
/// the HHDM offset so `crate::vm::hhdm` is usable from that point on.
///
/// Must run before `crate::boot::init()`, and before the heap allocator so
/// that no allocation is attempted while still relying on the bootloader's
/// own (soon to be torn down) page tables.
pub(crate) fn init() {
    STACK_REQUEST
        .get_response()
        .get()
        .expect("Limine: stack size request not answered");

    let hhdm_offset = HHDM_REQUEST
        .get_response()
        .get()
        .expect("Limine: HHDM request not answered")
        .offset as usize;
    crate::vm::hhdm::init(hhdm_offset);

    crate::boot::register_boot_init_callbacks(
        init_bootloader_name,
        init_kernel_cmdline,
        init_initramfs,
        init_acpi_arg,
        init_framebuffer_arg,
        init_memory_regions,
    );
}

fn init_bootloader_name(bootloader_name: &'static Once<String>) {
    bootloader_name.call_once(|| {
        let response = BOOTLOADER_INFO_REQUEST
            .get_response()
            .get()
            .expect("Limine: bootloader info request not answered");
        let name = response.name.to_str().unwrap().to_str().unwrap();
        let version = response.version.to_str().unwrap().to_str().unwrap();
        alloc::format!("{} v{}", name, version)
    });
}

fn init_kernel_cmdline(kernel_cmdline: &'static Once<KCmdlineArg>) {
    kernel_cmdline.call_once(|| {
        let response = BOOTLOADER_INFO_REQUEST.get_response().get();
        let cmdline = response
            .and_then(|_| MODULE_REQUEST.get_response().get())
            .and_then(|m| m.modules().first())
            .and_then(|module| module.cmdline.to_str())
            .and_then(|s| s.to_str().ok())
            .unwrap_or("");
        KCmdlineArg::from(cmdline)
    });
}

fn init_initramfs(initramfs: &'static Once<&'static [u8]>) {
    initramfs.call_once(|| {
        let response = MODULE_REQUEST
            .get_response()
            .get()
            .expect("Limine: module request not answered");
        let module = response
            .modules()
            .first()
            .expect("Limine: no boot modules provided, initrd is required");
        // Safety: the bootloader maps the module contents at `base` for
        // `length` bytes for the lifetime of the kernel.
        unsafe {
            core::slice::from_raw_parts(module.base.as_ptr().unwrap(), module.length as usize)
        }
    });
}

fn init_acpi_arg(acpi_arg: &'static Once<BootloaderAcpiArg>) {
    acpi_arg.call_once(|| match RSDP_REQUEST.get_response().get() {
        Some(response) => BootloaderAcpiArg::Rsdp(response.address.as_ptr().unwrap() as usize),
        None => BootloaderAcpiArg::NotProvided,
    });
}

fn init_framebuffer_arg(framebuffer_arg: &'static Once<BootloaderFramebufferArg>) {
    framebuffer_arg.call_once(|| {
        // Framebuffer handoff is an out-of-scope console concern here; report
        // an empty framebuffer when none was requested.
        BootloaderFramebufferArg {
            address: 0,
            width: 0,
            height: 0,
            bpp: 0,
        }
    });
}

fn init_memory_regions(memory_regions: &'static Once<Vec<MemoryRegion>>) {
    memory_regions.call_once(|| {
        let response = MEMMAP_REQUEST
            .get_response()
            .get()
            .expect("Limine: memmap request not answered");
        response
            .memmap()
            .iter()
            .map(|entry| {
                let typ = match entry.typ {
                    LimineMemoryMapEntryType::Usable => MemoryRegionType::Usable,
                    LimineMemoryMapEntryType::Reserved => MemoryRegionType::Reserved,
                    LimineMemoryMapEntryType::AcpiReclaimable => MemoryRegionType::Reclaimable,
                    LimineMemoryMapEntryType::AcpiNvs => MemoryRegionType::NonVolatileSleep,
                    LimineMemoryMapEntryType::BadMemory => MemoryRegionType::BadMemory,
                    LimineMemoryMapEntryType::BootloaderReclaimable => {
                        MemoryRegionType::Reclaimable
                    }
                    LimineMemoryMapEntryType::KernelAndModules => MemoryRegionType::Kernel,
                    LimineMemoryMapEntryType::Framebuffer => MemoryRegionType::Framebuffer,
                };
                MemoryRegion::new(entry.base as usize, entry.len as usize, typ)
            })
            .collect()
    });
}
