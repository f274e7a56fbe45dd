// SPDX-License-Identifier: MPL-2.0

//! The ownership/exchange subsystem's device surface.
//!
//! The original exposes this state through a Plan 9 `Dirtab`/`devgen`
//! function-pointer table (`devexchange.c`'s `exchread`/`exchwrite`
//! dispatching on `c->qid.path`). Design Notes §9 recasts that function-
//! pointer polymorphism as a capability-set trait: one small `trait
//! OwnershipDevice` standing in for "the subset of the `Dev` vtable this
//! pseudo-file actually uses" (`read` and, for the control file, `write`),
//! grounded on the same read/write split `bus::mmio` makes between device
//! discovery and the driver proper.

use alloc::{
    format,
    string::{String, ToString},
    vec::Vec,
};

use crate::{
    exchange::ExchangeHandle,
    lock::BorrowLock,
    lockdag::LockDagNode,
    pageown::PAGE_OWN_TABLE,
    process::ProcessId,
};

/// The capability set a pseudo-file in this subsystem implements. Not
/// every device needs every capability: [`PageOwnStatDevice`] is
/// read-only and its `write` is the default no-op rejection.
///
/// A device's `BorrowLock`-guarded state (see [`ExchangeDevice`]) can only
/// be locked through a `'static` reference (spec.md's lock order
/// diagnostics key off a lock's fixed address, so a `BorrowLock` is meant
/// to live in a `static`); every instance of a type implementing this
/// trait is expected to live in one, and reborrows itself as `'static`
/// internally where that's needed.
pub trait OwnershipDevice {
    /// Renders the device's current content, 9P-`read`-style: the device
    /// owns the formatting, the caller owns the buffer.
    fn read(&self) -> String;

    /// Parses and applies a control write. The default implementation
    /// rejects all writes, matching a read-only device like
    /// `/dev/pageown/stat`.
    fn write(&self, _caller: ProcessId, _line: &str) -> Result<(), DeviceError> {
        Err(DeviceError::ReadOnly)
    }
}

/// Errors a device's `write` can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    ReadOnly,
    BadCommand,
    Exchange(crate::exchange::ExchangeError),
}

impl From<crate::exchange::ExchangeError> for DeviceError {
    fn from(e: crate::exchange::ExchangeError) -> Self {
        DeviceError::Exchange(e)
    }
}

static LOCKDAG_EXCHANGE_LOG_NODE: LockDagNode = LockDagNode::new("exchange-device-log");

/// A line appended to `/dev/exchange`'s read-side log every time a write
/// command runs, so a reader can see recent activity the way the original
/// dumps the live `prepared[]` table.
#[derive(Clone)]
struct LogEntry {
    caller: ProcessId,
    command: String,
    result: Result<ExchangeHandle, DeviceError>,
}

/// `/dev/exchange`: accepts `prepare <pfn> <vaddr>`, `accept <handle>
/// <vaddr>`, and `cancel <handle>` command lines on write, and produces a
/// tabular dump of recent activity on read — the Rust-native equivalent
/// of the original's `prepared[]` table dump.
pub struct ExchangeDevice {
    log: BorrowLock<Vec<LogEntry>>,
}

const MAX_LOG_ENTRIES: usize = 64;

impl ExchangeDevice {
    pub const fn new() -> Self {
        Self {
            log: BorrowLock::new(&LOCKDAG_EXCHANGE_LOG_NODE, Vec::new()),
        }
    }

    fn record(&'static self, caller: ProcessId, command: String, result: Result<ExchangeHandle, DeviceError>) {
        let mut log = self.log.lock(caller);
        if log.len() >= MAX_LOG_ENTRIES {
            log.remove(0);
        }
        log.push(LogEntry {
            caller,
            command,
            result,
        });
    }

    fn apply(&'static self, caller: ProcessId, line: &str) -> Result<ExchangeHandle, DeviceError> {
        let mut words = line.split_whitespace();
        match words.next() {
            Some("prepare") => {
                let pfn: usize = words.next().and_then(|s| s.parse().ok()).ok_or(DeviceError::BadCommand)?;
                let vaddr: usize = words
                    .next()
                    .and_then(|s| usize::from_str_radix(s.trim_start_matches("0x"), 16).ok())
                    .ok_or(DeviceError::BadCommand)?;
                Ok(crate::exchange::exchange_prepare(caller, pfn, vaddr)?)
            }
            Some("accept") => {
                let handle: usize = words.next().and_then(|s| s.parse().ok()).ok_or(DeviceError::BadCommand)?;
                let vaddr: usize = words
                    .next()
                    .and_then(|s| usize::from_str_radix(s.trim_start_matches("0x"), 16).ok())
                    .ok_or(DeviceError::BadCommand)?;
                crate::exchange::exchange_accept(caller, handle, vaddr)?;
                Ok(handle)
            }
            Some("cancel") => {
                let handle: usize = words.next().and_then(|s| s.parse().ok()).ok_or(DeviceError::BadCommand)?;
                crate::exchange::exchange_cancel(handle)?;
                Ok(handle)
            }
            _ => Err(DeviceError::BadCommand),
        }
    }
}

impl Default for ExchangeDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl OwnershipDevice for ExchangeDevice {
    fn read(&self) -> String {
        // SAFETY of the `'static` reborrow: this device only ever lives in
        // a `static`, see `EXCHANGE_DEVICE` below.
        let this: &'static Self = unsafe { &*(self as *const Self) };
        let log = this.log.lock(ProcessId::from_raw(usize::MAX));
        let mut out = String::from("Page Exchange System\n");
        out.push_str(&format!("Recent commands: {}\n", log.len()));
        out.push_str("Caller PID  Command                         Result\n");
        out.push_str("----------  ------------------------------  ------\n");
        for entry in log.iter() {
            let result = match &entry.result {
                Ok(handle) => format!("ok handle={:#x}", handle),
                Err(e) => format!("err {:?}", e),
            };
            out.push_str(&format!(
                "{:<10}  {:<30}  {}\n",
                entry.caller.as_raw(),
                entry.command,
                result
            ));
        }
        out
    }

    fn write(&self, caller: ProcessId, line: &str) -> Result<(), DeviceError> {
        let this: &'static Self = unsafe { &*(self as *const Self) };
        let result = this.apply(caller, line);
        this.record(caller, line.to_string(), result.clone());
        result.map(|_| ())
    }
}

/// `/dev/pageown/stat`: a read-only snapshot of the four page-ownership
/// counters (`npages`, `nowned`, `nshared`, `nmut`).
pub struct PageOwnStatDevice;

impl OwnershipDevice for PageOwnStatDevice {
    fn read(&self) -> String {
        let stats = PAGE_OWN_TABLE.stats();
        format!(
            "Page Ownership Statistics:\n  Total pages:    {}\n  Owned:          {}\n  Shared borrows: {}\n  Mut borrows:    {}\n",
            stats.npages, stats.nowned, stats.nshared, stats.nmut
        )
    }
}

/// The process-wide exchange device instance.
pub static EXCHANGE_DEVICE: ExchangeDevice = ExchangeDevice::new();

/// The process-wide page ownership stat device instance.
pub static PAGE_OWN_STAT_DEVICE: PageOwnStatDevice = PageOwnStatDevice;

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(n: usize) -> ProcessId {
        ProcessId::from_raw(n)
    }

    #[test]
    fn stat_device_reports_current_counters() {
        PAGE_OWN_TABLE.init(4);
        let before = PAGE_OWN_STAT_DEVICE.read();
        assert!(before.contains("Total pages:    4"));
    }

    #[test]
    fn exchange_device_rejects_bad_command() {
        let err = EXCHANGE_DEVICE.write(pid(1), "frobnicate").unwrap_err();
        assert_eq!(err, DeviceError::BadCommand);
        assert!(EXCHANGE_DEVICE.read().contains("frobnicate"));
    }

    #[test]
    fn exchange_device_prepare_cancel_round_trip() {
        PAGE_OWN_TABLE.init(4);
        PAGE_OWN_TABLE.acquire(pid(2), 1, 0x3000).unwrap();
        EXCHANGE_DEVICE
            .write(pid(2), "prepare 1 0x3000")
            .expect("prepare should succeed");
        EXCHANGE_DEVICE
            .write(pid(2), "cancel 1")
            .expect("cancel should succeed");
        PAGE_OWN_TABLE.release(pid(2), 1).unwrap();
    }
}
