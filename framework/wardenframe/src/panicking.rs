// SPDX-License-Identifier: MPL-2.0

//! Panic support.

use alloc::{
    boxed::Box,
    string::{String, ToString},
};

use crate::{
    arch::qemu::{exit_qemu, QemuExitCode},
    println,
};

#[derive(Clone, Debug)]
pub struct PanicInfo {
    pub message: String,
    pub file: String,
    pub line: usize,
    pub col: usize,
}

impl core::fmt::Display for PanicInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        writeln!(f, "Panicked at {}:{}:{}", self.file, self.line, self.col)?;
        writeln!(f, "{}", self.message)
    }
}

#[panic_handler]
pub fn panic_handler(info: &core::panic::PanicInfo) -> ! {
    let throw_info = PanicInfo {
        message: info
            .message()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "<no message>".to_string()),
        file: info.location().map(|l| l.file().to_string()).unwrap_or_default(),
        line: info.location().map(|l| l.line() as usize).unwrap_or(0),
        col: info.location().map(|l| l.column() as usize).unwrap_or(0),
    };
    // Throw an exception and expect it to be caught by ktest's `catch_unwind_fn`.
    unwinding::panic::begin_panic(Box::new(throw_info));
    // If the exception is not caught, print the information and exit failed
    // using the QEMU debug device.
    println!("[uncaught panic] {}", info);
    abort();
}

/// Terminates the current run unconditionally, the way an uncaught panic does.
pub fn abort() -> ! {
    exit_qemu(QemuExitCode::Failed);
}
