// SPDX-License-Identifier: MPL-2.0

//! Parsing of the kernel command line passed by the bootloader.
//!
//! The format follows the usual `key=value key2 module.key=value` shape:
//! whitespace-separated tokens, each either a bare flag or a `key=value`
//! pair. A token of the form `module.key=value` is routed to that module's
//! argument list, retrievable with [`KCmdlineArg::get_module_args`].

use alloc::{
    ffi::CString,
    string::{String, ToString},
    vec::Vec,
};
use core::ffi::CStr;

use alloc::collections::BTreeMap;

/// A single parsed `key=value` or bare-flag argument.
#[derive(Debug, Clone)]
pub enum ModuleArg {
    /// A bare flag with no value, e.g. `quiet`.
    Flag(CString),
    /// A `key=value` pair.
    KeyVal(CString, CString),
}

/// The parsed kernel command line.
#[derive(Debug, Default)]
pub struct KCmdlineArg {
    module_args: BTreeMap<String, Vec<ModuleArg>>,
}

impl KCmdlineArg {
    /// Returns the argument list belonging to `module`, if the command line
    /// mentioned any `module.*` tokens.
    pub fn get_module_args(&self, module: &str) -> Option<&Vec<ModuleArg>> {
        self.module_args.get(module)
    }
}

impl From<&str> for KCmdlineArg {
    fn from(cmdline: &str) -> Self {
        let mut module_args: BTreeMap<String, Vec<ModuleArg>> = BTreeMap::new();
        for token in cmdline.split_whitespace() {
            let (key_part, val_part) = match token.split_once('=') {
                Some((key, val)) => (key, Some(val)),
                None => (token, None),
            };
            let (module, sub_key) = match key_part.split_once('.') {
                Some((module, sub_key)) => (module.to_string(), sub_key),
                None => (key_part.to_string(), key_part),
            };
            let arg = match val_part {
                Some(val) => ModuleArg::KeyVal(
                    CString::new(sub_key).unwrap_or_default(),
                    CString::new(val).unwrap_or_default(),
                ),
                None => ModuleArg::Flag(CString::new(sub_key).unwrap_or_default()),
            };
            module_args.entry(module).or_default().push(arg);
        }
        Self { module_args }
    }
}

impl ModuleArg {
    /// The key half of a `KeyVal`, or the whole flag name for a `Flag`.
    pub fn key(&self) -> &CStr {
        match self {
            ModuleArg::Flag(k) => k.as_c_str(),
            ModuleArg::KeyVal(k, _) => k.as_c_str(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_module_keyval() {
        let args = KCmdlineArg::from("ktest.whitelist=foo,bar quiet");
        let ktest_args = args.get_module_args("ktest").unwrap();
        assert_eq!(ktest_args.len(), 1);
        match &ktest_args[0] {
            ModuleArg::KeyVal(k, v) => {
                assert_eq!(k.to_str().unwrap(), "whitelist");
                assert_eq!(v.to_str().unwrap(), "foo,bar");
            }
            _ => panic!("expected KeyVal"),
        }
    }

    #[test]
    fn unknown_module_returns_none() {
        let args = KCmdlineArg::from("quiet");
        assert!(args.get_module_args("ktest").is_none());
    }
}
