// SPDX-License-Identifier: MPL-2.0

//! A minimal POSIX ustar reader for the initramfs image returned by
//! [`crate::boot::initramfs`].
//!
//! Grounded in spirit (not format) on the teacher-adjacent `cpio-decoder`
//! crate: fixed-width ASCII header fields read in place, one header per
//! entry, a sentinel marking end-of-archive — here that's two consecutive
//! all-zero 512-byte blocks instead of cpio's `TRAILER!!!` name. Unlike
//! `cpio-decoder`'s `Read`-based streaming API, the initramfs arrives as
//! one fully-loaded byte slice, so this is a plain borrowing iterator over
//! `&[u8]` rather than a lending iterator over a reader.

use alloc::vec::Vec;
use core::str;

const BLOCK_SIZE: usize = 512;
const NAME_LEN: usize = 100;
const SIZE_FIELD_OFFSET: usize = 124;
const SIZE_FIELD_LEN: usize = 12;
const TYPEFLAG_OFFSET: usize = 156;
const MAGIC_OFFSET: usize = 257;
const MAGIC: &[u8] = b"ustar";

/// Errors raised while walking a ustar archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UstarError {
    /// The buffer ended before a full header block.
    Truncated,
    /// A header's `size` field was not valid octal ASCII.
    BadSizeField,
    /// A header's `magic` field was not `"ustar"` (unsupported or corrupt
    /// archive — this parser does not attempt pre-POSIX `v7` tar).
    BadMagic,
}

/// One file entry in the archive.
#[derive(Debug, Clone, Copy)]
pub struct UstarEntry<'a> {
    name: &'a str,
    typeflag: u8,
    data: &'a [u8],
}

impl<'a> UstarEntry<'a> {
    /// The file's path, as recorded in the archive (no prefix-field
    /// support: names over 100 bytes are not handled, matching spec.md's
    /// stated scope for the initrd format).
    pub fn name(&self) -> &'a str {
        self.name
    }

    /// The raw ustar typeflag byte (`b'0'` or `0` for a regular file).
    pub fn typeflag(&self) -> u8 {
        self.typeflag
    }

    pub fn is_regular_file(&self) -> bool {
        matches!(self.typeflag, b'0' | 0)
    }

    /// The file's contents, exactly `size` bytes (the trailing padding to
    /// the next 512-byte boundary is not included).
    pub fn data(&self) -> &'a [u8] {
        self.data
    }
}

/// Iterates over the entries of a ustar archive held entirely in memory.
pub struct UstarIter<'a> {
    buf: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> UstarIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            offset: 0,
            done: false,
        }
    }
}

fn parse_octal(field: &[u8]) -> Result<usize, UstarError> {
    // Fields are left-zero-padded ASCII octal, NUL- or space-terminated.
    let text = field
        .iter()
        .take_while(|&&b| b != 0 && b != b' ')
        .copied()
        .collect::<Vec<u8>>();
    let text = str::from_utf8(&text).map_err(|_| UstarError::BadSizeField)?;
    if text.is_empty() {
        return Ok(0);
    }
    usize::from_str_radix(text, 8).map_err(|_| UstarError::BadSizeField)
}

fn is_all_zero(block: &[u8]) -> bool {
    block.iter().all(|&b| b == 0)
}

impl<'a> Iterator for UstarIter<'a> {
    type Item = Result<UstarEntry<'a>, UstarError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if self.offset + BLOCK_SIZE > self.buf.len() {
                self.done = true;
                return None;
            }
            let header = &self.buf[self.offset..self.offset + BLOCK_SIZE];

            if is_all_zero(header) {
                // End-of-archive marker (one all-zero block is enough for
                // this reader; POSIX pads with two, but a truncated image
                // with a single terminator block should still parse
                // cleanly rather than erroring).
                self.done = true;
                return None;
            }

            if &header[MAGIC_OFFSET..MAGIC_OFFSET + MAGIC.len()] != MAGIC {
                self.done = true;
                return Some(Err(UstarError::BadMagic));
            }

            let name_bytes = &header[0..NAME_LEN];
            let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
            let name = match str::from_utf8(&name_bytes[..name_len]) {
                Ok(n) => n,
                Err(_) => {
                    self.done = true;
                    return Some(Err(UstarError::BadSizeField));
                }
            };

            let size = match parse_octal(&header[SIZE_FIELD_OFFSET..SIZE_FIELD_OFFSET + SIZE_FIELD_LEN]) {
                Ok(s) => s,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            let typeflag = header[TYPEFLAG_OFFSET];

            let data_start = self.offset + BLOCK_SIZE;
            if data_start + size > self.buf.len() {
                self.done = true;
                return Some(Err(UstarError::Truncated));
            }
            let data = &self.buf[data_start..data_start + size];

            let padded_size = (size + BLOCK_SIZE - 1) / BLOCK_SIZE * BLOCK_SIZE;
            self.offset = data_start + padded_size;

            return Some(Ok(UstarEntry {
                name,
                typeflag,
                data,
            }));
        }
    }
}

/// Returns an iterator over the `(name, data)` pairs of a ustar archive,
/// skipping non-regular entries (directories, symlinks, ...). Errors
/// anywhere in the archive stop iteration but are otherwise swallowed,
/// consistent with the boot-time initrd walk only caring about the files
/// it's looking for.
pub fn entries(buf: &[u8]) -> impl Iterator<Item = (&str, &[u8])> {
    UstarIter::new(buf)
        .take_while(|r| r.is_ok())
        .filter_map(|r| r.ok())
        .filter(|e| e.is_regular_file())
        .map(|e| (e.name(), e.data()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::{vec, vec::Vec};

    fn ustar_header(name: &str, size: usize, typeflag: u8) -> Vec<u8> {
        let mut block = vec![0u8; BLOCK_SIZE];
        block[0..name.len()].copy_from_slice(name.as_bytes());
        let octal = alloc::format!("{:011o}\0", size);
        block[SIZE_FIELD_OFFSET..SIZE_FIELD_OFFSET + octal.len()].copy_from_slice(octal.as_bytes());
        block[TYPEFLAG_OFFSET] = typeflag;
        block[MAGIC_OFFSET..MAGIC_OFFSET + MAGIC.len()].copy_from_slice(MAGIC);
        block
    }

    fn pad_to_block(data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        let padded = (data.len() + BLOCK_SIZE - 1) / BLOCK_SIZE * BLOCK_SIZE;
        out.resize(padded, 0);
        out
    }

    #[test]
    fn reads_one_regular_file() {
        let mut archive = ustar_header("hello.txt", 5, b'0');
        archive.extend(pad_to_block(b"world"));
        archive.extend(vec![0u8; BLOCK_SIZE]);

        let found: Vec<_> = entries(&archive).collect();
        assert_eq!(found, vec![("hello.txt", &b"world"[..])]);
    }

    #[test]
    fn skips_directories() {
        let mut archive = ustar_header("bin/", 0, b'5');
        archive.extend(ustar_header("bin/sh", 3, b'0'));
        archive.extend(pad_to_block(b"abc"));
        archive.extend(vec![0u8; BLOCK_SIZE]);

        let found: Vec<_> = entries(&archive).collect();
        assert_eq!(found, vec![("bin/sh", &b"abc"[..])]);
    }

    #[test]
    fn empty_archive_yields_nothing() {
        let archive = vec![0u8; BLOCK_SIZE];
        assert_eq!(entries(&archive).count(), 0);
    }

    #[test]
    fn multiple_files_in_sequence() {
        let mut archive = ustar_header("a", 1, b'0');
        archive.extend(pad_to_block(b"1"));
        archive.extend(ustar_header("b", 2, b'0'));
        archive.extend(pad_to_block(b"22"));
        archive.extend(vec![0u8; BLOCK_SIZE]);

        let found: Vec<_> = entries(&archive).collect();
        assert_eq!(found, vec![("a", &b"1"[..]), ("b", &b"22"[..])]);
    }
}
