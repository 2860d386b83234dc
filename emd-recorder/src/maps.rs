/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Views of this process's memory map.
//!
//! [`find_mapping`] reads `/proc/self/maps` through the raw shim with a
//! fixed buffer and is safe to call from inside a hook. [`snapshot`] uses
//! `procfs` and allocates, so it is only used before any code is patched.

use core::fmt::Write;

use procfs::process::MMapPath;
use procfs::process::Process;

use crate::raw;
use crate::raw::CPath;
use crate::Result;

/// Parses the address range at the start of a maps line, e.g.
/// `7ffd1c3e0000-7ffd1c401000 rw-p ...`.
pub fn parse_range(line: &[u8]) -> Option<(u64, u64)> {
    let dash = line.iter().position(|b| *b == b'-')?;
    let end_len = line[dash + 1..]
        .iter()
        .position(|b| !b.is_ascii_hexdigit())
        .unwrap_or(line.len() - dash - 1);
    let start = parse_hex(&line[..dash])?;
    let end = parse_hex(&line[dash + 1..dash + 1 + end_len])?;
    Some((start, end))
}

fn parse_hex(digits: &[u8]) -> Option<u64> {
    if digits.is_empty() || digits.len() > 16 {
        return None;
    }
    digits.iter().try_fold(0u64, |acc, b| {
        let d = (*b as char).to_digit(16)?;
        Some(acc << 4 | d as u64)
    })
}

/// Scans maps text arriving in chunks for the range containing `addr`.
/// Lines may be split across chunks.
pub struct RangeScanner<const N: usize> {
    addr: u64,
    line: [u8; N],
    len: usize,
}

impl<const N: usize> RangeScanner<N> {
    pub fn new(addr: u64) -> Self {
        Self {
            addr,
            line: [0; N],
            len: 0,
        }
    }

    /// Feeds the next chunk. Returns the matching range once found.
    pub fn feed(&mut self, chunk: &[u8]) -> Option<(u64, u64)> {
        for &b in chunk {
            if b == b'\n' {
                let found = self.finish_line();
                if found.is_some() {
                    return found;
                }
            } else if self.len < N {
                self.line[self.len] = b;
                self.len += 1;
            }
        }
        None
    }

    /// Handles a final line without a newline.
    pub fn finish(&mut self) -> Option<(u64, u64)> {
        self.finish_line()
    }

    fn finish_line(&mut self) -> Option<(u64, u64)> {
        // The range is at the start, so a truncated line still parses.
        let range = parse_range(&self.line[..self.len]);
        self.len = 0;
        range.filter(|(start, end)| *start <= self.addr && self.addr < *end)
    }
}

/// Finds the mapping containing `addr` by reading `/proc/self/maps`.
pub fn find_mapping(addr: u64) -> Result<Option<(u64, u64)>> {
    let mut path = CPath::new();
    let _ = write!(path, "/proc/self/maps");
    let fd = raw::open_rdonly(&path)?;

    let mut buf = [0u8; 4096];
    let mut scanner = RangeScanner::<128>::new(addr);
    loop {
        let n = fd.read(&mut buf)?;
        if n == 0 {
            return Ok(scanner.finish());
        }
        if let Some(range) = scanner.feed(&buf[..n]) {
            return Ok(Some(range));
        }
    }
}

/// A mapping from `procfs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub start: u64,
    pub end: u64,
    pub path: Option<String>,
    pub vdso: bool,
}

/// All current mappings, sorted by address.
pub fn snapshot() -> Result<Vec<Mapping>> {
    let maps = Process::myself()?.maps()?;
    let mut out: Vec<Mapping> = maps
        .into_iter()
        .map(|map| Mapping {
            start: map.address.0,
            end: map.address.1,
            vdso: matches!(map.pathname, MMapPath::Vdso),
            path: match map.pathname {
                MMapPath::Path(path) => Some(path.display().to_string()),
                _ => None,
            },
        })
        .collect();
    out.sort_by_key(|map| map.start);
    Ok(out)
}
