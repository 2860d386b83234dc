/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use bitflags::bitflags;

use crate::MAX_SYSCALLS;

bitflags! {
    /// Describes which syscall arguments point at memory worth capturing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ArgFlags: u8 {
        const ARG0 = 1 << 0;
        const ARG1 = 1 << 1;
        const ARG2 = 1 << 2;
        const ARG3 = 1 << 3;
        const ARG4 = 1 << 4;
        const ARG5 = 1 << 5;
        const ARG6 = 1 << 6;
        /// The marked pointer's length is the following argument rather
        /// than a nul terminator.
        const SIZE_IN_NEXT = 1 << 7;
    }
}

impl ArgFlags {
    /// Flag for argument `index`.
    pub const fn arg(index: usize) -> Self {
        Self::from_bits_truncate(1 << index)
    }
}

/// Parameter capture description for one syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParamSpec {
    pub flags: ArgFlags,
    pub arg_count: u8,
}

impl ParamSpec {
    pub const fn new(flags: ArgFlags, arg_count: u8) -> Self {
        Self { flags, arg_count }
    }

    /// Walks the pointer arguments selected by this spec. Pointers that are
    /// null or fall inside `stack` (inclusive) are skipped. A pointer with
    /// `SIZE_IN_NEXT` ends the walk, yielding nothing if its length is zero.
    pub fn captures<'a>(&self, args: &'a [u64], stack: (u64, u64)) -> Captures<'a> {
        Captures {
            bits: self.flags.bits(),
            sized: self.flags.contains(ArgFlags::SIZE_IN_NEXT),
            index: 0,
            count: (self.arg_count as usize).min(args.len()),
            args,
            stack,
        }
    }
}

/// A parameter region to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    /// Nul-terminated data, capped by the configured parameter size.
    CString { addr: u64 },
    /// Exactly `len` bytes.
    Sized { addr: u64, len: u64 },
}

impl Capture {
    pub fn addr(&self) -> u64 {
        match *self {
            Capture::CString { addr } | Capture::Sized { addr, .. } => addr,
        }
    }
}

pub struct Captures<'a> {
    bits: u8,
    sized: bool,
    index: usize,
    count: usize,
    args: &'a [u64],
    stack: (u64, u64),
}

impl Iterator for Captures<'_> {
    type Item = Capture;

    fn next(&mut self) -> Option<Capture> {
        while self.index < self.count {
            let i = self.index;
            let marked = self.bits & 1 != 0;
            self.bits >>= 1;
            self.index += 1;

            if !marked {
                continue;
            }
            let addr = self.args[i];
            if addr == 0 || (self.stack.0 <= addr && addr <= self.stack.1) {
                continue;
            }
            if self.sized {
                self.count = 0;
                let len = self.args.get(i + 1).copied().unwrap_or(0);
                // Lengths are signed in the kernel ABI.
                if (len as i64) > 0 {
                    return Some(Capture::Sized { addr, len });
                }
                return None;
            }
            return Some(Capture::CString { addr });
        }
        None
    }
}

/// Per-syscall parameter specs, stored two bytes per index.
#[derive(Clone, PartialEq, Eq)]
pub struct ParamTable {
    bytes: [u8; 2 * MAX_SYSCALLS],
}

impl ParamTable {
    pub const BYTES: usize = 2 * MAX_SYSCALLS;

    pub const fn new() -> Self {
        Self {
            bytes: [0; 2 * MAX_SYSCALLS],
        }
    }

    /// Loads a table from its shared-memory form. Missing trailing entries
    /// are zero and surplus bytes are ignored.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut table = Self::new();
        let n = bytes.len().min(Self::BYTES);
        table.bytes[..n].copy_from_slice(&bytes[..n]);
        table
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn get(&self, index: usize) -> ParamSpec {
        match self.bytes.get(2 * index..2 * index + 2) {
            Some(entry) => ParamSpec::new(ArgFlags::from_bits_truncate(entry[0]), entry[1]),
            None => ParamSpec::default(),
        }
    }

    pub fn set(&mut self, index: usize, spec: ParamSpec) -> bool {
        match self.bytes.get_mut(2 * index..2 * index + 2) {
            Some(entry) => {
                entry[0] = spec.flags.bits();
                entry[1] = spec.arg_count;
                true
            }
            None => false,
        }
    }
}

impl Default for ParamTable {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for ParamTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let populated = self.bytes.chunks(2).filter(|e| e[0] != 0).count();
        f.debug_struct("ParamTable")
            .field("populated", &populated)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const NO_STACK: (u64, u64) = (0x7000, 0x8000);

    #[test]
    fn string_args() {
        // openat(dirfd, path, flags, mode)
        let spec = ParamSpec::new(ArgFlags::ARG1, 4);
        let args = [u64::MAX - 99, 0x1000, 0, 0];
        let got: Vec<_> = spec.captures(&args, NO_STACK).collect();
        assert_eq!(got, vec![Capture::CString { addr: 0x1000 }]);
    }

    #[test]
    fn sized_arg_stops_walk() {
        // read(fd, buf, count)
        let spec = ParamSpec::new(ArgFlags::ARG1 | ArgFlags::SIZE_IN_NEXT, 3);
        let args = [3, 0x1000, 100];
        let got: Vec<_> = spec.captures(&args, NO_STACK).collect();
        assert_eq!(got, vec![Capture::Sized { addr: 0x1000, len: 100 }]);

        // Both pointers are marked but only the first is taken.
        let spec = ParamSpec::new(ArgFlags::ARG0 | ArgFlags::ARG2 | ArgFlags::SIZE_IN_NEXT, 4);
        let args = [0x1000, 8, 0x2000, 8];
        assert_eq!(spec.captures(&args, NO_STACK).count(), 1);
    }

    #[test]
    fn zero_length_yields_nothing() {
        let spec = ParamSpec::new(ArgFlags::ARG1 | ArgFlags::SIZE_IN_NEXT, 3);
        assert_eq!(spec.captures(&[3, 0x1000, 0], NO_STACK).count(), 0);
    }

    #[test]
    fn stack_and_null_pointers_are_skipped() {
        let spec = ParamSpec::new(ArgFlags::ARG0 | ArgFlags::ARG1 | ArgFlags::ARG2, 3);
        let args = [0, 0x7800, 0x9000];
        let got: Vec<_> = spec.captures(&args, NO_STACK).collect();
        assert_eq!(got, vec![Capture::CString { addr: 0x9000 }]);
    }

    #[test]
    fn table_entries() {
        let mut table = ParamTable::new();
        assert!(table.set(2, ParamSpec::new(ArgFlags::ARG0, 3)));
        assert!(!table.set(MAX_SYSCALLS, ParamSpec::default()));
        assert_eq!(table.get(2), ParamSpec::new(ArgFlags::ARG0, 3));
        assert_eq!(table.get(MAX_SYSCALLS + 1), ParamSpec::default());

        let copy = ParamTable::from_bytes(&table.as_bytes()[..10]);
        assert_eq!(copy.get(2).arg_count, 3);
    }
}
