/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

/// Describes the register frame a trampoline builds on the stack. All
/// fields are indices of 64-bit slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameAbi {
    /// Number of slots, matching the kernel's `user_regs` layout.
    pub words: usize,
    /// Bytes the stack pointer is lowered by. At least `words * 8` and a
    /// multiple of 16.
    pub frame_size: usize,
    pub nr: usize,
    pub args: [usize; 6],
    pub result: usize,
    /// Register the kernel uses to flag a failed syscall, on architectures
    /// that return a positive errno.
    pub error_flag: Option<usize>,
    pub sp: usize,
    pub pc: usize,
    pub ra: Option<usize>,
    /// Size of the floating point register block that follows the general
    /// purpose registers in a record.
    pub fpregs_size: usize,
    /// Value subtracted from syscall numbers to get a table index.
    pub syscall_base: u32,
}

impl FrameAbi {
    pub const fn regs_size(&self) -> usize {
        self.words * 8
    }
}

/// Typed access to a register frame.
pub struct Frame<'a> {
    abi: &'a FrameAbi,
    slots: &'a mut [u64],
}

impl<'a> Frame<'a> {
    /// Wraps `slots`, which must hold at least `abi.words` entries.
    pub fn new(abi: &'a FrameAbi, slots: &'a mut [u64]) -> Option<Self> {
        (slots.len() >= abi.words).then_some(Self { abi, slots })
    }

    pub fn abi(&self) -> &FrameAbi {
        self.abi
    }

    pub fn nr(&self) -> u64 {
        self.slots[self.abi.nr]
    }

    pub fn args(&self) -> [u64; 6] {
        self.abi.args.map(|i| self.slots[i])
    }

    pub fn sp(&self) -> u64 {
        self.slots[self.abi.sp]
    }

    pub fn pc(&self) -> u64 {
        self.slots[self.abi.pc]
    }

    pub fn set(&mut self, slot: usize, value: u64) {
        self.slots[slot] = value;
    }

    /// Stores a syscall's return value the way the kernel would: a negated
    /// errno in the result register, or a positive errno plus the error
    /// flag. Returns the value for the result register.
    pub fn set_result(&mut self, raw: u64) -> u64 {
        let failed = (raw as i64) < 0 && (raw as i64) >= -4095;
        let value = match self.abi.error_flag {
            Some(flag) => {
                self.slots[flag] = failed as u64;
                if failed { (raw as i64).unsigned_abs() } else { raw }
            }
            None => raw,
        };
        self.slots[self.abi.result] = value;
        value
    }

    /// The general purpose registers in their kernel layout.
    pub fn as_bytes(&self) -> &[u8] {
        let words = &self.slots[..self.abi.words];
        // SAFETY: u64 has no padding and any byte pattern is valid for u8.
        unsafe { core::slice::from_raw_parts(words.as_ptr().cast::<u8>(), words.len() * 8) }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mips64::Mips64;
    use crate::x86_64::X86_64;
    use crate::TrampolineBuilder;

    #[test]
    fn results() {
        let mut slots = [0u64; 27];
        let mut frame = Frame::new(&X86_64::ABI, &mut slots).unwrap();
        assert_eq!(frame.set_result(-2i64 as u64), -2i64 as u64);
        assert_eq!(slots[10], -2i64 as u64);

        let mut slots = [0u64; 38];
        let mut frame = Frame::new(&Mips64::ABI, &mut slots).unwrap();
        assert_eq!(frame.set_result(-9i64 as u64), 9);
        assert_eq!(slots[2], 9);
        assert_eq!(slots[7], 1);

        let mut frame = Frame::new(&Mips64::ABI, &mut slots).unwrap();
        assert_eq!(frame.set_result(3), 3);
        assert_eq!(slots[7], 0);
    }

    #[test]
    fn short_frame() {
        let mut slots = [0u64; 4];
        assert!(Frame::new(&X86_64::ABI, &mut slots).is_none());
    }
}
