/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Machine-code generation for syscall interception.
//!
//! Each supported instruction set provides a [`TrampolineBuilder`]: a
//! scanner that finds syscall sites whose number is a constant, the branch
//! that replaces such a site, and the trampoline body the branch leads to.
//! A trampoline saves the general purpose registers into a frame laid out
//! as described by the builder's [`FrameAbi`], calls the dispatcher with a
//! pointer to that frame, restores everything except the result register
//! and jumps back behind the original instruction.
//!
//! Nothing in this crate touches process memory. Code is scanned from byte
//! slices and emitted into vectors, so every architecture can be tested on
//! any host.

pub mod aarch64;
mod error;
mod frame;
pub mod mips64;
mod region;
pub mod sw64;
pub mod x86_64;

pub use error::*;
pub use frame::*;
pub use region::*;

/// Instruction sets with trampoline support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86_64,
    Aarch64,
    Mips64,
    Sw64,
}

/// A syscall site that can be intercepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Site {
    /// Address of the syscall instruction.
    pub syscall: u64,
    /// Syscall number loaded by the preceding immediate move.
    pub nr: u32,
    /// First byte overwritten by the patch.
    pub patch_addr: u64,
    /// Number of bytes overwritten by the patch.
    pub patch_len: usize,
    /// An instruction displaced by the patch that the trampoline executes
    /// before saving registers.
    pub displaced: Option<u32>,
    /// Where execution continues after the trampoline.
    pub resume: u64,
}

/// Code generation for one instruction set.
pub trait TrampolineBuilder {
    const ARCH: Arch;

    /// Upper bound on the size of one trampoline body.
    const STUB_SIZE: usize;

    /// Register frame handed to the dispatcher.
    const ABI: FrameAbi;

    /// Syscalls that must never be intercepted on this architecture.
    const EXCLUDED: &'static [u32];

    /// Finds the interceptable syscall sites in `code`, which is mapped at
    /// `base`.
    fn scan(&self, code: &[u8], base: u64) -> Vec<Site>;

    /// Whether a direct branch placed at `site` can reach `target`, and a
    /// branch at the end of a trampoline at `target` can get back.
    fn reachable(&self, site: &Site, target: u64) -> bool;

    /// The bytes that replace `site.patch_len` bytes at `site.patch_addr`.
    fn patch(&self, site: &Site, trampoline: u64) -> Result<Vec<u8>, BuildError>;

    /// Appends the trampoline for `site`, which will live at `trampoline`,
    /// to `out`.
    fn build(
        &self,
        site: &Site,
        trampoline: u64,
        dispatcher: u64,
        out: &mut Vec<u8>,
    ) -> Result<(), BuildError>;

    fn is_excluded(&self, nr: u32) -> bool {
        Self::EXCLUDED.contains(&nr)
    }
}

/// The builder for the architecture this crate is compiled for.
#[cfg(target_arch = "x86_64")]
pub type Native = x86_64::X86_64;
#[cfg(target_arch = "aarch64")]
pub type Native = aarch64::Aarch64;
#[cfg(target_arch = "mips64")]
pub type Native = mips64::Mips64;
#[cfg(target_arch = "sw64")]
pub type Native = sw64::Sw64;

/// Little helper for emitting 32-bit instruction words.
pub(crate) fn emit32(out: &mut Vec<u8>, words: &[u32]) {
    for w in words {
        out.extend_from_slice(&w.to_le_bytes());
    }
}

/// Reads the instruction word at byte offset `at` of `code`.
pub(crate) fn word_at(code: &[u8], at: usize) -> Option<u32> {
    let bytes = code.get(at..at + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
