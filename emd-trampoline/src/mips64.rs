/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! MIPS64 (n64, little endian).
//!
//! Branches on MIPS have a delay slot, so the patch covers two words: the
//! instruction before the `syscall` becomes `j trampoline` and the
//! `syscall` itself becomes the `nop` in its delay slot. The trampoline
//! replays the displaced instruction before saving registers, and returns
//! to the instruction after the `syscall`, so a following `bnez a3` sees
//! the error flag written by the dispatcher.

use crate::emit32;
use crate::word_at;
use crate::Arch;
use crate::BuildError;
use crate::FrameAbi;
use crate::Site;
use crate::TrampolineBuilder;

#[derive(Debug, Clone, Copy, Default)]
pub struct Mips64;

pub const SYSCALL: u32 = 0x0000_000c;
pub const NOP: u32 = 0;

const V0: u32 = 2;
const A0: u32 = 4;
const T0: u32 = 12;
const T9: u32 = 25;
const SP: u32 = 29;

const WORDS: usize = 38;
const FRAME: u32 = 304;

// Slots after the 32 general purpose registers.
const LO: u32 = 32;
const HI: u32 = 33;
const PC: u32 = 34;

const LOOKBACK: usize = 6;

pub mod enc {
    pub const fn daddiu(rt: u32, rs: u32, imm: i16) -> u32 {
        0x6400_0000 | rs << 21 | rt << 16 | (imm as u16 as u32)
    }

    pub const fn sd(rt: u32, base: u32, off: i16) -> u32 {
        0xfc00_0000 | base << 21 | rt << 16 | (off as u16 as u32)
    }

    pub const fn ld(rt: u32, base: u32, off: i16) -> u32 {
        0xdc00_0000 | base << 21 | rt << 16 | (off as u16 as u32)
    }

    pub const fn lui(rt: u32, imm: u16) -> u32 {
        0x3c00_0000 | rt << 16 | imm as u32
    }

    pub const fn ori(rt: u32, rs: u32, imm: u16) -> u32 {
        0x3400_0000 | rs << 21 | rt << 16 | imm as u32
    }

    pub const fn dsll(rd: u32, rt: u32, sa: u32) -> u32 {
        0x38 | rt << 16 | rd << 11 | sa << 6
    }

    pub const fn mflo(rd: u32) -> u32 {
        0x12 | rd << 11
    }

    pub const fn mfhi(rd: u32) -> u32 {
        0x10 | rd << 11
    }

    pub const fn mtlo(rs: u32) -> u32 {
        0x13 | rs << 21
    }

    pub const fn mthi(rs: u32) -> u32 {
        0x11 | rs << 21
    }

    /// `or rd, rs, zero`
    pub const fn mov(rd: u32, rs: u32) -> u32 {
        0x25 | rs << 21 | rd << 11
    }

    /// `jalr ra, rs`
    pub const fn jalr(rs: u32) -> u32 {
        0x09 | rs << 21 | 31 << 11
    }

    pub const fn j(target: u64) -> u32 {
        0x0800_0000 | ((target >> 2) as u32 & 0x03ff_ffff)
    }
}

fn load_imm64(out: &mut Vec<u8>, rd: u32, value: u64) {
    emit32(
        out,
        &[
            enc::lui(rd, (value >> 48) as u16),
            enc::ori(rd, rd, (value >> 32) as u16),
            enc::dsll(rd, rd, 16),
            enc::ori(rd, rd, (value >> 16) as u16),
            enc::dsll(rd, rd, 16),
            enc::ori(rd, rd, value as u16),
        ],
    );
}

const fn opcode(w: u32) -> u32 {
    w >> 26
}

const fn funct(w: u32) -> u32 {
    w & 0x3f
}

/// `li v0, imm` in any of its usual encodings.
fn li_v0(w: u32) -> Option<u32> {
    let imm = w & 0xffff;
    match w & 0xffff_0000 {
        0x6402_0000 | 0x2402_0000 => Some(imm as u16 as i16 as i32 as u32),
        0x3402_0000 => Some(imm),
        _ => None,
    }
}

fn is_branch(w: u32) -> bool {
    match opcode(w) {
        0 => matches!(funct(w), 0x08 | 0x09),
        0x01..=0x07 | 0x14..=0x17 => true,
        // Coprocessor branches.
        0x11 | 0x12 => (w >> 21) & 0x1f == 0x08,
        // Release 6 compact branches.
        0x32 | 0x36 | 0x3a | 0x3e => true,
        _ => false,
    }
}

/// Whether `w` may write v0.
fn writes_v0(w: u32) -> bool {
    match opcode(w) {
        0 => (w >> 11) & 0x1f == V0,
        // Stores read rt.
        0x28 | 0x29 | 0x2b | 0x3f | 0x2c | 0x2d | 0x2e => false,
        _ => (w >> 16) & 0x1f == V0,
    }
}

/// Whether `w` can execute from a different address with the same effect.
fn is_relocatable(w: u32) -> bool {
    match opcode(w) {
        // ALU ops except jumps, syscall and break.
        0 => !matches!(funct(w), 0x08 | 0x09 | 0x0c | 0x0d),
        // Immediate arithmetic and logic, lui.
        0x08..=0x0f | 0x18 | 0x19 => true,
        // Loads and stores.
        0x20..=0x27 | 0x28 | 0x29 | 0x2b | 0x37 | 0x3f => true,
        _ => false,
    }
}

fn same_region(a: u64, b: u64) -> bool {
    a >> 28 == b >> 28
}

impl TrampolineBuilder for Mips64 {
    const ARCH: Arch = Arch::Mips64;

    const STUB_SIZE: usize = 384;

    const ABI: FrameAbi = FrameAbi {
        words: WORDS,
        frame_size: FRAME as usize,
        nr: V0 as usize,
        args: [4, 5, 6, 7, 8, 9],
        result: V0 as usize,
        error_flag: Some(7),
        sp: SP as usize,
        pc: PC as usize,
        ra: Some(31),
        fpregs_size: 33 * 8,
        syscall_base: 5000,
    };

    // clone, vfork, rt_sigreturn, clone3
    const EXCLUDED: &'static [u32] = &[5055, 5056, 5211, 5435];

    fn scan(&self, code: &[u8], base: u64) -> Vec<Site> {
        let mut sites = Vec::new();
        let words = code.len() / 4;

        for i in 1..words {
            if word_at(code, i * 4) != Some(SYSCALL) {
                continue;
            }
            let Some(displaced) = word_at(code, (i - 1) * 4) else {
                continue;
            };
            if !is_relocatable(displaced) {
                continue;
            }
            // The displaced word must not sit in a delay slot itself.
            if i >= 2 && word_at(code, (i - 2) * 4).is_some_and(is_branch) {
                continue;
            }

            let mut nr = None;
            for back in 1..=LOOKBACK.min(i) {
                let Some(w) = word_at(code, (i - back) * 4) else {
                    break;
                };
                if let Some(imm) = li_v0(w) {
                    nr = Some(imm);
                    break;
                }
                if is_branch(w) || writes_v0(w) {
                    break;
                }
            }
            let Some(nr) = nr else { continue };
            if self.is_excluded(nr) {
                continue;
            }

            let addr = base + (i * 4) as u64;
            sites.push(Site {
                syscall: addr,
                nr,
                patch_addr: addr - 4,
                patch_len: 8,
                displaced: Some(displaced),
                resume: addr + 4,
            });
        }

        sites
    }

    fn reachable(&self, site: &Site, target: u64) -> bool {
        let end = target + Self::STUB_SIZE as u64;
        same_region(site.patch_addr + 4, target) && same_region(end, site.resume)
    }

    fn patch(&self, site: &Site, trampoline: u64) -> Result<Vec<u8>, BuildError> {
        if trampoline % 4 != 0 {
            return Err(BuildError::Misaligned(trampoline));
        }
        if !same_region(site.patch_addr + 4, trampoline) {
            return Err(BuildError::OutOfRange {
                from: site.patch_addr,
                to: trampoline,
            });
        }
        let mut bytes = Vec::with_capacity(8);
        emit32(&mut bytes, &[enc::j(trampoline), NOP]);
        Ok(bytes)
    }

    fn build(
        &self,
        site: &Site,
        trampoline: u64,
        dispatcher: u64,
        out: &mut Vec<u8>,
    ) -> Result<(), BuildError> {
        if trampoline % 4 != 0 {
            return Err(BuildError::Misaligned(trampoline));
        }
        let start = out.len();

        if let Some(w) = site.displaced {
            if !is_relocatable(w) {
                return Err(BuildError::NotRelocatable(w));
            }
            emit32(out, &[w]);
        }

        let frame = FRAME as i16;
        emit32(out, &[enc::daddiu(SP, SP, -frame)]);
        for r in 0..32 {
            if r != SP {
                emit32(out, &[enc::sd(r, SP, (r * 8) as i16)]);
            }
        }
        emit32(
            out,
            &[
                enc::mflo(T0),
                enc::sd(T0, SP, (LO * 8) as i16),
                enc::mfhi(T0),
                enc::sd(T0, SP, (HI * 8) as i16),
                enc::daddiu(T0, SP, frame),
                enc::sd(T0, SP, (SP * 8) as i16),
            ],
        );
        load_imm64(out, T0, site.resume);
        emit32(out, &[enc::sd(T0, SP, (PC * 8) as i16)]);
        // badvaddr, status, cause
        for slot in PC + 1..WORDS as u32 {
            emit32(out, &[enc::sd(0, SP, (slot * 8) as i16)]);
        }

        load_imm64(out, T9, dispatcher);
        emit32(out, &[enc::mov(A0, SP), enc::jalr(T9), NOP]);

        // v0 holds the result.
        emit32(
            out,
            &[
                enc::ld(T0, SP, (LO * 8) as i16),
                enc::mtlo(T0),
                enc::ld(T0, SP, (HI * 8) as i16),
                enc::mthi(T0),
            ],
        );
        for r in 1..32 {
            if r != V0 && r != SP {
                emit32(out, &[enc::ld(r, SP, (r * 8) as i16)]);
            }
        }
        emit32(out, &[enc::daddiu(SP, SP, frame)]);

        let at = trampoline + (out.len() - start) as u64;
        if !same_region(at + 4, site.resume) {
            return Err(BuildError::OutOfRange {
                from: at,
                to: site.resume,
            });
        }
        emit32(out, &[enc::j(site.resume), NOP]);

        debug_assert!(out.len() - start <= Self::STUB_SIZE);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const BASE: u64 = 0x0000_00ff_f000_0000;

    fn bytes(words: &[u32]) -> Vec<u8> {
        let mut out = Vec::new();
        emit32(&mut out, words);
        out
    }

    fn words(code: &[u8]) -> Vec<u32> {
        code.chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    const BNEZ_A3: u32 = 0x14e0_0003;

    #[test]
    fn encodings() {
        assert_eq!(enc::daddiu(V0, 0, 5038), 0x6402_13ae);
        assert_eq!(enc::sd(31, SP, 248), 0xffbf_00f8);
        assert_eq!(enc::ld(31, SP, 248), 0xdfbf_00f8);
        assert_eq!(enc::mflo(T0), 0x0000_6012);
        assert_eq!(enc::mfhi(T0), 0x0000_6010);
        assert_eq!(enc::mov(A0, SP), 0x03a0_2025);
        assert_eq!(enc::jalr(T9), 0x0320_f809);
        assert_eq!(enc::j(0x1000_0040), 0x0800_0010);
    }

    #[test]
    fn scan_sites() {
        let code = bytes(&[
            enc::daddiu(V0, 0, 5038), // getpid
            SYSCALL,
            BNEZ_A3,
            NOP,
            enc::daddiu(V0, 0, 5055), // clone
            SYSCALL,
            enc::daddiu(V0, 0, 5001), // write
            enc::mov(A0, 16),
            SYSCALL,
            enc::daddiu(V0, 0, 5000), // read, but the displaced word is a delay slot
            BNEZ_A3,
            enc::mov(A0, 16),
            SYSCALL,
            enc::mov(V0, 16), // computed number
            SYSCALL,
        ]);
        let sites = Mips64.scan(&code, BASE);
        let found: Vec<(u32, u64)> = sites.iter().map(|s| (s.nr, s.syscall - BASE)).collect();
        assert_eq!(found, vec![(5038, 4), (5001, 32)]);

        let getpid = sites[0];
        assert_eq!(getpid.patch_addr, BASE);
        assert_eq!(getpid.patch_len, 8);
        assert_eq!(getpid.displaced, Some(enc::daddiu(V0, 0, 5038)));
        assert_eq!(getpid.resume, BASE + 8);
    }

    #[test]
    fn patch_and_rescan() {
        let mut code = bytes(&[enc::daddiu(V0, 0, 5038), SYSCALL, BNEZ_A3, NOP]);
        let site = Mips64.scan(&code, BASE)[0];
        let trampoline = BASE + 0x10_0000;
        let patch = Mips64.patch(&site, trampoline).unwrap();
        code[..8].copy_from_slice(&patch);
        assert_eq!(words(&code)[..2], [enc::j(trampoline), NOP]);
        assert!(Mips64.scan(&code, BASE).is_empty());

        assert!(Mips64.reachable(&site, trampoline));
        assert!(!Mips64.reachable(&site, BASE + 0x1000_0000));
        assert!(Mips64.patch(&site, BASE + 0x1000_0000).is_err());
    }

    #[test]
    fn trampoline_layout() {
        let code = bytes(&[enc::daddiu(V0, 0, 5038), SYSCALL, BNEZ_A3, NOP]);
        let site = Mips64.scan(&code, BASE)[0];
        let trampoline = BASE + 0x2000;
        let mut out = Vec::new();
        Mips64.build(&site, trampoline, 0x1234_5678_9abc_def0, &mut out).unwrap();
        assert!(out.len() <= Mips64::STUB_SIZE);

        let w = words(&out);
        assert_eq!(w[0], enc::daddiu(V0, 0, 5038));
        assert_eq!(w[1], enc::daddiu(SP, SP, -304));
        assert!(w.contains(&enc::sd(31, SP, 248)));
        assert!(!w.contains(&enc::sd(SP, SP, 232)));
        assert!(w.contains(&enc::lui(T9, 0x1234)));
        assert!(w.contains(&enc::jalr(T9)));
        // v0 is not reloaded but a3 is.
        assert!(!w.contains(&enc::ld(V0, SP, 16)));
        assert!(w.contains(&enc::ld(7, SP, 56)));

        let n = w.len();
        assert_eq!(w[n - 3], enc::daddiu(SP, SP, 304));
        assert_eq!(w[n - 2], enc::j(site.resume));
        assert_eq!(w[n - 1], NOP);
    }
}
