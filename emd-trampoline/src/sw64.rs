/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! SW64 (Sunway): `ldi v0, nr(zero)` followed by `sys_call 0x83`.
//!
//! The `sys_call` is replaced by `br zero, trampoline`. 64-bit constants
//! are loaded from a literal pool placed inline in the trampoline and
//! skipped with `br t0`, which also leaves the pool address in t0.

use crate::emit32;
use crate::word_at;
use crate::Arch;
use crate::BuildError;
use crate::FrameAbi;
use crate::Site;
use crate::TrampolineBuilder;

#[derive(Debug, Clone, Copy, Default)]
pub struct Sw64;

pub const SYS_CALL: u32 = 0x0200_0083;
/// `ldi zero, 0(zero)`
pub const NOP: u32 = 0xfbff_0000;

const V0: u32 = 0;
const T0: u32 = 1;
const T1: u32 = 2;
const A0: u32 = 16;
const RA: u32 = 26;
const T12: u32 = 27;
const SP: u32 = 30;
const ZERO: u32 = 31;

const FRAME: u32 = 272;

const SP_SLOT: u32 = 26;
const PS_SLOT: u32 = 27;
const PC_SLOT: u32 = 28;

const LOOKBACK: usize = 6;

/// Reach of `br`: 21 bits of words.
const REACH: i64 = 4 << 20;

/// Frame slot holding general purpose register `reg`, following the
/// kernel's `user_pt_regs` order.
const fn slot(reg: u32) -> u32 {
    match reg {
        0..=15 => reg,
        16..=18 => 30 + (reg - 16),
        19..=28 => 16 + (reg - 19),
        29 => 29,
        _ => SP_SLOT,
    }
}

pub mod enc {
    pub const fn ldi(ra: u32, rb: u32, disp: i16) -> u32 {
        0xf800_0000 | ra << 21 | rb << 16 | (disp as u16 as u32)
    }

    pub const fn stl(ra: u32, rb: u32, disp: i16) -> u32 {
        0xac00_0000 | ra << 21 | rb << 16 | (disp as u16 as u32)
    }

    pub const fn ldl(ra: u32, rb: u32, disp: i16) -> u32 {
        0x8c00_0000 | ra << 21 | rb << 16 | (disp as u16 as u32)
    }

    /// `call ra, (rb)`
    pub const fn call(ra: u32, rb: u32) -> u32 {
        0x0400_0000 | ra << 21 | rb << 16
    }

    /// `br ra, disp` with `disp` counted in words from the next instruction.
    pub const fn br(ra: u32, disp: i32) -> u32 {
        0x1000_0000 | ra << 21 | (disp as u32 & 0x001f_ffff)
    }
}

fn li_v0(w: u32) -> Option<u32> {
    ((w & 0xffff_0000) == enc::ldi(V0, ZERO, 0)).then_some((w & 0xffff) as u16 as i16 as i32 as u32)
}

fn is_branch(w: u32) -> bool {
    matches!(w >> 26, 0x01..=0x05 | 0x30..=0x3d)
}

fn may_write_v0(w: u32) -> bool {
    (w >> 21) & 0x1f == V0 || w & 0x1f == V0
}

/// Word displacement of a branch at `from` to `to`.
fn disp(from: u64, to: u64) -> Option<i32> {
    let delta = to.wrapping_sub(from + 4) as i64;
    ((-REACH..REACH).contains(&delta) && delta % 4 == 0).then_some((delta / 4) as i32)
}

impl TrampolineBuilder for Sw64 {
    const ARCH: Arch = Arch::Sw64;

    const STUB_SIZE: usize = 320;

    const ABI: FrameAbi = FrameAbi {
        words: 33,
        frame_size: FRAME as usize,
        nr: slot(V0) as usize,
        args: [30, 31, 32, 16, 17, 18],
        result: slot(V0) as usize,
        error_flag: Some(slot(19) as usize),
        sp: SP_SLOT as usize,
        pc: PC_SLOT as usize,
        ra: Some(slot(RA) as usize),
        fpregs_size: 32 * 8,
        syscall_base: 0,
    };

    // vfork, sigreturn, clone, rt_sigreturn
    const EXCLUDED: &'static [u32] = &[66, 103, 312, 351];

    fn scan(&self, code: &[u8], base: u64) -> Vec<Site> {
        let mut sites = Vec::new();

        for i in 0..code.len() / 4 {
            if word_at(code, i * 4) != Some(SYS_CALL) {
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
                if is_branch(w) || may_write_v0(w) {
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
                patch_addr: addr,
                patch_len: 4,
                displaced: None,
                resume: addr + 4,
            });
        }

        sites
    }

    fn reachable(&self, site: &Site, target: u64) -> bool {
        disp(site.patch_addr, target).is_some()
            && disp(target + Self::STUB_SIZE as u64, site.resume).is_some()
    }

    fn patch(&self, site: &Site, trampoline: u64) -> Result<Vec<u8>, BuildError> {
        if trampoline % 4 != 0 {
            return Err(BuildError::Misaligned(trampoline));
        }
        let d = disp(site.patch_addr, trampoline).ok_or(BuildError::OutOfRange {
            from: site.patch_addr,
            to: trampoline,
        })?;
        Ok(enc::br(ZERO, d).to_le_bytes().to_vec())
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
        let here = |out: &Vec<u8>| trampoline + (out.len() - start) as u64;
        let frame = FRAME as i16;

        emit32(out, &[enc::ldi(SP, SP, -frame)]);
        for r in 0..30 {
            emit32(out, &[enc::stl(r, SP, (slot(r) * 8) as i16)]);
        }
        emit32(
            out,
            &[
                enc::ldi(T0, SP, frame),
                enc::stl(T0, SP, (SP_SLOT * 8) as i16),
                enc::stl(ZERO, SP, (PS_SLOT * 8) as i16),
            ],
        );

        // The pool must be 8 byte aligned for ldl.
        if (here(out) + 4) % 8 != 0 {
            emit32(out, &[NOP]);
        }
        emit32(out, &[enc::br(T0, 4)]);
        out.extend_from_slice(&site.resume.to_le_bytes());
        out.extend_from_slice(&dispatcher.to_le_bytes());

        emit32(
            out,
            &[
                enc::ldl(T1, T0, 0),
                enc::stl(T1, SP, (PC_SLOT * 8) as i16),
                enc::ldl(T12, T0, 8),
                enc::ldi(A0, SP, 0),
                enc::call(RA, T12),
            ],
        );

        // v0 holds the result.
        for r in 1..30 {
            emit32(out, &[enc::ldl(r, SP, (slot(r) * 8) as i16)]);
        }
        emit32(out, &[enc::ldi(SP, SP, frame)]);

        let at = here(out);
        let d = disp(at, site.resume).ok_or(BuildError::OutOfRange {
            from: at,
            to: site.resume,
        })?;
        emit32(out, &[enc::br(ZERO, d)]);

        debug_assert!(out.len() - start <= Self::STUB_SIZE);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const BASE: u64 = 0x0000_0200_0000_0000;

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

    #[test]
    fn encodings() {
        assert_eq!(enc::ldi(SP, SP, -272), 0xfbde_fef0);
        assert_eq!(enc::ldi(A0, SP, 0), 0xfa1e_0000);
        assert_eq!(enc::ldi(ZERO, ZERO, 0), NOP);
        assert_eq!(enc::call(RA, T12), 0x075b_0000);
        assert_eq!(enc::br(ZERO, 0), 0x13e0_0000);
        assert_eq!(enc::br(ZERO, -1), 0x13ff_ffff);
        assert_eq!(li_v0(0xf81f_0014), Some(20));
    }

    #[test]
    fn register_slots_are_a_permutation() {
        let mut seen = [false; 33];
        for r in 0..=30 {
            let s = slot(r) as usize;
            assert!(!seen[s], "slot {} used twice", s);
            seen[s] = true;
        }
        assert!(!seen[PS_SLOT as usize] && !seen[PC_SLOT as usize]);
        assert_eq!(slot(16), 30);
        assert_eq!(slot(19), 16);
        assert_eq!(slot(26), 23);
    }

    #[test]
    fn scan_and_patch() {
        let mut code = bytes(&[
            enc::ldi(V0, ZERO, 20), // getxpid
            SYS_CALL,
            enc::ldi(V0, ZERO, 312), // clone
            SYS_CALL,
            enc::ldi(V0, ZERO, 3), // read
            enc::ldi(A0, SP, 8),
            SYS_CALL,
        ]);
        let sites = Sw64.scan(&code, BASE);
        let found: Vec<(u32, u64)> = sites.iter().map(|s| (s.nr, s.syscall - BASE)).collect();
        assert_eq!(found, vec![(20, 4), (3, 24)]);

        let trampoline = BASE + 0x1000;
        for site in &sites {
            let patch = Sw64.patch(site, trampoline).unwrap();
            let at = (site.patch_addr - BASE) as usize;
            code[at..at + 4].copy_from_slice(&patch);
        }
        assert_eq!(words(&code)[1], enc::br(ZERO, (0x1000 - 8) / 4));
        assert_eq!(words(&code)[3], SYS_CALL);
        assert!(Sw64.scan(&code, BASE).is_empty());

        assert!(!Sw64.reachable(&sites[0], BASE + (8 << 20)));
    }

    #[test]
    fn trampoline_layout() {
        let site = Sw64.scan(&bytes(&[enc::ldi(V0, ZERO, 20), SYS_CALL]), BASE)[0];
        let trampoline = BASE + 0x4000;
        let dispatcher = 0x0000_0120_0000_1000;
        let mut out = Vec::new();
        Sw64.build(&site, trampoline, dispatcher, &mut out).unwrap();
        assert!(out.len() <= Sw64::STUB_SIZE);

        let w = words(&out);
        assert_eq!(w[0], enc::ldi(SP, SP, -272));
        let br = w.iter().position(|x| *x == enc::br(T0, 4)).unwrap();
        let pool = (br + 1) * 4;
        assert_eq!((trampoline + pool as u64) % 8, 0);
        assert_eq!(&out[pool..pool + 8], &site.resume.to_le_bytes());
        assert_eq!(&out[pool + 8..pool + 16], &dispatcher.to_le_bytes());
        assert_eq!(w[br + 5], enc::ldl(T1, T0, 0));
        assert!(w.contains(&enc::call(RA, T12)));
        assert!(!w.contains(&enc::ldl(V0, SP, 0)));

        let n = w.len();
        let at = trampoline + (n as u64 - 1) * 4;
        assert_eq!(w[n - 1], enc::br(ZERO, disp(at, site.resume).unwrap()));
    }
}
