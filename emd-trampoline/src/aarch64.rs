/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! AArch64: `mov x8, #nr` followed within a few instructions by `svc #0`.
//!
//! The `svc` is replaced by a `b` to the trampoline. The frame mirrors
//! `user_pt_regs`: x0 to x30, sp, pc, pstate. Below it the trampoline
//! keeps q0 to q31, fpsr and fpcr while the dispatcher runs.

use crate::emit32;
use crate::word_at;
use crate::Arch;
use crate::BuildError;
use crate::FrameAbi;
use crate::Site;
use crate::TrampolineBuilder;

#[derive(Debug, Clone, Copy, Default)]
pub struct Aarch64;

pub const SVC0: u32 = 0xd400_0001;
pub const NOP: u32 = 0xd503_201f;

const FRAME: u32 = 272;
const SP: u32 = 31;

const X30_OFF: u32 = 240;
const SP_OFF: u32 = 248;
const PC_OFF: u32 = 256;
const PSTATE_OFF: u32 = 264;

/// fpsr and fpcr, then q0 to q31.
const VFRAME: u32 = 16 + 32 * 16;
const Q_OFF: u32 = 16;

/// How far back from the `svc` the syscall number may be loaded.
const LOOKBACK: usize = 6;

/// Branch range of `b`: 26 bits of words.
const REACH: i64 = 128 << 20;

/// Instruction encoders.
pub mod enc {
    pub const fn sub_imm(rd: u32, rn: u32, imm: u32) -> u32 {
        0xd100_0000 | imm << 10 | rn << 5 | rd
    }

    pub const fn add_imm(rd: u32, rn: u32, imm: u32) -> u32 {
        0x9100_0000 | imm << 10 | rn << 5 | rd
    }

    pub const fn stp(rt: u32, rt2: u32, rn: u32, off: u32) -> u32 {
        0xa900_0000 | (off / 8) << 15 | rt2 << 10 | rn << 5 | rt
    }

    pub const fn ldp(rt: u32, rt2: u32, rn: u32, off: u32) -> u32 {
        0xa940_0000 | (off / 8) << 15 | rt2 << 10 | rn << 5 | rt
    }

    /// `stp qt, qt2, [rn, #off]`
    pub const fn stp_q(rt: u32, rt2: u32, rn: u32, off: u32) -> u32 {
        0xad00_0000 | (off / 16) << 15 | rt2 << 10 | rn << 5 | rt
    }

    /// `ldp qt, qt2, [rn, #off]`
    pub const fn ldp_q(rt: u32, rt2: u32, rn: u32, off: u32) -> u32 {
        0xad40_0000 | (off / 16) << 15 | rt2 << 10 | rn << 5 | rt
    }

    pub const fn str(rt: u32, rn: u32, off: u32) -> u32 {
        0xf900_0000 | (off / 8) << 10 | rn << 5 | rt
    }

    pub const fn ldr(rt: u32, rn: u32, off: u32) -> u32 {
        0xf940_0000 | (off / 8) << 10 | rn << 5 | rt
    }

    pub const fn movz(rd: u32, imm: u16, hw: u32) -> u32 {
        0xd280_0000 | hw << 21 | (imm as u32) << 5 | rd
    }

    pub const fn movk(rd: u32, imm: u16, hw: u32) -> u32 {
        0xf280_0000 | hw << 21 | (imm as u32) << 5 | rd
    }

    pub const fn blr(rn: u32) -> u32 {
        0xd63f_0000 | rn << 5
    }

    /// `mrs xt, nzcv`
    pub const fn mrs_nzcv(rt: u32) -> u32 {
        0xd53b_4200 | rt
    }

    /// `msr nzcv, xt`
    pub const fn msr_nzcv(rt: u32) -> u32 {
        0xd51b_4200 | rt
    }

    pub const fn mrs_fpcr(rt: u32) -> u32 {
        0xd53b_4400 | rt
    }

    pub const fn msr_fpcr(rt: u32) -> u32 {
        0xd51b_4400 | rt
    }

    pub const fn mrs_fpsr(rt: u32) -> u32 {
        0xd53b_4420 | rt
    }

    pub const fn msr_fpsr(rt: u32) -> u32 {
        0xd51b_4420 | rt
    }

    /// `b` by a byte offset.
    pub const fn b(offset: i64) -> u32 {
        0x1400_0000 | ((offset >> 2) as u32 & 0x03ff_ffff)
    }
}

/// Loads a 64-bit constant into `rd`.
fn load_imm64(out: &mut Vec<u8>, rd: u32, value: u64) {
    emit32(
        out,
        &[
            enc::movz(rd, value as u16, 0),
            enc::movk(rd, (value >> 16) as u16, 1),
            enc::movk(rd, (value >> 32) as u16, 2),
            enc::movk(rd, (value >> 48) as u16, 3),
        ],
    );
}

/// `movz x8, #imm` or `movz w8, #imm`.
fn mov_x8_imm(w: u32) -> Option<u32> {
    let is_movz = (w & 0xffe0_001f) == 0xd280_0008 || (w & 0xffe0_001f) == 0x5280_0008;
    is_movz.then_some((w >> 5) & 0xffff)
}

fn is_branch(w: u32) -> bool {
    (w & 0x7c00_0000) == 0x1400_0000 // b, bl
        || (w & 0x7e00_0000) == 0x3400_0000 // cbz, cbnz
        || (w & 0x7e00_0000) == 0x3600_0000 // tbz, tbnz
        || (w & 0xff00_0010) == 0x5400_0000 // b.cond
        || (w & 0xfe00_0000) == 0xd600_0000 // br, blr, ret
        || w == SVC0
}

fn in_range(from: u64, to: u64) -> bool {
    let delta = to.wrapping_sub(from) as i64;
    (-REACH..REACH).contains(&delta) && delta % 4 == 0
}

impl TrampolineBuilder for Aarch64 {
    const ARCH: Arch = Arch::Aarch64;

    const STUB_SIZE: usize = 384;

    const ABI: FrameAbi = FrameAbi {
        words: 34,
        frame_size: FRAME as usize,
        nr: 8,
        args: [0, 1, 2, 3, 4, 5],
        result: 0,
        error_flag: None,
        sp: 31,
        pc: 32,
        ra: Some(30),
        fpregs_size: 66 * 8,
        syscall_base: 0,
    };

    // tgkill, rt_sigreturn, clone, clone3
    const EXCLUDED: &'static [u32] = &[131, 139, 220, 435];

    fn scan(&self, code: &[u8], base: u64) -> Vec<Site> {
        let mut sites = Vec::new();
        let words = code.len() / 4;

        for i in 0..words {
            if word_at(code, i * 4) != Some(SVC0) {
                continue;
            }
            let mut nr = None;
            for back in 1..=LOOKBACK.min(i) {
                let Some(w) = word_at(code, (i - back) * 4) else {
                    break;
                };
                if let Some(imm) = mov_x8_imm(w) {
                    nr = Some(imm);
                    break;
                }
                // x8 is computed some other way, or control flow joins here.
                if is_branch(w) || (w & 0x1f) == 8 {
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
        in_range(site.patch_addr, target)
            && in_range(target + Self::STUB_SIZE as u64, site.resume)
    }

    fn patch(&self, site: &Site, trampoline: u64) -> Result<Vec<u8>, BuildError> {
        if trampoline % 4 != 0 {
            return Err(BuildError::Misaligned(trampoline));
        }
        if !in_range(site.patch_addr, trampoline) {
            return Err(BuildError::OutOfRange {
                from: site.patch_addr,
                to: trampoline,
            });
        }
        let offset = trampoline.wrapping_sub(site.patch_addr) as i64;
        Ok(enc::b(offset).to_le_bytes().to_vec())
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

        emit32(out, &[enc::sub_imm(SP, SP, FRAME)]);
        for r in (0..30).step_by(2) {
            emit32(out, &[enc::stp(r, r + 1, SP, r * 8)]);
        }
        emit32(
            out,
            &[
                enc::str(30, SP, X30_OFF),
                enc::add_imm(9, SP, FRAME),
                enc::str(9, SP, SP_OFF),
            ],
        );
        load_imm64(out, 10, site.resume);
        emit32(
            out,
            &[
                enc::str(10, SP, PC_OFF),
                enc::mrs_nzcv(9),
                enc::str(9, SP, PSTATE_OFF),
                enc::sub_imm(SP, SP, VFRAME),
            ],
        );
        for q in (0..32).step_by(2) {
            emit32(out, &[enc::stp_q(q, q + 1, SP, Q_OFF + q * 16)]);
        }
        emit32(
            out,
            &[
                enc::mrs_fpsr(9),
                enc::mrs_fpcr(10),
                enc::stp(9, 10, SP, 0),
                enc::add_imm(0, SP, VFRAME),
            ],
        );
        load_imm64(out, 9, dispatcher);
        emit32(out, &[enc::blr(9)]);

        // x0 holds the result.
        emit32(
            out,
            &[
                enc::ldp(9, 10, SP, 0),
                enc::msr_fpsr(9),
                enc::msr_fpcr(10),
            ],
        );
        for q in (0..32).step_by(2) {
            emit32(out, &[enc::ldp_q(q, q + 1, SP, Q_OFF + q * 16)]);
        }
        emit32(
            out,
            &[
                enc::add_imm(SP, SP, VFRAME),
                enc::ldr(9, SP, PSTATE_OFF),
                enc::msr_nzcv(9),
                enc::ldr(1, SP, 8),
            ],
        );
        for r in (2..30).step_by(2) {
            emit32(out, &[enc::ldp(r, r + 1, SP, r * 8)]);
        }
        emit32(
            out,
            &[enc::ldr(30, SP, X30_OFF), enc::add_imm(SP, SP, FRAME)],
        );

        let at = trampoline + (out.len() - start) as u64;
        if !in_range(at, site.resume) {
            return Err(BuildError::OutOfRange {
                from: at,
                to: site.resume,
            });
        }
        emit32(out, &[enc::b(site.resume.wrapping_sub(at) as i64)]);

        debug_assert!(out.len() - start <= Self::STUB_SIZE);
        Ok(())
    }
}
