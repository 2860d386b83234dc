/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! x86-64: `mov eax, imm32; syscall` sites.
//!
//! The 5 byte `mov` is replaced by `jmp rel32`. The `syscall` instruction
//! behind it is left alone and simply never reached. The trampoline replays
//! the `mov`, builds a `user_regs_struct` with pushes and calls the
//! dispatcher on an aligned stack. The x87 and SSE state is kept in an
//! `fxsave64` area below the frame for the duration of the call.

use iced_x86::Code;
use iced_x86::Decoder;
use iced_x86::DecoderOptions;
use iced_x86::Instruction;
use iced_x86::Mnemonic;
use iced_x86::Register;
use syscalls::x86_64::Sysno;

use crate::Arch;
use crate::BuildError;
use crate::FrameAbi;
use crate::Site;
use crate::TrampolineBuilder;

#[derive(Debug, Clone, Copy, Default)]
pub struct X86_64;

const RED_ZONE: u32 = 128;

/// Bytes pushed to form the register frame: 27 slots.
const FRAME_BYTES: u32 = 27 * 8;

/// Size of the `fxsave64` area.
const FXSAVE_BYTES: u32 = 512;

// Slot indices in `user_regs_struct`.
const R10: usize = 7;
const R9: usize = 8;
const R8: usize = 9;
const RAX: usize = 10;
const RDX: usize = 12;
const RSI: usize = 13;
const RDI: usize = 14;
const ORIG_RAX: usize = 15;
const RIP: usize = 16;
const RSP: usize = 19;

/// Pushes for `orig_rax` down to `r15`, in order.
const PUSH_GPRS: &[u8] = &[
    0x50, // push rax (orig_rax)
    0x57, // push rdi
    0x56, // push rsi
    0x52, // push rdx
    0x51, // push rcx
    0x50, // push rax
    0x41, 0x50, // push r8
    0x41, 0x51, // push r9
    0x41, 0x52, // push r10
    0x41, 0x53, // push r11
    0x53, // push rbx
    0x55, // push rbp
    0x41, 0x54, // push r12
    0x41, 0x55, // push r13
    0x41, 0x56, // push r14
    0x41, 0x57, // push r15
];

/// Pops for `r15` up to `r8`.
const POP_LOW: &[u8] = &[
    0x41, 0x5f, // pop r15
    0x41, 0x5e, // pop r14
    0x41, 0x5d, // pop r13
    0x41, 0x5c, // pop r12
    0x5d, // pop rbp
    0x5b, // pop rbx
    0x41, 0x5b, // pop r11
    0x41, 0x5a, // pop r10
    0x41, 0x59, // pop r9
    0x41, 0x58, // pop r8
];

const POP_ARGS: &[u8] = &[
    0x59, // pop rcx
    0x5a, // pop rdx
    0x5e, // pop rsi
    0x5f, // pop rdi
];

fn mov_eax_imm(insn: &Instruction) -> Option<u32> {
    (insn.code() == Code::Mov_r32_imm32 && insn.op0_register() == Register::EAX && insn.len() == 5)
        .then(|| insn.immediate32())
}

/// Highest syscall number in the x86-64 table.
fn max_nr() -> u32 {
    Sysno::last().id() as u32
}

fn rel32(from: u64, to: u64) -> Option<i32> {
    i32::try_from(to.wrapping_sub(from) as i64).ok()
}

/// `lea r11, [rsp + disp32]`
fn lea_r11_rsp(out: &mut Vec<u8>, disp: u32) {
    out.extend_from_slice(&[0x4c, 0x8d, 0x9c, 0x24]);
    out.extend_from_slice(&disp.to_le_bytes());
}

/// `mov [rsp + disp32], r11`
fn store_r11(out: &mut Vec<u8>, disp: u32) {
    out.extend_from_slice(&[0x4c, 0x89, 0x9c, 0x24]);
    out.extend_from_slice(&disp.to_le_bytes());
}

impl TrampolineBuilder for X86_64 {
    const ARCH: Arch = Arch::X86_64;

    const STUB_SIZE: usize = 208;

    const ABI: FrameAbi = FrameAbi {
        words: 27,
        frame_size: 27 * 8,
        nr: ORIG_RAX,
        args: [RDI, RSI, RDX, R10, R8, R9],
        result: RAX,
        error_flag: None,
        sp: RSP,
        pc: RIP,
        ra: None,
        fpregs_size: 512,
        syscall_base: 0,
    };

    // rt_sigreturn, clone, vfork, clone3
    const EXCLUDED: &'static [u32] = &[15, 56, 58, 435];

    fn scan(&self, code: &[u8], base: u64) -> Vec<Site> {
        let mut decoder = Decoder::with_ip(64, code, base, DecoderOptions::NONE);
        let mut insn = Instruction::default();
        let mut prev: Option<Instruction> = None;
        let mut sites = Vec::new();

        while decoder.can_decode() {
            decoder.decode_out(&mut insn);
            if insn.is_invalid() {
                prev = None;
                continue;
            }
            if insn.mnemonic() == Mnemonic::Syscall {
                let nr = prev
                    .filter(|p| p.next_ip() == insn.ip())
                    .and_then(|p| mov_eax_imm(&p).map(|nr| (p, nr)));
                if let Some((mov, nr)) = nr {
                    // Numbers with the x32 bit or beyond the table are left alone.
                    if nr <= max_nr() && !self.is_excluded(nr) {
                        sites.push(Site {
                            syscall: insn.ip(),
                            nr,
                            patch_addr: mov.ip(),
                            patch_len: mov.len(),
                            displaced: None,
                            resume: insn.next_ip(),
                        });
                    }
                }
            }
            prev = Some(insn);
        }

        sites
    }

    fn reachable(&self, site: &Site, target: u64) -> bool {
        rel32(site.patch_addr + 5, target).is_some()
            && rel32(target + Self::STUB_SIZE as u64, site.resume).is_some()
            && rel32(target, site.resume).is_some()
    }

    fn patch(&self, site: &Site, trampoline: u64) -> Result<Vec<u8>, BuildError> {
        let from = site.patch_addr + 5;
        let rel = rel32(from, trampoline).ok_or(BuildError::OutOfRange {
            from,
            to: trampoline,
        })?;
        let mut bytes = Vec::with_capacity(site.patch_len);
        bytes.push(0xe9);
        bytes.extend_from_slice(&rel.to_le_bytes());
        Ok(bytes)
    }

    fn build(
        &self,
        site: &Site,
        trampoline: u64,
        dispatcher: u64,
        out: &mut Vec<u8>,
    ) -> Result<(), BuildError> {
        let start = out.len();

        // lea rsp, [rsp - 128]
        out.extend_from_slice(&[0x48, 0x8d, 0x64, 0x24, 0x80]);
        // mov eax, nr
        out.push(0xb8);
        out.extend_from_slice(&site.nr.to_le_bytes());

        // gs, fs, es, ds, gs_base, fs_base, ss, rsp
        for _ in 0..8 {
            out.extend_from_slice(&[0x6a, 0x00]);
        }
        // pushfq; cld
        out.extend_from_slice(&[0x9c, 0xfc]);
        // cs, rip
        out.extend_from_slice(&[0x6a, 0x00, 0x6a, 0x00]);
        out.extend_from_slice(PUSH_GPRS);

        // Fill in the caller's stack pointer and the resume address.
        lea_r11_rsp(out, FRAME_BYTES + RED_ZONE);
        store_r11(out, (RSP * 8) as u32);
        out.extend_from_slice(&[0x49, 0xbb]);
        out.extend_from_slice(&site.resume.to_le_bytes());
        store_r11(out, (RIP * 8) as u32);

        // mov rbx, rsp; and rsp, -16
        out.extend_from_slice(&[0x48, 0x89, 0xe3, 0x48, 0x83, 0xe4, 0xf0]);
        // sub rsp, 512; fxsave64 [rsp]
        out.extend_from_slice(&[0x48, 0x81, 0xec]);
        out.extend_from_slice(&FXSAVE_BYTES.to_le_bytes());
        out.extend_from_slice(&[0x48, 0x0f, 0xae, 0x04, 0x24]);
        // mov rdi, rbx; mov rax, dispatcher; call rax
        out.extend_from_slice(&[0x48, 0x89, 0xdf, 0x48, 0xb8]);
        out.extend_from_slice(&dispatcher.to_le_bytes());
        out.extend_from_slice(&[0xff, 0xd0]);
        // fxrstor64 [rsp]; mov rsp, rbx
        out.extend_from_slice(&[0x48, 0x0f, 0xae, 0x0c, 0x24, 0x48, 0x89, 0xdc]);

        out.extend_from_slice(POP_LOW);
        // rax carries the result: skip its slot.
        out.extend_from_slice(&[0x48, 0x8d, 0x64, 0x24, 0x08]);
        out.extend_from_slice(POP_ARGS);
        // Skip orig_rax, rip and cs, then popfq.
        out.extend_from_slice(&[0x48, 0x8d, 0x64, 0x24, 0x18, 0x9d]);
        // Drop the remaining 8 slots and the red zone.
        out.extend_from_slice(&[0x48, 0x8d, 0xa4, 0x24]);
        out.extend_from_slice(&(8 * 8 + RED_ZONE).to_le_bytes());

        let from = trampoline + (out.len() - start) as u64 + 5;
        let rel = rel32(from, site.resume).ok_or(BuildError::OutOfRange {
            from,
            to: site.resume,
        })?;
        out.push(0xe9);
        out.extend_from_slice(&rel.to_le_bytes());

        debug_assert!(out.len() - start <= Self::STUB_SIZE);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use iced_x86::OpKind;

    use super::*;

    const BASE: u64 = 0x7f00_0000_1000;

    fn site_code() -> Vec<u8> {
        let mut code = Vec::new();
        code.extend_from_slice(&[0x55]); // push rbp
        code.extend_from_slice(&[0xb8, 0x27, 0, 0, 0, 0x0f, 0x05]); // getpid
        code.extend_from_slice(&[0xb8, 0x38, 0, 0, 0, 0x0f, 0x05]); // clone
        code.extend_from_slice(&[0xb8, 0x00, 0, 0, 0, 0x90, 0x0f, 0x05]); // not adjacent
        code.extend_from_slice(&[0x89, 0xf8, 0x0f, 0x05]); // mov eax, edi
        code.extend_from_slice(&[0xb8, 0x01, 0, 0, 0, 0x0f, 0x05]); // write
        code.push(0xc3);
        code
    }

    #[test]
    fn finds_constant_sites() {
        let sites = X86_64.scan(&site_code(), BASE);
        let nrs: Vec<u32> = sites.iter().map(|s| s.nr).collect();
        assert_eq!(nrs, vec![39, 1]);

        let getpid = sites[0];
        assert_eq!(getpid.patch_addr, BASE + 1);
        assert_eq!(getpid.patch_len, 5);
        assert_eq!(getpid.syscall, BASE + 6);
        assert_eq!(getpid.resume, BASE + 8);
    }

    #[test]
    fn unknown_numbers_are_skipped() {
        let mut code = Vec::new();
        for nr in [max_nr(), max_nr() + 1, 0x4000_0027] {
            code.push(0xb8);
            code.extend_from_slice(&nr.to_le_bytes());
            code.extend_from_slice(&[0x0f, 0x05]);
        }
        let nrs: Vec<u32> = X86_64.scan(&code, BASE).iter().map(|s| s.nr).collect();
        assert_eq!(nrs, vec![max_nr()]);
    }

    #[test]
    fn rescanning_patched_code_is_idempotent() {
        let mut code = site_code();
        let trampoline = BASE + 0x10_0000;
        for site in X86_64.scan(&code, BASE) {
            let patch = X86_64.patch(&site, trampoline).unwrap();
            let at = (site.patch_addr - BASE) as usize;
            code[at..at + patch.len()].copy_from_slice(&patch);
        }
        assert!(X86_64.scan(&code, BASE).is_empty());

        // The clone site is untouched.
        assert_eq!(&code[8..15], &[0xb8, 0x38, 0, 0, 0, 0x0f, 0x05]);
    }

    #[test]
    fn patch_jumps_to_trampoline() {
        let site = X86_64.scan(&site_code(), BASE)[0];
        let trampoline = BASE - 0x8000_0000 + 0x1000;
        let bytes = X86_64.patch(&site, trampoline).unwrap();
        let mut decoder = Decoder::with_ip(64, &bytes, site.patch_addr, DecoderOptions::NONE);
        let insn = decoder.decode();
        assert_eq!(insn.mnemonic(), Mnemonic::Jmp);
        assert_eq!(insn.near_branch_target(), trampoline);

        assert!(X86_64.reachable(&site, trampoline));
        assert!(!X86_64.reachable(&site, BASE + (3 << 30)));
        assert!(X86_64.patch(&site, BASE + (3 << 30)).is_err());
    }

    #[test]
    fn trampoline_shape() {
        let site = X86_64.scan(&site_code(), BASE)[0];
        let trampoline = BASE + 0x20_0000;
        let dispatcher = 0x5555_1234_5678;
        let mut code = Vec::new();
        X86_64.build(&site, trampoline, dispatcher, &mut code).unwrap();
        assert!(code.len() <= X86_64::STUB_SIZE);

        let mut decoder = Decoder::with_ip(64, &code, trampoline, DecoderOptions::NONE);
        let insns: Vec<Instruction> = decoder.iter().collect();
        assert!(insns.iter().all(|i| !i.is_invalid()));

        let first = insns[0];
        assert_eq!(first.code(), Code::Lea_r64_m);
        assert_eq!(first.memory_displacement64() as i64, -128);
        assert_eq!(mov_eax_imm(&insns[1]), Some(39));

        let count = |m: Mnemonic| insns.iter().filter(|i| i.mnemonic() == m).count();
        assert_eq!(count(Mnemonic::Push) + count(Mnemonic::Pushfq), 27);
        assert_eq!(count(Mnemonic::Pop), 14);
        assert_eq!(count(Mnemonic::Popfq), 1);
        assert_eq!(count(Mnemonic::Call), 1);

        // Vector state is saved before the call and restored after it.
        let at = |m: Mnemonic| insns.iter().position(|i| i.mnemonic() == m);
        let call = at(Mnemonic::Call).unwrap();
        let save = at(Mnemonic::Fxsave64).unwrap();
        let restore = at(Mnemonic::Fxrstor64).unwrap();
        assert!(save < call && call < restore);
        assert_eq!(insns[save].memory_base(), Register::RSP);
        assert_eq!(insns[save - 1].mnemonic(), Mnemonic::Sub);
        assert_eq!(insns[save - 1].immediate(1), FXSAVE_BYTES as u64);
        assert_eq!(insns[restore + 1].mnemonic(), Mnemonic::Mov);
        assert_eq!(insns[restore + 1].op0_register(), Register::RSP);

        let movabs: Vec<u64> = insns
            .iter()
            .filter(|i| i.op1_kind() == OpKind::Immediate64)
            .map(|i| i.immediate64())
            .collect();
        assert_eq!(movabs, vec![site.resume, dispatcher]);

        let last = insns.last().unwrap();
        assert_eq!(last.mnemonic(), Mnemonic::Jmp);
        assert_eq!(last.near_branch_target(), site.resume);
    }

    #[test]
    fn stack_is_balanced() {
        // Track rsp through the trampoline, ignoring the call itself.
        let site = X86_64.scan(&site_code(), BASE)[0];
        let mut code = Vec::new();
        X86_64.build(&site, BASE, 0x1000, &mut code).unwrap();

        let mut rsp: i64 = 0;
        let mut at_call = None;
        for insn in Decoder::with_ip(64, &code, BASE, DecoderOptions::NONE).iter() {
            match insn.mnemonic() {
                Mnemonic::Push | Mnemonic::Pushfq => rsp -= 8,
                Mnemonic::Pop | Mnemonic::Popfq => rsp += 8,
                Mnemonic::Lea if insn.op0_register() == Register::RSP => {
                    rsp += insn.memory_displacement64() as i64
                }
                Mnemonic::Call => at_call = Some(rsp),
                _ => {}
            }
        }
        assert_eq!(at_call, Some(-(FRAME_BYTES as i64) - RED_ZONE as i64));
        assert_eq!(rsp, 0);
    }
}
