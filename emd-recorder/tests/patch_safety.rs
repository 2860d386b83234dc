/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Patches a copy of the C library's code and checks that process creating
//! syscalls are left alone.

#![cfg(target_arch = "x86_64")]

use emd_recorder::elf;
use emd_recorder::patch::PatchEngine;
use emd_trampoline::x86_64::X86_64;
use emd_trampoline::TrampolineBuilder;
use memmap2::MmapMut;

extern "C" fn fake_dispatcher(_frame: *mut u64) -> u64 {
    0
}

fn page() -> u64 {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
}

/// Offsets of `mov eax, nr; syscall` for each excluded syscall number.
fn excluded_sites(code: &[u8]) -> Vec<usize> {
    code.windows(7)
        .enumerate()
        .filter(|(_, w)| {
            w[0] == 0xb8
                && w[5..7] == [0x0f, 0x05]
                && X86_64::EXCLUDED.contains(&u32::from_le_bytes([w[1], w[2], w[3], w[4]]))
        })
        .map(|(i, _)| i)
        .collect()
}

#[test]
fn libc_copy_keeps_clone_sites() {
    let libc = elf::loaded_modules()
        .into_iter()
        .find(|m| elf::short_name(&m.path) == "libc")
        .expect("libc is loaded");
    let text = elf::find_text(&libc.path, libc.bias).unwrap();
    assert!(!text.is_empty());

    let original = unsafe {
        core::slice::from_raw_parts(text.text_start as *const u8, text.len())
    }
    .to_vec();

    let mut copy = MmapMut::map_anon(original.len()).unwrap();
    copy.copy_from_slice(&original);
    let copy = copy.make_exec().unwrap();
    let base = copy.as_ptr() as u64;
    let end = base + copy.len() as u64;

    let maps = emd_recorder::maps::snapshot()
        .unwrap()
        .iter()
        .map(|m| (m.start, m.end))
        .collect();
    let mut engine = PatchEngine::new(X86_64, fake_dispatcher as usize as u64, page(), maps);

    let sites = unsafe { engine.scan(base, end) };
    assert!(!sites.is_empty(), "libc has syscall sites");
    assert!(sites.iter().all(|s| !X86_64::EXCLUDED.contains(&s.nr)));
    assert_eq!(unsafe { engine.patch_sites(&sites) }, sites.len());
    engine.seal().unwrap();

    for site in &sites {
        let offset = (site.patch_addr - base) as usize;
        assert_eq!(copy[offset], 0xe9, "site at {:#x} redirected", offset);
    }
    for offset in excluded_sites(&original) {
        assert_eq!(
            copy[offset..offset + 7],
            original[offset..offset + 7],
            "excluded site at {:#x} untouched",
            offset
        );
    }

    // Everything patchable has been patched.
    assert!(unsafe { engine.scan(base, end) }.is_empty());
}
