/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Rewrites syscall sites to branch into generated trampolines.

use emd_print::debug;
use emd_trampoline::find_gap;
use emd_trampoline::Site;
use emd_trampoline::TrampolineBuilder;

use crate::config::DEBUG_SYSCALL;
use crate::elf::InterceptDesc;
use crate::raw;
use crate::Error;
use crate::Result;

/// Size of one trampoline region.
pub const REGION_SIZE: usize = 64 * 1024;

/// Trampolines start on this boundary.
const STUB_ALIGN: u64 = 16;

const RWX: i32 = libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC;
const RX: i32 = libc::PROT_READ | libc::PROT_EXEC;

#[derive(Debug, Clone, Copy)]
struct Region {
    start: u64,
    end: u64,
    cursor: u64,
}

/// Places trampolines and patches sites for one instruction set.
///
/// Regions are allocated in free gaps of the address space close enough to
/// each site for a direct branch. A trampoline is always complete before
/// the branch to it is written, so a site is consistent at every instant.
pub struct PatchEngine<B> {
    builder: B,
    dispatcher: u64,
    page: u64,
    /// Sorted `[start, end)` of everything mapped, including our regions.
    maps: Vec<(u64, u64)>,
    regions: Vec<Region>,
    scratch: Vec<u8>,
    patched: usize,
}

impl<B: TrampolineBuilder> PatchEngine<B> {
    /// `maps` is a snapshot of the address space. Trampolines call
    /// `dispatcher`.
    pub fn new(builder: B, dispatcher: u64, page: u64, mut maps: Vec<(u64, u64)>) -> Self {
        maps.sort_unstable();
        Self {
            builder,
            dispatcher,
            page: page.max(1),
            maps,
            regions: Vec::new(),
            scratch: Vec::with_capacity(B::STUB_SIZE),
            patched: 0,
        }
    }

    pub fn builder(&self) -> &B {
        &self.builder
    }

    /// Number of sites patched so far.
    pub fn patched(&self) -> usize {
        self.patched
    }

    /// Finds the sites in loaded code `[start, end)`. Sites patched earlier
    /// no longer look like syscall sites and are not reported again.
    ///
    /// # Safety
    ///
    /// The range must be mapped and readable.
    pub unsafe fn scan(&self, start: u64, end: u64) -> Vec<Site> {
        if end <= start {
            return Vec::new();
        }
        let code = core::slice::from_raw_parts(start as *const u8, (end - start) as usize);
        self.builder.scan(code, start)
    }

    /// Scans and patches one module. Stops at the first site that fails and
    /// returns how many sites were patched.
    ///
    /// # Safety
    ///
    /// `desc` must describe code loaded in this process.
    pub unsafe fn patch_module(&mut self, desc: &InterceptDesc) -> usize {
        let sites = self.scan(desc.text_start, desc.text_end);
        let patched = self.patch_sites(&sites);
        debug!(
            DEBUG_SYSCALL,
            "{}: {} of {} sites patched",
            desc.path.display(),
            patched,
            sites.len()
        );
        patched
    }

    /// Patches `sites` in order. Returns how many were patched before the
    /// first failure, which ends the walk.
    ///
    /// # Safety
    ///
    /// Every site must describe code loaded in this process.
    pub unsafe fn patch_sites(&mut self, sites: &[Site]) -> usize {
        let mut count = 0;
        for site in sites {
            if let Err(err) = self.patch_site(site) {
                debug!(
                    DEBUG_SYSCALL,
                    "patching syscall {} at {:#x} failed: {}", site.nr, site.syscall, err
                );
                break;
            }
            count += 1;
        }
        count
    }

    /// Builds the trampoline for `site` and then redirects the site to it.
    ///
    /// # Safety
    ///
    /// The site must describe code loaded in this process.
    pub unsafe fn patch_site(&mut self, site: &Site) -> Result<()> {
        let index = self.region_for(site)?;
        let trampoline = self.regions[index].cursor;

        self.scratch.clear();
        self.builder
            .build(site, trampoline, self.dispatcher, &mut self.scratch)?;
        let branch = self.builder.patch(site, trampoline)?;
        if branch.len() > site.patch_len || self.scratch.len() > B::STUB_SIZE {
            return Err(Error::Unsupported);
        }

        core::ptr::copy_nonoverlapping(
            self.scratch.as_ptr(),
            trampoline as *mut u8,
            self.scratch.len(),
        );
        flush_icache(trampoline, self.scratch.len());
        let region = &mut self.regions[index];
        region.cursor = align_up(trampoline + self.scratch.len() as u64, STUB_ALIGN);

        self.write_code(site.patch_addr, &branch)?;
        self.patched += 1;
        Ok(())
    }

    /// Copies `bytes` over code at `addr`, lifting write protection for the
    /// duration.
    unsafe fn write_code(&self, addr: u64, bytes: &[u8]) -> Result<()> {
        let first = addr & !(self.page - 1);
        let last = (addr + bytes.len() as u64 + self.page - 1) & !(self.page - 1);
        let len = (last - first) as usize;

        raw::mprotect(first, len, RWX)?;
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
        flush_icache(addr, bytes.len());
        raw::mprotect(first, len, RX)?;
        Ok(())
    }

    /// A region with room for one more trampoline reachable from `site`.
    unsafe fn region_for(&mut self, site: &Site) -> Result<usize> {
        let stub = B::STUB_SIZE as u64;
        let found = self.regions.iter().position(|r| {
            r.cursor + stub <= r.end && self.builder.reachable(site, r.cursor)
        });
        if let Some(index) = found {
            return Ok(index);
        }

        let builder = &self.builder;
        let start = find_gap(&self.maps, site.patch_addr, REGION_SIZE as u64, self.page, |addr| {
            builder.reachable(site, addr)
        })
        .ok_or(Error::NoReachableRegion(site.patch_addr))?;

        let addr = raw::mmap(
            start,
            REGION_SIZE,
            RWX,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
            -1,
            0,
        )?;
        if addr != start {
            // Kernels without MAP_FIXED_NOREPLACE treat the address as a hint.
            let _ = raw::munmap(addr, REGION_SIZE);
            return Err(Error::NoReachableRegion(site.patch_addr));
        }

        let end = start + REGION_SIZE as u64;
        let at = self.maps.partition_point(|m| m.0 < start);
        self.maps.insert(at, (start, end));
        self.regions.push(Region {
            start,
            end,
            cursor: start,
        });
        debug!(DEBUG_SYSCALL, "trampoline region {:#x}-{:#x}", start, end);
        Ok(self.regions.len() - 1)
    }

    /// Drops write access to every trampoline region.
    pub fn seal(&self) -> Result<()> {
        for region in &self.regions {
            unsafe { raw::mprotect(region.start, (region.end - region.start) as usize, RX)? };
        }
        Ok(())
    }
}

const fn align_up(v: u64, align: u64) -> u64 {
    (v + align - 1) & !(align - 1)
}

#[cfg(target_arch = "aarch64")]
fn flush_icache(addr: u64, len: usize) {
    use core::arch::asm;

    let ctr: u64;
    unsafe { asm!("mrs {}, ctr_el0", out(reg) ctr) };
    let dline = 4u64 << ((ctr >> 16) & 0xf);
    let iline = 4u64 << (ctr & 0xf);
    let end = addr + len as u64;

    let mut p = addr & !(dline - 1);
    while p < end {
        unsafe { asm!("dc cvau, {}", in(reg) p) };
        p += dline;
    }
    unsafe { asm!("dsb ish") };
    let mut p = addr & !(iline - 1);
    while p < end {
        unsafe { asm!("ic ivau, {}", in(reg) p) };
        p += iline;
    }
    unsafe { asm!("dsb ish", "isb") };
}

#[cfg(target_arch = "mips64")]
fn flush_icache(addr: u64, len: usize) {
    // BCACHE: both instruction and data caches.
    const BCACHE: u64 = 3;
    raw::syscall(
        syscalls::Sysno::cacheflush as u64,
        [addr, len as u64, BCACHE, 0, 0, 0],
    );
}

#[cfg(not(any(target_arch = "aarch64", target_arch = "mips64")))]
fn flush_icache(_addr: u64, _len: usize) {}

#[cfg(all(test, target_arch = "x86_64"))]
mod test {
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::Ordering;

    use emd_trampoline::x86_64::X86_64;
    use memmap2::MmapMut;

    use super::*;

    static SEEN: AtomicU64 = AtomicU64::new(0);

    extern "C" fn fake_dispatcher(frame: *mut u64) -> u64 {
        let slots = unsafe { core::slice::from_raw_parts(frame, X86_64::ABI.words) };
        SEEN.store(slots[X86_64::ABI.nr], Ordering::SeqCst);
        4242
    }

    const GETPID: &[u8] = &[0xb8, 0x27, 0, 0, 0, 0x0f, 0x05, 0xc3];
    const CLONE: &[u8] = &[0xb8, 0x38, 0, 0, 0, 0x0f, 0x05, 0xc3];

    fn page() -> u64 {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
    }

    /// Two tiny functions in their own executable page.
    fn code_page() -> memmap2::Mmap {
        let mut map = MmapMut::map_anon(page() as usize).unwrap();
        map[..GETPID.len()].copy_from_slice(GETPID);
        map[64..64 + CLONE.len()].copy_from_slice(CLONE);
        map.make_exec().unwrap()
    }

    fn engine() -> PatchEngine<X86_64> {
        let maps = crate::maps::snapshot()
            .unwrap()
            .iter()
            .map(|m| (m.start, m.end))
            .collect();
        PatchEngine::new(X86_64, fake_dispatcher as usize as u64, page(), maps)
    }

    #[test]
    fn patched_site_runs_through_trampoline() {
        let code = code_page();
        let base = code.as_ptr() as u64;
        let mut engine = engine();

        let sites = unsafe { engine.scan(base, base + 128) };
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].nr, 39);
        assert_eq!(unsafe { engine.patch_sites(&sites) }, 1);
        engine.seal().unwrap();

        assert_eq!(code[0], 0xe9);
        assert_eq!(&code[64..64 + CLONE.len()], CLONE);

        let f: extern "C" fn() -> u64 = unsafe { core::mem::transmute(base as usize) };
        assert_eq!(f(), 4242);
        assert_eq!(SEEN.load(Ordering::SeqCst), 39);

        // Nothing left to patch.
        assert!(unsafe { engine.scan(base, base + 128) }.is_empty());
    }

    extern "C" fn clobbering_dispatcher(_frame: *mut u64) -> u64 {
        unsafe {
            core::arch::asm!(
                "xorps xmm0, xmm0",
                "pcmpeqd xmm1, xmm1",
                out("xmm0") _,
                out("xmm1") _,
            )
        };
        0
    }

    #[test]
    fn vector_registers_survive_the_dispatcher() {
        const ROUND_TRIP: &[u8] = &[
            0x66, 0x48, 0x0f, 0x6e, 0xc7, // movq xmm0, rdi
            0xb8, 0x27, 0, 0, 0, 0x0f, 0x05, // getpid
            0x66, 0x48, 0x0f, 0x7e, 0xc0, // movq rax, xmm0
            0xc3,
        ];
        let mut map = MmapMut::map_anon(page() as usize).unwrap();
        map[..ROUND_TRIP.len()].copy_from_slice(ROUND_TRIP);
        let code = map.make_exec().unwrap();
        let base = code.as_ptr() as u64;

        let maps = crate::maps::snapshot()
            .unwrap()
            .iter()
            .map(|m| (m.start, m.end))
            .collect();
        let mut engine = PatchEngine::new(
            X86_64,
            clobbering_dispatcher as usize as u64,
            page(),
            maps,
        );
        let sites = unsafe { engine.scan(base, base + ROUND_TRIP.len() as u64) };
        assert_eq!(sites.len(), 1);
        assert_eq!(unsafe { engine.patch_sites(&sites) }, 1);
        engine.seal().unwrap();
        assert_eq!(code[5], 0xe9);

        let f: extern "C" fn(u64) -> u64 = unsafe { core::mem::transmute(base as usize) };
        assert_eq!(f(0x1234_5678_9abc_def0), 0x1234_5678_9abc_def0);
    }

    #[test]
    fn trampolines_share_a_region() {
        let first = code_page();
        let second = code_page();
        let mut engine = engine();

        for code in [&first, &second] {
            let base = code.as_ptr() as u64;
            let sites = unsafe { engine.scan(base, base + 128) };
            assert_eq!(unsafe { engine.patch_sites(&sites) }, 1);
        }
        assert_eq!(engine.patched(), 2);
        assert_eq!(engine.regions.len(), 1);
        let region = engine.regions[0];
        let used = region.cursor - region.start;
        assert!(used > X86_64::STUB_SIZE as u64 && used <= 2 * X86_64::STUB_SIZE as u64);
        assert_eq!(used % STUB_ALIGN, 0);
    }
}
