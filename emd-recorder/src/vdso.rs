/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Entry points of the vDSO, for calls that never reach a syscall site.

use core::ffi::c_int;
use core::ffi::c_void;

use object::Object as _;
use object::ObjectSegment as _;
use object::ObjectSymbol as _;

use crate::maps;
use crate::Error;
use crate::Result;

pub type ClockGettime = unsafe extern "C" fn(libc::clockid_t, *mut libc::timespec) -> c_int;
pub type Gettimeofday = unsafe extern "C" fn(*mut libc::timeval, *mut c_void) -> c_int;

#[cfg(target_arch = "aarch64")]
const CLOCK_GETTIME: &str = "__kernel_clock_gettime";
#[cfg(target_arch = "aarch64")]
const GETTIMEOFDAY: &str = "__kernel_gettimeofday";
#[cfg(not(target_arch = "aarch64"))]
const CLOCK_GETTIME: &str = "__vdso_clock_gettime";
#[cfg(not(target_arch = "aarch64"))]
const GETTIMEOFDAY: &str = "__vdso_gettimeofday";

/// The time functions exported by the vDSO. Either may be missing.
#[derive(Debug, Clone, Copy, Default)]
pub struct Vdso {
    pub clock_gettime: Option<ClockGettime>,
    pub gettimeofday: Option<Gettimeofday>,
}

impl Vdso {
    /// Parses the vDSO mapped into this process.
    pub fn resolve() -> Result<Self> {
        let map = maps::snapshot()?
            .into_iter()
            .find(|m| m.vdso)
            .ok_or(Error::Unsupported)?;
        // SAFETY: the vDSO stays mapped and unchanged for the life of the
        // process.
        let image = unsafe {
            core::slice::from_raw_parts(map.start as *const u8, (map.end - map.start) as usize)
        };
        Self::parse(image, map.start)
    }

    fn parse(image: &[u8], start: u64) -> Result<Self> {
        let object = object::File::parse(image)?;
        let low = object
            .segments()
            .map(|s| s.address())
            .min()
            .unwrap_or(0);
        let bias = start.wrapping_sub(low);

        let mut vdso = Self::default();
        for sym in object.dynamic_symbols() {
            let addr = bias.wrapping_add(sym.address()) as usize;
            match sym.name() {
                Ok(CLOCK_GETTIME) if sym.address() != 0 => {
                    vdso.clock_gettime = Some(unsafe { core::mem::transmute::<usize, ClockGettime>(addr) });
                }
                Ok(GETTIMEOFDAY) if sym.address() != 0 => {
                    vdso.gettimeofday = Some(unsafe { core::mem::transmute::<usize, Gettimeofday>(addr) });
                }
                _ => {}
            }
        }
        Ok(vdso)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    #[test]
    fn clock_gettime_through_vdso() {
        let vdso = Vdso::resolve().unwrap();
        let f = vdso.clock_gettime.expect("vdso exports clock_gettime");

        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        assert_eq!(unsafe { f(libc::CLOCK_MONOTONIC, &mut ts) }, 0);

        let mut now = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now) };
        assert!(now.tv_sec >= ts.tv_sec && now.tv_sec - ts.tv_sec < 5);
    }

    #[test]
    fn garbage_image() {
        assert!(Vdso::parse(&[0u8; 64], 0x1000).is_err());
    }
}
