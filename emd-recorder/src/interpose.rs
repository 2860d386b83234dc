/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Lookup of the definitions our interposed symbols shadow.

use core::ffi::CStr;
use core::sync::atomic::AtomicUsize;
use core::sync::atomic::Ordering;

/// The next definition of a symbol after ours in lookup order, resolved on
/// first use and cached.
pub struct NextSymbol {
    name: &'static CStr,
    addr: AtomicUsize,
}

impl NextSymbol {
    pub const fn new(name: &'static CStr) -> Self {
        Self {
            name,
            addr: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &'static CStr {
        self.name
    }

    /// Address of the next definition, or `None` if no later object
    /// defines it.
    pub fn get(&self) -> Option<usize> {
        match self.addr.load(Ordering::Acquire) {
            0 => {
                let addr = unsafe { libc::dlsym(libc::RTLD_NEXT, self.name.as_ptr()) } as usize;
                if addr != 0 {
                    self.addr.store(addr, Ordering::Release);
                }
                (addr != 0).then_some(addr)
            }
            addr => Some(addr),
        }
    }

    /// The next definition as a function pointer of type `F`.
    ///
    /// # Safety
    ///
    /// `F` must be a function pointer type matching the symbol's signature.
    pub unsafe fn get_fn<F: Copy>(&self) -> Option<F> {
        debug_assert_eq!(core::mem::size_of::<F>(), core::mem::size_of::<usize>());
        self.get().map(|addr| core::mem::transmute_copy(&addr))
    }
}

/// Resolves `name` in the global scope.
pub fn global(name: &CStr) -> Option<usize> {
    let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) } as usize;
    (addr != 0).then_some(addr)
}
