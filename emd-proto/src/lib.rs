/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Contracts shared between the in-process recorder and the supervisor:
//! the control protocol, the layout of the shared event buffer, and the
//! binary record format that flushes produce.

mod codec;
mod control;
pub mod env;
mod error;
mod event;
pub mod layout;
mod meta;
mod number_set;
mod params;
mod record;

pub use codec::*;
pub use control::*;
pub use error::*;
pub use event::*;
pub use meta::*;
pub use number_set::*;
pub use params::*;
pub use record::*;

/// Offset subtracted from a raw syscall number to index per-syscall tables.
/// MIPS n64 numbers start at 5000.
#[cfg(target_arch = "mips64")]
pub const SYSCALL_BASE: u32 = 5000;
#[cfg(not(target_arch = "mips64"))]
pub const SYSCALL_BASE: u32 = 0;

/// Number of per-syscall entries in the number set and the parameter table.
pub const MAX_SYSCALLS: usize = 1024;

/// Maps a raw syscall number to its table index, if it has one.
#[inline]
pub fn syscall_index(nr: u64, base: u32) -> Option<usize> {
    let index = nr.checked_sub(base as u64)? as usize;
    (index < MAX_SYSCALLS).then_some(index)
}
