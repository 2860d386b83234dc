/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The in-process half of the event recorder.
//!
//! Syscall sites in the C library (and optionally every other loaded
//! object) are rewritten to branch into generated trampolines. Each
//! trampoline hands its saved register frame to [`emd_syscall_hook`], which
//! performs the syscall through the raw shim in [`raw`] and appends a
//! record to the shared [`MemoryDumper`] buffer. When the buffer fills up,
//! the supervisor is asked over the control socket to persist it.
//!
//! D-Bus and X11 entry points are interposed by the preload object and
//! feed short summaries into the same buffer.
//!
//! Nothing in this crate runs a constructor. The `emd-preload` cdylib calls
//! [`runtime::init`] and [`runtime::fini`].

#![allow(clippy::missing_safety_doc)]

pub mod config;
mod control;
mod dispatcher;
mod dumper;
pub mod elf;
mod error;
pub mod interceptors;
pub mod interpose;
mod lock;
pub mod maps;
pub mod patch;
pub mod raw;
pub mod runtime;
mod slot;
pub mod vdso;

pub use config::Config;
pub use control::*;
pub use dispatcher::*;
pub use dumper::*;
pub use error::*;
pub use lock::*;
pub use runtime::emd_syscall_hook;
pub use slot::*;
