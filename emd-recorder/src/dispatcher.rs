/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use emd_print::debug;
use emd_proto::Channel;
use emd_proto::Command;
use emd_proto::Request;
use emd_trampoline::Frame;
use syscalls::Sysno;

use crate::config::DEBUG_SYSCALL;
use crate::raw;
use crate::MemoryDumper;

/// Where intercepted syscalls are finally performed.
pub trait SyscallBackend {
    /// Performs syscall `nr` and returns the raw kernel result, with errors
    /// as negated errno values.
    fn syscall(&self, nr: u64, args: [u64; 6]) -> u64;

    fn pid(&self) -> i32;
}

/// Performs syscalls directly through the kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawBackend;

impl SyscallBackend for RawBackend {
    #[inline]
    fn syscall(&self, nr: u64, args: [u64; 6]) -> u64 {
        raw::syscall(nr, args)
    }

    fn pid(&self) -> i32 {
        raw::getpid()
    }
}

fn failed(raw: u64) -> bool {
    (raw as i64) < 0 && (raw as i64) >= -4095
}

/// Whether a process-creating syscall returned in the new child.
fn in_child(nr: u64, raw: u64) -> bool {
    raw == 0
        && Sysno::new(nr as usize).map_or(false, |sysno| {
            matches!(sysno.name(), "fork" | "vfork" | "clone" | "clone3")
        })
}

/// Performs the syscall described by `frame` and records it.
///
/// The syscall always runs, whether or not anything can be recorded. Its
/// result is written back into `frame` the way the kernel would and also
/// returned. A buffer belonging to another process, as seen by a child
/// right after fork, is ignored.
pub fn dispatch<B, C>(frame: &mut Frame<'_>, backend: &B, dumper: Option<&MemoryDumper<C>>) -> u64
where
    B: SyscallBackend,
    C: Channel,
{
    let nr = frame.nr();
    let args = frame.args();
    let dumper = dumper.filter(|d| d.is_current_process(backend.pid()));
    let eligible = dumper.map_or(false, |d| d.wants(nr));

    let raw = backend.syscall(nr, args);
    let value = frame.set_result(raw);

    debug!(
        DEBUG_SYSCALL,
        "[{}] syscall {} ({:#x}, {:#x}, {:#x}) = {:#x}",
        raw::gettid(),
        nr,
        args[0],
        args[1],
        args[2],
        raw
    );

    let Some(dumper) = dumper else {
        return value;
    };

    // The child of a fork shares nothing with the buffer anymore.
    if in_child(nr, raw) {
        return value;
    }

    if eligible {
        if let Err(err) = dumper.record_syscall(frame, raw) {
            debug!(DEBUG_SYSCALL, "record of syscall {} failed: {}", nr, err);
        }
    }

    if !failed(raw) {
        match Sysno::new(nr as usize) {
            Some(Sysno::mmap) => {
                dumper
                    .channel()
                    .call(Request::new(Command::UpdateMaps, args[2]), &[]);
            }
            Some(Sysno::mremap) => {
                dumper.channel().call(Request::new(Command::UpdateMaps, 0), &[]);
            }
            _ => {}
        }
    }

    value
}
