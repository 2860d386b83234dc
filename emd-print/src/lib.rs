/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Debug output for code that runs inside an instrumented process.
//!
//! Everything here writes with a raw `write` syscall from a fixed stack
//! buffer. Nothing allocates and nothing goes through libc, so the macros
//! keep working while the C library is half patched or the recorder is in
//! the middle of a failure.

#![no_std]

use core::fmt;
use core::fmt::Write;
use core::sync::atomic::AtomicBool;
use core::sync::atomic::Ordering;

use syscalls::syscall3;
use syscalls::Errno;
use syscalls::Sysno;

/// File descriptor used by the `eprint*` and `debug!` macros.
pub const STDERR: i32 = 2;

#[inline(always)]
fn sys_write(fd: i32, buf: &[u8]) -> Result<usize, Errno> {
    unsafe { syscall3(Sysno::write, fd as usize, buf.as_ptr() as usize, buf.len()) }
}

fn sys_write_all(fd: i32, mut buf: &[u8]) -> Result<(), Errno> {
    while !buf.is_empty() {
        match sys_write(fd, buf) {
            Ok(0) => return Err(Errno::EIO),
            Ok(n) => buf = &buf[n..],
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno),
        }
    }
    Ok(())
}

/// A small write buffer living on the stack. Lines are emitted with as few
/// `write` calls as possible so concurrent threads rarely interleave.
struct Stdio<const N: usize = 512> {
    fd: i32,
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> Stdio<N> {
    fn new(fd: i32) -> Self {
        Self {
            fd,
            buf: [0; N],
            len: 0,
        }
    }

    fn write_all(&mut self, mut buf: &[u8]) -> Result<(), Errno> {
        while !buf.is_empty() {
            if self.len == N {
                self.flush()?;
            }
            let remaining = &mut self.buf[self.len..];
            let count = remaining.len().min(buf.len());
            remaining[..count].copy_from_slice(&buf[..count]);
            self.len += count;
            buf = &buf[count..];
        }

        Ok(())
    }

    fn flush(&mut self) -> Result<(), Errno> {
        sys_write_all(self.fd, &self.buf[..self.len])?;
        self.len = 0;
        Ok(())
    }
}

impl<const N: usize> Drop for Stdio<N> {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

impl<const N: usize> fmt::Write for Stdio<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_all(s.as_bytes()).map_err(|_| fmt::Error)
    }
}

fn _inner_print(fd: i32, args: fmt::Arguments<'_>, newline: bool) -> fmt::Result {
    let mut f = Stdio::<512>::new(fd);
    f.write_fmt(args)?;

    if newline {
        f.write_str("\n")?;
    }

    Ok(())
}

#[doc(hidden)]
pub fn _print(fd: i32, args: fmt::Arguments<'_>, newline: bool) {
    // Output is best effort.
    let _ = _inner_print(fd, args, newline);
}

/// A debug switch that is read once at startup and then checked on every
/// `debug!` invocation.
pub struct Gate {
    enabled: AtomicBool,
}

impl Gate {
    pub const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
        }
    }

    pub fn set(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::_print(1, ::core::format_args!($($arg)*), false));
}

#[macro_export]
macro_rules! eprint {
    ($($arg:tt)*) => ($crate::_print($crate::STDERR, ::core::format_args!($($arg)*), false));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ({
        // format_args_nl is nightly only.
        $crate::_print(1, ::core::format_args!($($arg)*), true);
    })
}

#[macro_export]
macro_rules! eprintln {
    () => ($crate::eprint!("\n"));
    ($($arg:tt)*) => ({
        $crate::_print($crate::STDERR, ::core::format_args!($($arg)*), true);
    })
}

/// Prints a line to stderr when `$gate` is enabled. Arguments are not
/// evaluated otherwise.
#[macro_export]
macro_rules! debug {
    ($gate:expr, $($arg:tt)*) => ({
        if $gate.is_enabled() {
            $crate::_print($crate::STDERR, ::core::format_args!($($arg)*), true);
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn gate_defaults_off() {
        let gate = Gate::new();
        assert!(!gate.is_enabled());
        gate.set(true);
        assert!(gate.is_enabled());
    }

    #[test]
    fn disabled_gate_skips_arguments() {
        static GATE: Gate = Gate::new();
        let mut evaluated = false;
        debug!(GATE, "{}", {
            evaluated = true;
            1
        });
        assert!(!evaluated);
    }

    #[test]
    fn buffer_spills_long_lines() {
        // Writing to a closed descriptor fails but must not panic.
        let mut out = Stdio::<8>::new(-1);
        assert_eq!(out.write_all(b"0123456789"), Err(Errno::EBADF));
        out.len = 0;
    }
}
