/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Recorder settings, read once from the environment when the preload
//! object is initialized.

use core::ops::RangeInclusive;
use std::ffi::OsStr;

use emd_print::Gate;
use emd_proto::layout::DEFAULT_BUFFER_SIZE;
use emd_proto::layout::MIN_BUFFER_SIZE;
use emd_proto::DEFAULT_CONTROL_DIR;

/// Patch engine and dispatcher diagnostics.
pub static DEBUG_SYSCALL: Gate = Gate::new();
/// Event log and control channel diagnostics.
pub static DEBUG_DUMP: Gate = Gate::new();
pub static DEBUG_DBUS: Gate = Gate::new();
pub static DEBUG_X11: Gate = Gate::new();

pub use emd_proto::env::*;

/// Programs that are never instrumented, matched on the basename of
/// `argv[0]`.
pub const EXCLUDED_PROGRAMS: &[&str] = &["gdb"];

/// D-Bus message types: method call, method return, error, signal.
pub const DBUS_TYPES: RangeInclusive<u32> = 1..=4;
/// X11 core event types up to `MapNotify`.
pub const X11_TYPES: RangeInclusive<u32> = 0..=19;

/// Which modules get their syscall sites patched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PatchScope {
    /// The C library and the thread library.
    #[default]
    Libc,
    /// Every loaded object except the vDSO and the recorder itself.
    All,
}

/// An allow-list of small event type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventFilter {
    bits: u32,
}

impl EventFilter {
    pub const fn all() -> Self {
        Self { bits: u32::MAX }
    }

    pub const fn none() -> Self {
        Self { bits: 0 }
    }

    /// Parses a list of decimal codes separated by single delimiter
    /// characters, e.g. `1,4` or `2;3`. Codes outside `range` are ignored.
    /// Parsing stops at the first token that is not a number and keeps
    /// what was read up to there.
    pub fn parse(s: &str, range: RangeInclusive<u32>) -> Self {
        let mut filter = Self::none();
        let mut rest = s.as_bytes();

        loop {
            let digits = rest.iter().take_while(|b| b.is_ascii_digit()).count();
            if digits == 0 {
                break;
            }
            let value = rest[..digits]
                .iter()
                .try_fold(0u32, |acc, b| acc.checked_mul(10)?.checked_add((b - b'0') as u32));
            if let Some(value) = value.filter(|v| range.contains(v)) {
                filter.insert(value);
            }
            // Skip the number and one delimiter.
            match rest.get(digits + 1..) {
                Some(tail) => rest = tail,
                None => break,
            }
        }

        filter
    }

    pub fn insert(&mut self, code: u32) {
        if code < 32 {
            self.bits |= 1 << code;
        }
    }

    pub fn allows(&self, code: u32) -> bool {
        code < 32 && self.bits & (1 << code) != 0
    }
}

impl Default for EventFilter {
    fn default() -> Self {
        Self::all()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DebugFlags {
    pub syscall: bool,
    pub dump: bool,
    pub dbus: bool,
    pub x11: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Only instrument a program whose `argv[0]` is this name or ends with
    /// `/` followed by it.
    pub cmdline_filter: Option<String>,
    pub scope: PatchScope,
    /// Total size of the shared event buffer in bytes.
    pub buffer_size: usize,
    /// Record `clock_gettime` and `gettimeofday` calls served by the vDSO.
    pub hook_vdso: bool,
    pub dbus_filter: EventFilter,
    pub x11_filter: EventFilter,
    /// Directory holding the supervisor's per-process control sockets.
    pub control_dir: String,
    pub debug: DebugFlags,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cmdline_filter: None,
            scope: PatchScope::Libc,
            buffer_size: DEFAULT_BUFFER_SIZE,
            hook_vdso: false,
            dbus_filter: EventFilter::all(),
            x11_filter: EventFilter::all(),
            control_dir: DEFAULT_CONTROL_DIR.to_owned(),
            debug: DebugFlags::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars_os())
    }

    /// Builds a configuration from `(name, value)` pairs. Unknown names are
    /// ignored.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        let mut config = Self::default();

        for (name, value) in vars {
            let Some(name) = name.as_ref().to_str() else {
                continue;
            };
            let value = value.as_ref().to_string_lossy();
            match name {
                ENV_CMDLINE_FILTER => config.cmdline_filter = Some(value.into_owned()),
                ENV_PATCH_ALL => {
                    if value.trim() == "1" {
                        config.scope = PatchScope::All;
                    }
                }
                ENV_BUFFER_SIZE => {
                    if let Ok(size) = value.trim().parse::<usize>() {
                        config.buffer_size = size.max(MIN_BUFFER_SIZE);
                    }
                }
                ENV_HOOK_VDSO => config.hook_vdso = value.trim() == "1",
                ENV_DBUS_FILTER => config.dbus_filter = EventFilter::parse(&value, DBUS_TYPES),
                ENV_X11_FILTER => {
                    if !value.is_empty() {
                        config.x11_filter = EventFilter::parse(&value, X11_TYPES);
                    }
                }
                ENV_CONTROL_DIR => {
                    if !value.is_empty() {
                        config.control_dir = value.into_owned();
                    }
                }
                ENV_DEBUG_SYSCALL => config.debug.syscall = true,
                ENV_DEBUG_DUMP => config.debug.dump = true,
                ENV_DEBUG_DBUS => config.debug.dbus = true,
                ENV_DEBUG_X11 => config.debug.x11 = true,
                _ => {}
            }
        }

        config
    }

    /// Whether the program started as `argv0` should be recorded.
    pub fn instruments(&self, argv0: &str) -> bool {
        let basename = argv0.rsplit('/').next().unwrap_or(argv0);
        if EXCLUDED_PROGRAMS.contains(&basename) {
            return false;
        }

        match &self.cmdline_filter {
            None => true,
            Some(filter) => match argv0.strip_suffix(filter.as_str()) {
                Some("") => true,
                Some(prefix) => prefix.ends_with('/'),
                None => false,
            },
        }
    }

    /// Turns the debug gates on or off.
    pub fn apply_debug_gates(&self) {
        DEBUG_SYSCALL.set(self.debug.syscall);
        DEBUG_DUMP.set(self.debug.dump);
        DEBUG_DBUS.set(self.debug.dbus);
        DEBUG_X11.set(self.debug.x11);
    }
}
