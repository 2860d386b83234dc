/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use core::fmt;

/// Offset added to a signal number to form its event type.
pub const SIGNAL_BASE: u16 = 0x2000;
/// Offset added to a D-Bus message type to form its event type.
pub const DBUS_BASE: u16 = 0x2100;
/// Offset added to an X11 event type to form its event type.
pub const X11_BASE: u16 = 0x2200;
/// Upper bound (exclusive) for simple event types.
pub const PTRACE_BASE: u16 = 0x2300;

/// Upper bound for the payload of a simple event.
pub const EVENT_EXTRA_INFO_SIZE: usize = 256;

/// Maximum number of parameter regions captured for one syscall.
pub const MAX_HEAP_REGIONS: usize = 12;

/// Decoded form of a record's event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Syscall(u16),
    Signal(u8),
    Dbus(u8),
    X11(u8),
    Other(u16),
}

impl EventKind {
    pub const fn from_code(code: u16) -> Self {
        match code {
            c if c < SIGNAL_BASE => EventKind::Syscall(c),
            c if c < DBUS_BASE => EventKind::Signal((c - SIGNAL_BASE) as u8),
            c if c < X11_BASE => EventKind::Dbus((c - DBUS_BASE) as u8),
            c if c < PTRACE_BASE => EventKind::X11((c - X11_BASE) as u8),
            c => EventKind::Other(c),
        }
    }

    pub const fn code(self) -> u16 {
        match self {
            EventKind::Syscall(nr) => nr,
            EventKind::Signal(n) => SIGNAL_BASE + n as u16,
            EventKind::Dbus(n) => DBUS_BASE + n as u16,
            EventKind::X11(n) => X11_BASE + n as u16,
            EventKind::Other(c) => c,
        }
    }

    /// Simple events carry a payload instead of a syscall result.
    pub const fn is_simple(self) -> bool {
        matches!(
            self,
            EventKind::Signal(_) | EventKind::Dbus(_) | EventKind::X11(_)
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Syscall(nr) => write!(f, "syscall:{}", nr),
            EventKind::Signal(n) => write!(f, "signal:{}", n),
            EventKind::Dbus(n) => write!(f, "dbus:{}", n),
            EventKind::X11(n) => write!(f, "x11:{}", n),
            EventKind::Other(c) => write!(f, "event:{:#x}", c),
        }
    }
}
