/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use serde::Deserialize;
use serde::Serialize;

use crate::DBUS_BASE;
use crate::POINTER_SIZE;
use crate::SIGNAL_BASE;
use crate::SYSCALL_BASE;
use crate::X11_BASE;

/// Describes how to interpret a dump file. Written by the supervisor next
/// to the dump when a session ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub pid: i32,
    pub arch: String,
    pub pointer_width: u8,
    pub page_size: u32,
    pub syscall_base: u32,
    pub signal_base: u16,
    pub dbus_base: u16,
    pub x11_base: u16,
    pub stats: SessionStats,
}

/// Counters accumulated over a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub flushes: u64,
    pub bytes: u64,
    pub syscall_count: u64,
    pub early_events: u64,
    pub maps_snapshots: u32,
}

impl SessionMeta {
    /// Metadata for a process running on this machine.
    pub fn native(pid: i32, page_size: u32) -> Self {
        Self {
            pid,
            arch: std::env::consts::ARCH.to_owned(),
            pointer_width: POINTER_SIZE as u8,
            page_size,
            syscall_base: SYSCALL_BASE,
            signal_base: SIGNAL_BASE,
            dbus_base: DBUS_BASE,
            x11_base: X11_BASE,
            stats: SessionStats::default(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::decode_from;
    use crate::write_frame;

    #[test]
    fn meta_frame() {
        let mut meta = SessionMeta::native(1234, 4096);
        meta.stats.flushes = 3;
        meta.stats.bytes = 1 << 20;

        let mut file = Vec::new();
        write_frame(&mut file, &meta).unwrap();
        assert_eq!(
            u32::from_be_bytes(file[..4].try_into().unwrap()) as usize,
            file.len() - 4
        );

        let mut buf = Vec::new();
        let decoded: SessionMeta = decode_from(&file[..], &mut buf).unwrap();
        assert_eq!(decoded, meta);
    }
}
