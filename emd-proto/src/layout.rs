/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Layout of the shared event buffer.
//!
//! The buffer starts with a fixed 64 byte header. Records are appended to
//! the arena that follows it. Until the recorder takes ownership, the start
//! of the arena holds the bootstrap data written by the supervisor: the
//! number set slots, an `i32` length, then the parameter table.

use byteorder::ByteOrder;
use byteorder::NativeEndian;

use crate::DecodeError;
use crate::EncodeError;
use crate::NumberSet;
use crate::ParamTable;
use crate::MAX_SYSCALLS;

pub const HEADER_SIZE: usize = 64;

pub const PID: usize = 0;
pub const MUTEX: usize = 4;
pub const SYSCALL_COUNT: usize = 8;
pub const CURRENT: usize = 16;
pub const SIZE: usize = 20;
pub const PAGE_SIZE: usize = 24;
pub const MAX_STACK_SIZE: usize = 28;
pub const STACK_BEGIN: usize = 32;
pub const STACK_END: usize = 40;
pub const MAX_PARAM_SIZE: usize = 48;
pub const NSLOTS: usize = 52;
pub const NOT_FLAG: usize = 56;

/// Mutex word value when the buffer is unlocked.
pub const MUTEX_FREE: u32 = 1;
/// Mutex word value while a writer holds the buffer.
pub const MUTEX_HELD: u32 = 0;

pub const DEFAULT_MAX_STACK_SIZE: u32 = 32 * 1024;
pub const DEFAULT_MAX_PARAM_SIZE: u32 = 256;

/// Smallest shared buffer the recorder will ask for.
pub const MIN_BUFFER_SIZE: usize = 64 * 1024;
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// Space the bootstrap data needs at the start of the arena.
pub const BOOTSTRAP_SIZE: usize = MAX_SYSCALLS / 32 * 4 + 4 + ParamTable::BYTES;

/// Values the supervisor writes into a fresh buffer.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub page_size: u32,
    pub max_stack_size: u32,
    pub max_param_size: u32,
    pub numbers: NumberSet,
    pub params: ParamTable,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            max_stack_size: DEFAULT_MAX_STACK_SIZE,
            max_param_size: DEFAULT_MAX_PARAM_SIZE,
            numbers: NumberSet::all(),
            params: ParamTable::new(),
        }
    }
}

/// Formats `buf` as an empty event buffer. The pid stays zero and the
/// mutex held until the recorder claims the buffer.
pub fn init_shared_buffer(buf: &mut [u8], config: &BufferConfig) -> Result<(), EncodeError> {
    let needed = HEADER_SIZE + BOOTSTRAP_SIZE;
    if buf.len() < needed {
        return Err(EncodeError::Overflow {
            offset: 0,
            needed,
            capacity: buf.len(),
        });
    }

    buf[..HEADER_SIZE].fill(0);
    let size = (buf.len() - HEADER_SIZE).min(u32::MAX as usize) as u32;
    NativeEndian::write_u32(&mut buf[MUTEX..], MUTEX_HELD);
    NativeEndian::write_u32(&mut buf[SIZE..], size);
    NativeEndian::write_u32(&mut buf[PAGE_SIZE..], config.page_size);
    NativeEndian::write_u32(&mut buf[MAX_STACK_SIZE..], config.max_stack_size);
    NativeEndian::write_u32(&mut buf[MAX_PARAM_SIZE..], config.max_param_size);

    let slots = config.numbers.slots();
    NativeEndian::write_u32(&mut buf[NSLOTS..], slots.len() as u32);
    NativeEndian::write_u32(&mut buf[NOT_FLAG..], config.numbers.not_flag() as u32);

    let mut pos = HEADER_SIZE;
    for slot in slots {
        NativeEndian::write_u32(&mut buf[pos..], *slot);
        pos += 4;
    }
    let table = config.params.as_bytes();
    NativeEndian::write_i32(&mut buf[pos..], table.len() as i32);
    pos += 4;
    buf[pos..pos + table.len()].copy_from_slice(table);

    Ok(())
}

/// Reads the number set and parameter table back out of a freshly
/// initialized buffer.
pub fn read_bootstrap(buf: &[u8]) -> Result<(NumberSet, ParamTable), DecodeError> {
    let header = read_header(buf)?;
    let nslots = header.nslots as usize;
    let mut slots = [0u32; MAX_SYSCALLS / 32];
    if nslots > slots.len() {
        return Err(DecodeError::TooManySlots(header.nslots));
    }
    let slots_end = HEADER_SIZE + nslots * 4;
    let table_start = slots_end + 4;
    ensure(buf, table_start)?;

    NativeEndian::read_u32_into(&buf[HEADER_SIZE..slots_end], &mut slots[..nslots]);
    let numbers = NumberSet::from_raw(&slots[..nslots], header.not_flag)?;

    let len = NativeEndian::read_i32(&buf[slots_end..]);
    if len < 0 {
        return Err(DecodeError::InvalidLength {
            offset: slots_end,
            len: len as i64,
        });
    }
    let table_end = table_start + len as usize;
    ensure(buf, table_end)?;
    let params = ParamTable::from_bytes(&buf[table_start..table_end]);

    Ok((numbers, params))
}

/// A decoded copy of the header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub pid: i32,
    pub mutex: u32,
    pub syscall_count: u64,
    pub current: u32,
    pub size: u32,
    pub page_size: u32,
    pub max_stack_size: u32,
    pub stack_begin: u64,
    pub stack_end: u64,
    pub max_param_size: u32,
    pub nslots: u32,
    pub not_flag: bool,
}

pub fn read_header(buf: &[u8]) -> Result<Header, DecodeError> {
    ensure(buf, HEADER_SIZE)?;
    Ok(Header {
        pid: NativeEndian::read_i32(&buf[PID..]),
        mutex: NativeEndian::read_u32(&buf[MUTEX..]),
        syscall_count: NativeEndian::read_u64(&buf[SYSCALL_COUNT..]),
        current: NativeEndian::read_u32(&buf[CURRENT..]),
        size: NativeEndian::read_u32(&buf[SIZE..]),
        page_size: NativeEndian::read_u32(&buf[PAGE_SIZE..]),
        max_stack_size: NativeEndian::read_u32(&buf[MAX_STACK_SIZE..]),
        stack_begin: NativeEndian::read_u64(&buf[STACK_BEGIN..]),
        stack_end: NativeEndian::read_u64(&buf[STACK_END..]),
        max_param_size: NativeEndian::read_u32(&buf[MAX_PARAM_SIZE..]),
        nslots: NativeEndian::read_u32(&buf[NSLOTS..]),
        not_flag: NativeEndian::read_u32(&buf[NOT_FLAG..]) != 0,
    })
}

fn ensure(buf: &[u8], end: usize) -> Result<(), DecodeError> {
    if buf.len() < end {
        Err(DecodeError::Truncated {
            offset: buf.len(),
            wanted: end - buf.len(),
        })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ArgFlags;
    use crate::ParamSpec;

    #[test]
    fn header_offsets_fit() {
        assert!(NOT_FLAG + 4 <= HEADER_SIZE);
        assert_eq!(STACK_BEGIN % 8, 0);
        assert_eq!(SYSCALL_COUNT % 8, 0);
    }

    #[test]
    fn bootstrap_round_trip() {
        let mut params = ParamTable::new();
        params.set(0, ParamSpec::new(ArgFlags::ARG1 | ArgFlags::SIZE_IN_NEXT, 3));
        let config = BufferConfig {
            page_size: 16384,
            numbers: NumberSet::allow([0, 1, 2, 3, 257]),
            params,
            ..Default::default()
        };

        let mut buf = vec![0xffu8; MIN_BUFFER_SIZE];
        init_shared_buffer(&mut buf, &config).unwrap();

        let header = read_header(&buf).unwrap();
        assert_eq!(header.pid, 0);
        assert_eq!(header.mutex, MUTEX_HELD);
        assert_eq!(header.current, 0);
        assert_eq!(header.size as usize, MIN_BUFFER_SIZE - HEADER_SIZE);
        assert_eq!(header.page_size, 16384);
        assert_eq!(header.max_stack_size, DEFAULT_MAX_STACK_SIZE);
        assert_eq!(header.nslots, 9);
        assert!(!header.not_flag);

        let (numbers, params) = read_bootstrap(&buf).unwrap();
        assert_eq!(numbers, config.numbers);
        assert_eq!(params, config.params);
    }

    #[test]
    fn too_small() {
        let mut buf = vec![0u8; HEADER_SIZE + 16];
        assert!(init_shared_buffer(&mut buf, &BufferConfig::default()).is_err());
        assert!(read_header(&buf[..10]).is_err());
    }
}
