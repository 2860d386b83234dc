/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Binary event records.
//!
//! Every record is 4 byte aligned and uses native byte order:
//!
//! ```text
//! timespec (16)  event_type (u16)  thread_num (u16)  tid | extra_size << 16 (u32)
//! extra data (extra_size, padded to 4)
//! thread_num times {
//!     tid (u16)  cpu_size (u16)  registers (cpu_size)
//!     tls_size (i32)  tls data
//!     stack_addr (pointer)  stack_len (i32)  stack data
//! }
//! heap_count (i32)
//! heap_count times { addr (pointer)  len (i32, multiple of 4)  data }
//! ```

use byteorder::ByteOrder;
use byteorder::NativeEndian;

use crate::DecodeError;
use crate::EncodeError;
use crate::EventKind;

pub const TIMESPEC_SIZE: usize = 16;
pub const POINTER_SIZE: usize = core::mem::size_of::<usize>();

/// Heap region padding byte.
pub const REGION_FILL: u8 = 0xcc;

#[inline]
pub const fn align4(n: usize) -> usize {
    (n + 3) & !3
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    pub sec: i64,
    pub nsec: i64,
}

/// The fixed leading part of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub time: Timestamp,
    pub event_type: u16,
    pub thread_num: u16,
    pub tid: u16,
    pub extra_size: u16,
}

/// Accumulates the encoded length of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordSize(usize);

impl RecordSize {
    /// Header, extra data and a single thread block with empty TLS and
    /// empty stack, followed by a zero heap count.
    pub const fn new(extra: usize, cpu: usize) -> Self {
        Self(TIMESPEC_SIZE + 4 + 4 + align4(extra) + 4 + cpu + 4 + POINTER_SIZE + 4 + 4)
    }

    pub const fn stack(self, len: usize) -> Self {
        Self(self.0 + len)
    }

    pub const fn region(self, len: usize) -> Self {
        Self(self.0 + POINTER_SIZE + 4 + align4(len))
    }

    pub const fn get(self) -> usize {
        self.0
    }
}

/// Writes records into a byte arena. Positions are offsets into the arena.
pub struct RecordWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> RecordWriter<'a> {
    pub fn new(buf: &'a mut [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn reserve(&mut self, len: usize) -> Result<&mut [u8], EncodeError> {
        let end = self.pos + len;
        if end > self.buf.len() {
            return Err(EncodeError::Overflow {
                offset: self.pos,
                needed: len,
                capacity: self.buf.len(),
            });
        }
        let start = self.pos;
        self.pos = end;
        Ok(&mut self.buf[start..end])
    }

    fn put_u16(&mut self, v: u16) -> Result<(), EncodeError> {
        NativeEndian::write_u16(self.reserve(2)?, v);
        Ok(())
    }

    fn put_u32(&mut self, v: u32) -> Result<(), EncodeError> {
        NativeEndian::write_u32(self.reserve(4)?, v);
        Ok(())
    }

    fn put_pointer(&mut self, v: u64) -> Result<(), EncodeError> {
        let out = self.reserve(POINTER_SIZE)?;
        if POINTER_SIZE == 8 {
            NativeEndian::write_u64(out, v);
        } else {
            NativeEndian::write_u32(out, v as u32);
        }
        Ok(())
    }

    pub fn header(&mut self, header: &RecordHeader) -> Result<(), EncodeError> {
        let out = self.reserve(TIMESPEC_SIZE)?;
        NativeEndian::write_i64(&mut out[0..8], header.time.sec);
        NativeEndian::write_i64(&mut out[8..16], header.time.nsec);
        self.put_u16(header.event_type)?;
        self.put_u16(header.thread_num)?;
        self.put_u32(header.tid as u32 | (header.extra_size as u32) << 16)
    }

    /// Writes extra data, zero padded to 4 bytes. The header's
    /// `extra_size` must be `align4(data.len())`.
    pub fn extra(&mut self, data: &[u8]) -> Result<(), EncodeError> {
        let out = self.reserve(align4(data.len()))?;
        out[..data.len()].copy_from_slice(data);
        out[data.len()..].fill(0);
        Ok(())
    }

    /// Writes a thread block's register context: `regs` followed by
    /// `fpregs_len` zero bytes.
    pub fn registers(&mut self, tid: u16, regs: &[u8], fpregs_len: usize) -> Result<(), EncodeError> {
        let cpu = regs.len() + fpregs_len;
        self.put_u16(tid)?;
        self.put_u16(cpu as u16)?;
        let out = self.reserve(cpu)?;
        out[..regs.len()].copy_from_slice(regs);
        out[regs.len()..].fill(0);
        // TLS is never captured.
        self.put_u32(0)
    }

    /// Writes the stack descriptor and returns the space for its bytes.
    pub fn stack(&mut self, addr: u64, len: usize) -> Result<&mut [u8], EncodeError> {
        self.put_pointer(addr)?;
        self.put_u32(len as u32)?;
        self.reserve(len)
    }

    pub fn heap_count(&mut self, count: usize) -> Result<(), EncodeError> {
        self.put_u32(count as u32)
    }

    /// Writes a heap region descriptor and returns the `len` bytes to be
    /// filled. The stored length is rounded up to 4 and the tail is filled
    /// with [`REGION_FILL`].
    pub fn region(&mut self, addr: u64, len: usize) -> Result<&mut [u8], EncodeError> {
        let padded = align4(len);
        self.put_pointer(addr)?;
        self.put_u32(padded as u32)?;
        let out = self.reserve(padded)?;
        out[len..].fill(REGION_FILL);
        Ok(&mut out[..len])
    }
}

/// A memory block captured in a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region<'a> {
    pub addr: u64,
    pub data: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadBlock<'a> {
    pub tid: u16,
    pub cpu: &'a [u8],
    pub tls: &'a [u8],
    pub stack: Region<'a>,
}

/// A decoded record borrowing from the dump bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record<'a> {
    pub offset: usize,
    pub len: usize,
    pub header: RecordHeader,
    pub extra: &'a [u8],
    pub threads: Vec<ThreadBlock<'a>>,
    pub heap: Vec<Region<'a>>,
}

impl Record<'_> {
    pub fn kind(&self) -> EventKind {
        EventKind::from_code(self.header.event_type)
    }

    /// The syscall result stored in the extra data of syscall records.
    pub fn result(&self) -> Option<i64> {
        if self.kind().is_simple() || self.extra.len() < 8 {
            return None;
        }
        Some(NativeEndian::read_i64(&self.extra[..8]))
    }

    /// The payload of a simple event without its zero padding.
    pub fn payload(&self) -> &[u8] {
        let end = self
            .extra
            .iter()
            .rposition(|b| *b != 0)
            .map_or(0, |i| i + 1);
        &self.extra[..end]
    }
}

/// Iterates over the records of a dump stream. Iteration stops after the
/// first malformed record.
pub struct RecordReader<'a> {
    buf: &'a [u8],
    pos: usize,
    pointer_width: usize,
}

impl<'a> RecordReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self::with_pointer_width(buf, POINTER_SIZE)
    }

    pub fn with_pointer_width(buf: &'a [u8], pointer_width: usize) -> Self {
        Self {
            buf,
            pos: 0,
            pointer_width,
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.buf.len());
        match end {
            Some(end) => {
                let out = &self.buf[self.pos..end];
                self.pos = end;
                Ok(out)
            }
            None => Err(DecodeError::Truncated {
                offset: self.pos,
                wanted: len,
            }),
        }
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(NativeEndian::read_u16(self.take(2)?))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(NativeEndian::read_u32(self.take(4)?))
    }

    fn length(&mut self) -> Result<usize, DecodeError> {
        let offset = self.pos;
        let len = self.u32()? as i32;
        if len < 0 {
            return Err(DecodeError::InvalidLength {
                offset,
                len: len as i64,
            });
        }
        Ok(len as usize)
    }

    fn pointer(&mut self) -> Result<u64, DecodeError> {
        let bytes = self.take(self.pointer_width)?;
        Ok(if self.pointer_width == 8 {
            NativeEndian::read_u64(bytes)
        } else {
            NativeEndian::read_u32(bytes) as u64
        })
    }

    fn region(&mut self) -> Result<Region<'a>, DecodeError> {
        let addr = self.pointer()?;
        let len = self.length()?;
        let data = self.take(len)?;
        Ok(Region { addr, data })
    }

    fn record(&mut self) -> Result<Record<'a>, DecodeError> {
        let offset = self.pos;
        let time = self.take(TIMESPEC_SIZE)?;
        let time = Timestamp {
            sec: NativeEndian::read_i64(&time[0..8]),
            nsec: NativeEndian::read_i64(&time[8..16]),
        };
        let event_type = self.u16()?;
        let thread_num = self.u16()?;
        let packed = self.u32()?;
        let header = RecordHeader {
            time,
            event_type,
            thread_num,
            tid: packed as u16,
            extra_size: (packed >> 16) as u16,
        };
        let extra = self.take(header.extra_size as usize)?;

        let mut threads = Vec::with_capacity(thread_num as usize);
        for _ in 0..thread_num {
            let tid = self.u16()?;
            let cpu_size = self.u16()?;
            let cpu = self.take(cpu_size as usize)?;
            let tls_size = self.length()?;
            let tls = self.take(tls_size)?;
            let stack = self.region()?;
            threads.push(ThreadBlock {
                tid,
                cpu,
                tls,
                stack,
            });
        }

        let heap_count = self.length()?;
        let mut heap = Vec::with_capacity(heap_count.min(64));
        for _ in 0..heap_count {
            heap.push(self.region()?);
        }

        Ok(Record {
            offset,
            len: self.pos - offset,
            header,
            extra,
            threads,
            heap,
        })
    }
}

impl<'a> Iterator for RecordReader<'a> {
    type Item = Result<Record<'a>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }
        let item = self.record();
        if item.is_err() {
            self.pos = self.buf.len();
        }
        Some(item)
    }
}
