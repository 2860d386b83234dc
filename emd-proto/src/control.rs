/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use core::fmt;

use byteorder::ByteOrder;
use byteorder::NativeEndian;

use crate::DecodeError;

/// Size of a control request on the wire: `{i32 command, u64 argument}`,
/// packed, native byte order.
pub const REQUEST_SIZE: usize = 12;

/// Size of a control response: a single `i32`.
pub const RESPONSE_SIZE: usize = 4;

/// Result value reported for any failed control operation.
pub const CONTROL_FAILURE: i32 = -1;

/// Commands understood by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Command {
    /// Returns a nonce used to name the shared buffer.
    AllocateSharedName = 1,
    /// Argument is the total size of the shared buffer in bytes. The
    /// supervisor resizes the object and writes the header.
    InitBuffers = 2,
    /// Recording has started. The supervisor snapshots the memory map.
    EnableDump = 3,
    /// Argument is the number of arena bytes to persist.
    FlushBuffers = 4,
    /// A mapping changed. Argument is the protection hint, or 0.
    UpdateMaps = 5,
    /// A simple event recorded before any shared buffer existed. The
    /// argument packs the event type, payload length and thread id, and the
    /// payload follows the request.
    DumpEvent = 6,
}

impl TryFrom<i32> for Command {
    type Error = DecodeError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Command::AllocateSharedName,
            2 => Command::InitBuffers,
            3 => Command::EnableDump,
            4 => Command::FlushBuffers,
            5 => Command::UpdateMaps,
            6 => Command::DumpEvent,
            other => return Err(DecodeError::UnknownCommand(other)),
        })
    }
}

/// A single control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub arg: u64,
}

impl Request {
    pub const fn new(command: Command, arg: u64) -> Self {
        Self { command, arg }
    }

    /// Builds a `DumpEvent` request. The payload length is carried in the
    /// argument and must be written right after the request.
    pub const fn dump_event(event_type: u16, payload_len: u16, tid: u32) -> Self {
        let arg = event_type as u64 | (payload_len as u64) << 16 | (tid as u64) << 32;
        Self::new(Command::DumpEvent, arg)
    }

    /// Splits a `DumpEvent` argument into `(event_type, payload_len, tid)`.
    pub const fn dump_event_parts(&self) -> (u16, u16, u32) {
        (
            self.arg as u16,
            (self.arg >> 16) as u16,
            (self.arg >> 32) as u32,
        )
    }

    pub fn encode(&self) -> [u8; REQUEST_SIZE] {
        let mut buf = [0u8; REQUEST_SIZE];
        NativeEndian::write_i32(&mut buf[0..4], self.command as i32);
        NativeEndian::write_u64(&mut buf[4..12], self.arg);
        buf
    }

    pub fn decode(buf: &[u8; REQUEST_SIZE]) -> Result<Self, DecodeError> {
        let command = Command::try_from(NativeEndian::read_i32(&buf[0..4]))?;
        let arg = NativeEndian::read_u64(&buf[4..12]);
        Ok(Self { command, arg })
    }
}

pub fn encode_response(result: i32) -> [u8; RESPONSE_SIZE] {
    let mut buf = [0u8; RESPONSE_SIZE];
    NativeEndian::write_i32(&mut buf, result);
    buf
}

pub fn decode_response(buf: &[u8; RESPONSE_SIZE]) -> i32 {
    NativeEndian::read_i32(buf)
}

/// A request/response transport to the supervisor.
///
/// Implementations must never fail loudly: any transport problem is
/// reported as [`CONTROL_FAILURE`].
pub trait Channel {
    /// Sends `request` followed by `payload` and waits for the response.
    fn call(&self, request: Request, payload: &[u8]) -> i32;
}

impl<C: Channel + ?Sized> Channel for &C {
    fn call(&self, request: Request, payload: &[u8]) -> i32 {
        (**self).call(request, payload)
    }
}

/// Default directory for control sockets.
pub const DEFAULT_CONTROL_DIR: &str = "/tmp";

/// Writes the control socket path for `pid` under `dir`.
pub fn write_socket_path<W: fmt::Write>(out: &mut W, dir: &str, pid: i32) -> fmt::Result {
    write!(out, "{}/emd-{}.sock", dir.trim_end_matches('/'), pid)
}

/// Writes the name of the shared buffer object for `pid` and `nonce`.
pub fn write_shared_name<W: fmt::Write>(out: &mut W, pid: i32, nonce: i32) -> fmt::Result {
    write!(out, "/tmp/emd-syscallbuf-{}-{}", pid, nonce)
}
