/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Length-prefixed `bincode` frames for supervisor-side metadata files.

use std::io;
use std::io::Write;

use bincode::Options;
use serde::Deserialize;
use serde::Serialize;

fn bincode_options() -> impl bincode::Options {
    // Writers and readers must agree on these options.
    bincode::DefaultOptions::new().with_limit(16 * (1 << 20) /* 16MB */)
}

/// Encodes `item` as a frame: a big-endian `u32` length, then the payload.
pub fn encode<T>(item: &T, buf: &mut Vec<u8>) -> io::Result<()>
where
    T: Serialize,
{
    let start = buf.len();
    buf.extend_from_slice(&[0, 0, 0, 0]);

    bincode_options()
        .serialize_into(&mut *buf, item)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("failed to encode frame: {}", e)))?;

    let size = (buf.len() - start - 4) as u32;
    buf[start..start + 4].copy_from_slice(&size.to_be_bytes());

    Ok(())
}

/// Writes one frame to `writer`.
pub fn write_frame<W, T>(mut writer: W, item: &T) -> io::Result<()>
where
    T: Serialize,
    W: Write,
{
    let mut buf = Vec::with_capacity(256);
    encode(item, &mut buf)?;
    writer.write_all(&buf)
}

/// Decodes a frame payload (without its length prefix).
pub fn decode_frame<'a, T>(frame: &'a [u8]) -> io::Result<T>
where
    T: Deserialize<'a>,
{
    bincode_options()
        .deserialize(frame)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("failed to decode frame: {}", e)))
}

/// Reads one frame from `reader` into `buf` and decodes it.
pub fn decode_from<'a, T, R>(mut reader: R, buf: &'a mut Vec<u8>) -> io::Result<T>
where
    T: Deserialize<'a>,
    R: io::Read,
{
    let mut head = [0u8; 4];
    reader.read_exact(&mut head)?;

    let len = u32::from_be_bytes(head) as usize;
    buf.resize(len, 0);
    reader.read_exact(buf)?;

    decode_frame(buf)
}
