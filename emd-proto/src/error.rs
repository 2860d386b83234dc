/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use thiserror::Error;

/// Errors produced while decoding shared-memory or dump-file contents.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of input at offset {offset} (wanted {wanted} bytes)")]
    Truncated { offset: usize, wanted: usize },

    #[error("unknown control command {0}")]
    UnknownCommand(i32),

    #[error("invalid length {len} at offset {offset}")]
    InvalidLength { offset: usize, len: i64 },

    #[error("number set has {0} slots, which is more than supported")]
    TooManySlots(u32),
}

/// Errors produced while encoding into a fixed-size arena.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    #[error("record does not fit: {needed} bytes needed at offset {offset}, {capacity} available")]
    Overflow {
        offset: usize,
        needed: usize,
        capacity: usize,
    },
}
