/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::io;

use emd_proto::DecodeError;
use thiserror::Error;

/// A control connection sent something the supervisor cannot act on.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("failed to read control request: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("{command} sent before a shared buffer name was allocated")]
    NoSharedName { command: &'static str },

    #[error("{command} sent before the shared buffer was initialized")]
    NoSharedBuffer { command: &'static str },

    #[error("buffer size {size} is below the minimum of {min} bytes")]
    BufferTooSmall { size: u64, min: usize },

    #[error("flush of {len} bytes exceeds the arena of {capacity} bytes")]
    FlushTooLarge { len: u64, capacity: usize },

    #[error("event payload is {len} bytes, more than {max}")]
    PayloadTooLarge { len: usize, max: usize },
}
