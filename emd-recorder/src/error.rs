/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use emd_proto::DecodeError;
use emd_proto::EncodeError;
use syscalls::Errno;
use thiserror::Error;

/// Errors raised inside the recorder. None of them ever reaches the traced
/// program: callers at the hook boundary turn them into passthrough or a
/// skipped record.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Errno(#[from] Errno),

    #[error("failed to parse object file: {0}")]
    Elf(#[from] object::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Proc(#[from] procfs::ProcError),

    /// The supervisor answered a control request with a failure code.
    #[error("control request failed with {0}")]
    Control(i32),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("no trampoline region within branch range of {0:#x}")]
    NoReachableRegion(u64),

    #[error("path does not fit in a fixed buffer")]
    PathTooLong,

    #[error("not supported on this architecture")]
    Unsupported,
}

impl From<emd_trampoline::BuildError> for Error {
    fn from(err: emd_trampoline::BuildError) -> Self {
        match err {
            emd_trampoline::BuildError::OutOfRange { from, .. } => Error::NoReachableRegion(from),
            _ => Error::Unsupported,
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;
