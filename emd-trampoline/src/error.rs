/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildError {
    #[error("branch from {from:#x} cannot reach {to:#x}")]
    OutOfRange { from: u64, to: u64 },

    #[error("trampoline address {0:#x} is misaligned")]
    Misaligned(u64),

    #[error("displaced instruction {0:#010x} cannot be relocated")]
    NotRelocatable(u32),
}
