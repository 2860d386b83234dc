/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The supervisor of recorded processes. It launches the target with the
//! recorder preloaded, serves the recorder's control socket and turns the
//! shared event buffer into dump files.

mod error;
mod launch;
mod params;
mod server;
mod session;
mod summary;

pub use error::*;
pub use launch::*;
pub use params::*;
pub use server::*;
pub use session::*;
pub use summary::*;
