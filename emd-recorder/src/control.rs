/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use emd_print::debug;
use emd_proto::decode_response;
use emd_proto::write_socket_path;
use emd_proto::Channel;
use emd_proto::Request;
use emd_proto::CONTROL_FAILURE;
use emd_proto::RESPONSE_SIZE;
use syscalls::Errno;

use crate::config::DEBUG_DUMP;
use crate::raw;
use crate::raw::CPath;
use crate::Error;
use crate::Result;

/// The control channel to the supervisor over its per-process unix socket.
///
/// Every request opens a fresh connection, writes the request and its
/// payload, reads the four byte response and closes the connection. All
/// I/O goes through the raw shim.
#[derive(Debug, Clone)]
pub struct SocketChannel {
    path: CPath,
}

impl SocketChannel {
    pub fn new(dir: &str, pid: i32) -> Result<Self> {
        let mut path = CPath::new();
        write_socket_path(&mut path, dir, pid).map_err(|_| Error::PathTooLong)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &str {
        self.path.as_str()
    }

    fn try_call(&self, request: Request, payload: &[u8]) -> core::result::Result<i32, Errno> {
        let fd = raw::unix_connect(&self.path)?;
        fd.write_all(&request.encode())?;
        fd.write_all(payload)?;
        let mut response = [0u8; RESPONSE_SIZE];
        fd.read_exact(&mut response)?;
        Ok(decode_response(&response))
    }
}

impl Channel for SocketChannel {
    fn call(&self, request: Request, payload: &[u8]) -> i32 {
        match self.try_call(request, payload) {
            Ok(result) => {
                debug!(
                    DEBUG_DUMP,
                    "control {:?}({:#x}) -> {}", request.command, request.arg, result
                );
                result
            }
            Err(errno) => {
                debug!(
                    DEBUG_DUMP,
                    "control {:?} via {} failed: {}",
                    request.command,
                    self.path(),
                    errno
                );
                CONTROL_FAILURE
            }
        }
    }
}
