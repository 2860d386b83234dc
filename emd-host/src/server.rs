/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use emd_proto::encode_response;
use emd_proto::write_socket_path;
use emd_proto::Command;
use emd_proto::Request;
use emd_proto::CONTROL_FAILURE;
use emd_proto::EVENT_EXTRA_INFO_SIZE;
use emd_proto::REQUEST_SIZE;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixListener;
use tokio::net::UnixStream;

use crate::ProtocolError;
use crate::Session;

/// The control socket of one recorded process.
pub struct Server {
    listener: UnixListener,
    path: PathBuf,
}

impl Server {
    /// Binds `<dir>/emd-<pid>.sock`, replacing a stale socket left behind
    /// by an earlier run. Must be called from within a tokio runtime.
    pub fn bind(dir: &Path, pid: i32) -> Result<Self> {
        let dir = dir
            .to_str()
            .with_context(|| format!("control directory {:?} is not valid UTF-8", dir))?;
        let mut path = String::new();
        write_socket_path(&mut path, dir, pid)?;
        let path = PathBuf::from(path);

        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!("removed stale socket {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(&path)
            .with_context(|| format!("failed to bind {}", path.display()))?;

        Ok(Self { listener, path })
    }

    /// Returns the path to the socket.
    pub fn sock_path(&self) -> &Path {
        &self.path
    }

    /// Accepts connections and serves one request on each.
    pub async fn serve(&self, session: Arc<Session>) -> ! {
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    let session = session.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve_connection(stream, session).await {
                            tracing::warn!("bad control connection: {}", err);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("connection failed: {}", e);
                }
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn serve_connection(mut stream: UnixStream, session: Arc<Session>) -> Result<(), ProtocolError> {
    let mut buf = [0u8; REQUEST_SIZE];
    stream.read_exact(&mut buf).await?;
    let request = Request::decode(&buf)?;

    let mut payload = Vec::new();
    if request.command == Command::DumpEvent {
        let (_, len, _) = request.dump_event_parts();
        let len = len as usize;
        if len > EVENT_EXTRA_INFO_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                len,
                max: EVENT_EXTRA_INFO_SIZE,
            });
        }
        payload.resize(len, 0);
        stream.read_exact(&mut payload).await?;
    }

    // Flushes copy megabytes to disk; keep them off the reactor.
    let response = tokio::task::spawn_blocking(move || session.handle(request, &payload))
        .await
        .unwrap_or(CONTROL_FAILURE);

    stream.write_all(&encode_response(response)).await?;
    Ok(())
}
