/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Supervisor side state of one recorded process.

use std::fmt::Write as _;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use anyhow::Context;
use anyhow::Result;
use emd_proto::align4;
use emd_proto::layout;
use emd_proto::layout::BufferConfig;
use emd_proto::layout::HEADER_SIZE;
use emd_proto::layout::MIN_BUFFER_SIZE;
use emd_proto::write_frame;
use emd_proto::write_shared_name;
use emd_proto::Command;
use emd_proto::RecordHeader;
use emd_proto::RecordSize;
use emd_proto::RecordWriter;
use emd_proto::Request;
use emd_proto::SessionMeta;
use emd_proto::SessionStats;
use emd_proto::Timestamp;
use emd_proto::CONTROL_FAILURE;
use emd_proto::EVENT_EXTRA_INFO_SIZE;
use memmap2::MmapMut;
use procfs::process::MMPermissions;
use procfs::process::MMapPath;
use procfs::process::Process;

use crate::ProtocolError;

/// Where a session writes and how it formats the shared buffer.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub dump_dir: PathBuf,
    pub buffer: BufferConfig,
}

#[derive(Default)]
struct State {
    nonce: i32,
    name: Option<String>,
    shared: Option<MmapMut>,
    dump: Option<File>,
    stats: SessionStats,
}

/// Serves the control requests of a single process and owns its output
/// files: `<pid>.dump`, `<pid>.maps.<n>` and `<pid>.meta`.
pub struct Session {
    pid: i32,
    config: SessionConfig,
    state: Mutex<State>,
}

impl Session {
    pub fn new(pid: i32, config: SessionConfig) -> Self {
        Self {
            pid,
            config,
            state: Mutex::new(State::default()),
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn dump_path(&self) -> PathBuf {
        self.config.dump_dir.join(format!("{}.dump", self.pid))
    }

    pub fn meta_path(&self) -> PathBuf {
        self.config.dump_dir.join(format!("{}.meta", self.pid))
    }

    pub fn maps_path(&self, n: u32) -> PathBuf {
        self.config.dump_dir.join(format!("{}.maps.{}", self.pid, n))
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // Poisoning is ignored.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Handles one request and returns the response value. Failures are
    /// logged and reported to the recorder as [`CONTROL_FAILURE`].
    pub fn handle(&self, request: Request, payload: &[u8]) -> i32 {
        let result = match request.command {
            Command::AllocateSharedName => self.allocate_name(),
            Command::InitBuffers => self.init_buffers(request.arg).map(|()| 0),
            Command::EnableDump => self.snapshot_maps().map(|_| 0),
            Command::FlushBuffers => self.flush(request.arg).map(|()| 0),
            Command::UpdateMaps => self.snapshot_maps().map(|_| 0),
            Command::DumpEvent => {
                let (event_type, _, tid) = request.dump_event_parts();
                self.dump_event(event_type, tid, payload).map(|()| 0)
            }
        };
        match result {
            Ok(value) => {
                tracing::trace!(pid = self.pid, ?request, value, "control request");
                value
            }
            Err(err) => {
                tracing::warn!(pid = self.pid, ?request, "control request failed: {:#}", err);
                CONTROL_FAILURE
            }
        }
    }

    fn allocate_name(&self) -> Result<i32> {
        let mut state = self.state();
        state.nonce += 1;
        let mut name = String::new();
        write_shared_name(&mut name, self.pid, state.nonce)?;
        let nonce = state.nonce;
        state.name = Some(name);
        Ok(nonce)
    }

    /// Sizes the object the recorder created under the allocated name and
    /// writes the header and bootstrap data into it.
    fn init_buffers(&self, size: u64) -> Result<()> {
        if size < MIN_BUFFER_SIZE as u64 {
            return Err(ProtocolError::BufferTooSmall {
                size,
                min: MIN_BUFFER_SIZE,
            }
            .into());
        }
        let mut state = self.state();
        let name = state.name.take().ok_or(ProtocolError::NoSharedName {
            command: "init-buffers",
        })?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&name)
            .with_context(|| format!("failed to open shared buffer {}", name))?;
        file.set_len(size)?;
        let mut map = unsafe { MmapMut::map_mut(&file) }?;
        layout::init_shared_buffer(&mut map, &self.config.buffer)?;
        tracing::debug!(pid = self.pid, name = %name, size, "shared buffer initialized");
        state.shared = Some(map);
        Ok(())
    }

    fn append(&self, state: &mut State, bytes: &[u8]) -> Result<()> {
        if state.dump.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.dump_path())
                .with_context(|| format!("failed to open {}", self.dump_path().display()))?;
            state.dump = Some(file);
        }
        if let Some(dump) = state.dump.as_mut() {
            dump.write_all(bytes)?;
        }
        state.stats.bytes += bytes.len() as u64;
        Ok(())
    }

    /// Persists the first `len` bytes of the arena. The recorder holds the
    /// buffer lock until we answer.
    fn flush(&self, len: u64) -> Result<()> {
        let mut state = self.state();
        let state = &mut *state;
        let shared = state.shared.take().ok_or(ProtocolError::NoSharedBuffer {
            command: "flush-buffers",
        })?;
        let capacity = shared.len() - HEADER_SIZE;
        let result = if len > capacity as u64 {
            Err(ProtocolError::FlushTooLarge { len, capacity }.into())
        } else {
            let bytes = &shared[HEADER_SIZE..HEADER_SIZE + len as usize];
            self.append(state, bytes)
        };
        state.shared = Some(shared);
        result?;
        state.stats.flushes += 1;
        tracing::debug!(pid = self.pid, len, "flushed");
        Ok(())
    }

    /// Writes the next `<pid>.maps.<n>` file. Returns its number.
    fn snapshot_maps(&self) -> Result<u32> {
        let maps = Process::new(self.pid)?.maps()?;
        let mut text = String::new();
        for map in maps {
            let perms = [
                (MMPermissions::READ, 'r'),
                (MMPermissions::WRITE, 'w'),
                (MMPermissions::EXECUTE, 'x'),
            ]
            .map(|(bit, c)| if map.perms.contains(bit) { c } else { '-' });
            let shared = if map.perms.contains(MMPermissions::SHARED) {
                's'
            } else {
                'p'
            };
            let path = match &map.pathname {
                MMapPath::Path(path) => path.display().to_string(),
                MMapPath::Heap => "[heap]".to_owned(),
                MMapPath::Stack => "[stack]".to_owned(),
                MMapPath::Vdso => "[vdso]".to_owned(),
                MMapPath::Vvar => "[vvar]".to_owned(),
                MMapPath::Vsyscall => "[vsyscall]".to_owned(),
                MMapPath::Other(s) => s.clone(),
                _ => String::new(),
            };
            writeln!(
                text,
                "{:x}-{:x} {}{}{}{} {:08x} {:02x}:{:02x} {} {}",
                map.address.0,
                map.address.1,
                perms[0],
                perms[1],
                perms[2],
                shared,
                map.offset,
                map.dev.0,
                map.dev.1,
                map.inode,
                path
            )?;
        }

        let mut state = self.state();
        let n = state.stats.maps_snapshots;
        std::fs::write(self.maps_path(n), text)?;
        state.stats.maps_snapshots += 1;
        Ok(n)
    }

    /// Encodes an event the recorder sent before it had a buffer of its
    /// own. The record carries no register context.
    fn dump_event(&self, event_type: u16, tid: u32, payload: &[u8]) -> Result<()> {
        if payload.len() > EVENT_EXTRA_INFO_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                len: payload.len(),
                max: EVENT_EXTRA_INFO_SIZE,
            }
            .into());
        }
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?;
        let mut record = vec![0u8; RecordSize::new(payload.len(), 0).get()];
        let mut w = RecordWriter::new(&mut record, 0);
        w.header(&RecordHeader {
            time: Timestamp {
                sec: now.as_secs() as i64,
                nsec: now.subsec_nanos() as i64,
            },
            event_type,
            thread_num: 1,
            tid: tid as u16,
            extra_size: align4(payload.len()) as u16,
        })?;
        w.extra(payload)?;
        w.registers(tid as u16, &[], 0)?;
        w.stack(0, 0)?;
        w.heap_count(0)?;

        let mut state = self.state();
        self.append(&mut state, &record)?;
        state.stats.early_events += 1;
        Ok(())
    }

    /// Ends the session: persists whatever the recorder left in the buffer
    /// and writes the metadata file.
    pub fn finish(&self) -> Result<SessionMeta> {
        let mut state = self.state();
        let state = &mut *state;
        if let Some(shared) = state.shared.take() {
            let header = layout::read_header(&shared)?;
            let current = (header.current as usize).min(shared.len() - HEADER_SIZE);
            if current > 0 {
                self.append(state, &shared[HEADER_SIZE..HEADER_SIZE + current])?;
                state.stats.flushes += 1;
            }
            state.stats.syscall_count = header.syscall_count;
        }
        if let Some(dump) = state.dump.take() {
            dump.sync_all()?;
        }

        let mut meta = SessionMeta::native(self.pid, self.config.buffer.page_size);
        meta.stats = state.stats.clone();
        let file = File::create(self.meta_path())?;
        write_frame(&file, &meta)?;
        tracing::info!(
            pid = self.pid,
            bytes = meta.stats.bytes,
            syscalls = meta.stats.syscall_count,
            "session finished"
        );
        Ok(meta)
    }
}

/// Default buffer layout for this machine.
pub fn native_buffer_config() -> BufferConfig {
    BufferConfig {
        page_size: procfs::page_size() as u32,
        params: crate::default_param_table(),
        ..BufferConfig::default()
    }
}

/// Reads the metadata file written by [`Session::finish`].
pub fn read_meta(path: &Path) -> Result<SessionMeta> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut buf = Vec::new();
    Ok(emd_proto::decode_from(file, &mut buf)?)
}
