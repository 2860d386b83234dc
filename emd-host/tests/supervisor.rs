/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Runs the supervisor in-process and records into it through the same
//! control path the preload object uses.

use std::sync::Arc;

use emd_host::native_buffer_config;
use emd_host::read_meta;
use emd_host::Server;
use emd_host::Session;
use emd_host::SessionConfig;
use emd_proto::layout::BufferConfig;
use emd_proto::syscall_index;
use emd_proto::EventKind;
use emd_proto::NumberSet;
use emd_proto::RecordReader;
use emd_recorder::dispatch;
use emd_recorder::MemoryDumper;
use emd_recorder::RawBackend;
use emd_recorder::SocketChannel;
use emd_trampoline::Frame;
use emd_trampoline::Native;
use emd_trampoline::TrampolineBuilder;
use syscalls::Sysno;

fn syscall(dumper: &MemoryDumper<SocketChannel>, nr: Sysno) {
    let abi = Native::ABI;
    let mut slots = [0u64; 40];
    slots[abi.nr] = nr as u64;
    slots[abi.sp] = &slots as *const _ as u64;
    let mut frame = Frame::new(&abi, &mut slots).unwrap();
    dispatch(&mut frame, &RawBackend, Some(dumper));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn record_through_control_socket() {
    let dir = tempfile::tempdir().unwrap();
    let pid = std::process::id() as i32;
    let index = |nr: Sysno| syscall_index(nr as u64, Native::ABI.syscall_base).unwrap();

    let session = Arc::new(Session::new(
        pid,
        SessionConfig {
            dump_dir: dir.path().to_owned(),
            buffer: BufferConfig {
                numbers: NumberSet::allow([index(Sysno::getppid)]),
                max_stack_size: 512,
                ..native_buffer_config()
            },
        },
    ));
    let server = Server::bind(dir.path(), pid).unwrap();
    let serving = {
        let session = session.clone();
        tokio::spawn(async move { server.serve(session).await })
    };

    let control_dir = dir.path().to_str().unwrap().to_owned();
    let recorded = tokio::task::spawn_blocking(move || {
        let channel = SocketChannel::new(&control_dir, pid).unwrap();
        let dumper = MemoryDumper::create(channel, 1 << 20, Native::ABI).unwrap();
        for _ in 0..10 {
            syscall(&dumper, Sysno::getppid);
            syscall(&dumper, Sysno::getpid);
        }
        dumper
            .record_event_simple(0x2203, b"win=1a,key=38\0")
            .unwrap();
        dumper.flush();
        for _ in 0..3 {
            syscall(&dumper, Sysno::getppid);
        }
        dumper.syscall_count()
        // The dumper is dropped with three records pending, as if the
        // process had been killed.
    })
    .await
    .unwrap();
    assert_eq!(recorded, 13);

    let finished = session.clone();
    let meta = tokio::task::spawn_blocking(move || finished.finish())
        .await
        .unwrap()
        .unwrap();
    serving.abort();

    assert_eq!(meta.pid, pid);
    assert_eq!(meta.stats.flushes, 2);
    assert_eq!(meta.stats.syscall_count, 13);
    assert_eq!(meta.stats.early_events, 0);
    assert!(meta.stats.maps_snapshots >= 1);
    assert_eq!(read_meta(&session.meta_path()).unwrap(), meta);
    assert!(session.maps_path(0).exists());

    let dump = std::fs::read(session.dump_path()).unwrap();
    assert_eq!(dump.len() as u64, meta.stats.bytes);
    let records: Vec<_> = RecordReader::new(&dump)
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(records.len(), 14);

    let kinds: Vec<_> = records.iter().map(|r| r.kind()).collect();
    assert!(kinds[..10]
        .iter()
        .all(|k| *k == EventKind::Syscall(Sysno::getppid as u16)));
    assert_eq!(kinds[10], EventKind::X11(3));
    assert_eq!(records[10].payload(), b"win=1a,key=38");
    assert!(kinds[11..]
        .iter()
        .all(|k| *k == EventKind::Syscall(Sysno::getppid as u16)));

    let parent = std::os::unix::process::parent_id() as i64;
    assert!(records
        .iter()
        .filter_map(|r| r.result())
        .all(|result| result == parent));
}

#[test]
fn recorder_without_supervisor_gives_up() {
    let dir = tempfile::tempdir().unwrap();
    let channel = SocketChannel::new(dir.path().to_str().unwrap(), 1).unwrap();
    assert!(MemoryDumper::create(channel, 1 << 20, Native::ABI).is_err());
}
