/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! End to end recording through the dispatcher with real syscalls.

use std::io::Write as _;
use std::sync::Arc;

use emd_proto::layout::BufferConfig;
use emd_proto::syscall_index;
use emd_proto::ArgFlags;
use emd_proto::Channel;
use emd_proto::Command;
use emd_proto::EventKind;
use emd_proto::NumberSet;
use emd_proto::ParamSpec;
use emd_proto::ParamTable;
use emd_proto::RecordReader;
use emd_proto::Request;
use emd_recorder::dispatch;
use emd_recorder::MemoryDumper;
use emd_recorder::RawBackend;
use emd_trampoline::Frame;
use emd_trampoline::FrameAbi;
use emd_trampoline::Native;
use emd_trampoline::TrampolineBuilder;
use parking_lot::Mutex;
use syscalls::Sysno;

const ABI: FrameAbi = Native::ABI;

/// Remembers every request and answers with success.
#[derive(Default)]
struct Log {
    requests: Mutex<Vec<Request>>,
}

impl Log {
    fn flushes(&self) -> Vec<u64> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.command == Command::FlushBuffers)
            .map(|r| r.arg)
            .collect()
    }
}

impl Channel for Log {
    fn call(&self, request: Request, _payload: &[u8]) -> i32 {
        self.requests.lock().push(request);
        0
    }
}

fn index(nr: Sysno) -> usize {
    syscall_index(nr as u64, ABI.syscall_base).unwrap()
}

/// Runs syscall `nr` through the dispatcher and returns the value the
/// caller would see in its result register.
fn syscall<C: Channel>(dumper: &MemoryDumper<C>, nr: Sysno, args: [u64; 6]) -> i64 {
    let mut slots = [0u64; 40];
    slots[ABI.nr] = nr as u64;
    for (slot, arg) in ABI.args.iter().zip(args) {
        slots[*slot] = arg;
    }
    slots[ABI.sp] = &slots as *const _ as u64;
    let mut frame = Frame::new(&ABI, &mut slots).unwrap();
    let value = dispatch(&mut frame, &RawBackend, Some(dumper));
    match ABI.error_flag {
        Some(flag) if slots[flag] != 0 => -(value as i64),
        _ => value as i64,
    }
}

#[test]
fn open_read_close() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let contents: Vec<u8> = (0..200u32).map(|i| b'a' + (i % 26) as u8).collect();
    file.write_all(&contents).unwrap();
    let path = std::ffi::CString::new(file.path().to_str().unwrap()).unwrap();

    let mut params = ParamTable::new();
    params.set(index(Sysno::openat), ParamSpec::new(ArgFlags::ARG1, 4));
    params.set(
        index(Sysno::read),
        ParamSpec::new(ArgFlags::ARG1 | ArgFlags::SIZE_IN_NEXT, 3),
    );
    let config = BufferConfig {
        numbers: NumberSet::allow([index(Sysno::openat), index(Sysno::read), index(Sysno::close)]),
        params,
        max_param_size: 256,
        max_stack_size: 1024,
        ..Default::default()
    };
    let dumper = MemoryDumper::in_memory(1 << 20, &config, ABI, Log::default()).unwrap();

    let fd = syscall(
        &dumper,
        Sysno::openat,
        [libc::AT_FDCWD as u64, path.as_ptr() as u64, libc::O_RDONLY as u64, 0, 0, 0],
    );
    assert!(fd >= 0, "openat failed: {}", fd);

    // Not selected, so not recorded.
    syscall(&dumper, Sysno::getpid, [0; 6]);

    let mut buf = vec![0u8; 100];
    let n = syscall(
        &dumper,
        Sysno::read,
        [fd as u64, buf.as_mut_ptr() as u64, 100, 0, 0, 0],
    );
    assert_eq!(n, 100);
    assert_eq!(syscall(&dumper, Sysno::close, [fd as u64, 0, 0, 0, 0, 0]), 0);

    let pending = dumper.pending();
    let records: Vec<_> = RecordReader::new(&pending)
        .collect::<Result<_, _>>()
        .unwrap();
    let kinds: Vec<_> = records.iter().map(|r| r.kind()).collect();
    assert_eq!(
        kinds,
        [
            EventKind::Syscall(Sysno::openat as u16),
            EventKind::Syscall(Sysno::read as u16),
            EventKind::Syscall(Sysno::close as u16),
        ]
    );
    assert_eq!(records[0].result(), Some(fd));
    assert_eq!(
        records[0].heap[0].data,
        path.as_bytes_with_nul(),
        "path argument captured with its terminator"
    );
    assert_eq!(records[1].result(), Some(100));
    assert_eq!(records[1].heap.len(), 1);
    assert_eq!(records[1].heap[0].addr, buf.as_ptr() as u64);
    assert_eq!(records[1].heap[0].data, &contents[..100]);
    assert_eq!(records[2].result(), Some(0));
    let tid = emd_recorder::raw::gettid() as u16;
    assert!(records.iter().all(|r| r.header.tid == tid));
    assert_eq!(dumper.syscall_count(), 3);
}

#[test]
fn failed_syscalls_record_the_error() {
    let dumper =
        MemoryDumper::in_memory(1 << 16, &BufferConfig::default(), ABI, Log::default()).unwrap();
    assert_eq!(
        syscall(&dumper, Sysno::close, [u32::MAX as u64 >> 1, 0, 0, 0, 0, 0]),
        -(libc::EBADF as i64)
    );
    let pending = dumper.pending();
    let record = RecordReader::new(&pending).next().unwrap().unwrap();
    assert_eq!(record.result(), Some(-(libc::EBADF as i64)));
}

#[test]
fn threads_record_every_call() {
    const THREADS: usize = 8;
    const CALLS: usize = 250;

    let config = BufferConfig {
        numbers: NumberSet::allow([index(Sysno::getppid)]),
        max_stack_size: 128,
        ..Default::default()
    };
    let dumper =
        Arc::new(MemoryDumper::in_memory(8 << 20, &config, ABI, Log::default()).unwrap());

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let dumper = dumper.clone();
            std::thread::spawn(move || {
                for _ in 0..CALLS {
                    syscall(&dumper, Sysno::getppid, [0; 6]);
                    // Not selected.
                    syscall(&dumper, Sysno::getpid, [0; 6]);
                }
                emd_recorder::raw::gettid() as u16
            })
        })
        .collect();
    let mut tids: Vec<u16> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(dumper.channel().flushes().is_empty());
    assert_eq!(dumper.syscall_count(), (THREADS * CALLS) as u64);

    let pending = dumper.pending();
    let records: Vec<_> = RecordReader::new(&pending)
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(records.len(), THREADS * CALLS);

    let mut seen: Vec<u16> = records.iter().map(|r| r.header.tid).collect();
    seen.sort_unstable();
    seen.dedup();
    tids.sort_unstable();
    assert_eq!(seen, tids);
}

#[test]
fn one_flush_per_overflow() {
    let config = BufferConfig {
        max_stack_size: 2048,
        ..Default::default()
    };
    let dumper = MemoryDumper::in_memory(1 << 16, &config, ABI, Log::default()).unwrap();

    let mut breaches = 0;
    for _ in 0..300 {
        let before = dumper.current();
        let flushes = dumper.channel().flushes().len();
        syscall(&dumper, Sysno::getpid, [0; 6]);
        let after = dumper.current();

        let new = &dumper.channel().flushes()[flushes..];
        if after <= before {
            // The record did not fit: exactly one flush of everything
            // written so far, and the record starts the new buffer.
            breaches += 1;
            assert_eq!(new, [before as u64]);
            let pending = dumper.pending();
            let first = RecordReader::new(&pending).next().unwrap().unwrap();
            assert_eq!(first.offset, 0);
            assert_eq!(first.len, after);
        } else {
            assert!(new.is_empty());
        }
        assert!(after <= dumper.capacity());
    }
    assert!(breaches > 0);
    assert_eq!(dumper.channel().flushes().len(), breaches);
}

#[test]
fn child_of_fork_does_not_write() {
    let dumper =
        MemoryDumper::in_memory(1 << 16, &BufferConfig::default(), ABI, Log::default()).unwrap();
    syscall(&dumper, Sysno::getpid, [0; 6]);
    assert_eq!(dumper.syscall_count(), 1);

    match unsafe { nix::unistd::fork() }.unwrap() {
        nix::unistd::ForkResult::Child => {
            let pid = syscall(&dumper, Sysno::getpid, [0; 6]);
            let ok = pid == unsafe { libc::getpid() } as i64 && dumper.syscall_count() == 1;
            unsafe { libc::_exit(if ok { 0 } else { 1 }) };
        }
        nix::unistd::ForkResult::Parent { child } => {
            let status = nix::sys::wait::waitpid(child, None).unwrap();
            assert_eq!(status, nix::sys::wait::WaitStatus::Exited(child, 0));
        }
    }
    assert_eq!(dumper.syscall_count(), 1);
}
