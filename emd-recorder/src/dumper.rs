/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The shared-memory event log.

use core::ptr::NonNull;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;

use emd_print::debug;
use emd_proto::align4;
use emd_proto::layout;
use emd_proto::layout::BufferConfig;
use emd_proto::layout::Header;
use emd_proto::layout::HEADER_SIZE;
use emd_proto::layout::MUTEX_FREE;
use emd_proto::syscall_index;
use emd_proto::write_shared_name;
use emd_proto::Capture;
use emd_proto::Channel;
use emd_proto::Command;
use emd_proto::NumberSet;
use emd_proto::ParamTable;
use emd_proto::RecordHeader;
use emd_proto::RecordSize;
use emd_proto::RecordWriter;
use emd_proto::Request;
use emd_proto::EVENT_EXTRA_INFO_SIZE;
use emd_proto::MAX_HEAP_REGIONS;
use emd_trampoline::Frame;
use emd_trampoline::FrameAbi;
use memmap2::MmapMut;

use crate::config::DEBUG_DUMP;
use crate::raw;
use crate::raw::CPath;
use crate::Error;
use crate::FutexGuard;
use crate::FutexLock;
use crate::Result;

/// Stack bytes captured when the memory map cannot be read.
const FALLBACK_STACK_SIZE: usize = 256;

/// Longest string argument probed for its terminator.
const MAX_CSTRING_PROBE: usize = 4096;

/// An empty stack window: no pointer argument is skipped.
const NO_STACK: (u64, u64) = (0, 0);

/// Largest register frame of any supported architecture, in words.
const MAX_FRAME_WORDS: usize = 40;

struct Shared {
    addr: NonNull<u8>,
    len: usize,
    // Keeps test buffers alive. Shared buffers live until the process
    // exits.
    _anon: Option<MmapMut>,
}

/// A process's event log: a header followed by an arena of records, in a
/// shared mapping that the supervisor reads on flush.
///
/// All threads append through `&self`. Appends are serialized by the
/// futex word in the header.
pub struct MemoryDumper<C> {
    mem: Shared,
    pid: i32,
    numbers: NumberSet,
    params: ParamTable,
    page_size: u64,
    max_stack: usize,
    max_param: usize,
    abi: FrameAbi,
    channel: C,
}

// SAFETY: the mapping is only written under the futex lock or through
// atomics.
unsafe impl<C: Send> Send for MemoryDumper<C> {}
unsafe impl<C: Sync> Sync for MemoryDumper<C> {}

impl<C: Channel> MemoryDumper<C> {
    /// Creates the shared buffer with the supervisor's help:
    ///
    /// 1. ask for a name nonce,
    /// 2. create `/tmp/emd-syscallbuf-<pid>-<nonce>` exclusively,
    /// 3. let the supervisor size and format it,
    /// 4. map it and unlink the name,
    /// 5. claim it and enable dumping.
    pub fn create(channel: C, size: usize, abi: FrameAbi) -> Result<Self> {
        let pid = raw::getpid();
        let nonce = channel.call(Request::new(Command::AllocateSharedName, 0), &[]);
        if nonce < 0 {
            return Err(Error::Control(nonce));
        }

        let mut path = CPath::new();
        write_shared_name(&mut path, pid, nonce).map_err(|_| Error::PathTooLong)?;
        let fd = raw::create_exclusive(&path)?;
        debug!(DEBUG_DUMP, "shared buffer {:?}, size={}", path, size);

        let ret = channel.call(Request::new(Command::InitBuffers, size as u64), &[]);
        if ret < 0 {
            let _ = raw::unlink(&path);
            return Err(Error::Control(ret));
        }

        let addr = unsafe {
            raw::mmap(
                0,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.raw(),
                0,
            )
        };
        drop(fd);
        let _ = raw::unlink(&path);
        let addr = addr?;

        let mem = Shared {
            addr: NonNull::new(addr as *mut u8).ok_or(Error::Unsupported)?,
            len: size,
            _anon: None,
        };
        Self::attach(mem, pid, abi, channel)
    }

    /// Formats a private anonymous buffer the way the supervisor would and
    /// attaches to it. Records written here are flushed through `channel`
    /// like any other.
    pub fn in_memory(size: usize, config: &BufferConfig, abi: FrameAbi, channel: C) -> Result<Self> {
        let mut anon = MmapMut::map_anon(size)?;
        layout::init_shared_buffer(&mut anon, config)?;
        let mem = Shared {
            addr: NonNull::new(anon.as_mut_ptr()).ok_or(Error::Unsupported)?,
            len: size,
            _anon: Some(anon),
        };
        Self::attach(mem, raw::getpid(), abi, channel)
    }

    fn attach(mem: Shared, pid: i32, abi: FrameAbi, channel: C) -> Result<Self> {
        let bytes = unsafe { core::slice::from_raw_parts(mem.addr.as_ptr(), mem.len) };
        let header = layout::read_header(bytes)?;
        if header.size as usize + HEADER_SIZE != mem.len {
            return Err(Error::Control(-1));
        }
        // Copy the bootstrap data out before records overwrite it.
        let (numbers, params) = layout::read_bootstrap(bytes)?;

        let dumper = Self {
            mem,
            pid,
            numbers,
            params,
            page_size: (header.page_size as u64).max(1),
            max_stack: header.max_stack_size as usize,
            max_param: header.max_param_size as usize,
            abi,
            channel,
        };
        dumper.word(layout::PID).store(pid as u32, Ordering::Relaxed);
        dumper.word(layout::MUTEX).store(MUTEX_FREE, Ordering::Release);

        dumper
            .channel
            .call(Request::new(Command::EnableDump, 0), &[]);
        debug!(DEBUG_DUMP, "dumper ready pid={} size={}", pid, header.size);
        Ok(dumper)
    }

    fn word(&self, offset: usize) -> &AtomicU32 {
        debug_assert!(offset % 4 == 0 && offset + 4 <= HEADER_SIZE);
        unsafe { &*self.mem.addr.as_ptr().add(offset).cast::<AtomicU32>() }
    }

    fn dword(&self, offset: usize) -> &AtomicU64 {
        debug_assert!(offset % 8 == 0 && offset + 8 <= HEADER_SIZE);
        unsafe { &*self.mem.addr.as_ptr().add(offset).cast::<AtomicU64>() }
    }

    /// The record arena. Only call while holding the lock.
    #[allow(clippy::mut_from_ref)]
    unsafe fn arena(&self) -> &mut [u8] {
        core::slice::from_raw_parts_mut(
            self.mem.addr.as_ptr().add(HEADER_SIZE),
            self.mem.len - HEADER_SIZE,
        )
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Whether this buffer was created by the calling process. A child
    /// forked after creation inherits the mapping but must not write to it.
    pub fn is_current_process(&self, pid: i32) -> bool {
        self.word(layout::PID).load(Ordering::Relaxed) as i32 == pid && pid == self.pid
    }

    /// Whether syscall `nr` is selected for recording.
    pub fn wants(&self, nr: u64) -> bool {
        match syscall_index(nr, self.abi.syscall_base) {
            Some(index) => self.numbers.contains(index),
            None => self.numbers.not_flag(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.mem.len - HEADER_SIZE
    }

    pub fn current(&self) -> usize {
        self.word(layout::CURRENT).load(Ordering::Relaxed) as usize
    }

    pub fn syscall_count(&self) -> u64 {
        self.dword(layout::SYSCALL_COUNT).load(Ordering::Relaxed)
    }

    pub fn lock(&self) -> FutexGuard<'_> {
        FutexLock::new(self.word(layout::MUTEX)).lock()
    }

    /// A copy of the header.
    pub fn header(&self) -> Header {
        let bytes = unsafe { core::slice::from_raw_parts(self.mem.addr.as_ptr(), HEADER_SIZE) };
        layout::read_header(bytes).unwrap_or_default()
    }

    /// A copy of the records written since the last flush.
    pub fn pending(&self) -> Vec<u8> {
        let _guard = self.lock();
        unsafe { self.arena()[..self.current()].to_vec() }
    }

    /// Asks the supervisor to persist the arena up to `current` and starts
    /// over at the beginning. Call with the lock held.
    fn flush_locked(&self, current: usize) {
        let ret = self
            .channel
            .call(Request::new(Command::FlushBuffers, current as u64), &[]);
        debug!(DEBUG_DUMP, "flush {} bytes -> {}", current, ret);
        self.word(layout::CURRENT).store(0, Ordering::Relaxed);
    }

    /// Flushes whatever is pending.
    pub fn flush(&self) {
        let _guard = self.lock();
        let current = self.current();
        if current > 0 {
            self.flush_locked(current);
        }
    }

    /// The part of the stack to capture for stack pointer `sp`: from the
    /// start of its page up to the end of its mapping, capped at the
    /// configured maximum. The mapping is looked up once and cached in the
    /// header.
    fn stack_window(&self, sp: u64) -> (u64, usize) {
        let base = sp & !(self.page_size - 1);
        let begin = self.dword(layout::STACK_BEGIN).load(Ordering::Relaxed);
        let end = self.dword(layout::STACK_END).load(Ordering::Relaxed);

        let end = if begin <= base && base < end {
            end
        } else {
            match crate::maps::find_mapping(base) {
                Ok(Some((start, end))) => {
                    self.dword(layout::STACK_BEGIN).store(start, Ordering::Relaxed);
                    self.dword(layout::STACK_END).store(end, Ordering::Relaxed);
                    end
                }
                Ok(None) => return (base, 0),
                Err(_) => return (base, FALLBACK_STACK_SIZE.min(self.max_stack) & !3),
            }
        };

        // Whole words only, like every other block of a record.
        (base, ((end - base) as usize).min(self.max_stack) & !3)
    }

    /// The pointer arguments of syscall `nr` to capture, skipping those
    /// inside `stack`.
    fn param_regions(
        &self,
        nr: u64,
        args: &[u64; 6],
        stack: (u64, u64),
    ) -> heapless::Vec<(u64, usize), MAX_HEAP_REGIONS> {
        let mut regions = heapless::Vec::new();
        if self.max_param == 0 {
            return regions;
        }
        let spec = syscall_index(nr, self.abi.syscall_base)
            .map(|index| self.params.get(index))
            .unwrap_or_default();
        for capture in spec.captures(args, stack) {
            let (addr, len) = match capture {
                Capture::CString { addr } => (addr, Self::probe_cstring(addr, self.max_param)),
                Capture::Sized { addr, len } => (addr, (len as usize).min(self.max_param)),
            };
            if len > 0 && regions.push((addr, len)).is_err() {
                break;
            }
        }
        regions
    }

    /// Length of the nul-terminated string at `addr`, counting the nul,
    /// capped at `max`. Zero if nothing there is readable.
    fn probe_cstring(addr: u64, max: usize) -> usize {
        let mut buf = [0u8; MAX_CSTRING_PROBE];
        let max = max.min(MAX_CSTRING_PROBE);
        let readable = raw::read_self(addr, &mut buf[..max]);
        match buf[..readable].iter().position(|b| *b == 0) {
            Some(nul) => nul + 1,
            None => readable,
        }
    }

    /// Makes room for a record of `size` bytes. Returns where to write it,
    /// or `None` if it can never fit.
    fn reserve(&self, size: usize) -> Option<usize> {
        if size > self.capacity() {
            return None;
        }
        let current = self.current();
        if current + size > self.capacity() {
            self.flush_locked(current);
            return Some(0);
        }
        Some(current)
    }

    /// Appends a syscall record: the result as extra data, the register
    /// frame, the stack and the pointer arguments described by the
    /// parameter table.
    pub fn record_syscall(&self, frame: &Frame<'_>, result: u64) -> Result<()> {
        let tid = raw::gettid();
        let nr = frame.nr();
        let args = frame.args();
        let cpu = self.abi.regs_size() + self.abi.fpregs_size;

        let _guard = self.lock();

        let (stack_addr, mut stack_len) = self.stack_window(frame.sp());

        let mut regions =
            self.param_regions(nr, &args, (stack_addr, stack_addr + stack_len as u64));

        let size_of = |stack_len: usize, regions: &[(u64, usize)]| {
            regions
                .iter()
                .fold(RecordSize::new(8, cpu).stack(stack_len), |size, (_, len)| {
                    size.region(*len)
                })
                .get()
        };
        let mut size = size_of(stack_len, &regions);
        if size > self.capacity() {
            regions.clear();
            size = size_of(stack_len, &regions);
        }
        if size > self.capacity() {
            // Without the stack, arguments pointing into it are regions again.
            stack_len = 0;
            regions = self.param_regions(nr, &args, NO_STACK);
            size = size_of(stack_len, &regions);
            if size > self.capacity() {
                regions.clear();
                size = size_of(stack_len, &regions);
            }
        }
        let Some(start) = self.reserve(size) else {
            return Ok(());
        };

        debug!(
            DEBUG_DUMP,
            "dump-syscall tid={} nr={} result={:#x} pos={} stack={:#x},{}",
            tid,
            nr,
            result,
            start,
            stack_addr,
            stack_len
        );

        let mut w = RecordWriter::new(unsafe { self.arena() }, start);
        w.header(&RecordHeader {
            time: raw::clock_realtime(),
            event_type: nr as u16,
            thread_num: 1,
            tid: tid as u16,
            extra_size: 8,
        })?;
        w.extra(&(result as i64).to_ne_bytes())?;
        w.registers(tid as u16, frame.as_bytes(), self.abi.fpregs_size)?;
        raw::read_self(stack_addr, w.stack(stack_addr, stack_len)?);
        w.heap_count(regions.len())?;
        for (addr, len) in &regions {
            raw::read_self(*addr, w.region(*addr, *len)?);
        }
        debug_assert_eq!(w.position(), start + size);

        self.word(layout::CURRENT)
            .store(w.position() as u32, Ordering::Relaxed);
        self.dword(layout::SYSCALL_COUNT)
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Appends a signal, D-Bus or X11 event. The payload is truncated to
    /// [`EVENT_EXTRA_INFO_SIZE`] bytes. Only the stack pointer of the
    /// register block is filled in.
    pub fn record_event_simple(&self, event_type: u16, payload: &[u8]) -> Result<()> {
        let payload = &payload[..payload.len().min(EVENT_EXTRA_INFO_SIZE)];
        let tid = raw::gettid();
        let cpu = self.abi.regs_size() + self.abi.fpregs_size;

        let mut slots = [0u64; MAX_FRAME_WORDS];
        let sp = &slots as *const _ as u64;
        let words = self.abi.words.min(MAX_FRAME_WORDS);
        slots[self.abi.sp] = sp;
        let regs = unsafe { core::slice::from_raw_parts(slots.as_ptr().cast::<u8>(), words * 8) };

        let _guard = self.lock();

        let (stack_addr, mut stack_len) = self.stack_window(sp);
        let mut size = RecordSize::new(payload.len(), cpu).stack(stack_len).get();
        if size > self.capacity() {
            stack_len = 0;
            size = RecordSize::new(payload.len(), cpu).get();
        }
        let Some(start) = self.reserve(size) else {
            return Ok(());
        };

        debug!(
            DEBUG_DUMP,
            "dump-event tid={} type={:#x} pos={} len={}",
            tid,
            event_type,
            start,
            payload.len()
        );

        let mut w = RecordWriter::new(unsafe { self.arena() }, start);
        w.header(&RecordHeader {
            time: raw::clock_realtime(),
            event_type,
            thread_num: 1,
            tid: tid as u16,
            extra_size: align4(payload.len()) as u16,
        })?;
        w.extra(payload)?;
        w.registers(tid as u16, regs, cpu - regs.len())?;
        raw::read_self(stack_addr, w.stack(stack_addr, stack_len)?);
        w.heap_count(0)?;

        self.word(layout::CURRENT)
            .store(w.position() as u32, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;

    use emd_proto::ArgFlags;
    use emd_proto::EventKind;
    use emd_proto::ParamSpec;
    use emd_proto::RecordReader;
    use emd_trampoline::Native;
    use emd_trampoline::TrampolineBuilder;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: RefCell<Vec<Request>>,
    }

    impl Channel for Recorder {
        fn call(&self, request: Request, _payload: &[u8]) -> i32 {
            self.calls.borrow_mut().push(request);
            0
        }
    }

    fn dumper(size: usize, config: BufferConfig) -> MemoryDumper<Recorder> {
        MemoryDumper::in_memory(size, &config, Native::ABI, Recorder::default()).unwrap()
    }

    fn frame_for(slots: &mut [u64], nr: u64, args: [u64; 6]) -> Frame<'_> {
        let abi = &Native::ABI;
        for (slot, arg) in abi.args.iter().zip(args) {
            slots[*slot] = arg;
        }
        slots[abi.nr] = nr;
        let sp = slots.as_ptr() as u64;
        slots[abi.sp] = sp;
        Frame::new(abi, slots).unwrap()
    }

    #[test]
    fn attach_claims_buffer() {
        let d = dumper(64 * 1024, BufferConfig::default());
        let header = d.header();
        assert_eq!(header.pid, raw::getpid());
        assert_eq!(header.mutex, MUTEX_FREE);
        assert_eq!(header.current, 0);
        assert!(d.is_current_process(raw::getpid()));
        assert!(!d.is_current_process(raw::getpid() + 1));
        assert_eq!(
            d.channel().calls.borrow().as_slice(),
            &[Request::new(Command::EnableDump, 0)]
        );
    }

    #[test]
    fn syscall_record_with_string_argument() {
        let nr = syscalls::Sysno::openat as u64;
        let mut params = ParamTable::new();
        params.set(
            syscall_index(nr, Native::ABI.syscall_base).unwrap(),
            ParamSpec::new(ArgFlags::ARG1, 4),
        );
        let d = dumper(
            256 * 1024,
            BufferConfig {
                params,
                max_stack_size: 512,
                ..Default::default()
            },
        );

        let path = Box::new(*b"/tmp/x\0");
        let mut slots = [0u64; MAX_FRAME_WORDS];
        let frame = frame_for(&mut slots, nr, [0, path.as_ptr() as u64, 0, 0, 0, 0]);
        d.record_syscall(&frame, 3).unwrap();

        assert_eq!(d.syscall_count(), 1);
        let pending = d.pending();
        let records: Vec<_> = RecordReader::new(&pending).collect::<std::result::Result<_, _>>().unwrap();
        assert_eq!(records.len(), 1);
        let rec = &records[0];
        assert_eq!(rec.kind(), EventKind::Syscall(nr as u16));
        assert_eq!(rec.result(), Some(3));
        assert_eq!(rec.header.tid, raw::gettid() as u16);
        assert_eq!(rec.threads[0].cpu.len(), Native::ABI.regs_size() + Native::ABI.fpregs_size);
        assert!(rec.threads[0].stack.data.len() <= 512);
        assert_eq!(rec.heap.len(), 1);
        assert_eq!(rec.heap[0].addr, path.as_ptr() as u64);
        assert_eq!(&rec.heap[0].data[..7], b"/tmp/x\0");
    }

    #[test]
    fn stack_arguments_are_kept_when_the_stack_is_dropped() {
        let nr = syscalls::Sysno::openat as u64;
        let mut params = ParamTable::new();
        params.set(
            syscall_index(nr, Native::ABI.syscall_base).unwrap(),
            ParamSpec::new(ArgFlags::ARG1, 4),
        );
        let d = dumper(
            64 * 1024,
            BufferConfig {
                params,
                max_stack_size: 1 << 20,
                ..Default::default()
            },
        );

        // A stack far larger than the buffer, holding the path argument.
        let mut stack = memmap2::MmapMut::map_anon(256 * 1024).unwrap();
        stack[64..71].copy_from_slice(b"/tmp/x\0");
        let path = stack.as_ptr() as u64 + 64;

        let mut slots = [0u64; MAX_FRAME_WORDS];
        let mut frame = frame_for(&mut slots, nr, [0, path, 0, 0, 0, 0]);
        frame.set(Native::ABI.sp, stack.as_ptr() as u64 + 32);
        d.record_syscall(&frame, 3).unwrap();

        let pending = d.pending();
        let records: Vec<_> = RecordReader::new(&pending).collect::<std::result::Result<_, _>>().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].threads[0].stack.data.is_empty());
        assert_eq!(records[0].heap.len(), 1);
        assert_eq!(records[0].heap[0].addr, path);
        assert_eq!(&records[0].heap[0].data[..7], b"/tmp/x\0");
    }

    #[test]
    fn stack_capture_is_whole_words() {
        let d = dumper(
            64 * 1024,
            BufferConfig {
                max_stack_size: 1023,
                ..Default::default()
            },
        );
        let mut slots = [0u64; MAX_FRAME_WORDS];
        let frame = frame_for(&mut slots, 0, [0; 6]);
        d.record_syscall(&frame, 0).unwrap();

        let pending = d.pending();
        let rec = RecordReader::new(&pending).next().unwrap().unwrap();
        let stack = &rec.threads[0].stack.data;
        assert!(stack.len() <= 1020);
        assert_eq!(stack.len() % 4, 0);
    }

    #[test]
    fn filtered_syscalls() {
        let d = dumper(
            64 * 1024,
            BufferConfig {
                numbers: NumberSet::allow([3, 5]),
                ..Default::default()
            },
        );
        let base = Native::ABI.syscall_base as u64;
        assert!(d.wants(base + 3));
        assert!(d.wants(base + 5));
        assert!(!d.wants(base + 4));
        assert!(!d.wants(base + 5000));
    }

    #[test]
    fn overflow_flushes_before_the_record() {
        let d = dumper(
            64 * 1024,
            BufferConfig {
                max_stack_size: 4096,
                ..Default::default()
            },
        );
        let mut slots = [0u64; MAX_FRAME_WORDS];
        let frame = frame_for(&mut slots, 0, [0; 6]);

        let mut flushes = 0;
        for i in 0..200 {
            let before = d.current();
            d.record_syscall(&frame, i).unwrap();
            let calls = d.channel().calls.borrow();
            let flushed: Vec<_> = calls
                .iter()
                .filter(|r| r.command == Command::FlushBuffers)
                .collect();
            if flushed.len() > flushes {
                flushes = flushed.len();
                // The flush covers everything written before this record.
                assert_eq!(flushed.last().unwrap().arg, before as u64);
                let pending_now = d.pending();
                let first = RecordReader::new(&pending_now).next().unwrap().unwrap();
                assert_eq!(first.offset, 0);
                assert_eq!(first.result(), Some(i as i64));
            }
            assert!(d.current() <= d.capacity());
        }
        assert!(flushes > 0);
        assert_eq!(d.syscall_count(), 200);
    }

    #[test]
    fn simple_event_payload() {
        let d = dumper(64 * 1024, BufferConfig::default());
        d.record_event_simple(0x2203, b"win=1a00003,key=38\0").unwrap();
        d.record_event_simple(0x2101, &[b'x'; 400]).unwrap();

        let pending = d.pending();
        let records: Vec<_> = RecordReader::new(&pending).collect::<std::result::Result<_, _>>().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind(), EventKind::X11(3));
        assert_eq!(records[0].payload(), b"win=1a00003,key=38");
        assert_eq!(records[1].kind(), EventKind::Dbus(1));
        assert_eq!(records[1].extra.len(), EVENT_EXTRA_INFO_SIZE);
        assert_eq!(d.syscall_count(), 0);
    }

    #[test]
    fn explicit_flush_resets_cursor() {
        let d = dumper(64 * 1024, BufferConfig::default());
        d.flush();
        assert!(d
            .channel()
            .calls
            .borrow()
            .iter()
            .all(|r| r.command != Command::FlushBuffers));

        d.record_event_simple(0x2001, b"sig").unwrap();
        let current = d.current();
        assert!(current > 0);
        d.flush();
        assert_eq!(d.current(), 0);
        assert_eq!(
            d.channel().calls.borrow().last(),
            Some(&Request::new(Command::FlushBuffers, current as u64))
        );
    }
}
