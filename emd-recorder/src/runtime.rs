/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Process-wide recorder state and the entry points the preload library
//! exports.

use core::ffi::c_int;
use core::ffi::c_void;
use core::sync::atomic::AtomicBool;
use core::sync::atomic::Ordering;

use emd_print::debug;
use emd_proto::Channel;
use emd_proto::Request;
use emd_trampoline::Frame;
use emd_trampoline::Native;
use emd_trampoline::TrampolineBuilder;
use once_cell::sync::OnceCell;
use syscalls::Sysno;

use crate::config::DEBUG_DUMP;
use crate::config::DEBUG_SYSCALL;
use crate::dispatch;
use crate::elf;
use crate::interceptors::dbus;
use crate::interceptors::dbus::LibDbus;
use crate::interceptors::dbus::MessageView;
use crate::interceptors::x11::X11Recorder;
use crate::interceptors::x11::XEvent;
use crate::interceptors::x11::XGenericEventCookie;
use crate::interceptors::x11::XcbGenericEvent;
use crate::interceptors::EventSink;
use crate::maps;
use crate::patch::PatchEngine;
use crate::raw;
use crate::vdso::Vdso;
use crate::Config;
use crate::DumperSlot;
use crate::MemoryDumper;
use crate::RawBackend;
use crate::Result;
use crate::SocketChannel;

type Dumper = MemoryDumper<SocketChannel>;

static CONFIG: OnceCell<Config> = OnceCell::new();
static SLOT: DumperSlot<Dumper> = DumperSlot::new();
/// Set once patching is complete. Hooks taken before that do not record.
static ACTIVE: AtomicBool = AtomicBool::new(false);
static VDSO: OnceCell<Vdso> = OnceCell::new();
static LIBDBUS: OnceCell<Option<LibDbus>> = OnceCell::new();
static X11: X11Recorder = X11Recorder::new();

/// Largest register frame of any supported architecture, in words.
const FRAME_WORDS: usize = 40;

/// Sets up recording for the current process. Does nothing for programs
/// the configuration excludes.
pub fn init(argv0: &str) {
    let config = CONFIG.get_or_init(Config::from_env);
    config.apply_debug_gates();
    if !config.instruments(argv0) {
        debug!(DEBUG_SYSCALL, "not recording {}", argv0);
        return;
    }

    if config.hook_vdso {
        match Vdso::resolve() {
            Ok(vdso) => {
                let _ = VDSO.set(vdso);
            }
            Err(err) => debug!(DEBUG_SYSCALL, "vdso: {}", err),
        }
    }

    match patch_modules(config) {
        Ok(count) => debug!(DEBUG_SYSCALL, "{} syscall sites patched", count),
        Err(err) => debug!(DEBUG_SYSCALL, "patching failed: {}", err),
    }
    ACTIVE.store(true, Ordering::Release);
}

/// Patches every eligible module. The recorder's own code is never
/// patched.
fn patch_modules(config: &Config) -> Result<usize> {
    let hook = emd_syscall_hook as usize as u64;

    // Everything that allocates or parses happens before the first patch.
    let descs: Vec<elf::InterceptDesc> = elf::loaded_modules()
        .into_iter()
        .filter(|m| !m.contains(hook) && elf::should_patch(&m.path, config.scope))
        .filter_map(|m| match elf::find_text(&m.path, m.bias) {
            Ok(desc) => Some(desc),
            Err(err) => {
                debug!(DEBUG_SYSCALL, "{}: {}", m.path.display(), err);
                None
            }
        })
        .collect();
    let maps = maps::snapshot()?
        .into_iter()
        .map(|m| (m.start, m.end))
        .collect();
    let page = page_size();

    let mut engine = PatchEngine::new(Native::default(), hook, page, maps);
    for desc in &descs {
        unsafe { engine.patch_module(desc) };
    }
    engine.seal()?;
    Ok(engine.patched())
}

fn page_size() -> u64 {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as u64,
        _ => 4096,
    }
}

/// Flushes what is pending and stops recording. Hooks taken afterwards
/// pass through.
pub fn fini() {
    ACTIVE.store(false, Ordering::Release);
    if let Some(dumper) = SLOT.close() {
        if dumper.is_current_process(raw::getpid()) {
            dumper.flush();
        }
    }
}

fn active_config() -> Option<&'static Config> {
    if ACTIVE.load(Ordering::Acquire) {
        CONFIG.get()
    } else {
        None
    }
}

fn create_dumper(config: &Config) -> Option<Dumper> {
    let channel = SocketChannel::new(&config.control_dir, raw::getpid()).ok()?;
    match MemoryDumper::create(channel, config.buffer_size, Native::ABI) {
        Ok(dumper) => Some(dumper),
        Err(err) => {
            debug!(DEBUG_DUMP, "no event log: {}", err);
            None
        }
    }
}

/// The event log, created on first use.
fn dumper() -> Option<&'static Dumper> {
    let config = active_config()?;
    SLOT.get_or_create(|| create_dumper(config))
}

/// Called by every trampoline with the register frame it built. Returns
/// the value for the syscall result register.
///
/// # Safety
///
/// `frame` must point at a register frame laid out as
/// `Native::ABI` describes.
#[no_mangle]
pub unsafe extern "C" fn emd_syscall_hook(frame: *mut u64) -> u64 {
    let abi = &Native::ABI;
    let slots = core::slice::from_raw_parts_mut(frame, abi.words);
    let Some(mut frame) = Frame::new(abi, slots) else {
        return -(libc::ENOSYS as i64) as u64;
    };
    dispatch(&mut frame, &RawBackend, dumper())
}

/// Sends simple events to the event log, or to the supervisor while no
/// log exists.
pub struct RuntimeSink;

impl EventSink for RuntimeSink {
    fn emit(&self, event_type: u16, payload: &[u8]) {
        emit(event_type, payload)
    }
}

/// Records a signal, D-Bus or X11 event.
pub fn emit(event_type: u16, payload: &[u8]) {
    let pid = raw::getpid();
    if let Some(dumper) = SLOT.get().filter(|d| d.is_current_process(pid)) {
        if let Err(err) = dumper.record_event_simple(event_type, payload) {
            debug!(DEBUG_DUMP, "event {:#x} dropped: {}", event_type, err);
        }
        return;
    }

    let Some(config) = active_config() else {
        return;
    };
    let Ok(channel) = SocketChannel::new(&config.control_dir, pid) else {
        return;
    };
    let payload = &payload[..payload.len().min(emd_proto::EVENT_EXTRA_INFO_SIZE)];
    let request = Request::dump_event(event_type, payload.len() as u16, raw::gettid() as u32);
    channel.call(request, payload);
}

/// Records a D-Bus message and the reply to it. Either may be null.
///
/// # Safety
///
/// Non-null arguments must be live `DBusMessage` pointers.
pub unsafe fn record_dbus(msg: *mut c_void, reply: *mut c_void) {
    let Some(config) = active_config() else {
        return;
    };
    let Some(lib) = LIBDBUS.get_or_init(LibDbus::load).as_ref() else {
        return;
    };
    let msg = (!msg.is_null()).then(|| lib.message(msg));
    let reply = (!reply.is_null()).then(|| lib.message(reply));
    dbus::dump(
        &RuntimeSink,
        &config.dbus_filter,
        msg.as_ref().map(|m| m as &dyn MessageView),
        reply.as_ref().map(|m| m as &dyn MessageView),
    );
}

/// Records an event returned by `XNextEvent`.
pub fn record_xevent(event: &XEvent) {
    if let Some(config) = active_config() {
        X11.next_event(&RuntimeSink, &config.x11_filter, event);
    }
}

/// Records the device event behind a cookie filled in by `XGetEventData`.
///
/// # Safety
///
/// See [`X11Recorder::event_data`].
pub unsafe fn record_event_data(cookie: &XGenericEventCookie) {
    if let Some(config) = active_config() {
        X11.event_data(&RuntimeSink, &config.x11_filter, cookie);
    }
}

/// Records an event returned by `xcb_wait_for_event`.
///
/// # Safety
///
/// See [`crate::interceptors::x11::describe_xcb`].
pub unsafe fn record_xcb_event(event: *const XcbGenericEvent) {
    if let Some(config) = active_config() {
        X11.xcb_event(&RuntimeSink, &config.x11_filter, event);
    }
}

/// Whether the time functions are served and recorded here.
pub fn hooks_vdso() -> bool {
    VDSO.get().is_some() && active_config().is_some()
}

/// Records a syscall that was served without a trampoline, such as a vDSO
/// call.
fn record_synthetic(nr: Sysno, args: [u64; 6], result: u64) {
    let Some(dumper) = dumper() else {
        return;
    };
    if !dumper.is_current_process(raw::getpid()) || !dumper.wants(nr as u64) {
        return;
    }

    let abi = &Native::ABI;
    let mut slots = [0u64; FRAME_WORDS];
    let sp = &slots as *const _ as u64;
    slots[abi.nr] = nr as u64;
    for (slot, arg) in abi.args.iter().zip(args) {
        slots[*slot] = arg;
    }
    slots[abi.sp] = sp;
    let Some(mut frame) = Frame::new(abi, &mut slots) else {
        return;
    };
    frame.set_result(result);
    if let Err(err) = dumper.record_syscall(&frame, result) {
        debug!(DEBUG_SYSCALL, "record of {} failed: {}", nr, err);
    }
}

/// Turns a raw kernel result into the libc convention.
unsafe fn libc_result(raw: i64) -> c_int {
    if (-4095..0).contains(&raw) {
        *libc::__errno_location() = -raw as c_int;
        -1
    } else {
        raw as c_int
    }
}

/// `clock_gettime` through the vDSO, or the kernel if the vDSO lacks it.
///
/// # Safety
///
/// `ts` must be valid for writes.
pub unsafe fn clock_gettime(clock: libc::clockid_t, ts: *mut libc::timespec) -> c_int {
    let raw = match VDSO.get().and_then(|v| v.clock_gettime) {
        Some(f) => f(clock, ts) as i64,
        None => raw::syscall(Sysno::clock_gettime as u64, [clock as u64, ts as u64, 0, 0, 0, 0]) as i64,
    };
    record_synthetic(Sysno::clock_gettime, [clock as u64, ts as u64, 0, 0, 0, 0], raw as u64);
    libc_result(raw)
}

/// `gettimeofday` through the vDSO, or the kernel if the vDSO lacks it.
///
/// # Safety
///
/// Non-null arguments must be valid for writes.
pub unsafe fn gettimeofday(tv: *mut libc::timeval, tz: *mut c_void) -> c_int {
    let raw = match VDSO.get().and_then(|v| v.gettimeofday) {
        Some(f) => f(tv, tz) as i64,
        None => raw::syscall(Sysno::gettimeofday as u64, [tv as u64, tz as u64, 0, 0, 0, 0]) as i64,
    };
    record_synthetic(Sysno::gettimeofday, [tv as u64, tz as u64, 0, 0, 0, 0], raw as u64);
    libc_result(raw)
}
