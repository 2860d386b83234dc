/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The preload object. Loading it into a process installs syscall
//! interception and exports the library entry points whose calls are
//! recorded as D-Bus and X11 events.

#![allow(non_snake_case)]

use core::ffi::c_char;
use core::ffi::c_int;
use core::ffi::c_void;
use std::ffi::CStr;

use emd_print::debug;
use emd_recorder::config::DEBUG_SYSCALL;
use emd_recorder::interceptors::x11::XEvent;
use emd_recorder::interceptors::x11::XGenericEventCookie;
use emd_recorder::interceptors::x11::XcbGenericEvent;
use emd_recorder::interpose::NextSymbol;
use emd_recorder::runtime;

// Allocation can happen inside hooks that run while the target's own
// allocator holds its locks. A separate allocator keeps us off them.
#[global_allocator]
static GLOBAL_ALLOCATOR: mimalloc::MiMalloc = mimalloc::MiMalloc;

type InitFn = extern "C" fn(c_int, *const *const c_char, *const *const c_char);

#[cfg(not(test))]
#[link_section = ".init_array"]
#[used]
static INIT: InitFn = init;

#[cfg(not(test))]
#[link_section = ".fini_array"]
#[used]
static FINI: extern "C" fn() = fini;

/// glibc passes the program arguments to `.init_array` entries.
extern "C" fn init(argc: c_int, argv: *const *const c_char, _envp: *const *const c_char) {
    let argv0 = if argc > 0 && !argv.is_null() {
        let first = unsafe { *argv };
        if first.is_null() {
            None
        } else {
            unsafe { CStr::from_ptr(first) }.to_str().ok()
        }
    } else {
        None
    };
    let argv0 = argv0.unwrap_or("");
    debug!(DEBUG_SYSCALL, "preload init in {}", argv0);
    runtime::init(argv0);
}

extern "C" fn fini() {
    runtime::fini();
}

type DbusBool = u32;

static DBUS_CONNECTION_SEND: NextSymbol = NextSymbol::new(c"dbus_connection_send");
static DBUS_CONNECTION_SEND_WITH_REPLY: NextSymbol =
    NextSymbol::new(c"dbus_connection_send_with_reply");
static DBUS_PENDING_CALL_STEAL_REPLY: NextSymbol =
    NextSymbol::new(c"dbus_pending_call_steal_reply");
static DBUS_CONNECTION_POP_MESSAGE: NextSymbol = NextSymbol::new(c"dbus_connection_pop_message");
static X_NEXT_EVENT: NextSymbol = NextSymbol::new(c"XNextEvent");
static X_GET_EVENT_DATA: NextSymbol = NextSymbol::new(c"XGetEventData");
static XCB_WAIT_FOR_EVENT: NextSymbol = NextSymbol::new(c"xcb_wait_for_event");
static CLOCK_GETTIME: NextSymbol = NextSymbol::new(c"clock_gettime");
static GETTIMEOFDAY: NextSymbol = NextSymbol::new(c"gettimeofday");

#[no_mangle]
pub unsafe extern "C" fn dbus_connection_send(
    connection: *mut c_void,
    message: *mut c_void,
    serial: *mut u32,
) -> DbusBool {
    type F = unsafe extern "C" fn(*mut c_void, *mut c_void, *mut u32) -> DbusBool;
    let Some(real) = DBUS_CONNECTION_SEND.get_fn::<F>() else {
        return 0;
    };
    let ret = real(connection, message, serial);
    after_send(ret, message, |m| runtime::record_dbus(m, core::ptr::null_mut()));
    ret
}

/// Records `message` only if libdbus accepted it.
fn after_send<F>(ret: DbusBool, message: *mut c_void, record: F)
where
    F: FnOnce(*mut c_void),
{
    if ret != 0 {
        record(message);
    }
}

#[no_mangle]
pub unsafe extern "C" fn dbus_connection_send_with_reply(
    connection: *mut c_void,
    message: *mut c_void,
    pending_return: *mut *mut c_void,
    timeout_milliseconds: c_int,
) -> DbusBool {
    type F = unsafe extern "C" fn(*mut c_void, *mut c_void, *mut *mut c_void, c_int) -> DbusBool;
    let Some(real) = DBUS_CONNECTION_SEND_WITH_REPLY.get_fn::<F>() else {
        return 0;
    };
    let ret = real(connection, message, pending_return, timeout_milliseconds);
    after_send(ret, message, |m| runtime::record_dbus(m, core::ptr::null_mut()));
    ret
}

#[no_mangle]
pub unsafe extern "C" fn dbus_pending_call_steal_reply(pending: *mut c_void) -> *mut c_void {
    type F = unsafe extern "C" fn(*mut c_void) -> *mut c_void;
    let Some(real) = DBUS_PENDING_CALL_STEAL_REPLY.get_fn::<F>() else {
        return core::ptr::null_mut();
    };
    let reply = real(pending);
    if !reply.is_null() {
        runtime::record_dbus(core::ptr::null_mut(), reply);
    }
    reply
}

#[no_mangle]
pub unsafe extern "C" fn dbus_connection_pop_message(connection: *mut c_void) -> *mut c_void {
    type F = unsafe extern "C" fn(*mut c_void) -> *mut c_void;
    let Some(real) = DBUS_CONNECTION_POP_MESSAGE.get_fn::<F>() else {
        return core::ptr::null_mut();
    };
    let msg = real(connection);
    if !msg.is_null() {
        runtime::record_dbus(core::ptr::null_mut(), msg);
    }
    msg
}

#[no_mangle]
pub unsafe extern "C" fn XNextEvent(display: *mut c_void, event: *mut XEvent) -> c_int {
    type F = unsafe extern "C" fn(*mut c_void, *mut XEvent) -> c_int;
    let Some(real) = X_NEXT_EVENT.get_fn::<F>() else {
        return 0;
    };
    if event.is_null() {
        return real(display, event);
    }
    // A failed call must not leave a stale event behind to be recorded.
    *event = XEvent::zeroed();
    let ret = real(display, event);
    runtime::record_xevent(&*event);
    ret
}

#[no_mangle]
pub unsafe extern "C" fn XGetEventData(
    display: *mut c_void,
    cookie: *mut XGenericEventCookie,
) -> c_int {
    type F = unsafe extern "C" fn(*mut c_void, *mut XGenericEventCookie) -> c_int;
    let Some(real) = X_GET_EVENT_DATA.get_fn::<F>() else {
        return 0;
    };
    let ret = real(display, cookie);
    if ret != 0 && !cookie.is_null() {
        runtime::record_event_data(&*cookie);
    }
    ret
}

#[no_mangle]
pub unsafe extern "C" fn xcb_wait_for_event(connection: *mut c_void) -> *mut XcbGenericEvent {
    type F = unsafe extern "C" fn(*mut c_void) -> *mut XcbGenericEvent;
    let Some(real) = XCB_WAIT_FOR_EVENT.get_fn::<F>() else {
        return core::ptr::null_mut();
    };
    let event = real(connection);
    if !event.is_null() {
        runtime::record_xcb_event(event);
    }
    event
}

#[no_mangle]
pub unsafe extern "C" fn clock_gettime(clock: libc::clockid_t, ts: *mut libc::timespec) -> c_int {
    type F = unsafe extern "C" fn(libc::clockid_t, *mut libc::timespec) -> c_int;
    match CLOCK_GETTIME.get_fn::<F>() {
        Some(real) if !runtime::hooks_vdso() => real(clock, ts),
        _ => runtime::clock_gettime(clock, ts),
    }
}

#[no_mangle]
pub unsafe extern "C" fn gettimeofday(tv: *mut libc::timeval, tz: *mut c_void) -> c_int {
    type F = unsafe extern "C" fn(*mut libc::timeval, *mut c_void) -> c_int;
    match GETTIMEOFDAY.get_fn::<F>() {
        Some(real) if !runtime::hooks_vdso() => real(tv, tz),
        _ => runtime::gettimeofday(tv, tz),
    }
}
