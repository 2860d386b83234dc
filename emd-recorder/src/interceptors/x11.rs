/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! X11 and XCB input event summaries.

use core::ffi::c_int;
use core::ffi::c_long;
use core::ffi::c_uint;
use core::ffi::c_ulong;
use core::ffi::c_void;
use core::fmt::Write;

use emd_print::debug;
use emd_proto::X11_BASE;
use parking_lot::Mutex;

use super::EventSink;
use super::Summary;
use crate::config::EventFilter;
use crate::config::DEBUG_X11;

pub const KEY_PRESS: c_int = 2;
pub const KEY_RELEASE: c_int = 3;
pub const BUTTON_PRESS: c_int = 4;
pub const BUTTON_RELEASE: c_int = 5;
pub const FOCUS_IN: c_int = 9;
pub const FOCUS_OUT: c_int = 10;
pub const CREATE_NOTIFY: c_int = 16;
pub const DESTROY_NOTIFY: c_int = 17;
pub const UNMAP_NOTIFY: c_int = 18;
pub const MAP_NOTIFY: c_int = 19;
pub const GENERIC_EVENT: c_int = 35;

pub type Window = c_ulong;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct XAnyEvent {
    pub type_: c_int,
    pub serial: c_ulong,
    pub send_event: c_int,
    pub display: *mut c_void,
    pub window: Window,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct XKeyEvent {
    pub type_: c_int,
    pub serial: c_ulong,
    pub send_event: c_int,
    pub display: *mut c_void,
    pub window: Window,
    pub root: Window,
    pub subwindow: Window,
    pub time: c_ulong,
    pub x: c_int,
    pub y: c_int,
    pub x_root: c_int,
    pub y_root: c_int,
    pub state: c_uint,
    /// Key code for key events, button number for button events.
    pub detail: c_uint,
    pub same_screen: c_int,
}

/// `XButtonEvent` has the same layout as `XKeyEvent`.
pub type XButtonEvent = XKeyEvent;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct XFocusChangeEvent {
    pub type_: c_int,
    pub serial: c_ulong,
    pub send_event: c_int,
    pub display: *mut c_void,
    pub window: Window,
    pub mode: c_int,
    pub detail: c_int,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct XCreateWindowEvent {
    pub type_: c_int,
    pub serial: c_ulong,
    pub send_event: c_int,
    pub display: *mut c_void,
    pub parent: Window,
    pub window: Window,
    pub x: c_int,
    pub y: c_int,
    pub width: c_int,
    pub height: c_int,
    pub border_width: c_int,
    pub override_redirect: c_int,
}

/// Shared layout of `XDestroyWindowEvent`, `XUnmapEvent` and `XMapEvent`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct XStructureEvent {
    pub type_: c_int,
    pub serial: c_ulong,
    pub send_event: c_int,
    pub display: *mut c_void,
    pub event: Window,
    pub window: Window,
    pub flag: c_int,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct XGenericEvent {
    pub type_: c_int,
    pub serial: c_ulong,
    pub send_event: c_int,
    pub display: *mut c_void,
    pub extension: c_int,
    pub evtype: c_int,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct XGenericEventCookie {
    pub type_: c_int,
    pub serial: c_ulong,
    pub send_event: c_int,
    pub display: *mut c_void,
    pub extension: c_int,
    pub evtype: c_int,
    pub cookie: c_uint,
    pub data: *mut c_void,
}

/// The leading part of XInput2's `XIDeviceEvent`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct XIDeviceEvent {
    pub type_: c_int,
    pub serial: c_ulong,
    pub send_event: c_int,
    pub display: *mut c_void,
    pub extension: c_int,
    pub evtype: c_int,
    pub time: c_ulong,
    pub deviceid: c_int,
    pub sourceid: c_int,
    pub detail: c_int,
    pub root: Window,
    pub event: Window,
    pub child: Window,
    pub root_x: f64,
    pub root_y: f64,
    pub event_x: f64,
    pub event_y: f64,
    pub flags: c_int,
}

/// Xlib's event union.
#[repr(C)]
#[derive(Clone, Copy)]
pub union XEvent {
    pub type_: c_int,
    pub any: XAnyEvent,
    pub key: XKeyEvent,
    pub focus: XFocusChangeEvent,
    pub create: XCreateWindowEvent,
    pub structure: XStructureEvent,
    pub generic: XGenericEvent,
    pub cookie: XGenericEventCookie,
    pad: [c_long; 24],
}

impl XEvent {
    pub const fn zeroed() -> Self {
        Self { pad: [0; 24] }
    }

    pub fn kind(&self) -> c_int {
        unsafe { self.type_ }
    }
}

/// Writes the summary of a core Xlib event. Returns false for event types
/// that are not summarized.
pub fn describe_xevent(event: &XEvent, out: &mut Summary) -> bool {
    let _ = unsafe {
        match event.type_ {
            KEY_PRESS | KEY_RELEASE => {
                write!(out, "win={:x},key={}", event.key.window, event.key.detail)
            }
            BUTTON_PRESS | BUTTON_RELEASE => write!(
                out,
                "win={:x},x={},y={}",
                event.key.window, event.key.x, event.key.y
            ),
            FOCUS_IN | FOCUS_OUT => write!(out, "win={:x}", event.focus.window),
            CREATE_NOTIFY => {
                let cr = &event.create;
                write!(
                    out,
                    "win={:x},x={},y={},w={},h={}",
                    cr.window, cr.x, cr.y, cr.width, cr.height
                )
            }
            DESTROY_NOTIFY | UNMAP_NOTIFY | MAP_NOTIFY => {
                write!(out, "win={:x}", event.structure.window)
            }
            _ => return false,
        }
    };
    true
}

/// Writes the summary of an XInput2 device event delivered through
/// `XGetEventData`.
pub fn describe_device_event(evtype: c_int, dev: &XIDeviceEvent, out: &mut Summary) -> bool {
    let _ = match evtype {
        KEY_PRESS | KEY_RELEASE => write!(out, "win={:x},key={}", dev.event, dev.detail),
        BUTTON_PRESS | BUTTON_RELEASE => write!(
            out,
            "win={:x},x={:.2},y={:.2}",
            dev.event, dev.event_x, dev.event_y
        ),
        _ => return false,
    };
    true
}

pub const XCB_GE_GENERIC: u8 = 35;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct XcbGenericEvent {
    pub response_type: u8,
    pub pad0: u8,
    pub sequence: u16,
    pub pad: [u32; 7],
    pub full_sequence: u32,
}

/// Key and button press/release share this layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct XcbInputEvent {
    pub response_type: u8,
    pub detail: u8,
    pub sequence: u16,
    pub time: u32,
    pub root: u32,
    pub event: u32,
    pub child: u32,
    pub root_x: i16,
    pub root_y: i16,
    pub event_x: i16,
    pub event_y: i16,
    pub state: u16,
    pub same_screen: u8,
    pub pad0: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct XcbFocusEvent {
    pub response_type: u8,
    pub detail: u8,
    pub sequence: u16,
    pub event: u32,
    pub mode: u8,
    pub pad0: [u8; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct XcbCreateNotifyEvent {
    pub response_type: u8,
    pub pad0: u8,
    pub sequence: u16,
    pub parent: u32,
    pub window: u32,
    pub x: i16,
    pub y: i16,
    pub width: u16,
    pub height: u16,
    pub border_width: u16,
    pub override_redirect: u8,
    pub pad1: u8,
}

/// Destroy, unmap and map notifications.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct XcbStructureEvent {
    pub response_type: u8,
    pub pad0: u8,
    pub sequence: u16,
    pub event: u32,
    pub window: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct XcbGeGenericEvent {
    pub response_type: u8,
    pub extension: u8,
    pub sequence: u16,
    pub length: u32,
    pub event_type: u16,
    pub pad0: [u8; 22],
    pub full_sequence: u32,
}

/// XInput key and button events as delivered through XCB.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct XcbXiDeviceEvent {
    pub response_type: u8,
    pub extension: u8,
    pub sequence: u16,
    pub length: u32,
    pub event_type: u16,
    pub deviceid: u16,
    pub time: u32,
    pub detail: u32,
    pub root: u32,
    pub event: u32,
    pub child: u32,
    pub full_sequence: u32,
    pub root_x: i32,
    pub root_y: i32,
    pub event_x: i32,
    pub event_y: i32,
}

/// Integer part of a 16.16 fixed point value.
fn fp1616(v: i32) -> i32 {
    (v as f64 / 65536.0) as i32
}

/// Writes the summary of an XCB event and returns the event type it is
/// recorded under, or `None` if it is not summarized or `filter` rejects
/// it.
///
/// # Safety
///
/// `event` must point at a complete event of the kind its response type
/// announces. Generic events must be 32 bytes plus their extra length.
pub unsafe fn describe_xcb(
    event: *const XcbGenericEvent,
    filter: &EventFilter,
    out: &mut Summary,
) -> Option<u8> {
    let kind = (*event).response_type & !0x80;
    let code = if kind == XCB_GE_GENERIC {
        let ge = &*event.cast::<XcbGeGenericEvent>();
        ge.event_type as c_int
    } else {
        kind as c_int
    };
    if code > u8::MAX as c_int || !filter.allows(code as u32) {
        return None;
    }

    let _ = match (kind, code) {
        (XCB_GE_GENERIC, KEY_PRESS | KEY_RELEASE) => {
            let dev = &*event.cast::<XcbXiDeviceEvent>();
            write!(out, "win={:x},key={}", dev.event, dev.detail)
        }
        (XCB_GE_GENERIC, BUTTON_PRESS | BUTTON_RELEASE) => {
            let dev = &*event.cast::<XcbXiDeviceEvent>();
            write!(
                out,
                "win={:x},x={},y={}",
                dev.event,
                fp1616(dev.event_x),
                fp1616(dev.event_y)
            )
        }
        (XCB_GE_GENERIC, _) => return None,
        (_, KEY_PRESS | KEY_RELEASE) => {
            let key = &*event.cast::<XcbInputEvent>();
            write!(out, "win={:x},key={}", key.event, key.detail)
        }
        (_, BUTTON_PRESS | BUTTON_RELEASE) => {
            let btn = &*event.cast::<XcbInputEvent>();
            write!(out, "win={:x},x={},y={}", btn.event, btn.event_x, btn.event_y)
        }
        (_, FOCUS_IN | FOCUS_OUT) => {
            let focus = &*event.cast::<XcbFocusEvent>();
            write!(out, "win={:x}", focus.event)
        }
        (_, CREATE_NOTIFY) => {
            let cr = &*event.cast::<XcbCreateNotifyEvent>();
            write!(
                out,
                "win={:x},x={},y={},w={},h={}",
                cr.window, cr.x, cr.y, cr.width, cr.height
            )
        }
        (_, DESTROY_NOTIFY | UNMAP_NOTIFY | MAP_NOTIFY) => {
            let st = &*event.cast::<XcbStructureEvent>();
            write!(out, "win={:x}", st.event)
        }
        _ => return None,
    };
    Some(code as u8)
}

/// Identity of the last generic event seen by `XNextEvent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GenericKey {
    serial: c_ulong,
    evtype: c_int,
    extension: c_int,
}

/// State shared by the X11 entry points.
pub struct X11Recorder {
    prev_generic: Mutex<Option<GenericKey>>,
}

impl X11Recorder {
    pub const fn new() -> Self {
        Self {
            prev_generic: Mutex::new(None),
        }
    }

    fn emit(sink: &dyn EventSink, code: c_int, out: &mut Summary, from: &str) {
        let payload = out.with_nul();
        sink.emit(X11_BASE + code as u16, payload);
        debug!(
            DEBUG_X11,
            "x11 {} {}: {}",
            from,
            code,
            String::from_utf8_lossy(&payload[..payload.len() - 1])
        );
    }

    /// Handles an event returned by `XNextEvent`.
    pub fn next_event(&self, sink: &dyn EventSink, filter: &EventFilter, event: &XEvent) {
        let kind = event.kind();
        if kind == GENERIC_EVENT {
            let ge = unsafe { &event.generic };
            *self.prev_generic.lock() = Some(GenericKey {
                serial: ge.serial,
                evtype: ge.evtype,
                extension: ge.extension,
            });
            return;
        }
        if kind < 0 || !filter.allows(kind as u32) {
            return;
        }
        let mut out = Summary::new();
        if describe_xevent(event, &mut out) {
            Self::emit(sink, kind, &mut out, "XNextEvent");
        }
    }

    /// Handles a cookie filled in by a successful `XGetEventData`. Only
    /// cookies belonging to the last generic event from `XNextEvent` are
    /// recorded.
    ///
    /// # Safety
    ///
    /// `cookie.data` must point at an `XIDeviceEvent` when the cookie
    /// carries an XInput2 key or button event.
    pub unsafe fn event_data(
        &self,
        sink: &dyn EventSink,
        filter: &EventFilter,
        cookie: &XGenericEventCookie,
    ) {
        let key = GenericKey {
            serial: cookie.serial,
            evtype: cookie.evtype,
            extension: cookie.extension,
        };
        if *self.prev_generic.lock() != Some(key) || cookie.data.is_null() {
            return;
        }
        if cookie.evtype < 0 || !filter.allows(cookie.evtype as u32) {
            return;
        }
        let dev = &*cookie.data.cast::<XIDeviceEvent>();
        let mut out = Summary::new();
        if describe_device_event(cookie.evtype, dev, &mut out) {
            Self::emit(sink, cookie.evtype, &mut out, "XGetEventData");
        }
    }

    /// Handles an event returned by `xcb_wait_for_event`.
    ///
    /// # Safety
    ///
    /// See [`describe_xcb`].
    pub unsafe fn xcb_event(
        &self,
        sink: &dyn EventSink,
        filter: &EventFilter,
        event: *const XcbGenericEvent,
    ) {
        if event.is_null() {
            return;
        }
        let mut out = Summary::new();
        if let Some(code) = describe_xcb(event, filter, &mut out) {
            Self::emit(sink, code as c_int, &mut out, "xcb_wait_for_event");
        }
    }
}

impl Default for X11Recorder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use core::mem::size_of;

    use super::super::test::Events;
    use super::*;

    #[test]
    fn layouts() {
        assert_eq!(size_of::<XEvent>(), 24 * size_of::<c_long>());
        assert_eq!(size_of::<XcbGenericEvent>(), 36);
        assert_eq!(size_of::<XcbInputEvent>(), 32);
        assert_eq!(size_of::<XcbCreateNotifyEvent>(), 24);
        assert_eq!(size_of::<XcbGeGenericEvent>(), 36);
        #[cfg(target_pointer_width = "64")]
        {
            assert_eq!(core::mem::offset_of!(XKeyEvent, detail), 84);
            assert_eq!(core::mem::offset_of!(XIDeviceEvent, event_x), 104);
        }
    }

    fn key_event(kind: c_int) -> XEvent {
        let mut ev = XEvent::zeroed();
        unsafe {
            ev.key.type_ = kind;
            ev.key.window = 0x1a00003;
            ev.key.detail = 38;
            ev.key.x = 10;
            ev.key.y = 20;
        }
        ev
    }

    fn emitted(events: &Events) -> Vec<(u16, Vec<u8>)> {
        events.0.borrow().clone()
    }

    #[test]
    fn core_events() {
        let rec = X11Recorder::new();
        let events = Events::default();
        rec.next_event(&events, &EventFilter::all(), &key_event(KEY_PRESS));
        rec.next_event(&events, &EventFilter::all(), &key_event(BUTTON_RELEASE));

        let mut cr = XEvent::zeroed();
        unsafe {
            cr.create.type_ = CREATE_NOTIFY;
            cr.create.window = 0x42;
            cr.create.x = -1;
            cr.create.y = 2;
            cr.create.width = 300;
            cr.create.height = 200;
        }
        rec.next_event(&events, &EventFilter::all(), &cr);

        let mut map = XEvent::zeroed();
        unsafe {
            map.structure.type_ = MAP_NOTIFY;
            map.structure.window = 0x43;
        }
        rec.next_event(&events, &EventFilter::all(), &map);

        assert_eq!(
            emitted(&events),
            vec![
                (X11_BASE + 2, b"win=1a00003,key=38\0".to_vec()),
                (X11_BASE + 5, b"win=1a00003,x=10,y=20\0".to_vec()),
                (X11_BASE + 16, b"win=42,x=-1,y=2,w=300,h=200\0".to_vec()),
                (X11_BASE + 19, b"win=43\0".to_vec()),
            ]
        );
    }

    #[test]
    fn filter_and_unknown_types() {
        let rec = X11Recorder::new();
        let events = Events::default();
        let filter = EventFilter::parse("4,5", crate::config::X11_TYPES);
        rec.next_event(&events, &filter, &key_event(KEY_PRESS));
        rec.next_event(&events, &EventFilter::all(), &key_event(6));
        assert!(emitted(&events).is_empty());
    }

    #[test]
    fn event_data_needs_matching_generic_event() {
        let rec = X11Recorder::new();
        let events = Events::default();

        let mut dev: XIDeviceEvent = unsafe { core::mem::zeroed() };
        dev.event = 0x5000001;
        dev.event_x = 12.5;
        dev.event_y = 7.25;
        let mut cookie: XGenericEventCookie = unsafe { core::mem::zeroed() };
        cookie.type_ = GENERIC_EVENT;
        cookie.serial = 77;
        cookie.extension = 131;
        cookie.evtype = BUTTON_PRESS;
        cookie.data = &mut dev as *mut XIDeviceEvent as *mut c_void;

        // No generic event seen yet.
        unsafe { rec.event_data(&events, &EventFilter::all(), &cookie) };
        assert!(emitted(&events).is_empty());

        let mut ge = XEvent::zeroed();
        unsafe {
            ge.generic.type_ = GENERIC_EVENT;
            ge.generic.serial = 77;
            ge.generic.extension = 131;
            ge.generic.evtype = BUTTON_PRESS;
        }
        rec.next_event(&events, &EventFilter::all(), &ge);
        assert!(emitted(&events).is_empty());

        unsafe { rec.event_data(&events, &EventFilter::all(), &cookie) };
        assert_eq!(
            emitted(&events),
            vec![(X11_BASE + 4, b"win=5000001,x=12.50,y=7.25\0".to_vec())]
        );
    }

    #[test]
    fn xcb_events() {
        let rec = X11Recorder::new();
        let events = Events::default();

        // Sent events carry the high bit.
        let key = XcbInputEvent {
            response_type: KEY_RELEASE as u8 | 0x80,
            detail: 24,
            event: 0x3e00005,
            ..Default::default()
        };
        let focus = XcbFocusEvent {
            response_type: FOCUS_OUT as u8,
            event: 0x3e00006,
            ..Default::default()
        };
        let xi = XcbXiDeviceEvent {
            response_type: XCB_GE_GENERIC,
            event_type: BUTTON_PRESS as u16,
            event: 0x3e00007,
            event_x: 5 << 16 | 0x8000,
            event_y: 9 << 16,
            ..Default::default()
        };
        let motion = XcbInputEvent {
            response_type: 6,
            ..Default::default()
        };
        unsafe {
            rec.xcb_event(&events, &EventFilter::all(), (&key as *const XcbInputEvent).cast());
            rec.xcb_event(&events, &EventFilter::all(), (&focus as *const XcbFocusEvent).cast());
            rec.xcb_event(&events, &EventFilter::all(), (&xi as *const XcbXiDeviceEvent).cast());
            rec.xcb_event(&events, &EventFilter::all(), (&motion as *const XcbInputEvent).cast());
            rec.xcb_event(&events, &EventFilter::all(), core::ptr::null());
        }

        assert_eq!(
            emitted(&events),
            vec![
                (X11_BASE + 3, b"win=3e00005,key=24\0".to_vec()),
                (X11_BASE + 10, b"win=3e00006\0".to_vec()),
                (X11_BASE + 4, b"win=3e00007,x=5,y=9\0".to_vec()),
            ]
        );
    }
}
