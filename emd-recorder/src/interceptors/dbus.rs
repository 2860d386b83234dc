/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! D-Bus message summaries.

use core::ffi::c_char;
use core::ffi::c_int;
use core::ffi::c_void;
use core::ffi::CStr;
use core::fmt::Write;

use emd_print::debug;
use emd_proto::DBUS_BASE;

use super::EventSink;
use super::Summary;
use crate::config::EventFilter;
use crate::config::DEBUG_DBUS;
use crate::interpose;

pub const MESSAGE_TYPE_METHOD_CALL: i32 = 1;
pub const MESSAGE_TYPE_METHOD_RETURN: i32 = 2;
pub const MESSAGE_TYPE_ERROR: i32 = 3;
pub const MESSAGE_TYPE_SIGNAL: i32 = 4;

/// A decoded message argument. Containers are named, not entered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Arg<'a> {
    Str(&'a CStr),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    Double(f64),
    Byte(u8),
    Bool(bool),
    Variant,
    Array,
    DictEntry,
    Struct,
    Other,
}

impl Arg<'_> {
    fn write(&self, out: &mut Summary) {
        let _ = match *self {
            Arg::Str(s) => {
                out.push_bytes(s.to_bytes());
                out.write_str(",")
            }
            Arg::I16(v) => write!(out, "{},", v),
            Arg::U16(v) => write!(out, "{},", v),
            Arg::I32(v) => write!(out, "{},", v),
            Arg::U32(v) => write!(out, "{},", v),
            Arg::I64(v) => write!(out, "{},", v),
            Arg::U64(v) => write!(out, "{},", v),
            Arg::Double(v) => write!(out, "{:.6},", v),
            Arg::Byte(v) => write!(out, "{},", v),
            Arg::Bool(v) => write!(out, "{},", v),
            Arg::Variant => out.write_str("variant,"),
            Arg::Array => out.write_str("array,"),
            Arg::DictEntry => out.write_str("entry,"),
            Arg::Struct => out.write_str("struct,"),
            Arg::Other => Ok(()),
        };
    }
}

/// Read access to a message.
pub trait MessageView {
    fn message_type(&self) -> i32;
    fn sender(&self) -> Option<&CStr>;
    fn destination(&self) -> Option<&CStr>;
    fn path(&self) -> Option<&CStr>;
    fn interface(&self) -> Option<&CStr>;
    fn member(&self) -> Option<&CStr>;
    fn error_name(&self) -> Option<&CStr>;
    /// Calls `f` with each top level argument in order.
    fn for_each_arg(&self, f: &mut dyn FnMut(Arg<'_>));
}

fn or_null(s: Option<&CStr>) -> &[u8] {
    s.map_or(b"null", CStr::to_bytes)
}

fn or_nil(s: Option<&CStr>) -> &[u8] {
    s.map_or(b"(null)", CStr::to_bytes)
}

/// Appends the summary of `msg` to `out` if its type passes `filter`.
/// Returns the message type.
pub fn describe(msg: &dyn MessageView, filter: &EventFilter, out: &mut Summary) -> i32 {
    let kind = msg.message_type();
    if kind < 0 || !filter.allows(kind as u32) {
        return kind;
    }

    match kind {
        MESSAGE_TYPE_METHOD_CALL | MESSAGE_TYPE_SIGNAL => {
            if let Some(sender) = msg.sender() {
                out.push_bytes(sender.to_bytes());
                out.push_bytes(b"->");
            } else {
                out.push_bytes(b"d=");
            }
            out.push_bytes(or_null(msg.destination()));
            out.push_bytes(b",p=");
            out.push_bytes(or_nil(msg.path()));
            out.push_bytes(b",i=");
            out.push_bytes(or_nil(msg.interface()));
            out.push_bytes(b",m=");
            out.push_bytes(or_nil(msg.member()));
            out.push_bytes(b";");
        }
        MESSAGE_TYPE_METHOD_RETURN => msg.for_each_arg(&mut |arg| arg.write(out)),
        MESSAGE_TYPE_ERROR => {
            out.push_bytes(or_null(msg.sender()));
            out.push_bytes(b"->");
            out.push_bytes(or_null(msg.destination()));
            out.push_bytes(b",e=");
            out.push_bytes(or_nil(msg.error_name()));
            out.push_bytes(b";");
        }
        _ => {}
    }
    kind
}

/// Summarizes an outgoing message and the reply that came back for it,
/// either of which may be missing, and hands the result to `sink`.
///
/// The event is typed after the outgoing message when there is one and
/// after the reply otherwise.
pub fn dump(
    sink: &dyn EventSink,
    filter: &EventFilter,
    msg: Option<&dyn MessageView>,
    reply: Option<&dyn MessageView>,
) {
    let mut out = Summary::new();
    let mut kind = -1;
    if let Some(msg) = msg {
        kind = describe(msg, filter, &mut out);
    }
    if let Some(reply) = reply {
        let reply_kind = describe(reply, filter, &mut out);
        if kind < 0 {
            kind = reply_kind;
        }
    }

    if out.is_empty() || kind < 0 {
        return;
    }
    sink.emit(DBUS_BASE + kind as u16, out.as_bytes());
    debug!(
        DEBUG_DBUS,
        "dbus {}: {}",
        kind,
        String::from_utf8_lossy(out.as_bytes())
    );
}

const TYPE_INVALID: c_int = 0;
const TYPE_BYTE: c_int = b'y' as c_int;
const TYPE_BOOLEAN: c_int = b'b' as c_int;
const TYPE_INT16: c_int = b'n' as c_int;
const TYPE_UINT16: c_int = b'q' as c_int;
const TYPE_INT32: c_int = b'i' as c_int;
const TYPE_UINT32: c_int = b'u' as c_int;
const TYPE_INT64: c_int = b'x' as c_int;
const TYPE_UINT64: c_int = b't' as c_int;
const TYPE_DOUBLE: c_int = b'd' as c_int;
const TYPE_STRING: c_int = b's' as c_int;
const TYPE_OBJECT_PATH: c_int = b'o' as c_int;
const TYPE_SIGNATURE: c_int = b'g' as c_int;
const TYPE_ARRAY: c_int = b'a' as c_int;
const TYPE_VARIANT: c_int = b'v' as c_int;
const TYPE_STRUCT: c_int = b'r' as c_int;
const TYPE_DICT_ENTRY: c_int = b'e' as c_int;

/// Opaque storage for a `DBusMessageIter`, which is smaller than this on
/// every platform.
#[repr(C, align(8))]
struct MessageIter([u64; 16]);

type GetType = unsafe extern "C" fn(*mut c_void) -> c_int;
type GetString = unsafe extern "C" fn(*mut c_void) -> *const c_char;
type IterInit = unsafe extern "C" fn(*mut c_void, *mut MessageIter) -> u32;
type IterArgType = unsafe extern "C" fn(*mut MessageIter) -> c_int;
type IterGetBasic = unsafe extern "C" fn(*mut MessageIter, *mut c_void);
type IterNext = unsafe extern "C" fn(*mut MessageIter) -> u32;

/// The libdbus accessors used to read a message.
pub struct LibDbus {
    get_type: GetType,
    get_sender: GetString,
    get_destination: GetString,
    get_path: GetString,
    get_interface: GetString,
    get_member: GetString,
    get_error_name: GetString,
    iter_init: IterInit,
    iter_get_arg_type: IterArgType,
    iter_get_basic: IterGetBasic,
    iter_next: IterNext,
}

unsafe fn lookup<F: Copy>(name: &CStr) -> Option<F> {
    interpose::global(name).map(|addr| core::mem::transmute_copy(&addr))
}

impl LibDbus {
    /// Resolves the accessors from the libdbus already loaded into the
    /// process.
    pub fn load() -> Option<Self> {
        unsafe {
            Some(Self {
                get_type: lookup(c"dbus_message_get_type")?,
                get_sender: lookup(c"dbus_message_get_sender")?,
                get_destination: lookup(c"dbus_message_get_destination")?,
                get_path: lookup(c"dbus_message_get_path")?,
                get_interface: lookup(c"dbus_message_get_interface")?,
                get_member: lookup(c"dbus_message_get_member")?,
                get_error_name: lookup(c"dbus_message_get_error_name")?,
                iter_init: lookup(c"dbus_message_iter_init")?,
                iter_get_arg_type: lookup(c"dbus_message_iter_get_arg_type")?,
                iter_get_basic: lookup(c"dbus_message_iter_get_basic")?,
                iter_next: lookup(c"dbus_message_iter_next")?,
            })
        }
    }

    /// Wraps a `DBusMessage` pointer.
    ///
    /// # Safety
    ///
    /// `msg` must be a live message for as long as the view is used.
    pub unsafe fn message(&self, msg: *mut c_void) -> Message<'_> {
        Message { lib: self, msg }
    }
}

/// A live `DBusMessage`.
pub struct Message<'a> {
    lib: &'a LibDbus,
    msg: *mut c_void,
}

impl Message<'_> {
    fn string(&self, f: GetString) -> Option<&CStr> {
        let s = unsafe { f(self.msg) };
        (!s.is_null()).then(|| unsafe { CStr::from_ptr(s) })
    }
}

impl MessageView for Message<'_> {
    fn message_type(&self) -> i32 {
        unsafe { (self.lib.get_type)(self.msg) }
    }

    fn sender(&self) -> Option<&CStr> {
        self.string(self.lib.get_sender)
    }

    fn destination(&self) -> Option<&CStr> {
        self.string(self.lib.get_destination)
    }

    fn path(&self) -> Option<&CStr> {
        self.string(self.lib.get_path)
    }

    fn interface(&self) -> Option<&CStr> {
        self.string(self.lib.get_interface)
    }

    fn member(&self) -> Option<&CStr> {
        self.string(self.lib.get_member)
    }

    fn error_name(&self) -> Option<&CStr> {
        self.string(self.lib.get_error_name)
    }

    fn for_each_arg(&self, f: &mut dyn FnMut(Arg<'_>)) {
        let lib = self.lib;
        let mut iter = MessageIter([0; 16]);
        if unsafe { (lib.iter_init)(self.msg, &mut iter) } == 0 {
            return;
        }
        loop {
            let ty = unsafe { (lib.iter_get_arg_type)(&mut iter) };
            if ty == TYPE_INVALID {
                break;
            }
            // Large enough for any basic value.
            let mut value = [0u8; 8];
            let mut basic = || unsafe {
                (lib.iter_get_basic)(&mut iter, value.as_mut_ptr().cast());
                value
            };
            let arg = match ty {
                TYPE_STRING | TYPE_OBJECT_PATH | TYPE_SIGNATURE => {
                    let ptr = usize::from_ne_bytes(basic()) as *const c_char;
                    if ptr.is_null() {
                        Arg::Other
                    } else {
                        Arg::Str(unsafe { CStr::from_ptr(ptr) })
                    }
                }
                TYPE_INT16 => Arg::I16(i16::from_ne_bytes(first(basic()))),
                TYPE_UINT16 => Arg::U16(u16::from_ne_bytes(first(basic()))),
                TYPE_INT32 => Arg::I32(i32::from_ne_bytes(first(basic()))),
                TYPE_UINT32 => Arg::U32(u32::from_ne_bytes(first(basic()))),
                TYPE_INT64 => Arg::I64(i64::from_ne_bytes(basic())),
                TYPE_UINT64 => Arg::U64(u64::from_ne_bytes(basic())),
                TYPE_DOUBLE => Arg::Double(f64::from_ne_bytes(basic())),
                TYPE_BYTE => Arg::Byte(basic()[0]),
                TYPE_BOOLEAN => Arg::Bool(u32::from_ne_bytes(first(basic())) != 0),
                TYPE_VARIANT => Arg::Variant,
                TYPE_ARRAY => Arg::Array,
                TYPE_DICT_ENTRY => Arg::DictEntry,
                TYPE_STRUCT => Arg::Struct,
                _ => Arg::Other,
            };
            f(arg);
            if unsafe { (lib.iter_next)(&mut iter) } == 0 {
                break;
            }
        }
    }
}

fn first<const N: usize>(bytes: [u8; 8]) -> [u8; N] {
    let mut out = [0; N];
    out.copy_from_slice(&bytes[..N]);
    out
}
