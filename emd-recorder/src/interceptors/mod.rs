/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Summaries of D-Bus messages and X11 input events.
//!
//! The functions here only format and filter. The exported symbols that
//! call them live in the preload library.

pub mod dbus;
pub mod x11;

use core::fmt;

use emd_proto::EVENT_EXTRA_INFO_SIZE;

/// Receives finished summaries.
pub trait EventSink {
    /// `event_type` is the full event code, base included.
    fn emit(&self, event_type: u16, payload: &[u8]);
}

impl<S: EventSink + ?Sized> EventSink for &S {
    fn emit(&self, event_type: u16, payload: &[u8]) {
        (**self).emit(event_type, payload)
    }
}

/// A bounded text buffer on the stack. Writes past the end are dropped
/// silently, like `snprintf`.
#[derive(Default)]
pub struct Summary {
    buf: heapless::Vec<u8, EVENT_EXTRA_INFO_SIZE>,
}

impl Summary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        let room = self.buf.capacity() - self.buf.len();
        let _ = self.buf.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// The text followed by a nul, as long as it fits.
    pub fn with_nul(&mut self) -> &[u8] {
        self.push_bytes(b"\0");
        &self.buf
    }
}

impl fmt::Write for Summary {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push_bytes(s.as_bytes());
        Ok(())
    }
}

impl fmt::Debug for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.buf))
    }
}
