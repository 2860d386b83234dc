/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use serde::Deserialize;
use serde::Serialize;

use crate::DecodeError;
use crate::MAX_SYSCALLS;

/// Number of 32-bit slots needed to cover every syscall index.
pub const MAX_SLOTS: usize = MAX_SYSCALLS / 32;

/// A bit vector over syscall indices with a polarity flag.
///
/// With `not_flag` clear the set is an allow list: an index is selected
/// when its bit is set. With `not_flag` set it is a deny list. An empty
/// vector (`nslots == 0`) selects nothing, or everything when negated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumberSet {
    slots: [u32; MAX_SLOTS],
    nslots: u32,
    not_flag: bool,
}

impl NumberSet {
    /// Selects every syscall.
    pub const fn all() -> Self {
        Self {
            slots: [0; MAX_SLOTS],
            nslots: 0,
            not_flag: true,
        }
    }

    /// Selects nothing.
    pub const fn none() -> Self {
        Self {
            slots: [0; MAX_SLOTS],
            nslots: 0,
            not_flag: false,
        }
    }

    /// An allow list. Indices out of range are ignored.
    pub fn allow<I: IntoIterator<Item = usize>>(indices: I) -> Self {
        let mut set = Self::none();
        set.extend(indices);
        set
    }

    /// A deny list. Indices out of range are ignored.
    pub fn deny<I: IntoIterator<Item = usize>>(indices: I) -> Self {
        let mut set = Self::all();
        set.extend(indices);
        set
    }

    /// Rebuilds a set from its shared-memory representation.
    pub fn from_raw(slots: &[u32], not_flag: bool) -> Result<Self, DecodeError> {
        if slots.len() > MAX_SLOTS {
            return Err(DecodeError::TooManySlots(slots.len() as u32));
        }
        let mut set = if not_flag { Self::all() } else { Self::none() };
        set.slots[..slots.len()].copy_from_slice(slots);
        set.nslots = slots.len() as u32;
        Ok(set)
    }

    /// Adds an index to the underlying bit vector. Returns false if the
    /// index is out of range.
    pub fn insert(&mut self, index: usize) -> bool {
        if index >= MAX_SYSCALLS {
            return false;
        }
        let slot = index / 32;
        self.slots[slot] |= 1 << (index % 32);
        self.nslots = self.nslots.max(slot as u32 + 1);
        true
    }

    pub fn contains(&self, index: usize) -> bool {
        if self.nslots == 0 {
            return self.not_flag;
        }
        let slot = index / 32;
        let marked = slot < self.nslots as usize && self.slots[slot] & (1 << (index % 32)) != 0;
        marked ^ self.not_flag
    }

    /// The populated prefix of the bit vector.
    pub fn slots(&self) -> &[u32] {
        &self.slots[..self.nslots as usize]
    }

    pub fn not_flag(&self) -> bool {
        self.not_flag
    }
}

impl Default for NumberSet {
    fn default() -> Self {
        Self::all()
    }
}

impl Extend<usize> for NumberSet {
    fn extend<I: IntoIterator<Item = usize>>(&mut self, iter: I) {
        for index in iter {
            self.insert(index);
        }
    }
}
