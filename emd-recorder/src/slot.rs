/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering;

use once_cell::sync::OnceCell;

use crate::raw;

const EMPTY: u32 = 0;
const CREATING: u32 = 1;
const READY: u32 = 2;
const FAILED: u32 = 3;
const CLOSED: u32 = 4;

/// While creating, the bits above the phase hold the creator's pid.
const PHASE_MASK: u32 = 0xff;
const PID_SHIFT: u32 = 8;

const fn creating(pid: i32) -> u32 {
    (pid as u32) << PID_SHIFT | CREATING
}

/// Lifecycle of a [`DumperSlot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Creating,
    Ready,
    Failed,
    Closed,
}

/// Lazily created, process-wide value that is safe to reach from a syscall
/// hook.
///
/// The first caller creates the value. Other threads arriving meanwhile
/// sleep on a futex until creation ends. The creating thread itself, should
/// it re-enter through a syscall made during creation, is turned away
/// instead of deadlocking. A failed creation is never retried. A child
/// forked while another thread was creating finds the slot failed, since
/// nobody in the child will finish the creation.
pub struct DumperSlot<D> {
    state: AtomicU32,
    owner: AtomicU32,
    value: OnceCell<D>,
}

impl<D> DumperSlot<D> {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(EMPTY),
            owner: AtomicU32::new(0),
            value: OnceCell::new(),
        }
    }

    pub fn state(&self) -> SlotState {
        match self.state.load(Ordering::Acquire) & PHASE_MASK {
            EMPTY => SlotState::Empty,
            CREATING => SlotState::Creating,
            READY => SlotState::Ready,
            FAILED => SlotState::Failed,
            _ => SlotState::Closed,
        }
    }

    /// The value, if it has been created and not closed.
    pub fn get(&self) -> Option<&D> {
        if self.state.load(Ordering::Acquire) == READY {
            self.value.get()
        } else {
            None
        }
    }

    /// Returns the value, creating it with `create` on first use.
    pub fn get_or_create<F>(&self, create: F) -> Option<&D>
    where
        F: FnOnce() -> Option<D>,
    {
        let mut create = Some(create);
        loop {
            let state = self.state.load(Ordering::Acquire);
            match state & PHASE_MASK {
                READY => return self.value.get(),
                FAILED | CLOSED => return None,
                CREATING => {
                    if state != creating(raw::getpid()) {
                        // Inherited across fork.
                        let _ = self.state.compare_exchange(
                            state,
                            FAILED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                        continue;
                    }
                    if self.owner.load(Ordering::Relaxed) == raw::gettid() as u32 {
                        return None;
                    }
                    let _ = raw::futex_wait(&self.state, state);
                }
                _ => {
                    let claim = creating(raw::getpid());
                    if self
                        .state
                        .compare_exchange(EMPTY, claim, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        continue;
                    }
                    self.owner.store(raw::gettid() as u32, Ordering::Relaxed);

                    let value = create.take().and_then(|f| f());
                    let state = match value {
                        Some(value) => {
                            let _ = self.value.set(value);
                            READY
                        }
                        None => FAILED,
                    };
                    self.owner.store(0, Ordering::Relaxed);
                    self.state.store(state, Ordering::Release);
                    let _ = raw::futex_wake(&self.state, u32::MAX >> 1);
                    return self.get();
                }
            }
        }
    }

    /// Stops handing out the value and returns it for a final flush. The
    /// value itself is never dropped since other threads may still hold a
    /// reference.
    pub fn close(&self) -> Option<&D> {
        self.state
            .compare_exchange(READY, CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .and_then(|_| self.value.get())
    }
}

impl<D> Default for DumperSlot<D> {
    fn default() -> Self {
        Self::new()
    }
}
