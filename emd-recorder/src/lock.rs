/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering;

use emd_proto::layout::MUTEX_FREE;
use emd_proto::layout::MUTEX_HELD;

use crate::raw;

/// A binary mutex over a single futex word that may live in shared memory.
///
/// The word holds [`MUTEX_FREE`] or [`MUTEX_HELD`], matching the shared
/// buffer header, so the supervisor can tell whether a writer was
/// interrupted mid-record.
pub struct FutexLock<'a> {
    word: &'a AtomicU32,
}

impl<'a> FutexLock<'a> {
    pub fn new(word: &'a AtomicU32) -> Self {
        Self { word }
    }

    pub fn try_lock(&self) -> Option<FutexGuard<'a>> {
        self.word
            .compare_exchange(MUTEX_FREE, MUTEX_HELD, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| FutexGuard { word: self.word })
    }

    pub fn lock(&self) -> FutexGuard<'a> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            // EAGAIN means the word changed before we slept.
            let _ = raw::futex_wait(self.word, MUTEX_HELD);
        }
    }

    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) == MUTEX_HELD
    }
}

/// Releases the lock and wakes at most one waiter when dropped.
pub struct FutexGuard<'a> {
    word: &'a AtomicU32,
}

impl Drop for FutexGuard<'_> {
    fn drop(&mut self) {
        self.word.store(MUTEX_FREE, Ordering::Release);
        let _ = raw::futex_wake(self.word, 1);
    }
}
