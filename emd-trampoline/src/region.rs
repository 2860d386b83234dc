/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

/// Finds a free, page aligned block of `size` bytes between the mappings in
/// `maps`, as close to `near` as possible.
///
/// `maps` holds `[start, end)` ranges sorted by start. Gaps below `near` are
/// tried first, nearest first, then gaps above it. A candidate is only
/// returned if `reachable` accepts both its first and last byte.
pub fn find_gap<F>(maps: &[(u64, u64)], near: u64, size: u64, page: u64, reachable: F) -> Option<u64>
where
    F: Fn(u64) -> bool,
{
    let page = page.max(1);
    let size = align_up(size.max(1), page)?;
    let fits = |addr: u64| reachable(addr) && reachable(addr + size - 1);

    // Free ranges in ascending order.
    let mut gaps = Vec::with_capacity(maps.len() + 1);
    let mut cursor = MIN_ADDR;
    for &(start, end) in maps {
        if start > cursor {
            gaps.push((cursor, start));
        }
        cursor = cursor.max(end);
    }
    if MAX_ADDR > cursor {
        gaps.push((cursor, MAX_ADDR));
    }

    // Below: highest aligned block in each gap, nearest gap first.
    let below = gaps
        .iter()
        .rev()
        .filter(|(start, _)| *start < near)
        .filter_map(|&(start, end)| {
            let end = end.min(align_down(near, page));
            let addr = align_down(end.checked_sub(size)?, page);
            (addr >= start && addr >= align_up(start, page)?).then_some(addr)
        })
        .find(|addr| fits(*addr));
    if below.is_some() {
        return below;
    }

    gaps.iter()
        .filter(|(_, end)| *end > near)
        .filter_map(|&(start, end)| {
            let addr = align_up(start.max(near), page)?;
            (addr.checked_add(size)? <= end).then_some(addr)
        })
        .find(|addr| fits(*addr))
}

/// Lowest address handed out; matches the usual `vm.mmap_min_addr`.
const MIN_ADDR: u64 = 0x10000;

/// Top of the user address space we are willing to use.
const MAX_ADDR: u64 = 0x7fff_ffff_0000;

fn align_up(v: u64, page: u64) -> Option<u64> {
    Some(v.checked_add(page - 1)? & !(page - 1))
}

fn align_down(v: u64, page: u64) -> u64 {
    v & !(page - 1)
}
