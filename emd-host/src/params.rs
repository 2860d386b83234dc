/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Which syscalls get recorded and which of their arguments point at
//! memory worth capturing.

use std::str::FromStr;

use emd_proto::syscall_index;
use emd_proto::ArgFlags;
use emd_proto::NumberSet;
use emd_proto::ParamSpec;
use emd_proto::ParamTable;
use emd_proto::SYSCALL_BASE;
use syscalls::Sysno;

/// Pointer arguments of the common path and buffer taking syscalls.
/// Entries for syscalls the host architecture lacks are skipped.
const POINTER_ARGS: &[(&str, ArgFlags, u8)] = &[
    ("open", ArgFlags::ARG0, 3),
    ("openat", ArgFlags::ARG1, 4),
    ("creat", ArgFlags::ARG0, 2),
    ("access", ArgFlags::ARG0, 2),
    ("faccessat", ArgFlags::ARG1, 3),
    ("faccessat2", ArgFlags::ARG1, 4),
    ("stat", ArgFlags::ARG0, 2),
    ("lstat", ArgFlags::ARG0, 2),
    ("newfstatat", ArgFlags::ARG1, 4),
    ("statx", ArgFlags::ARG1, 5),
    ("readlink", ArgFlags::ARG0, 3),
    ("readlinkat", ArgFlags::ARG1, 4),
    ("unlink", ArgFlags::ARG0, 1),
    ("unlinkat", ArgFlags::ARG1, 3),
    ("mkdir", ArgFlags::ARG0, 2),
    ("mkdirat", ArgFlags::ARG1, 3),
    ("rmdir", ArgFlags::ARG0, 1),
    ("chdir", ArgFlags::ARG0, 1),
    ("rename", ArgFlags::ARG0.union(ArgFlags::ARG1), 2),
    ("renameat", ArgFlags::ARG1.union(ArgFlags::ARG3), 4),
    ("renameat2", ArgFlags::ARG1.union(ArgFlags::ARG3), 5),
    ("execve", ArgFlags::ARG0, 3),
    ("execveat", ArgFlags::ARG1, 5),
    ("read", ArgFlags::ARG1.union(ArgFlags::SIZE_IN_NEXT), 3),
    ("write", ArgFlags::ARG1.union(ArgFlags::SIZE_IN_NEXT), 3),
    ("pread64", ArgFlags::ARG1.union(ArgFlags::SIZE_IN_NEXT), 4),
    ("pwrite64", ArgFlags::ARG1.union(ArgFlags::SIZE_IN_NEXT), 4),
    ("getrandom", ArgFlags::ARG0.union(ArgFlags::SIZE_IN_NEXT), 3),
    ("connect", ArgFlags::ARG1.union(ArgFlags::SIZE_IN_NEXT), 3),
    ("bind", ArgFlags::ARG1.union(ArgFlags::SIZE_IN_NEXT), 3),
    ("sendto", ArgFlags::ARG1.union(ArgFlags::SIZE_IN_NEXT), 6),
    ("recvfrom", ArgFlags::ARG1.union(ArgFlags::SIZE_IN_NEXT), 6),
];

/// The parameter table for this architecture.
pub fn default_param_table() -> ParamTable {
    let mut table = ParamTable::new();
    for (name, flags, count) in POINTER_ARGS {
        if let Some(index) = index_of(name) {
            table.set(index, ParamSpec::new(*flags, *count));
        }
    }
    table
}

fn index_of(name: &str) -> Option<usize> {
    let nr = Sysno::from_str(name).ok()?;
    syscall_index(nr.id() as u64, SYSCALL_BASE)
}

/// Turns a list of syscall names into the set of recorded syscalls. With
/// `exclude` the list names the syscalls to skip. An empty list records
/// everything. Unknown names are an error.
pub fn select(names: &[String], exclude: bool) -> Result<NumberSet, String> {
    if names.is_empty() {
        return Ok(NumberSet::all());
    }
    let indices = names
        .iter()
        .map(|name| index_of(name.trim()).ok_or_else(|| format!("unknown syscall: {}", name)))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(if exclude {
        NumberSet::deny(indices)
    } else {
        NumberSet::allow(indices)
    })
}
