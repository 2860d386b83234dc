/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Environment variables the supervisor sets for the recorder.

/// Instrument only the program whose `argv[0]` matches.
pub const ENV_CMDLINE_FILTER: &str = "INTERCEPT_HOOK_CMDLINE_FILTER";
/// `1` patches every loaded object instead of the C library only.
pub const ENV_PATCH_ALL: &str = "INTERCEPT_HOOK_PATCH_ALL";
pub const ENV_BUFFER_SIZE: &str = "ST2_SYSCALL_BUFFER_SIZE";
pub const ENV_HOOK_VDSO: &str = "ST2_HOOK_VDSO";
pub const ENV_DBUS_FILTER: &str = "ST2_DBUS_FILTER";
pub const ENV_X11_FILTER: &str = "ST2_X11_FILTER";
/// Directory holding the per-process control sockets.
pub const ENV_CONTROL_DIR: &str = "EMD_CONTROL_DIR";
pub const ENV_DEBUG_SYSCALL: &str = "ST2_DEBUG_SYSCALL";
pub const ENV_DEBUG_DUMP: &str = "ST2_DEBUG_DUMP";
pub const ENV_DEBUG_DBUS: &str = "ST2_DEBUG_DBUS";
pub const ENV_DEBUG_X11: &str = "ST2_DEBUG_X11";
