/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Discovery of loaded modules and their code sections.

use std::ffi::CStr;
use std::fs::File;
use std::path::Path;
use std::path::PathBuf;

use memmap2::Mmap;
use object::Object as _;
use object::ObjectSection as _;
use object::SectionKind;

use crate::config::PatchScope;
use crate::Error;
use crate::Result;

/// Path used for the main executable, which the loader lists without a name.
const MAIN_EXE: &str = "/proc/self/exe";

/// A module as reported by the dynamic loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub path: PathBuf,
    /// Load bias added to every address in the file.
    pub bias: u64,
    /// Loaded `[start, end)` ranges of its executable segments.
    pub code: Vec<(u64, u64)>,
}

impl Module {
    pub fn contains(&self, addr: u64) -> bool {
        self.code.iter().any(|(start, end)| *start <= addr && addr < *end)
    }
}

/// Describes the code of one module to be scanned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptDesc {
    pub path: PathBuf,
    pub bias: u64,
    /// Loaded `[start, end)` of the executable section.
    pub text_start: u64,
    pub text_end: u64,
}

impl InterceptDesc {
    pub fn len(&self) -> usize {
        (self.text_end - self.text_start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.text_end == self.text_start
    }
}

unsafe extern "C" fn collect(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut libc::c_void,
) -> libc::c_int {
    let modules = &mut *(data as *mut Vec<Module>);
    let info = &*info;

    let name = if info.dlpi_name.is_null() {
        ""
    } else {
        CStr::from_ptr(info.dlpi_name).to_str().unwrap_or("")
    };
    let path = if name.is_empty() {
        if !modules.is_empty() {
            // Only the first entry is the executable.
            return 0;
        }
        PathBuf::from(MAIN_EXE)
    } else {
        PathBuf::from(name)
    };

    let bias = info.dlpi_addr as u64;
    let phdrs = if info.dlpi_phdr.is_null() {
        &[][..]
    } else {
        core::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize)
    };
    let code = phdrs
        .iter()
        .filter(|ph| ph.p_type == libc::PT_LOAD && ph.p_flags & libc::PF_X != 0)
        .map(|ph| {
            let start = bias.wrapping_add(ph.p_vaddr as u64);
            (start, start + ph.p_memsz as u64)
        })
        .collect();

    modules.push(Module { path, bias, code });
    0
}

/// The modules currently loaded into this process, in load order. The vDSO
/// is left out since it has no file to parse.
pub fn loaded_modules() -> Vec<Module> {
    let mut modules = Vec::new();
    unsafe {
        libc::dl_iterate_phdr(Some(collect), &mut modules as *mut Vec<Module> as *mut libc::c_void);
    }
    let vdso = unsafe { libc::getauxval(libc::AT_SYSINFO_EHDR) } as u64;
    modules.retain(|m| !is_vdso(m, vdso));
    modules
}

fn is_vdso(module: &Module, vdso: u64) -> bool {
    let name = module
        .path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    name.starts_with("linux-vdso") || name.starts_with("linux-gate") || (vdso != 0 && module.contains(vdso))
}

/// The library name without directory, version or suffix:
/// `/usr/lib/libc.so.6` becomes `libc`, `libpthread-2.31.so` becomes
/// `libpthread`.
pub fn short_name(path: &Path) -> &str {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let end = name.find(['-', '.']).unwrap_or(name.len());
    &name[..end]
}

/// Whether `path` should be patched under `scope`. The C library always
/// is, the thread library is patched too since older systems keep their
/// own syscall wrappers in it.
pub fn should_patch(path: &Path, scope: PatchScope) -> bool {
    match (short_name(path), scope) {
        ("libc" | "libpthread", _) => true,
        (_, PatchScope::All) => true,
        _ => false,
    }
}

fn mmap_path(path: &Path) -> Result<Mmap> {
    let file = File::open(path)?;
    Ok(unsafe { Mmap::map(&file)? })
}

/// Locates the executable code section of the module at `path`, loaded
/// with `bias`. `.text` is preferred; otherwise the first section holding
/// code is used.
pub fn find_text(path: &Path, bias: u64) -> Result<InterceptDesc> {
    let mmap = mmap_path(path)?;
    let object = object::File::parse(&*mmap)?;

    let section = object
        .section_by_name(".text")
        .or_else(|| object.sections().find(|s| s.kind() == SectionKind::Text))
        .ok_or(Error::Unsupported)?;

    let text_start = bias.wrapping_add(section.address());
    Ok(InterceptDesc {
        path: path.to_path_buf(),
        bias,
        text_start,
        text_end: text_start + section.size(),
    })
}
