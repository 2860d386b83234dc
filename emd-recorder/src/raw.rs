/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The raw syscall shim.
//!
//! Everything the recorder does to the outside world goes through these
//! functions. They issue the syscall instruction inline, so they keep
//! working after the C library's own wrappers have been redirected into
//! trampolines, and they never re-enter the dispatcher.

use core::fmt;
use core::sync::atomic::AtomicU32;

use emd_proto::Timestamp;
use syscalls::Errno;
use syscalls::Sysno;

/// Performs syscall `nr` and returns the kernel's raw result, a negated
/// errno on failure.
#[inline]
pub fn syscall(nr: u64, args: [u64; 6]) -> u64 {
    let Some(sysno) = Sysno::new(nr as usize) else {
        return (-(libc::ENOSYS as i64)) as u64;
    };
    let [a, b, c, d, e, f] = args.map(|arg| arg as usize);
    unsafe { syscalls::raw::syscall6(sysno, a, b, c, d, e, f) as u64 }
}

pub fn getpid() -> i32 {
    unsafe { syscalls::raw::syscall0(Sysno::getpid) as i32 }
}

pub fn gettid() -> i32 {
    unsafe { syscalls::raw::syscall0(Sysno::gettid) as i32 }
}

/// Capacity of a [`CPath`], including the terminating nul.
pub const PATH_CAP: usize = 256;

/// A nul-terminated path built without allocating.
#[derive(Clone)]
pub struct CPath {
    buf: [u8; PATH_CAP],
    len: usize,
}

impl CPath {
    pub const fn new() -> Self {
        Self {
            buf: [0; PATH_CAP],
            len: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(self.as_bytes()).unwrap_or("")
    }

    pub fn as_ptr(&self) -> *const libc::c_char {
        self.buf.as_ptr().cast()
    }
}

impl Default for CPath {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Write for CPath {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        // Keep room for the nul.
        if self.len + bytes.len() >= PATH_CAP || bytes.contains(&0) {
            return Err(fmt::Error);
        }
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }
}

impl fmt::Debug for CPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

/// A file descriptor closed with a raw `close` on drop.
#[derive(Debug)]
pub struct Fd(i32);

impl Fd {
    pub fn raw(&self) -> i32 {
        self.0
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        loop {
            match unsafe {
                syscalls::syscall3(Sysno::read, self.0 as usize, buf.as_mut_ptr() as usize, buf.len())
            } {
                Err(Errno::EINTR) => continue,
                other => return other,
            }
        }
    }

    pub fn read_exact(&self, mut buf: &mut [u8]) -> Result<(), Errno> {
        while !buf.is_empty() {
            match self.read(buf)? {
                0 => return Err(Errno::EPIPE),
                n => buf = &mut buf[n..],
            }
        }
        Ok(())
    }

    pub fn write_all(&self, mut buf: &[u8]) -> Result<(), Errno> {
        while !buf.is_empty() {
            match unsafe {
                syscalls::syscall3(Sysno::write, self.0 as usize, buf.as_ptr() as usize, buf.len())
            } {
                Ok(0) => return Err(Errno::EIO),
                Ok(n) => buf = &buf[n..],
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno),
            }
        }
        Ok(())
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        let _ = unsafe { syscalls::syscall1(Sysno::close, self.0 as usize) };
    }
}

fn openat(path: &CPath, flags: i32, mode: u32) -> Result<Fd, Errno> {
    let fd = unsafe {
        syscalls::syscall4(
            Sysno::openat,
            libc::AT_FDCWD as usize,
            path.as_ptr() as usize,
            flags as usize,
            mode as usize,
        )
    }?;
    Ok(Fd(fd as i32))
}

pub fn open_rdonly(path: &CPath) -> Result<Fd, Errno> {
    openat(path, libc::O_RDONLY | libc::O_CLOEXEC, 0)
}

/// Creates `path`, failing if it already exists. Only the owner may access
/// it.
pub fn create_exclusive(path: &CPath) -> Result<Fd, Errno> {
    openat(
        path,
        libc::O_CREAT | libc::O_EXCL | libc::O_RDWR | libc::O_CLOEXEC,
        0o600,
    )
}

pub fn unlink(path: &CPath) -> Result<(), Errno> {
    unsafe {
        syscalls::syscall3(
            Sysno::unlinkat,
            libc::AT_FDCWD as usize,
            path.as_ptr() as usize,
            0,
        )
    }?;
    Ok(())
}

/// Connects a new stream socket to the unix socket at `path`.
pub fn unix_connect(path: &CPath) -> Result<Fd, Errno> {
    let fd = unsafe {
        syscalls::syscall3(
            Sysno::socket,
            libc::AF_UNIX as usize,
            (libc::SOCK_STREAM | libc::SOCK_CLOEXEC) as usize,
            0,
        )
    }?;
    let fd = Fd(fd as i32);

    let mut addr: libc::sockaddr_un = unsafe { core::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let path = path.as_bytes();
    if path.len() >= addr.sun_path.len() {
        return Err(Errno::ENAMETOOLONG);
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(path) {
        *dst = *src as libc::c_char;
    }

    loop {
        match unsafe {
            syscalls::syscall3(
                Sysno::connect,
                fd.raw() as usize,
                &addr as *const libc::sockaddr_un as usize,
                core::mem::size_of::<libc::sockaddr_un>(),
            )
        } {
            Ok(_) => return Ok(fd),
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno),
        }
    }
}

pub unsafe fn mmap(
    addr: u64,
    len: usize,
    prot: i32,
    flags: i32,
    fd: i32,
    offset: u64,
) -> Result<u64, Errno> {
    let addr = syscalls::syscall6(
        Sysno::mmap,
        addr as usize,
        len,
        prot as usize,
        flags as usize,
        fd as usize,
        offset as usize,
    )?;
    Ok(addr as u64)
}

pub unsafe fn mprotect(addr: u64, len: usize, prot: i32) -> Result<(), Errno> {
    syscalls::syscall3(Sysno::mprotect, addr as usize, len, prot as usize)?;
    Ok(())
}

pub unsafe fn munmap(addr: u64, len: usize) -> Result<(), Errno> {
    syscalls::syscall2(Sysno::munmap, addr as usize, len)?;
    Ok(())
}

/// Sleeps while `word` holds `expected`. Spurious wakeups are possible.
pub fn futex_wait(word: &AtomicU32, expected: u32) -> Result<(), Errno> {
    unsafe {
        syscalls::syscall6(
            Sysno::futex,
            word.as_ptr() as usize,
            libc::FUTEX_WAIT as usize,
            expected as usize,
            0,
            0,
            0,
        )
    }?;
    Ok(())
}

/// Wakes up to `count` waiters on `word`.
pub fn futex_wake(word: &AtomicU32, count: u32) -> Result<usize, Errno> {
    unsafe {
        syscalls::syscall6(
            Sysno::futex,
            word.as_ptr() as usize,
            libc::FUTEX_WAKE as usize,
            count as usize,
            0,
            0,
            0,
        )
    }
}

pub fn clock_realtime() -> Timestamp {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let _ = unsafe {
        syscalls::syscall2(
            Sysno::clock_gettime,
            libc::CLOCK_REALTIME as usize,
            &mut ts as *mut libc::timespec as usize,
        )
    };
    Timestamp {
        sec: ts.tv_sec as i64,
        nsec: ts.tv_nsec as i64,
    }
}

/// Copies `buf.len()` bytes of this process's memory at `addr` into `buf`
/// without faulting. Returns how many bytes were readable. The rest of
/// `buf` is zeroed.
pub fn read_self(addr: u64, buf: &mut [u8]) -> usize {
    if buf.is_empty() {
        return 0;
    }
    let local = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let remote = libc::iovec {
        iov_base: addr as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let read = unsafe {
        syscalls::syscall6(
            Sysno::process_vm_readv,
            getpid() as usize,
            &local as *const libc::iovec as usize,
            1,
            &remote as *const libc::iovec as usize,
            1,
            0,
        )
    }
    .unwrap_or(0)
    .min(buf.len());
    buf[read..].fill(0);
    read
}

#[cfg(test)]
mod test {
    use core::fmt::Write;

    use super::*;

    #[test]
    fn pids_match_libc() {
        assert_eq!(getpid(), unsafe { libc::getpid() });
        assert_eq!(gettid(), unsafe { libc::gettid() });
    }

    #[test]
    fn raw_syscall_reports_errno() {
        let ret = syscall(Sysno::close as u64, [u32::MAX as u64, 0, 0, 0, 0, 0]);
        assert_eq!(ret as i64, -(libc::EBADF as i64));
        let ret = syscall(100_000, [0; 6]);
        assert_eq!(ret as i64, -(libc::ENOSYS as i64));
    }

    #[test]
    fn cpath_is_bounded() {
        let mut path = CPath::new();
        write!(path, "/tmp/{}", 42).unwrap();
        assert_eq!(path.as_bytes(), b"/tmp/42");
        assert!(path.write_str(&"x".repeat(PATH_CAP)).is_err());
        assert_eq!(path.as_str(), "/tmp/42");
    }

    #[test]
    fn read_self_tolerates_bad_pointers() {
        let data = *b"hello world";
        let mut buf = [0xffu8; 5];
        assert_eq!(read_self(data.as_ptr() as u64, &mut buf), 5);
        assert_eq!(&buf, b"hello");

        let mut buf = [0xffu8; 8];
        assert_eq!(read_self(8, &mut buf), 0);
        assert_eq!(buf, [0; 8]);
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut path = CPath::new();
        write!(path, "{}/shm", dir.path().display()).unwrap();

        let fd = create_exclusive(&path).unwrap();
        fd.write_all(b"abc").unwrap();
        assert_eq!(create_exclusive(&path).unwrap_err(), Errno::EEXIST);
        drop(fd);

        let fd = open_rdonly(&path).unwrap();
        let mut buf = [0u8; 3];
        fd.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abc");

        unlink(&path).unwrap();
        assert_eq!(open_rdonly(&path).unwrap_err(), Errno::ENOENT);
    }
}
