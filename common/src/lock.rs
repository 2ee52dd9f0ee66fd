//! fcntl byte-range locks on the shared tables and log files.

use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
}

fn flock_struct(kind: libc::c_short, start: u64, len: u64) -> libc::flock {
    // SAFETY: flock is plain old data; platform specific padding fields must be zero.
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = kind;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = start as libc::off_t;
    fl.l_len = len as libc::off_t;
    fl
}

fn lock_type(kind: LockKind) -> libc::c_short {
    match kind {
        LockKind::Read => libc::F_RDLCK as libc::c_short,
        LockKind::Write => libc::F_WRLCK as libc::c_short,
    }
}

/// Held byte-range lock; released on drop. The guard only keeps the raw
/// descriptor, so it must be dropped before the owning `File`.
#[derive(Debug)]
pub struct RegionGuard {
    fd: RawFd,
    start: u64,
    len: u64,
}

impl RegionGuard {
    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for RegionGuard {
    fn drop(&mut self) {
        let fl = flock_struct(libc::F_UNLCK as libc::c_short, self.start, self.len);
        if let Err(e) = fcntl(self.fd, FcntlArg::F_SETLK(&fl)) {
            log::warn!(
                "Failed to unlock region {}+{} on fd {}: {}",
                self.start,
                self.len,
                self.fd,
                e
            );
        }
    }
}

/// Blocks until the region `[start, start + len)` is locked.
pub fn lock_region(file: &File, start: u64, len: u64, kind: LockKind) -> io::Result<RegionGuard> {
    let fd = file.as_raw_fd();
    let fl = flock_struct(lock_type(kind), start, len);
    loop {
        match fcntl(fd, FcntlArg::F_SETLKW(&fl)) {
            Ok(_) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
        }
    }
    Ok(RegionGuard { fd, start, len })
}

/// Non-blocking variant; `Ok(None)` when another process holds a conflicting lock.
pub fn try_lock_region(
    file: &File,
    start: u64,
    len: u64,
    kind: LockKind,
) -> io::Result<Option<RegionGuard>> {
    let fd = file.as_raw_fd();
    let fl = flock_struct(lock_type(kind), start, len);
    match fcntl(fd, FcntlArg::F_SETLK(&fl)) {
        Ok(_) => Ok(Some(RegionGuard { fd, start, len })),
        Err(Errno::EACCES) | Err(Errno::EAGAIN) => Ok(None),
        Err(e) => Err(io::Error::from_raw_os_error(e as i32)),
    }
}
