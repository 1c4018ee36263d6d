//! Advisory-lock primitives shared by the writer and reader sides.
//!
//! Two independent lock dimensions coexist on a chunk file and can never
//! collide because they live in different kernel namespaces:
//!
//! - the writer-activity lock is a whole-file BSD `flock`, held exclusively
//!   by the writer from creation until the chunk is closed;
//! - the claim lock is a POSIX record lock on a single byte, held by the
//!   reader that owns the chunk in multi-reader mode.
//!
//! Root-level attachment locks reuse the `flock` dimension on the
//! `.writer.lock` marker (writers) and on the directory itself (readers).

use std::fs::File;
use std::os::unix::io::AsRawFd;

use crate::{Error, Result};

/// Byte claimed by a reader to stake exclusive ownership of a chunk.
pub const CLAIM_BYTE: i64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flock {
    Shared,
    Exclusive,
}

impl Flock {
    fn op(self) -> libc::c_int {
        match self {
            Flock::Shared => libc::LOCK_SH,
            Flock::Exclusive => libc::LOCK_EX,
        }
    }
}

/// Non-blocking `flock`. Returns `false` when the lock is held elsewhere.
pub fn try_flock(file: &File, mode: Flock) -> Result<bool> {
    loop {
        let res = unsafe { libc::flock(file.as_raw_fd(), mode.op() | libc::LOCK_NB) };
        if res == 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        match err.kind() {
            std::io::ErrorKind::WouldBlock => return Ok(false),
            std::io::ErrorKind::Interrupted => continue,
            _ => return Err(Error::Io(err)),
        }
    }
}

/// Blocking `flock`. Only used on files no other process can see yet, so it
/// never actually waits in practice.
pub fn flock_blocking(file: &File, mode: Flock) -> Result<()> {
    loop {
        let res = unsafe { libc::flock(file.as_raw_fd(), mode.op()) };
        if res == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            continue;
        }
        return Err(Error::Io(err));
    }
}

pub fn unflock(file: &File) -> Result<()> {
    let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    if res == 0 {
        return Ok(());
    }
    Err(Error::Io(std::io::Error::last_os_error()))
}

/// Non-blocking exclusive record lock on one byte. Returns `false` when
/// another process holds it. The descriptor must be open for writing.
pub fn try_lock_byte(file: &File, offset: i64) -> Result<bool> {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = libc::F_WRLCK as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = offset;
    fl.l_len = 1;
    loop {
        let res = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &fl) };
        if res == 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EACCES) | Some(libc::EAGAIN) => return Ok(false),
            Some(libc::EINTR) => continue,
            _ => return Err(Error::Io(err)),
        }
    }
}
