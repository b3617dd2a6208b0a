// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Advisory byte-range locks on the index file.
//!
//! The index file is the single lock rendezvous for a table. Regions:
//!
//! | region | offset | length |
//! |--------|--------|--------|
//! | PRIMARY (dictionary-coherent section) | 0 | `0x3FFF_FFFF` |
//! | per-row locks | `0x4000_0000 + row_id` | 1 |
//! | whole-file row lock | `0x4000_0000` | `0x3FFF_FFFF` |
//! | open sentinel | `0x7FFF_FFFF` | 1 |
//!
//! Locks are POSIX `fcntl` record locks on Unix, so they are advisory and
//! per-process. On other platforms every acquisition trivially succeeds and
//! cross-process sharing is not supported.

use crate::{Error, Result};
use std::fs::File;

pub const PRIMARY_OFFSET: u64 = 0;
pub const PRIMARY_LEN: u64 = 0x3FFF_FFFF;

pub const ROW_LOCK_BASE: u64 = 0x4000_0000;
pub const ROW_LOCK_LEN: u64 = 0x3FFF_FFFF;

pub const FILE_OPEN_OFFSET: u64 = 0x7FFF_FFFF;

/// Lock mode for a byte range.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RangeLockMode {
    /// Shared lock, fail immediately when contended
    Read,

    /// Exclusive lock, fail immediately when contended
    Write,

    /// Shared lock, block until available
    ReadWait,

    /// Exclusive lock, block until available
    WriteWait,

    /// Release the range
    Unlock,
}

impl RangeLockMode {
    fn is_blocking(self) -> bool {
        matches!(self, Self::ReadWait | Self::WriteWait)
    }
}

/// Acquires or releases an advisory lock over `[offset, offset + len)`.
///
/// A contended non-waiting acquisition surfaces [`Error::Locked`]; a blocking
/// acquisition interrupted by a signal surfaces [`Error::Interrupted`].
#[cfg(unix)]
pub fn range_lock(file: &File, offset: u64, len: u64, mode: RangeLockMode) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    let lock_type = match mode {
        RangeLockMode::Read | RangeLockMode::ReadWait => libc::F_RDLCK,
        RangeLockMode::Write | RangeLockMode::WriteWait => libc::F_WRLCK,
        RangeLockMode::Unlock => libc::F_UNLCK,
    };

    let cmd = if mode.is_blocking() {
        libc::F_SETLKW
    } else {
        libc::F_SETLK
    };

    // NOTE: Truncation only bites past 2^63 bytes which no index file reaches
    #[allow(clippy::cast_possible_wrap)]
    let flock = libc::flock {
        l_type: lock_type as libc::c_short,
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: offset as libc::off_t,
        l_len: len as libc::off_t,
        l_pid: 0,
    };

    // SAFETY: fcntl with a valid fd and a fully initialized flock struct
    #[allow(unsafe_code)]
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), cmd, std::ptr::addr_of!(flock)) };

    if rc == 0 {
        return Ok(());
    }

    let errno = std::io::Error::last_os_error();

    Err(match errno.raw_os_error() {
        Some(libc::EACCES | libc::EAGAIN) => Error::Locked,
        Some(libc::EINTR) => Error::Interrupted,
        Some(libc::EDEADLK) => Error::Deadlock,
        Some(libc::ENOLCK) => Error::NoMoreLocks,
        _ => Error::Io(errno),
    })
}

#[cfg(not(unix))]
pub fn range_lock(_file: &File, _offset: u64, _len: u64, _mode: RangeLockMode) -> Result<()> {
    Ok(())
}
