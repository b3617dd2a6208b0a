// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{DecodeError, EncodeError};

/// Represents errors that can occur in the ISAM engine
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// A record with the same value for a unique key already exists
    Duplicate,

    /// The handle does not refer to an open table
    NotOpen,

    /// Illegal argument
    BadArgument,

    /// Illegal key descriptor
    BadKey,

    /// The handle pool is exhausted
    TooManyHandles,

    /// The index file is corrupt or not an index file at all
    BadFile,

    /// The operation requires the table to be opened exclusively
    NotExclusive,

    /// A row or file lock is held by somebody else
    Locked,

    /// An identical key descriptor already exists on the table
    KeyExists,

    /// The key descriptor is the primary key and cannot be dropped
    PrimaryKey,

    /// Positioned before the first or past the last entry of the index
    EndOfFile,

    /// No record satisfies the request
    NoRecord,

    /// The cursor holds no current record
    NoCurrent,

    /// The table is locked as a whole
    FileLocked,

    /// The file name exceeds the supported length
    FileNameTooLong,

    /// The table already exists on disk
    Exists,

    /// The lock device is unavailable
    NoLockDevice,

    /// Memory allocation failed
    OutOfMemory,

    /// The collation table is malformed
    BadCollation,

    /// A log record could not be read
    LogRead,

    /// A log record is malformed
    BadLog,

    /// The log file could not be opened
    LogOpen,

    /// A log record could not be appended
    LogWrite,

    /// No transaction is active
    NoTransaction,

    /// The operation requires a preceding begin
    NoBegin,

    /// The table has no usable primary key for this operation
    NoPrimary,

    /// Logging is not enabled
    NoLogging,

    /// The file system ran out of space
    NoFreeSpace,

    /// The row length is outside the table's bounds
    RowSize,

    /// An audit trail already exists
    AuditExists,

    /// The lock table is exhausted
    NoMoreLocks,

    /// Lock acquisition would deadlock
    Deadlock,

    /// The operation requires manual lock mode
    NotManualLock,

    /// A blocking lock wait was interrupted by a signal
    Interrupted,

    /// Invalid or unparsable on-disk format
    BadFormat,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IsamError: {self:?}")
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// ISAM result
pub type Result<T> = std::result::Result<T, Error>;
