// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The append-only transaction log.
//!
//! Record wire format (all integers big-endian):
//!
//! ```text
//! length   u32    bytes from `op` through the end of the payload
//! op       [u8;2] operation code
//! pid      u32    owning process
//! time     u32    seconds since the epoch
//! payload  ...
//! length   u32    mirror of the leading length
//! ```
//!
//! The trailing mirror lets recovery scan the log in either direction.

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    format::{read_ptr, write_ptr, RowId},
    key::StoredKey,
    tree::DupNo,
    Error, Result,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Fixed bytes per record besides the payload: two length fields, the op
/// code, pid and timestamp.
const RECORD_OVERHEAD: usize = 4 + 2 + 4 + 4 + 4;

/// Operation code of a log record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogOp {
    Build,
    Open,
    Close,
    Erase,
    Rename,
    Insert,
    Update,
    Delete,
    CreateIndex,
    DropIndex,
    Cluster,
    SetUnique,
    UniqueId,
    Begin,
    Commit,
    Rollback,
}

impl LogOp {
    pub fn code(self) -> [u8; 2] {
        match self {
            Self::Build => *b"FB",
            Self::Open => *b"FO",
            Self::Close => *b"FC",
            Self::Erase => *b"FE",
            Self::Rename => *b"FR",
            Self::Insert => *b"IN",
            Self::Update => *b"UP",
            Self::Delete => *b"DE",
            Self::CreateIndex => *b"CI",
            Self::DropIndex => *b"DI",
            Self::Cluster => *b"CL",
            Self::SetUnique => *b"SU",
            Self::UniqueId => *b"UN",
            Self::Begin => *b"BW",
            Self::Commit => *b"CW",
            Self::Rollback => *b"RW",
        }
    }

    pub fn from_code(code: [u8; 2]) -> Option<Self> {
        Some(match &code {
            b"FB" => Self::Build,
            b"FO" => Self::Open,
            b"FC" => Self::Close,
            b"FE" => Self::Erase,
            b"FR" => Self::Rename,
            b"IN" => Self::Insert,
            b"UP" => Self::Update,
            b"DE" => Self::Delete,
            b"CI" => Self::CreateIndex,
            b"DI" => Self::DropIndex,
            b"CL" => Self::Cluster,
            b"SU" => Self::SetUnique,
            b"UN" => Self::UniqueId,
            b"BW" => Self::Begin,
            b"CW" => Self::Commit,
            b"RW" => Self::Rollback,
            _ => return None,
        })
    }
}

/// A parsed log record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogRecord {
    pub op: LogOp,
    pub pid: u32,
    pub timestamp: u32,
    pub payload: Vec<u8>,
}

/// The single per-process log file.
pub struct LogFile {
    file: std::fs::File,
    path: PathBuf,
}

impl LogFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .map_err(|_| Error::LogOpen)?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Appends one record, framed with its mirrored length.
    pub fn append(&mut self, op: LogOp, pid: u32, timestamp: u32, payload: &[u8]) -> Result<()> {
        let length = u32::try_from(2 + 4 + 4 + payload.len()).map_err(|_| Error::LogWrite)?;

        let mut record = Vec::with_capacity(RECORD_OVERHEAD + payload.len());
        record
            .write_u32::<BigEndian>(length)
            .map_err(|_| Error::LogWrite)?;
        record.extend_from_slice(&op.code());
        record
            .write_u32::<BigEndian>(pid)
            .map_err(|_| Error::LogWrite)?;
        record
            .write_u32::<BigEndian>(timestamp)
            .map_err(|_| Error::LogWrite)?;
        record.extend_from_slice(payload);
        record
            .write_u32::<BigEndian>(length)
            .map_err(|_| Error::LogWrite)?;

        self.file.write_all(&record).map_err(|_| Error::LogWrite)?;
        self.file.flush().map_err(|_| Error::LogWrite)?;

        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all().map_err(|_| Error::LogWrite)
    }

    /// Reads and frames every record in the log.
    pub fn read_all(&mut self) -> Result<Vec<LogRecord>> {
        let bytes = std::fs::read(&self.path).map_err(|_| Error::LogRead)?;

        let mut records = vec![];
        let mut reader = &bytes[..];

        while !reader.is_empty() {
            let length = reader.read_u32::<BigEndian>().map_err(|_| Error::LogRead)? as usize;
            if length < 10 || length > reader.len() {
                return Err(Error::BadLog);
            }

            let mut code = [0u8; 2];
            reader.read_exact(&mut code).map_err(|_| Error::LogRead)?;
            let op = LogOp::from_code(code).ok_or(Error::BadLog)?;

            let pid = reader.read_u32::<BigEndian>().map_err(|_| Error::LogRead)?;
            let timestamp = reader.read_u32::<BigEndian>().map_err(|_| Error::LogRead)?;

            let payload_len = length - 10;
            let (payload, rest) = reader.split_at(payload_len);
            reader = rest;

            let mirror = reader.read_u32::<BigEndian>().map_err(|_| Error::LogRead)? as usize;
            if mirror != length {
                return Err(Error::BadLog);
            }

            records.push(LogRecord {
                op,
                pid,
                timestamp,
                payload: payload.to_vec(),
            });
        }

        Ok(records)
    }
}

// === payloads ===

fn write_name<W: Write>(writer: &mut W, name: &str) -> std::result::Result<(), EncodeError> {
    let len = u16::try_from(name.len())
        .map_err(|_| EncodeError::Io(std::io::Error::other("name too long")))?;
    writer.write_u16::<BigEndian>(len)?;
    writer.write_all(name.as_bytes())?;
    Ok(())
}

fn read_name<R: Read>(reader: &mut R) -> std::result::Result<String, DecodeError> {
    let len = usize::from(reader.read_u16::<BigEndian>()?);
    let mut bytes = vec![0; len];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| DecodeError::InvalidHeader("LogName"))
}

/// BUILD: everything needed to re-create the table.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuildPayload {
    pub handle: u32,
    pub node_size: u32,
    pub min_row_len: u32,
    pub max_row_len: u32,
    pub variable: bool,
    pub name: String,
    pub primary: StoredKey,
}

impl Encode for BuildPayload {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        writer.write_u32::<BigEndian>(self.handle)?;
        writer.write_u32::<BigEndian>(self.node_size)?;
        writer.write_u32::<BigEndian>(self.min_row_len)?;
        writer.write_u32::<BigEndian>(self.max_row_len)?;
        writer.write_u8(u8::from(self.variable))?;
        write_name(writer, &self.name)?;
        self.primary.encode_into(writer)
    }
}

impl Decode for BuildPayload {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        Ok(Self {
            handle: reader.read_u32::<BigEndian>()?,
            node_size: reader.read_u32::<BigEndian>()?,
            min_row_len: reader.read_u32::<BigEndian>()?,
            max_row_len: reader.read_u32::<BigEndian>()?,
            variable: reader.read_u8()? != 0,
            name: read_name(reader)?,
            primary: StoredKey::decode_from(reader)?,
        })
    }
}

/// OPEN / CLOSE / ERASE: handle and table name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NamePayload {
    pub handle: u32,
    pub name: String,
}

impl Encode for NamePayload {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        writer.write_u32::<BigEndian>(self.handle)?;
        write_name(writer, &self.name)
    }
}

impl Decode for NamePayload {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        Ok(Self {
            handle: reader.read_u32::<BigEndian>()?,
            name: read_name(reader)?,
        })
    }
}

/// RENAME: both names.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RenamePayload {
    pub old: String,
    pub new: String,
}

impl Encode for RenamePayload {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        write_name(writer, &self.old)?;
        write_name(writer, &self.new)
    }
}

impl Decode for RenamePayload {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        Ok(Self {
            old: read_name(reader)?,
            new: read_name(reader)?,
        })
    }
}

/// INSERT: the new row plus the duplicate number assigned per key, so
/// replay reproduces the exact index state.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InsertPayload {
    pub handle: u32,
    pub row_id: RowId,
    pub dups: Vec<DupNo>,
    pub row: Vec<u8>,
}

impl Encode for InsertPayload {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        writer.write_u32::<BigEndian>(self.handle)?;
        write_ptr(writer, self.row_id)?;

        let count = u16::try_from(self.dups.len())
            .map_err(|_| EncodeError::Io(std::io::Error::other("too many keys")))?;
        writer.write_u16::<BigEndian>(count)?;
        for dup in &self.dups {
            writer.write_u32::<BigEndian>(*dup)?;
        }

        writer.write_all(&self.row)?;
        Ok(())
    }
}

impl Decode for InsertPayload {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let handle = reader.read_u32::<BigEndian>()?;
        let row_id = read_ptr(reader)?;

        let count = usize::from(reader.read_u16::<BigEndian>()?);
        let mut dups = Vec::with_capacity(count);
        for _ in 0..count {
            dups.push(reader.read_u32::<BigEndian>()?);
        }

        let mut row = vec![];
        reader.read_to_end(&mut row)?;

        Ok(Self {
            handle,
            row_id,
            dups,
            row,
        })
    }
}

/// UPDATE: both images; the old one drives rollback.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UpdatePayload {
    pub handle: u32,
    pub row_id: RowId,
    pub old: Vec<u8>,
    pub new: Vec<u8>,
}

impl Encode for UpdatePayload {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        writer.write_u32::<BigEndian>(self.handle)?;
        write_ptr(writer, self.row_id)?;

        // NOTE: row lengths are bounded by the table's max row length (u32)
        #[allow(clippy::cast_possible_truncation)]
        {
            writer.write_u32::<BigEndian>(self.old.len() as u32)?;
            writer.write_u32::<BigEndian>(self.new.len() as u32)?;
        }

        writer.write_all(&self.old)?;
        writer.write_all(&self.new)?;
        Ok(())
    }
}

impl Decode for UpdatePayload {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let handle = reader.read_u32::<BigEndian>()?;
        let row_id = read_ptr(reader)?;

        let old_len = reader.read_u32::<BigEndian>()? as usize;
        let new_len = reader.read_u32::<BigEndian>()? as usize;

        let mut old = vec![0; old_len];
        reader.read_exact(&mut old)?;
        let mut new = vec![0; new_len];
        reader.read_exact(&mut new)?;

        Ok(Self {
            handle,
            row_id,
            old,
            new,
        })
    }
}

/// DELETE: the dropped image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeletePayload {
    pub handle: u32,
    pub row_id: RowId,
    pub row: Vec<u8>,
}

impl Encode for DeletePayload {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        writer.write_u32::<BigEndian>(self.handle)?;
        write_ptr(writer, self.row_id)?;
        writer.write_all(&self.row)?;
        Ok(())
    }
}

impl Decode for DeletePayload {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let handle = reader.read_u32::<BigEndian>()?;
        let row_id = read_ptr(reader)?;

        let mut row = vec![];
        reader.read_to_end(&mut row)?;

        Ok(Self {
            handle,
            row_id,
            row,
        })
    }
}

/// SETUNIQUE / UNIQUEID: the counter value involved.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValuePayload {
    pub handle: u32,
    pub value: u64,
}

impl Encode for ValuePayload {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        writer.write_u32::<BigEndian>(self.handle)?;
        write_ptr(writer, self.value)?;
        Ok(())
    }
}

impl Decode for ValuePayload {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        Ok(Self {
            handle: reader.read_u32::<BigEndian>()?,
            value: read_ptr(reader)?,
        })
    }
}

/// CREINDEX / DELINDEX / CLUSTER: the key descriptor involved.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IndexPayload {
    pub handle: u32,
    pub key: StoredKey,
}

impl Encode for IndexPayload {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        writer.write_u32::<BigEndian>(self.handle)?;
        self.key.encode_into(writer)
    }
}

impl Decode for IndexPayload {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        Ok(Self {
            handle: reader.read_u32::<BigEndian>()?,
            key: StoredKey::decode_from(reader)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn append_then_scan() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut log = LogFile::open(&dir.path().join("isam.log"))?;

        log.append(LogOp::Begin, 42, 1_000, &[])?;

        let payload = InsertPayload {
            handle: 3,
            row_id: 17,
            dups: vec![0, 2],
            row: b"hello".to_vec(),
        }
        .encode_into_vec();
        log.append(LogOp::Insert, 42, 1_001, &payload)?;

        log.append(LogOp::Commit, 42, 1_002, &[])?;

        let records = log.read_all()?;
        assert_eq!(3, records.len());
        assert_eq!(LogOp::Begin, records[0].op);
        assert_eq!(LogOp::Insert, records[1].op);
        assert_eq!(LogOp::Commit, records[2].op);
        assert_eq!(42, records[1].pid);

        let decoded = InsertPayload::decode_from(&mut &records[1].payload[..])?;
        assert_eq!(17, decoded.row_id);
        assert_eq!(vec![0, 2], decoded.dups);
        assert_eq!(b"hello".to_vec(), decoded.row);

        Ok(())
    }

    #[test]
    fn truncated_record_is_bad_log() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("isam.log");

        let mut log = LogFile::open(&path)?;
        log.append(LogOp::Begin, 1, 0, &[])?;

        // chop the trailing mirror off
        let bytes = std::fs::read(&path)?;
        std::fs::write(&path, &bytes[..bytes.len() - 2])?;

        let mut log = LogFile::open(&path)?;
        assert!(matches!(log.read_all(), Err(Error::BadLog | Error::LogRead)));

        Ok(())
    }
}
