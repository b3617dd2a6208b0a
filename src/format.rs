// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! On-disk format parameters.
//!
//! The `compat` cargo feature selects the legacy 32-bit layout: node pointers,
//! row ids and the dictionary counters are stored as 4 bytes instead of 8.
//! In-memory values are always 64-bit.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Number of a node (block) in the index file, 1-based.
///
/// Node 1 is always the dictionary. `0` is the nil pointer.
pub type NodeNo = u64;

/// Stable slot number of a row in the data file, 1-based.
///
/// `0` is the nil pointer (end of the free-slot chain).
pub type RowId = u64;

/// The nil node/row pointer.
pub const NIL: u64 = 0;

#[cfg(not(feature = "compat"))]
pub const MAGIC_BYTES: [u8; 4] = [b'I', b'S', b'M', 2];

#[cfg(feature = "compat")]
pub const MAGIC_BYTES: [u8; 4] = [b'I', b'S', b'M', 1];

/// Width of a node pointer / row id on disk.
#[cfg(not(feature = "compat"))]
pub const PTR_SIZE: usize = 8;

#[cfg(feature = "compat")]
pub const PTR_SIZE: usize = 4;

/// Maximum number of secondary indexes per table.
pub const MAX_KEYS: usize = 32;

/// Maximum encoded key length in bytes.
pub const MAX_KEY_LEN: usize = 240;

/// Maximum number of parts in one key descriptor.
pub const MAX_KEY_PARTS: usize = 8;

/// Maximum number of concurrently open table handles per context.
pub const MAX_HANDLES: usize = 128;

pub const MIN_NODE_SIZE: u32 = 512;
pub const MAX_NODE_SIZE: u32 = 65_536;

/// Bytes reserved at the head of every node (used-byte count + reserved pad).
pub const NODE_HEADER: usize = 4;

/// Bytes reserved at the tail of every tree node (level byte + marker byte).
pub const NODE_FOOTER: usize = 2;

/// Marker stored in the last byte of every tree node.
pub const TREE_NODE_MARKER: u8 = 0x7F;

pub fn write_ptr<W: Write>(writer: &mut W, value: u64) -> std::io::Result<()> {
    #[cfg(not(feature = "compat"))]
    {
        writer.write_u64::<BigEndian>(value)
    }
    #[cfg(feature = "compat")]
    {
        // NOTE: Truncation is the documented compat-mode limit
        #[allow(clippy::cast_possible_truncation)]
        let narrow = value as u32;
        writer.write_u32::<BigEndian>(narrow)
    }
}

pub fn read_ptr<R: Read>(reader: &mut R) -> std::io::Result<u64> {
    #[cfg(not(feature = "compat"))]
    {
        reader.read_u64::<BigEndian>()
    }
    #[cfg(feature = "compat")]
    {
        reader.read_u32::<BigEndian>().map(u64::from)
    }
}
