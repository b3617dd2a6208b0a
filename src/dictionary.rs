// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The dictionary node (node 1 of the index file).

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    format::{read_ptr, write_ptr, NodeNo, RowId, MAGIC_BYTES, NODE_FOOTER, NODE_HEADER},
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Default lock discipline of a table, recorded at build time.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockMethod {
    /// Row locks are taken implicitly by positioned reads
    Automatic,

    /// Row locks are taken only on request
    Manual,
}

impl TryFrom<u8> for LockMethod {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Automatic),
            1 => Ok(Self::Manual),
            _ => Err(()),
        }
    }
}

impl From<LockMethod> for u8 {
    fn from(value: LockMethod) -> Self {
        match value {
            LockMethod::Automatic => 0,
            LockMethod::Manual => 1,
        }
    }
}

/// Table metadata kept in node 1.
///
/// Every multi-byte field is stored big-endian. The trailing bytes of the
/// node are zero.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Dictionary {
    pub node_size: u32,
    pub header_reserved: u16,
    pub footer_reserved: u16,
    pub key_count: u16,
    pub lock_method: LockMethod,
    pub variable_length: bool,
    pub min_row_len: u32,
    pub max_row_len: u32,

    /// First block of the key-descriptor chain
    pub keydesc_head: NodeNo,

    /// Head of the free-data-slot chain (LIFO)
    pub free_data_head: RowId,

    /// Head of the free-node chain (LIFO)
    pub free_node_head: NodeNo,

    /// Number of allocated row slots (live or tombstoned)
    pub row_count: u64,

    /// Highest node number ever allocated
    pub node_count: u64,

    /// Bumped on every mutation; lets other handles notice stale caches
    pub txn_counter: u64,

    /// Caller-visible unique-id sequence
    pub unique_id: u64,
}

impl Dictionary {
    pub fn new(
        node_size: u32,
        min_row_len: u32,
        max_row_len: u32,
        variable_length: bool,
        lock_method: LockMethod,
    ) -> Self {
        Self {
            node_size,
            header_reserved: NODE_HEADER as u16,
            footer_reserved: NODE_FOOTER as u16,
            key_count: 0,
            lock_method,
            variable_length,
            min_row_len,
            max_row_len,
            keydesc_head: 0,
            free_data_head: 0,
            free_node_head: 0,
            row_count: 0,
            node_count: 1,
            txn_counter: 0,
            unique_id: 1,
        }
    }

    /// Serializes into a full, zero-padded node block.
    pub fn to_node(&self) -> Vec<u8> {
        let mut block = self.encode_into_vec();
        block.resize(self.node_size as usize, 0);
        block
    }
}

impl Encode for Dictionary {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_all(&MAGIC_BYTES)?;
        writer.write_u32::<BigEndian>(self.node_size)?;
        writer.write_u16::<BigEndian>(self.header_reserved)?;
        writer.write_u16::<BigEndian>(self.footer_reserved)?;
        writer.write_u16::<BigEndian>(self.key_count)?;
        writer.write_u8(u8::from(self.lock_method))?;
        writer.write_u8(u8::from(self.variable_length))?;
        writer.write_u32::<BigEndian>(self.min_row_len)?;
        writer.write_u32::<BigEndian>(self.max_row_len)?;
        write_ptr(writer, self.keydesc_head)?;
        write_ptr(writer, self.free_data_head)?;
        write_ptr(writer, self.free_node_head)?;
        write_ptr(writer, self.row_count)?;
        write_ptr(writer, self.node_count)?;
        write_ptr(writer, self.txn_counter)?;
        write_ptr(writer, self.unique_id)?;
        Ok(())
    }
}

impl Decode for Dictionary {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut magic = [0u8; MAGIC_BYTES.len()];
        reader.read_exact(&mut magic)?;

        if magic != MAGIC_BYTES {
            return Err(DecodeError::InvalidHeader("Dictionary"));
        }

        let node_size = reader.read_u32::<BigEndian>()?;
        let header_reserved = reader.read_u16::<BigEndian>()?;
        let footer_reserved = reader.read_u16::<BigEndian>()?;
        let key_count = reader.read_u16::<BigEndian>()?;

        let lock_method = reader.read_u8()?;
        let lock_method = lock_method
            .try_into()
            .map_err(|()| DecodeError::InvalidTag(("LockMethod", lock_method)))?;

        let variable_length = reader.read_u8()? != 0;
        let min_row_len = reader.read_u32::<BigEndian>()?;
        let max_row_len = reader.read_u32::<BigEndian>()?;
        let keydesc_head = read_ptr(reader)?;
        let free_data_head = read_ptr(reader)?;
        let free_node_head = read_ptr(reader)?;
        let row_count = read_ptr(reader)?;
        let node_count = read_ptr(reader)?;
        let txn_counter = read_ptr(reader)?;
        let unique_id = read_ptr(reader)?;

        Ok(Self {
            node_size,
            header_reserved,
            footer_reserved,
            key_count,
            lock_method,
            variable_length,
            min_row_len,
            max_row_len,
            keydesc_head,
            free_data_head,
            free_node_head,
            row_count,
            node_count,
            txn_counter,
            unique_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn dictionary_roundtrip() -> crate::Result<()> {
        let mut dict = Dictionary::new(1_024, 64, 0, false, LockMethod::Automatic);
        dict.key_count = 3;
        dict.keydesc_head = 2;
        dict.free_node_head = 17;
        dict.row_count = 1_000;
        dict.node_count = 99;
        dict.txn_counter = 123_456;
        dict.unique_id = 42;

        let block = dict.to_node();
        assert_eq!(1_024, block.len());

        let decoded = Dictionary::decode_from(&mut &block[..])?;
        assert_eq!(dict, decoded);

        Ok(())
    }

    #[test]
    fn rejects_bad_magic() {
        let dict = Dictionary::new(1_024, 64, 0, false, LockMethod::Manual);

        let mut block = dict.to_node();
        block[0] = b'X';

        assert!(Dictionary::decode_from(&mut &block[..]).is_err());
    }
}
