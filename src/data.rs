// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The data-file engine.
//!
//! Fixed-length mode packs rows into `(min_row_len + 1)`-byte slots, the
//! leading byte being the tombstone flag (0 = live). Variable-length mode
//! widens the primary slot with a total-length field and an overflow head
//! pointer; overflow bytes live in nodes borrowed from the index file's
//! free-node chain.
//!
//! Deleted slots form a LIFO free chain threaded through the slot bytes,
//! headed in the dictionary, so row ids get recycled most-recent-first.

use crate::{
    format::{read_ptr, write_ptr, RowId, NIL, PTR_SIZE},
    index::IndexFile,
    io::{read_at, write_at},
    Error, Result,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

const LIVE: u8 = 0;
const TOMBSTONE: u8 = 1;

/// An open `.dat` file.
pub struct DataFile {
    file: std::fs::File,
    min_row_len: u32,
    max_row_len: u32,
    variable: bool,
}

impl DataFile {
    pub fn new(file: std::fs::File, min_row_len: u32, max_row_len: u32, variable: bool) -> Self {
        Self {
            file,
            min_row_len,
            max_row_len,
            variable,
        }
    }

    /// Slot width: tombstone flag + payload, plus the variable-length
    /// descriptor (total length + overflow head) when applicable.
    fn slot_size(&self) -> u64 {
        let fixed = 1 + u64::from(self.min_row_len);
        if self.variable {
            fixed + 4 + PTR_SIZE as u64
        } else {
            fixed
        }
    }

    fn offset_of(&self, row_id: RowId) -> u64 {
        (row_id - 1) * self.slot_size()
    }

    /// Validates a row length against the table's bounds.
    pub fn validate_len(&self, len: usize) -> Result<()> {
        if self.variable {
            if len < self.min_row_len as usize || len > self.max_row_len as usize {
                return Err(Error::RowSize);
            }
        } else if len != self.min_row_len as usize {
            return Err(Error::RowSize);
        }
        Ok(())
    }

    fn read_slot(&self, row_id: RowId) -> Result<Vec<u8>> {
        let mut slot = vec![0; usize::try_from(self.slot_size()).map_err(|_| Error::BadFile)?];
        read_at(&self.file, &mut slot, self.offset_of(row_id))?;
        Ok(slot)
    }

    fn write_slot(&self, row_id: RowId, slot: &[u8]) -> Result<()> {
        write_at(&self.file, slot, self.offset_of(row_id))?;
        Ok(())
    }

    /// Reads a row; `None` when the slot is tombstoned.
    pub fn read_row(&self, index: &mut IndexFile, row_id: RowId) -> Result<Option<Vec<u8>>> {
        if row_id == NIL || row_id > index.dict.row_count {
            return Err(Error::NoRecord);
        }

        let slot = self.read_slot(row_id)?;
        if slot[0] != LIVE {
            return Ok(None);
        }

        if !self.variable {
            return Ok(Some(slot[1..].to_vec()));
        }

        let mut reader = &slot[1..];
        let total = reader.read_u32::<BigEndian>()? as usize;
        let mut overflow = read_ptr(&mut reader)?;

        if total < self.min_row_len as usize || total > self.max_row_len as usize {
            return Err(Error::BadFile);
        }

        let mut row = Vec::with_capacity(total);
        row.extend_from_slice(&reader[..(self.min_row_len as usize).min(total)]);

        while row.len() < total {
            if overflow == NIL {
                return Err(Error::BadFile);
            }

            let block = index.read_node(overflow)?;
            let mut reader = &block[..];

            let next = read_ptr(&mut reader)?;
            let len = usize::from(reader.read_u16::<BigEndian>()?);

            if len > reader.len() || row.len() + len > total {
                return Err(Error::BadFile);
            }

            row.extend_from_slice(&reader[..len]);
            overflow = next;
        }

        Ok(Some(row))
    }

    /// Writes a row into an allocated slot, replacing any previous content
    /// and overflow chain.
    pub fn write_row(&self, index: &mut IndexFile, row_id: RowId, row: &[u8]) -> Result<()> {
        self.validate_len(row.len())?;

        if row_id == NIL || row_id > index.dict.row_count {
            return Err(Error::BadArgument);
        }

        if !self.variable {
            let mut slot = Vec::with_capacity(row.len() + 1);
            slot.push(LIVE);
            slot.extend_from_slice(row);
            return self.write_slot(row_id, &slot);
        }

        self.drop_overflow(index, row_id)?;

        let head_len = (self.min_row_len as usize).min(row.len());
        let overflow = self.write_overflow(index, &row[head_len..])?;

        let mut slot = vec![0; usize::try_from(self.slot_size()).map_err(|_| Error::BadFile)?];
        slot[0] = LIVE;

        let mut writer = &mut slot[1..];

        // NOTE: row length is bounded by max_row_len (u32)
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<BigEndian>(row.len() as u32)?;
        write_ptr(&mut writer, overflow)?;
        writer[..head_len].copy_from_slice(&row[..head_len]);

        self.write_slot(row_id, &slot)
    }

    /// Stores `bytes` into a chain of index-file nodes, returning the head.
    fn write_overflow(&self, index: &mut IndexFile, bytes: &[u8]) -> Result<u64> {
        if bytes.is_empty() {
            return Ok(NIL);
        }

        let payload_per_node = index.node_size() as usize - PTR_SIZE - 2;
        let mut head = NIL;

        // build the chain back to front so each node links forward
        for chunk in bytes.chunks(payload_per_node).rev() {
            let node_no = index.allocate_node()?;
            let mut block = vec![0; index.node_size() as usize];

            let mut writer = &mut block[..];
            write_ptr(&mut writer, head)?;

            // NOTE: chunk fits in a node, nodes are capped at 65536
            #[allow(clippy::cast_possible_truncation)]
            writer.write_u16::<BigEndian>(chunk.len() as u16)?;
            writer[..chunk.len()].copy_from_slice(chunk);

            index.write_node(node_no, block)?;
            head = node_no;
        }

        Ok(head)
    }

    /// Returns a slot's overflow chain to the index free list.
    fn drop_overflow(&self, index: &mut IndexFile, row_id: RowId) -> Result<()> {
        if !self.variable {
            return Ok(());
        }

        let slot = self.read_slot(row_id)?;

        let mut reader = &slot[5..];
        let mut overflow = read_ptr(&mut reader)?;

        while overflow != NIL {
            let block = index.read_node(overflow)?;
            let next = read_ptr(&mut &block[..])?;
            index.free_node(overflow)?;
            overflow = next;
        }

        Ok(())
    }

    /// Hands out a row id: the head of the free-slot chain when non-empty,
    /// else a fresh slot extending the file.
    pub fn allocate_row(&self, index: &mut IndexFile) -> Result<RowId> {
        if index.dict.free_data_head != NIL {
            let row_id = index.dict.free_data_head;
            let slot = self.read_slot(row_id)?;

            index.dict.free_data_head = read_ptr(&mut &slot[1..])?;
            index.mark_dirty();

            return Ok(row_id);
        }

        index.dict.row_count += 1;
        index.mark_dirty();

        let row_id = index.dict.row_count;
        let slot = vec![0; usize::try_from(self.slot_size()).map_err(|_| Error::BadFile)?];
        self.write_slot(row_id, &slot)?;

        Ok(row_id)
    }

    /// Claims a specific slot (recovery replay): unlinks it from the free
    /// chain, or extends the file up to it, parking any gap slots on the
    /// free chain.
    pub fn force_allocate(&self, index: &mut IndexFile, row_id: RowId) -> Result<()> {
        if row_id == NIL {
            return Err(Error::BadArgument);
        }

        if row_id <= index.dict.row_count {
            self.unlink_free(index, row_id)?;
            return Ok(());
        }

        while index.dict.row_count + 1 < row_id {
            index.dict.row_count += 1;
            let gap = index.dict.row_count;

            let mut slot = vec![0; usize::try_from(self.slot_size()).map_err(|_| Error::BadFile)?];
            slot[0] = TOMBSTONE;
            write_ptr(&mut &mut slot[1..], index.dict.free_data_head)?;

            self.write_slot(gap, &slot)?;
            index.dict.free_data_head = gap;
        }

        index.dict.row_count += 1;
        index.mark_dirty();

        let slot = vec![0; usize::try_from(self.slot_size()).map_err(|_| Error::BadFile)?];
        self.write_slot(row_id, &slot)
    }

    fn unlink_free(&self, index: &mut IndexFile, row_id: RowId) -> Result<()> {
        let mut prev: Option<RowId> = None;
        let mut cur = index.dict.free_data_head;

        while cur != NIL {
            let slot = self.read_slot(cur)?;
            let next = read_ptr(&mut &slot[1..])?;

            if cur == row_id {
                match prev {
                    None => index.dict.free_data_head = next,
                    Some(p) => {
                        let mut prev_slot = self.read_slot(p)?;
                        write_ptr(&mut &mut prev_slot[1..], next)?;
                        self.write_slot(p, &prev_slot)?;
                    }
                }
                index.mark_dirty();
                return Ok(());
            }

            prev = Some(cur);
            cur = next;
        }

        Ok(())
    }

    /// Tombstones a row and pushes its slot onto the free chain.
    pub fn free_row(&self, index: &mut IndexFile, row_id: RowId) -> Result<()> {
        if row_id == NIL || row_id > index.dict.row_count {
            return Err(Error::BadArgument);
        }

        self.drop_overflow(index, row_id)?;

        let mut slot = vec![0; usize::try_from(self.slot_size()).map_err(|_| Error::BadFile)?];
        slot[0] = TOMBSTONE;
        write_ptr(&mut &mut slot[1..], index.dict.free_data_head)?;

        self.write_slot(row_id, &slot)?;

        index.dict.free_data_head = row_id;
        index.mark_dirty();

        Ok(())
    }

    /// Tombstones a row without touching the free chain (transactional
    /// deletes defer the slot free until commit).
    pub fn tombstone_row(&self, index: &IndexFile, row_id: RowId) -> Result<()> {
        if row_id == NIL || row_id > index.dict.row_count {
            return Err(Error::BadArgument);
        }

        let mut slot = self.read_slot(row_id)?;
        slot[0] = TOMBSTONE;
        self.write_slot(row_id, &slot)
    }

    /// Clears a tombstone set by [`DataFile::tombstone_row`] (rollback).
    pub fn revive_row(&self, index: &IndexFile, row_id: RowId) -> Result<()> {
        if row_id == NIL || row_id > index.dict.row_count {
            return Err(Error::BadArgument);
        }

        let mut slot = self.read_slot(row_id)?;
        slot[0] = LIVE;
        self.write_slot(row_id, &slot)
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary::{Dictionary, LockMethod};
    use test_log::test;

    fn open_pair(dir: &std::path::Path, variable: bool) -> Result<(IndexFile, DataFile)> {
        let open = |name: &str| {
            std::fs::OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(dir.join(name))
        };

        let max = if variable { 5_000 } else { 0 };
        let dict = Dictionary::new(512, 32, max, variable, LockMethod::Automatic);

        let index = IndexFile::create(open("t.idx")?, dict)?;
        let data = DataFile::new(open("t.dat")?, 32, max, variable);

        Ok((index, data))
    }

    #[test]
    fn fixed_rows_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (mut index, data) = open_pair(dir.path(), false)?;

        let row_a = [b'A'; 32];
        let row_b = [b'B'; 32];

        let a = data.allocate_row(&mut index)?;
        let b = data.allocate_row(&mut index)?;
        assert_eq!((1, 2), (a, b));

        data.write_row(&mut index, a, &row_a)?;
        data.write_row(&mut index, b, &row_b)?;

        assert_eq!(Some(row_a.to_vec()), data.read_row(&mut index, a)?);
        assert_eq!(Some(row_b.to_vec()), data.read_row(&mut index, b)?);

        Ok(())
    }

    #[test]
    fn wrong_length_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (mut index, data) = open_pair(dir.path(), false)?;

        let row = data.allocate_row(&mut index)?;
        assert!(matches!(
            data.write_row(&mut index, row, &[0; 31]),
            Err(Error::RowSize)
        ));

        Ok(())
    }

    #[test]
    fn freed_slots_recycle_lifo() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (mut index, data) = open_pair(dir.path(), false)?;

        for _ in 0..3 {
            let row = data.allocate_row(&mut index)?;
            data.write_row(&mut index, row, &[b'x'; 32])?;
        }

        data.free_row(&mut index, 1)?;
        data.free_row(&mut index, 3)?;

        assert_eq!(None, data.read_row(&mut index, 1)?);

        assert_eq!(3, data.allocate_row(&mut index)?);
        assert_eq!(1, data.allocate_row(&mut index)?);
        assert_eq!(4, data.allocate_row(&mut index)?);

        Ok(())
    }

    #[test]
    fn variable_rows_spill_into_overflow() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (mut index, data) = open_pair(dir.path(), true)?;

        let row_id = data.allocate_row(&mut index)?;

        let long: Vec<u8> = (0..4_000u32).map(|i| (i % 251) as u8).collect();
        data.write_row(&mut index, row_id, &long)?;

        let nodes_used = index.dict.node_count;
        assert!(nodes_used > 1, "overflow must allocate index nodes");

        assert_eq!(Some(long.clone()), data.read_row(&mut index, row_id)?);

        // rewriting with a short row returns the overflow nodes
        data.write_row(&mut index, row_id, &vec![7; 40])?;
        assert_eq!(Some(vec![7; 40]), data.read_row(&mut index, row_id)?);

        let mut free = 0;
        let mut head = index.dict.free_node_head;
        while head != NIL {
            let block = index.read_node(head)?;
            head = read_ptr(&mut &block[..])?;
            free += 1;
        }
        assert!(free > 0, "old overflow nodes must be on the free chain");

        Ok(())
    }

    #[test]
    fn force_allocate_extends_and_unlinks() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (mut index, data) = open_pair(dir.path(), false)?;

        data.force_allocate(&mut index, 3)?;
        assert_eq!(3, index.dict.row_count);
        data.write_row(&mut index, 3, &[b'z'; 32])?;

        // slots 1 and 2 were parked on the free chain
        assert_eq!(2, data.allocate_row(&mut index)?);

        // claiming slot 1 explicitly unlinks it
        data.force_allocate(&mut index, 1)?;
        data.write_row(&mut index, 1, &[b'y'; 32])?;
        assert_eq!(4, data.allocate_row(&mut index)?);

        Ok(())
    }
}
