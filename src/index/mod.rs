// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The index file: dictionary, free-node allocator and key-descriptor chain.

pub mod node_cache;

use crate::{
    coding::{Decode, Encode},
    dictionary::Dictionary,
    format::{
        read_ptr, write_ptr, NodeNo, MAX_NODE_SIZE, MIN_NODE_SIZE, NIL, PTR_SIZE,
    },
    io::BlockFile,
    key::StoredKey,
    Error, Result,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use node_cache::NodeCache;

/// Header of a key-descriptor chain block: used-byte count + next pointer.
const CHAIN_HEADER: usize = 2 + PTR_SIZE;

/// An open `.idx` file together with its cached dictionary.
///
/// All index nodes pass through the write-through node cache; the cache is
/// dropped whenever [`IndexFile::reload_dictionary`] observes a transaction
/// counter bump made by another handle.
pub struct IndexFile {
    blocks: BlockFile,
    pub dict: Dictionary,
    dict_dirty: bool,
    cache: NodeCache,
}

impl IndexFile {
    /// Initialises a fresh index file with the given dictionary.
    pub fn create(file: std::fs::File, dict: Dictionary) -> Result<Self> {
        let blocks = BlockFile::new(file, dict.node_size);
        blocks.write_node(1, &dict.to_node())?;

        Ok(Self {
            blocks,
            dict,
            dict_dirty: false,
            cache: NodeCache::default(),
        })
    }

    /// Opens an existing index file, validating the dictionary magic.
    pub fn open(file: std::fs::File) -> Result<Self> {
        // The node size lives inside the dictionary, so bootstrap with the
        // minimum node size; the dictionary always fits in it.
        let mut blocks = BlockFile::new(file, MIN_NODE_SIZE);

        let first = blocks.read_node(1).map_err(|_| Error::BadFile)?;
        let dict = Dictionary::decode_from(&mut &first[..]).map_err(|_| Error::BadFile)?;

        if !(MIN_NODE_SIZE..=MAX_NODE_SIZE).contains(&dict.node_size) {
            return Err(Error::BadFile);
        }

        blocks = BlockFile::new(blocks.into_file(), dict.node_size);

        Ok(Self {
            blocks,
            dict,
            dict_dirty: false,
            cache: NodeCache::default(),
        })
    }

    pub fn node_size(&self) -> u32 {
        self.dict.node_size
    }

    pub fn file(&self) -> &std::fs::File {
        self.blocks.file()
    }

    /// Flags the dictionary as modified; the coordinator will flush it (and
    /// bump the transaction counter) on operation exit.
    pub fn mark_dirty(&mut self) {
        self.dict_dirty = true;
    }

    /// Re-reads node 1 from disk. If another handle has bumped the
    /// transaction counter, the node cache is stale and gets dropped.
    pub fn reload_dictionary(&mut self) -> Result<()> {
        let first = self.blocks.read_node(1).map_err(|_| Error::BadFile)?;
        let dict = Dictionary::decode_from(&mut &first[..]).map_err(|_| Error::BadFile)?;

        if dict.txn_counter != self.dict.txn_counter {
            log::trace!("transaction counter moved, dropping node cache");
            self.cache.clear();
        }

        self.dict = dict;
        Ok(())
    }

    /// Writes the dictionary back if dirty, bumping the transaction counter.
    pub fn flush_dictionary(&mut self) -> Result<()> {
        if !self.dict_dirty {
            return Ok(());
        }

        self.dict.txn_counter += 1;
        self.blocks.write_node(1, &self.dict.to_node())?;
        self.dict_dirty = false;

        Ok(())
    }

    pub fn read_node(&mut self, node_no: NodeNo) -> Result<Vec<u8>> {
        if let Some(bytes) = self.cache.get(node_no) {
            return Ok(bytes.clone());
        }

        let bytes = self.blocks.read_node(node_no)?;
        self.cache.insert(node_no, bytes.clone());
        Ok(bytes)
    }

    pub fn write_node(&mut self, node_no: NodeNo, bytes: Vec<u8>) -> Result<()> {
        self.blocks.write_node(node_no, &bytes)?;
        self.cache.insert(node_no, bytes);
        Ok(())
    }

    /// Hands out a node: the head of the free-node chain when non-empty,
    /// else a fresh node extending the file.
    pub fn allocate_node(&mut self) -> Result<NodeNo> {
        if self.dict.free_node_head != NIL {
            let node_no = self.dict.free_node_head;
            let block = self.read_node(node_no)?;

            self.dict.free_node_head = read_ptr(&mut &block[..])?;
            self.mark_dirty();

            return Ok(node_no);
        }

        self.dict.node_count += 1;
        self.mark_dirty();

        let node_no = self.dict.node_count;
        self.write_node(node_no, vec![0; self.node_size() as usize])?;
        Ok(node_no)
    }

    /// Returns a node to the free chain, zeroing it.
    pub fn free_node(&mut self, node_no: NodeNo) -> Result<()> {
        let mut block = vec![0; self.node_size() as usize];

        let mut writer = &mut block[..];
        write_ptr(&mut writer, self.dict.free_node_head)?;

        self.write_node(node_no, block)?;

        self.dict.free_node_head = node_no;
        self.mark_dirty();

        Ok(())
    }

    /// Materialises every key descriptor from the chain.
    pub fn read_keys(&mut self) -> Result<Vec<StoredKey>> {
        let mut keys = Vec::with_capacity(self.dict.key_count.into());
        let mut node_no = self.dict.keydesc_head;

        while node_no != NIL {
            let block = self.read_node(node_no)?;

            let used = usize::from((&block[..]).read_u16::<BigEndian>()?);
            if used < CHAIN_HEADER || used > block.len() {
                return Err(Error::BadFile);
            }

            let next = read_ptr(&mut &block[2..])?;

            let mut records = &block[CHAIN_HEADER..used];
            while !records.is_empty() {
                keys.push(StoredKey::decode_from(&mut records)?);
            }

            node_no = next;
        }

        if keys.len() != usize::from(self.dict.key_count) {
            return Err(Error::BadFile);
        }

        Ok(keys)
    }

    /// Rewrites the whole key-descriptor chain from `keys`, reusing the
    /// existing chain blocks and allocating/freeing as needed.
    pub fn write_keys(&mut self, keys: &[StoredKey]) -> Result<()> {
        let capacity = self.node_size() as usize - CHAIN_HEADER;

        // Pack records greedily into block-sized groups
        let mut groups: Vec<Vec<u8>> = vec![];
        let mut current: Vec<u8> = vec![];

        for key in keys {
            let record = key.encode_into_vec();
            debug_assert!(record.len() <= capacity);

            if current.len() + record.len() > capacity {
                groups.push(std::mem::take(&mut current));
            }
            current.extend_from_slice(&record);
        }
        if !current.is_empty() || groups.is_empty() {
            groups.push(current);
        }

        // Collect the blocks currently forming the chain
        let mut old_blocks = vec![];
        let mut node_no = self.dict.keydesc_head;
        while node_no != NIL {
            let block = self.read_node(node_no)?;
            old_blocks.push(node_no);
            node_no = read_ptr(&mut &block[2..])?;
        }

        let mut chain = vec![];
        for idx in 0..groups.len() {
            match old_blocks.get(idx) {
                Some(&n) => chain.push(n),
                None => chain.push(self.allocate_node()?),
            }
        }

        for &surplus in old_blocks.get(groups.len()..).unwrap_or(&[]) {
            self.free_node(surplus)?;
        }

        for (idx, group) in groups.iter().enumerate() {
            let mut block = vec![0; self.node_size() as usize];

            let used = CHAIN_HEADER + group.len();

            // NOTE: used <= node_size <= 65536... the largest node size is
            // representable because used < node_size for chain blocks
            #[allow(clippy::cast_possible_truncation)]
            {
                let mut writer = &mut block[..];
                writer.write_u16::<BigEndian>(used as u16)?;
            }

            let next = chain.get(idx + 1).copied().unwrap_or(NIL);
            write_ptr(&mut &mut block[2..], next)?;

            block[CHAIN_HEADER..used].copy_from_slice(group);
            self.write_node(chain[idx], block)?;
        }

        self.dict.keydesc_head = *chain.first().unwrap_or(&NIL);

        // NOTE: Key count is bounded by MAX_KEYS
        #[allow(clippy::cast_possible_truncation)]
        {
            self.dict.key_count = keys.len() as u16;
        }
        self.mark_dirty();

        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.blocks.sync()?;
        Ok(())
    }
}
