// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Tree node block codec.
//!
//! Layout of a `node_size` block:
//!
//! ```text
//! [0..2)        used-byte count (BE)
//! [2..4)        reserved
//! [4..used)     packed entries
//! [size-2]      level (0 = leaf)
//! [size-1]      0x7F tree-node marker
//! ```
//!
//! Entries are decompressed into full keys in memory; compression is purely
//! a storage codec applied on encode, so splice/split/merge never have to
//! patch compression anchors by hand.

use super::entry::Entry;
use crate::{
    coding::DecodeError,
    format::{read_ptr, write_ptr, NodeNo, NODE_FOOTER, NODE_HEADER, TREE_NODE_MARKER},
    key::KeyDescriptor,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

const CTL_DUP_MEMBER: u8 = 0x01;
const CTL_DUMMY: u8 = 0x02;

/// Trailing compression strips runs of this byte.
const PAD: u8 = b' ';

/// A tree node held in memory with fully materialised keys.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TreeNode {
    pub node_no: NodeNo,
    pub level: u8,
    pub entries: Vec<Entry>,
}

impl TreeNode {
    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    /// Byte budget for entries in one node.
    pub fn capacity(node_size: u32) -> usize {
        node_size as usize - NODE_HEADER - NODE_FOOTER
    }

    pub fn decode(node_no: NodeNo, block: &[u8], key_len: usize) -> Result<Self, DecodeError> {
        let size = block.len();

        if block[size - 1] != TREE_NODE_MARKER {
            return Err(DecodeError::InvalidHeader("TreeNode"));
        }
        let level = block[size - 2];

        let used = usize::from((&block[..]).read_u16::<BigEndian>()?);
        if used < NODE_HEADER || used > size - NODE_FOOTER {
            return Err(DecodeError::InvalidHeader("TreeNode"));
        }

        let mut entries = vec![];
        let mut reader = &block[NODE_HEADER..used];
        let mut prev_key: Vec<u8> = vec![];

        while !reader.is_empty() {
            let ctl = reader.read_u8()?;

            if ctl & CTL_DUMMY != 0 {
                let ptr = read_ptr(&mut reader)?;
                entries.push(Entry::dummy(ptr));
                continue;
            }

            let key = if ctl & CTL_DUP_MEMBER != 0 {
                prev_key.clone()
            } else {
                let lead = usize::from(reader.read_u8()?);
                let stored = usize::from(reader.read_u8()?);

                if lead > prev_key.len() || lead + stored > key_len || stored > reader.len() {
                    return Err(DecodeError::InvalidHeader("TreeNode"));
                }

                let mut key = Vec::with_capacity(key_len);
                key.extend_from_slice(&prev_key[..lead]);

                let (bytes, rest) = reader.split_at(stored);
                key.extend_from_slice(bytes);
                reader = rest;

                key.resize(key_len, PAD);
                key
            };

            let dup_no = reader.read_u32::<BigEndian>()?;
            let ptr = read_ptr(&mut reader)?;

            prev_key.clone_from(&key);
            entries.push(Entry::new(key, dup_no, ptr));
        }

        Ok(Self {
            node_no,
            level,
            entries,
        })
    }

    /// Serializes into a full block, applying the descriptor's compression.
    ///
    /// The caller must have checked [`TreeNode::encoded_len`] against
    /// [`TreeNode::capacity`] first.
    pub fn encode(&self, node_size: u32, desc: &KeyDescriptor) -> crate::Result<Vec<u8>> {
        let mut body = vec![];
        let mut prev: Option<&Entry> = None;

        for entry in &self.entries {
            encode_entry(&mut body, entry, prev, desc)?;
            prev = Some(entry);
        }

        let size = node_size as usize;
        let used = NODE_HEADER + body.len();
        debug_assert!(used <= size - NODE_FOOTER);

        let mut block = vec![0; size];

        // NOTE: used fits: node sizes are capped at 65536 and capacity
        // excludes the footer
        #[allow(clippy::cast_possible_truncation)]
        {
            let mut writer = &mut block[..];
            writer.write_u16::<BigEndian>(used as u16)?;
        }

        block[NODE_HEADER..used].copy_from_slice(&body);
        block[size - 2] = self.level;
        block[size - 1] = TREE_NODE_MARKER;

        Ok(block)
    }

    /// Encoded size of all entries under the descriptor's compression.
    pub fn encoded_len(&self, desc: &KeyDescriptor) -> usize {
        encoded_len_of(&self.entries, desc)
    }
}

/// Encoded size of an entry run under the descriptor's compression.
pub fn encoded_len_of(entries: &[Entry], desc: &KeyDescriptor) -> usize {
    let mut total = 0;
    let mut prev: Option<&Entry> = None;

    for entry in entries {
        total += entry_len(entry, prev, desc);
        prev = Some(entry);
    }

    total
}

fn shared_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

fn key_parts<'a>(
    entry: &'a Entry,
    prev: Option<&Entry>,
    desc: &KeyDescriptor,
) -> (usize, &'a [u8]) {
    let lead = match prev {
        Some(p) if desc.compress_leading && !p.dummy => {
            shared_prefix(&entry.key, &p.key).min(255)
        }
        _ => 0,
    };

    let mut rest = &entry.key[lead..];
    if desc.compress_trailing {
        while rest.last() == Some(&PAD) {
            rest = &rest[..rest.len() - 1];
        }
    }

    (lead, rest)
}

fn is_dup_member(entry: &Entry, prev: Option<&Entry>, desc: &KeyDescriptor) -> bool {
    desc.compress_duplicates
        && prev.is_some_and(|p| !p.dummy && p.key == entry.key)
}

fn entry_len(entry: &Entry, prev: Option<&Entry>, desc: &KeyDescriptor) -> usize {
    use crate::format::PTR_SIZE;

    if entry.dummy {
        return 1 + PTR_SIZE;
    }

    if is_dup_member(entry, prev, desc) {
        return 1 + 4 + PTR_SIZE;
    }

    let (_, rest) = key_parts(entry, prev, desc);
    1 + 2 + rest.len() + 4 + PTR_SIZE
}

fn encode_entry(
    out: &mut Vec<u8>,
    entry: &Entry,
    prev: Option<&Entry>,
    desc: &KeyDescriptor,
) -> crate::Result<()> {
    if entry.dummy {
        out.write_u8(CTL_DUMMY)?;
        write_ptr(out, entry.ptr)?;
        return Ok(());
    }

    if is_dup_member(entry, prev, desc) {
        out.write_u8(CTL_DUP_MEMBER)?;
        out.write_u32::<BigEndian>(entry.dup_no)?;
        write_ptr(out, entry.ptr)?;
        return Ok(());
    }

    let (lead, rest) = key_parts(entry, prev, desc);

    out.write_u8(0)?;

    // NOTE: lead is capped at 255, rest at MAX_KEY_LEN
    #[allow(clippy::cast_possible_truncation)]
    {
        out.write_u8(lead as u8)?;
        out.write_u8(rest.len() as u8)?;
    }

    out.extend_from_slice(rest);
    out.write_u32::<BigEndian>(entry.dup_no)?;
    write_ptr(out, entry.ptr)?;

    Ok(())
}
