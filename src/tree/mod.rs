// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The key-tree engine: ordered search, insert with split, delete with
//! merge/redistribute, duplicate numbering.
//!
//! Interior entries carry the *maximum* `(key, dup_no)` of their child's
//! subtree; the rightmost child of every interior node hangs off the dummy
//! (+∞) entry. Separators are kept exact on every mutation, so a descent
//! into the first qualifying child always terminates at a qualifying leaf
//! entry.

pub mod entry;
pub mod node;

pub use entry::{DupNo, Entry};
pub use node::TreeNode;

use crate::{
    format::{NodeNo, RowId, NIL},
    index::IndexFile,
    key::KeyDescriptor,
    Error, Result,
};
use node::encoded_len_of;
use std::cmp::Ordering;

/// Result of a key-level search, separate from the cursor position.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SearchOutcome {
    /// An entry with exactly the requested key was located
    Exact,

    /// Positioned at the next greater entry (or the end dummy)
    GreaterThanTarget,

    /// The tree holds no entries at all
    EmptyTree,
}

/// Positioning bias of a key-level seek.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SeekBias {
    Equal,
    Greater,
    GreaterOrEqual,
}

struct Split {
    left_max_key: Vec<u8>,
    left_max_dup: DupNo,
    right: NodeNo,
}

struct Removal {
    underflow: bool,
    new_max: Option<(Vec<u8>, DupNo)>,
}

/// One key's tree, borrowed against the index file for the duration of an
/// operation.
///
/// Mutations may move the root; the coordinator persists [`Tree::root`]
/// back into the key-descriptor chain afterwards.
pub struct Tree<'a> {
    index: &'a mut IndexFile,
    desc: &'a KeyDescriptor,
    collation: Option<&'a [u8; 256]>,
    root: NodeNo,
}

impl<'a> Tree<'a> {
    pub fn new(
        index: &'a mut IndexFile,
        desc: &'a KeyDescriptor,
        collation: Option<&'a [u8; 256]>,
        root: NodeNo,
    ) -> Self {
        Self {
            index,
            desc,
            collation,
            root,
        }
    }

    /// Allocates the root leaf of a fresh, empty tree.
    pub fn create(index: &mut IndexFile, desc: &KeyDescriptor) -> Result<NodeNo> {
        let node_no = index.allocate_node()?;

        let root = TreeNode {
            node_no,
            level: 0,
            entries: vec![Entry::dummy(NIL)],
        };

        let block = root.encode(index.node_size(), desc)?;
        index.write_node(node_no, block)?;

        Ok(node_no)
    }

    pub fn root(&self) -> NodeNo {
        self.root
    }

    fn capacity(&self) -> usize {
        TreeNode::capacity(self.index.node_size())
    }

    fn load(&mut self, node_no: NodeNo) -> Result<TreeNode> {
        let block = self.index.read_node(node_no)?;
        TreeNode::decode(node_no, &block, self.desc.key_len()).map_err(Error::Decode)
    }

    fn store(&mut self, node: &TreeNode) -> Result<()> {
        let block = node.encode(self.index.node_size(), self.desc)?;
        self.index.write_node(node.node_no, block)
    }

    fn first_idx_key(&self, node: &TreeNode, key: &[u8], strict: bool) -> Option<usize> {
        node.entries.iter().position(|e| {
            let ord = e.cmp_key(key, self.collation);
            if strict {
                ord == Ordering::Greater
            } else {
                ord != Ordering::Less
            }
        })
    }

    fn first_idx_entry(
        &self,
        node: &TreeNode,
        key: &[u8],
        dup_no: DupNo,
        strict: bool,
    ) -> Option<usize> {
        node.entries.iter().position(|e| {
            let ord = e.cmp_entry(key, dup_no, self.collation);
            if strict {
                ord == Ordering::Greater
            } else {
                ord != Ordering::Less
            }
        })
    }

    /// First entry whose key is `>=` (or `>` when strict) the target.
    ///
    /// Always lands on an entry; the end position is the dummy.
    fn lower_bound_key(&mut self, key: &[u8], strict: bool) -> Result<Entry> {
        let mut node_no = self.root;

        loop {
            let node = self.load(node_no)?;
            let idx = self
                .first_idx_key(&node, key, strict)
                .ok_or(Error::BadFile)?;

            let e = node.entries[idx].clone();
            if node.is_leaf() {
                return Ok(e);
            }
            node_no = e.ptr;
        }
    }

    fn lower_bound_entry(&mut self, key: &[u8], dup_no: DupNo, strict: bool) -> Result<Entry> {
        let mut node_no = self.root;

        loop {
            let node = self.load(node_no)?;
            let idx = self
                .first_idx_entry(&node, key, dup_no, strict)
                .ok_or(Error::BadFile)?;

            let e = node.entries[idx].clone();
            if node.is_leaf() {
                return Ok(e);
            }
            node_no = e.ptr;
        }
    }

    /// Positions at the first entry of the index.
    pub fn first(&mut self) -> Result<Option<Entry>> {
        let mut node_no = self.root;

        loop {
            let node = self.load(node_no)?;
            let e = node.entries.first().ok_or(Error::BadFile)?.clone();

            if node.is_leaf() {
                return Ok(if e.dummy { None } else { Some(e) });
            }
            node_no = e.ptr;
        }
    }

    /// Positions at the last entry of the index.
    pub fn last(&mut self) -> Result<Option<Entry>> {
        self.last_in(self.root)
    }

    fn last_in(&mut self, node_no: NodeNo) -> Result<Option<Entry>> {
        let node = self.load(node_no)?;

        if node.is_leaf() {
            return Ok(node.entries.iter().rev().find(|e| !e.dummy).cloned());
        }

        for e in node.entries.iter().rev() {
            if let Some(found) = self.last_in(e.ptr)? {
                return Ok(Some(found));
            }
        }

        Ok(None)
    }

    /// The entry immediately after `(key, dup_no)`, if any.
    pub fn next_after(&mut self, key: &[u8], dup_no: DupNo) -> Result<Option<Entry>> {
        let e = self.lower_bound_entry(key, dup_no, true)?;
        Ok(if e.dummy { None } else { Some(e) })
    }

    /// The entry at `(key, dup_no)` or its successor, if any.
    pub fn at_or_after(&mut self, key: &[u8], dup_no: DupNo) -> Result<Option<Entry>> {
        let e = self.lower_bound_entry(key, dup_no, false)?;
        Ok(if e.dummy { None } else { Some(e) })
    }

    /// The entry immediately before `(key, dup_no)`, if any.
    pub fn prev_before(&mut self, key: &[u8], dup_no: DupNo) -> Result<Option<Entry>> {
        self.last_below(self.root, key, dup_no)
    }

    fn last_below(&mut self, node_no: NodeNo, key: &[u8], dup_no: DupNo) -> Result<Option<Entry>> {
        let node = self.load(node_no)?;

        if node.is_leaf() {
            return Ok(node
                .entries
                .iter()
                .rev()
                .find(|e| !e.dummy && e.cmp_entry(key, dup_no, self.collation) == Ordering::Less)
                .cloned());
        }

        if node.entries.is_empty() {
            return Err(Error::BadFile);
        }

        let start = self
            .first_idx_entry(&node, key, dup_no, false)
            .unwrap_or(node.entries.len() - 1);

        for i in (0..=start).rev() {
            let child = node.entries[i].ptr;

            let found = if i == start {
                self.last_below(child, key, dup_no)?
            } else {
                // every entry left of the qualifying child is below the target
                self.last_in(child)?
            };

            if found.is_some() {
                return Ok(found);
            }
        }

        Ok(None)
    }

    /// Key-level seek; the cursor may end up on the dummy (end of index).
    pub fn seek(&mut self, key: &[u8], bias: SeekBias) -> Result<(SearchOutcome, Entry)> {
        let strict = bias == SeekBias::Greater;
        let e = self.lower_bound_key(key, strict)?;

        let outcome = if e.dummy {
            if self.first()?.is_none() {
                SearchOutcome::EmptyTree
            } else {
                SearchOutcome::GreaterThanTarget
            }
        } else if !strict && e.cmp_key(key, self.collation) == Ordering::Equal {
            SearchOutcome::Exact
        } else {
            SearchOutcome::GreaterThanTarget
        };

        Ok((outcome, e))
    }

    /// Highest duplicate number currently stored under `key`.
    pub fn max_dup(&mut self, key: &[u8]) -> Result<Option<DupNo>> {
        match self.prev_before(key, DupNo::MAX)? {
            Some(e) if e.cmp_key(key, self.collation) == Ordering::Equal => Ok(Some(e.dup_no)),
            _ => Ok(None),
        }
    }

    /// Inserts `(key, row_id)`, assigning the next duplicate number.
    ///
    /// Fails with [`Error::Duplicate`] when the key is unique and already
    /// present.
    pub fn insert(&mut self, key: &[u8], row_id: RowId) -> Result<DupNo> {
        let dup_no = if self.desc.duplicates {
            self.max_dup(key)?.map_or(0, |d| d + 1)
        } else {
            let (outcome, _) = self.seek(key, SeekBias::Equal)?;
            if outcome == SearchOutcome::Exact {
                return Err(Error::Duplicate);
            }
            0
        };

        self.insert_entry(key, row_id, dup_no)?;
        Ok(dup_no)
    }

    /// Inserts an entry with an explicit duplicate number (recovery and
    /// rollback re-apply paths).
    pub fn insert_entry(&mut self, key: &[u8], row_id: RowId, dup_no: DupNo) -> Result<()> {
        let entry = Entry::new(key.to_vec(), dup_no, row_id);

        if let Some(split) = self.insert_rec(self.root, entry)? {
            let old_root = self.load(self.root)?;
            let new_root_no = self.index.allocate_node()?;

            // The root is always the rightmost node of its level, so its
            // upper half ends with the dummy; the new root mirrors that.
            let new_root = TreeNode {
                node_no: new_root_no,
                level: old_root.level + 1,
                entries: vec![
                    Entry::new(split.left_max_key, split.left_max_dup, self.root),
                    Entry::dummy(split.right),
                ],
            };

            self.store(&new_root)?;
            self.root = new_root_no;
        }

        self.index.mark_dirty();
        Ok(())
    }

    fn insert_rec(&mut self, node_no: NodeNo, entry: Entry) -> Result<Option<Split>> {
        let mut node = self.load(node_no)?;

        if node.is_leaf() {
            let idx = self
                .first_idx_entry(&node, &entry.key, entry.dup_no, true)
                .unwrap_or(node.entries.len());

            node.entries.insert(idx, entry);
            return self.store_or_split(node);
        }

        let idx = self
            .first_idx_entry(&node, &entry.key, entry.dup_no, false)
            .ok_or(Error::BadFile)?;
        let child = node.entries[idx].ptr;

        if let Some(split) = self.insert_rec(child, entry)? {
            // the old separator now describes the upper half
            node.entries[idx].ptr = split.right;
            node.entries
                .insert(idx, Entry::new(split.left_max_key, split.left_max_dup, child));

            return self.store_or_split(node);
        }

        Ok(None)
    }

    fn store_or_split(&mut self, mut node: TreeNode) -> Result<Option<Split>> {
        let cap = self.capacity();

        if node.encoded_len(self.desc) <= cap {
            self.store(&node)?;
            return Ok(None);
        }

        let mid = balanced_split(&node.entries, self.desc, cap)?;
        let right_entries = node.entries.split_off(mid);

        let right_no = self.index.allocate_node()?;
        let right = TreeNode {
            node_no: right_no,
            level: node.level,
            entries: right_entries,
        };

        let left_max = node.entries.last().ok_or(Error::BadFile)?.clone();

        self.store(&node)?;
        self.store(&right)?;

        Ok(Some(Split {
            left_max_key: left_max.key,
            left_max_dup: left_max.dup_no,
            right: right_no,
        }))
    }

    /// Removes the entry for `(key, row_id)`, scanning the duplicate run
    /// for the matching row.
    ///
    /// A missing entry means index and data file disagree and surfaces
    /// [`Error::BadFile`].
    pub fn delete(&mut self, key: &[u8], row_id: RowId) -> Result<DupNo> {
        let mut e = self.lower_bound_key(key, false)?;

        while !e.dummy && e.cmp_key(key, self.collation) == Ordering::Equal {
            if e.ptr == row_id {
                let dup_no = e.dup_no;
                self.delete_entry(key, dup_no)?;
                return Ok(dup_no);
            }

            e = self.lower_bound_entry(key, e.dup_no, true)?;
        }

        Err(Error::BadFile)
    }

    /// Removes the entry with an exact `(key, dup_no)`.
    ///
    /// Remaining duplicates keep their numbers; they are never renumbered,
    /// so concurrent cursors stay stable.
    pub fn delete_entry(&mut self, key: &[u8], dup_no: DupNo) -> Result<()> {
        if self.delete_rec(self.root, key, dup_no, true)?.is_none() {
            return Err(Error::BadFile);
        }

        // a root with a single child loses one level
        loop {
            let root = self.load(self.root)?;
            if root.is_leaf() || root.entries.len() > 1 {
                break;
            }

            let child = root.entries[0].ptr;
            self.index.free_node(self.root)?;
            self.root = child;
        }

        self.index.mark_dirty();
        Ok(())
    }

    fn delete_rec(
        &mut self,
        node_no: NodeNo,
        key: &[u8],
        dup_no: DupNo,
        is_root: bool,
    ) -> Result<Option<Removal>> {
        let mut node = self.load(node_no)?;
        let cap = self.capacity();

        if node.is_leaf() {
            let Some(idx) = node.entries.iter().position(|e| {
                !e.dummy && e.cmp_entry(key, dup_no, self.collation) == Ordering::Equal
            }) else {
                return Ok(None);
            };

            node.entries.remove(idx);
            self.store(&node)?;
            return Ok(Some(removal_of(&node, self.desc, cap)));
        }

        let Some(idx) = self.first_idx_entry(&node, key, dup_no, false) else {
            return Ok(None);
        };

        let Some(child) = self.delete_rec(node.entries[idx].ptr, key, dup_no, false)? else {
            return Ok(None);
        };

        if !node.entries[idx].dummy {
            if let Some((max_key, max_dup)) = child.new_max {
                node.entries[idx].key = max_key;
                node.entries[idx].dup_no = max_dup;
            }
        }

        if child.underflow {
            if node.entries.len() >= 2 {
                self.fix_underflow(&mut node, idx)?;
            } else if !is_root {
                // an interior node below the root must always have a sibling
                // to rebalance against
                return Err(Error::BadFile);
            }
            // a root left with a single child collapses one level afterwards
        }

        self.store(&node)?;
        Ok(Some(removal_of(&node, self.desc, cap)))
    }

    /// Re-balances the child at `idx` with a sibling: redistribution when
    /// both halves stay healthy, merge otherwise.
    fn fix_underflow(&mut self, parent: &mut TreeNode, idx: usize) -> Result<()> {
        let (li, ri) = if idx > 0 {
            (idx - 1, idx)
        } else if idx + 1 < parent.entries.len() {
            (idx, idx + 1)
        } else {
            // no sibling to borrow from or merge with
            return Err(Error::BadFile);
        };

        let left_no = parent.entries[li].ptr;
        let right_no = parent.entries[ri].ptr;

        let mut left = self.load(left_no)?;
        let mut right = self.load(right_no)?;

        let cap = self.capacity();

        let mut combined = left.entries;
        combined.extend(right.entries);

        if encoded_len_of(&combined, self.desc) <= cap {
            // merge into the left node; the right separator keeps
            // describing the combined maximum
            left.entries = combined;
            self.store(&left)?;
            self.index.free_node(right_no)?;

            parent.entries[ri].ptr = left_no;
            parent.entries.remove(li);
            return Ok(());
        }

        let mid = balanced_split(&combined, self.desc, cap)?;

        right.entries = combined.split_off(mid);
        left.entries = combined;

        let left_max = left.entries.last().ok_or(Error::BadFile)?.clone();

        self.store(&left)?;
        self.store(&right)?;

        // li cannot be the dummy: a right sibling exists
        parent.entries[li].key = left_max.key;
        parent.entries[li].dup_no = left_max.dup_no;

        Ok(())
    }

    /// Returns every node of the tree to the free list.
    pub fn free_all(&mut self) -> Result<()> {
        self.free_rec(self.root)
    }

    fn free_rec(&mut self, node_no: NodeNo) -> Result<()> {
        let node = self.load(node_no)?;

        if !node.is_leaf() {
            for e in &node.entries {
                self.free_rec(e.ptr)?;
            }
        }

        self.index.free_node(node_no)
    }

    /// Collects every live entry in order (consistency checks and tests).
    pub fn entries(&mut self) -> Result<Vec<Entry>> {
        let mut out = vec![];
        self.collect(self.root, &mut out)?;
        Ok(out)
    }

    fn collect(&mut self, node_no: NodeNo, out: &mut Vec<Entry>) -> Result<()> {
        let node = self.load(node_no)?;

        if node.is_leaf() {
            out.extend(node.entries.into_iter().filter(|e| !e.dummy));
            return Ok(());
        }

        for e in &node.entries {
            self.collect(e.ptr, out)?;
        }

        Ok(())
    }
}

fn removal_of(node: &TreeNode, desc: &KeyDescriptor, cap: usize) -> Removal {
    Removal {
        underflow: node.encoded_len(desc) < cap / 4,
        new_max: node
            .entries
            .last()
            .filter(|e| !e.dummy)
            .map(|e| (e.key.clone(), e.dup_no)),
    }
}

/// Picks a split point so both halves fit within `cap`, starting from the
/// middle entry and nudging towards balance.
fn balanced_split(entries: &[Entry], desc: &KeyDescriptor, cap: usize) -> Result<usize> {
    let mut mid = entries.len() / 2;

    for _ in 0..entries.len() {
        if mid == 0 || mid >= entries.len() {
            return Err(Error::BadFile);
        }

        let l = encoded_len_of(&entries[..mid], desc);
        let r = encoded_len_of(&entries[mid..], desc);

        if l <= cap && r <= cap {
            return Ok(mid);
        }

        if l > r {
            mid -= 1;
        } else {
            mid += 1;
        }
    }

    Err(Error::BadFile)
}
