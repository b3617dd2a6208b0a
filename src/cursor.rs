// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-handle cursor state.

use crate::format::RowId;
use crate::tree::DupNo;

/// Positioning mode of a read or start.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReadMode {
    /// First entry of the active index
    First,

    /// Last entry of the active index
    Last,

    /// Entry after the current one
    Next,

    /// Entry before the current one
    Prev,

    /// Re-fetch the current entry
    Current,

    /// Exact key match (the search value comes from the caller's buffer)
    Equal,

    /// First entry greater than the search value
    Greater,

    /// First entry greater than or equal to the search value
    GreaterOrEqual,
}

impl ReadMode {
    /// Sequential modes step the cursor; seek modes reposition it.
    pub fn is_sequential(self) -> bool {
        matches!(self, Self::First | Self::Last | Self::Next | Self::Prev)
    }
}

/// Row-lock behaviour of a read.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ReadFlags {
    /// Take a manual row lock on the located row
    pub lock: bool,

    /// Silently step past rows whose lock cannot be taken (sequential
    /// modes only)
    pub skip_locked: bool,

    /// Block until the row lock is available
    pub wait: bool,

    /// In automatic lock mode, keep previously acquired row locks instead
    /// of releasing them
    pub keep_locks: bool,
}

impl ReadFlags {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn lock() -> Self {
        Self {
            lock: true,
            ..Self::default()
        }
    }

    pub fn lock_wait() -> Self {
        Self {
            lock: true,
            wait: true,
            ..Self::default()
        }
    }

    pub fn skip_locked() -> Self {
        Self {
            skip_locked: true,
            ..Self::default()
        }
    }
}

/// Where the cursor currently sits within the active index.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CursorState {
    /// Freshly opened or invalidated; a Next reads the first entry
    Unpositioned,

    /// On a live entry
    OnEntry,

    /// On the end dummy (past the last entry)
    OnDummy,
}

/// Current position of a table handle.
///
/// The saved `(key, dup_no)` pair, not the node number, anchors the
/// position: sequential steps re-descend from the root, which keeps the
/// cursor valid across splits, merges and other handles' mutations.
#[derive(Clone, Debug)]
pub struct Cursor {
    /// Active index (0 = primary)
    pub key_no: usize,

    pub state: CursorState,

    /// Encoded key of the current entry
    pub key: Vec<u8>,

    pub dup_no: DupNo,

    pub row_id: RowId,

    /// Set by a re-seek (start); the following Next returns the sought
    /// entry itself instead of stepping past it
    pub disjoint: bool,
}

impl Default for Cursor {
    fn default() -> Self {
        Self {
            key_no: 0,
            state: CursorState::Unpositioned,
            key: vec![],
            dup_no: 0,
            row_id: 0,
            disjoint: false,
        }
    }
}

impl Cursor {
    /// Parks the cursor on a located entry.
    pub fn place(&mut self, key: Vec<u8>, dup_no: DupNo, row_id: RowId, disjoint: bool) {
        self.state = CursorState::OnEntry;
        self.key = key;
        self.dup_no = dup_no;
        self.row_id = row_id;
        self.disjoint = disjoint;
    }

    /// Parks the cursor past the end of the index.
    pub fn park_at_end(&mut self) {
        self.state = CursorState::OnDummy;
        self.row_id = 0;
        self.disjoint = false;
    }

    /// Forgets the position entirely (key switch, invalidation).
    pub fn reset(&mut self, key_no: usize) {
        *self = Self {
            key_no,
            ..Self::default()
        };
    }
}
