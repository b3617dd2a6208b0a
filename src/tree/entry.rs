// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::key::codec::compare_keys;
use std::cmp::Ordering;

/// Duplicate sequence number: tie-breaks equal key bytes in insertion order.
pub type DupNo = u32;

/// One slot of a tree node.
///
/// In a leaf, `ptr` is the row id of the indexed record. In an interior
/// node, `ptr` is the child whose subtree holds every entry up to and
/// including `(key, dup_no)`.
///
/// The rightmost node of every level terminates with a *dummy* entry: its key
/// compares greater than everything and it never matches an equality seek.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub dup_no: DupNo,
    pub ptr: u64,
    pub dummy: bool,
}

impl Entry {
    pub fn new(key: Vec<u8>, dup_no: DupNo, ptr: u64) -> Self {
        Self {
            key,
            dup_no,
            ptr,
            dummy: false,
        }
    }

    pub fn dummy(ptr: u64) -> Self {
        Self {
            key: vec![],
            dup_no: 0,
            ptr,
            dummy: true,
        }
    }

    /// Compares this entry's key against `key` (dummy sorts last).
    pub fn cmp_key(&self, key: &[u8], collation: Option<&[u8; 256]>) -> Ordering {
        if self.dummy {
            return Ordering::Greater;
        }
        compare_keys(&self.key, key, collation)
    }

    /// Compares `(key, dup_no)` pairs (dummy sorts last).
    pub fn cmp_entry(&self, key: &[u8], dup_no: DupNo, collation: Option<&[u8; 256]>) -> Ordering {
        self.cmp_key(key, collation)
            .then_with(|| self.dup_no.cmp(&dup_no))
    }

    /// Compares a leading portion of the key only (partial-key seek).
    pub fn cmp_key_prefix(
        &self,
        prefix: &[u8],
        collation: Option<&[u8; 256]>,
    ) -> Ordering {
        if self.dummy {
            return Ordering::Greater;
        }

        let head = self.key.get(..prefix.len()).unwrap_or(&self.key);
        compare_keys(head, prefix, collation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn dummy_sorts_last() {
        let dummy = Entry::dummy(0);

        assert_eq!(Ordering::Greater, dummy.cmp_key(&[0xFF; 8], None));
        assert_eq!(Ordering::Greater, dummy.cmp_entry(&[0xFF; 8], u32::MAX, None));
    }

    #[test]
    fn dup_no_breaks_ties() {
        let entry = Entry::new(b"K001".to_vec(), 1, 42);

        assert_eq!(Ordering::Greater, entry.cmp_entry(b"K001", 0, None));
        assert_eq!(Ordering::Equal, entry.cmp_entry(b"K001", 1, None));
        assert_eq!(Ordering::Less, entry.cmp_entry(b"K001", 2, None));
    }

    #[test]
    fn prefix_compare() {
        let entry = Entry::new(b"ABCD".to_vec(), 0, 1);

        assert_eq!(Ordering::Equal, entry.cmp_key_prefix(b"AB", None));
        assert_eq!(Ordering::Less, entry.cmp_key_prefix(b"AC", None));
    }
}
