// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::format::NodeNo;
use rustc_hash::FxHashMap;

/// Default cache capacity in nodes.
const CAPACITY: usize = 256;

/// Write-through cache of raw node blocks, keyed by node number.
///
/// The cache is only trusted while the dictionary transaction counter is
/// unchanged; the coordinator drops it wholesale when another handle has
/// mutated the table.
pub struct NodeCache {
    nodes: FxHashMap<NodeNo, Vec<u8>>,
    capacity: usize,
}

impl Default for NodeCache {
    fn default() -> Self {
        Self {
            nodes: FxHashMap::default(),
            capacity: CAPACITY,
        }
    }
}

impl NodeCache {
    pub fn get(&self, node_no: NodeNo) -> Option<&Vec<u8>> {
        self.nodes.get(&node_no)
    }

    pub fn insert(&mut self, node_no: NodeNo, bytes: Vec<u8>) {
        if self.nodes.len() >= self.capacity && !self.nodes.contains_key(&node_no) {
            self.nodes.clear();
        }
        self.nodes.insert(node_no, bytes);
    }

    pub fn remove(&mut self, node_no: NodeNo) {
        self.nodes.remove(&node_no);
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn eviction_clears() {
        let mut cache = NodeCache {
            nodes: FxHashMap::default(),
            capacity: 4,
        };

        for n in 1..=4 {
            cache.insert(n, vec![0]);
        }
        assert_eq!(4, cache.len());

        cache.insert(5, vec![0]);
        assert_eq!(1, cache.len());
        assert!(cache.get(5).is_some());
    }
}
