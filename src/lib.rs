// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! An embedded, file-based ISAM (indexed sequential access method) engine.
//!
//! ##### About
//!
//! A table is a pair of files: `<name>.dat` holds fixed- or
//! variable-length rows addressed by stable integer row ids, `<name>.idx`
//! holds the table dictionary plus one ordered B-tree per key descriptor.
//! Cursors traverse a chosen index forwards, backwards and by (partial)
//! key; rows can be locked individually or table-wide through advisory
//! byte-range locks, so several processes can share a table. With a log
//! attached, mutations are written ahead and grouped into transactions
//! with begin/commit/rollback, and a crashed process's work is re-applied
//! by replaying the log.
//!
//! Keys are derived from rows by key descriptors: up to 8 parts per key,
//! each a typed byte range of the row (characters, signed integers,
//! floats, optionally descending), normalised into an order-preserving
//! byte string. A key may allow duplicates, which stay ordered by their
//! insertion sequence.
//!
//! # Example usage
//!
//! ```
//! use isam_tree::{BuildOptions, Isam, KeyDescriptor, KeyPart, PartType, ReadFlags, ReadMode};
//! #
//! # let dir = tempfile::tempdir()?;
//!
//! let mut engine = Isam::new();
//!
//! // a table with one unique 8-byte character key at offset 0
//! let key = KeyDescriptor::unique(KeyPart::ascending(0, 8, PartType::Char));
//! let table = engine.build(&dir.path().join("people"), &BuildOptions::new(32), &key)?;
//!
//! let mut row = vec![b' '; 32];
//! row[..8].copy_from_slice(b"AA-00001");
//! engine.insert(table, &row)?;
//!
//! // cursors position by key or sequentially
//! let mut buffer = vec![0; 32];
//! let row_id = engine.read(table, &mut buffer, ReadMode::First, ReadFlags::none())?;
//! assert_eq!(1, row_id);
//! assert_eq!(row, buffer);
//!
//! engine.close(table)?;
//! #
//! # Ok::<(), isam_tree::Error>(())
//! ```

#![deny(unsafe_code)]
#![deny(clippy::all, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::module_name_repetitions)]

pub mod coding;

mod cursor;
mod data;
mod dictionary;
mod error;
mod format;
mod index;
mod io;
mod isam;
mod key;
mod table;
mod tree;
mod txn;

pub use cursor::{CursorState, ReadFlags, ReadMode};
pub use dictionary::LockMethod;
pub use error::{Error, Result};
pub use format::{NodeNo, RowId, MAX_KEYS, MAX_KEY_LEN, MAX_KEY_PARTS};
pub use isam::{AuditMode, Isam, TableHandle};
pub use key::{KeyDescriptor, KeyPart, PartType};
pub use table::{BuildOptions, LockMode, OpenMode, OpenOptions, TableInfo};
pub use tree::{DupNo, SearchOutcome};
pub use txn::TxnState;
