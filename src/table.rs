// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! An open table: the `(.idx, .dat)` pair, its key descriptors, cursor and
//! row locks.
//!
//! Every top-level operation runs inside the enter/exit protocol: enter
//! takes the PRIMARY byte range and refreshes the dictionary (dropping
//! stale caches when another handle has moved the transaction counter);
//! exit flushes a dirty dictionary, bumping the counter, and releases
//! PRIMARY.

use crate::{
    cursor::{Cursor, CursorState, ReadFlags, ReadMode},
    data::DataFile,
    dictionary::{Dictionary, LockMethod},
    format::{RowId, MAX_KEYS, MAX_NODE_SIZE, MIN_NODE_SIZE, PTR_SIZE},
    index::IndexFile,
    io::range_lock::{
        range_lock, RangeLockMode, FILE_OPEN_OFFSET, PRIMARY_LEN, PRIMARY_OFFSET, ROW_LOCK_BASE,
        ROW_LOCK_LEN,
    },
    key::{build_key, is_null_value, pad_key, KeyDescriptor, StoredKey},
    tree::{DupNo, Entry, SearchOutcome, SeekBias, Tree},
    Error, Result,
};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

const IDX_EXT: &str = "idx";
const DAT_EXT: &str = "dat";

const MAX_NAME_LEN: usize = 1_019;

const DEFAULT_NODE_SIZE: u32 = 1_024;

/// Access mode of an open table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OpenMode {
    /// Reads only
    Input,

    /// Writes only
    Output,

    /// Reads and writes
    InOut,
}

/// Lock discipline of an open table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockMode {
    /// Positioned reads implicitly lock the located row
    Automatic,

    /// Rows are locked only on request
    Manual,

    /// The whole table is held exclusively for this handle
    Exclusive,
}

/// Parameters for creating a table.
#[derive(Clone, Debug)]
pub struct BuildOptions {
    pub min_row_len: u32,

    /// `Some(max)` switches the table to variable-length rows
    pub max_row_len: Option<u32>,

    pub node_size: u32,

    pub lock: LockMode,

    /// Byte remap applied during key comparison
    pub collation: Option<Box<[u8; 256]>>,
}

impl BuildOptions {
    pub fn new(min_row_len: u32) -> Self {
        Self {
            min_row_len,
            max_row_len: None,
            node_size: DEFAULT_NODE_SIZE,
            lock: LockMode::Automatic,
            collation: None,
        }
    }
}

/// Parameters for opening a table.
#[derive(Clone, Debug)]
pub struct OpenOptions {
    pub mode: OpenMode,

    pub lock: LockMode,

    /// Opt this table out of transaction logging
    pub no_log: bool,

    pub collation: Option<Box<[u8; 256]>>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            mode: OpenMode::InOut,
            lock: LockMode::Automatic,
            no_log: false,
            collation: None,
        }
    }
}

/// Table shape as reported to callers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TableInfo {
    pub key_count: usize,
    pub min_row_len: u32,
    pub max_row_len: u32,
    pub node_size: u32,

    /// Allocated row slots, live or tombstoned
    pub row_count: u64,

    /// Nodes ever allocated in the index file
    pub node_count: u64,
}

pub(crate) struct Table {
    base: PathBuf,
    pub index: IndexFile,
    pub data: DataFile,
    pub keys: Vec<StoredKey>,
    pub cursor: Cursor,
    pub open_mode: OpenMode,
    pub lock_mode: LockMode,
    collation: Option<Box<[u8; 256]>>,

    /// Manually locked rows (mirrored by byte locks on the index file)
    row_locks: BTreeSet<RowId>,

    /// Row locked implicitly by the last automatic-mode read
    auto_lock: Option<RowId>,

    /// Whole-table row lock held
    file_locked: bool,

    /// Mutated inside the current transaction
    pub touched: bool,

    /// Closed mid-transaction: files and locks live on, the handle is
    /// invisible until the same name is re-opened
    pub buffers_only: bool,

    /// Excluded from transaction logging
    pub no_log: bool,
}

fn validate_collation(collation: &Option<Box<[u8; 256]>>) -> Result<()> {
    if let Some(map) = collation {
        let mut seen = [false; 256];
        for &b in map.iter() {
            seen[usize::from(b)] = true;
        }
        if seen.contains(&false) {
            return Err(Error::BadCollation);
        }
    }
    Ok(())
}

fn file_paths(base: &Path) -> Result<(PathBuf, PathBuf)> {
    if base.as_os_str().len() > MAX_NAME_LEN {
        return Err(Error::FileNameTooLong);
    }
    Ok((
        base.with_extension(IDX_EXT),
        base.with_extension(DAT_EXT),
    ))
}

pub(crate) fn table_files_exist(base: &Path) -> Result<bool> {
    let (idx, dat) = file_paths(base)?;
    Ok(idx.exists() || dat.exists())
}

pub(crate) fn erase_table_files(base: &Path) -> Result<()> {
    let (idx, dat) = file_paths(base)?;
    std::fs::remove_file(idx)?;
    std::fs::remove_file(dat)?;
    Ok(())
}

pub(crate) fn rename_table_files(old: &Path, new: &Path) -> Result<()> {
    let (old_idx, old_dat) = file_paths(old)?;
    let (new_idx, new_dat) = file_paths(new)?;

    if new_idx.exists() || new_dat.exists() {
        return Err(Error::Exists);
    }

    std::fs::rename(old_idx, new_idx)?;
    std::fs::rename(old_dat, new_dat)?;
    Ok(())
}

impl Table {
    /// Creates the `(.idx, .dat)` pair and opens it in-out.
    pub fn build(base: &Path, opts: &BuildOptions, primary: &KeyDescriptor) -> Result<Self> {
        let (idx_path, dat_path) = file_paths(base)?;

        if !opts.node_size.is_power_of_two()
            || !(MIN_NODE_SIZE..=MAX_NODE_SIZE).contains(&opts.node_size)
        {
            return Err(Error::BadArgument);
        }

        // the free-slot chain threads a node pointer through dead slots
        if opts.min_row_len < PTR_SIZE as u32 {
            return Err(Error::BadArgument);
        }

        let max_row_len = match opts.max_row_len {
            Some(max) if max < opts.min_row_len => return Err(Error::BadArgument),
            Some(max) => max,
            None => 0,
        };

        primary.validate(opts.min_row_len)?;
        validate_collation(&opts.collation)?;

        let create = |path: &Path| {
            std::fs::OpenOptions::new()
                .create_new(true)
                .read(true)
                .write(true)
                .open(path)
                .map_err(|e| {
                    if e.kind() == std::io::ErrorKind::AlreadyExists {
                        Error::Exists
                    } else {
                        Error::Io(e)
                    }
                })
        };

        let idx_file = create(&idx_path)?;
        let dat_file = create(&dat_path)?;

        let lock_method = if opts.lock == LockMode::Manual {
            LockMethod::Manual
        } else {
            LockMethod::Automatic
        };

        let dict = Dictionary::new(
            opts.node_size,
            opts.min_row_len,
            max_row_len,
            opts.max_row_len.is_some(),
            lock_method,
        );

        let mut index = IndexFile::create(idx_file, dict)?;

        let root = Tree::create(&mut index, primary)?;
        index.write_keys(&[StoredKey {
            root,
            desc: primary.clone(),
        }])?;
        index.flush_dictionary()?;

        let data = DataFile::new(
            dat_file,
            opts.min_row_len,
            max_row_len,
            opts.max_row_len.is_some(),
        );

        let keys = index.read_keys()?;

        let mut table = Self {
            base: base.to_path_buf(),
            index,
            data,
            keys,
            cursor: Cursor::default(),
            open_mode: OpenMode::InOut,
            lock_mode: opts.lock,
            collation: opts.collation.clone(),
            row_locks: BTreeSet::new(),
            auto_lock: None,
            file_locked: false,
            touched: false,
            buffers_only: false,
            no_log: false,
        };

        table.acquire_open_sentinel()?;
        Ok(table)
    }

    /// Opens an existing table, validating the index magic.
    pub fn open(base: &Path, opts: &OpenOptions) -> Result<Self> {
        let (idx_path, dat_path) = file_paths(base)?;

        validate_collation(&opts.collation)?;

        // byte-range write locks need a writable descriptor even for
        // input-only handles
        let open = |path: &Path| {
            std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
        };

        let index = IndexFile::open(open(&idx_path)?)?;
        let data = DataFile::new(
            open(&dat_path)?,
            index.dict.min_row_len,
            index.dict.max_row_len,
            index.dict.variable_length,
        );

        let mut table = Self {
            base: base.to_path_buf(),
            keys: vec![],
            index,
            data,
            cursor: Cursor::default(),
            open_mode: opts.mode,
            lock_mode: opts.lock,
            collation: opts.collation.clone(),
            row_locks: BTreeSet::new(),
            auto_lock: None,
            file_locked: false,
            touched: false,
            buffers_only: false,
            no_log: opts.no_log,
        };

        table.keys = table.index.read_keys()?;
        table.acquire_open_sentinel()?;

        Ok(table)
    }

    /// Revives a buffers-only handle closed mid-transaction.
    pub fn revive(&mut self, opts: &OpenOptions) -> Result<()> {
        validate_collation(&opts.collation)?;

        self.open_mode = opts.mode;
        self.lock_mode = opts.lock;
        self.no_log = opts.no_log;
        if opts.collation.is_some() {
            self.collation = opts.collation.clone();
        }
        self.buffers_only = false;
        self.cursor = Cursor::default();

        self.acquire_open_sentinel()
    }

    fn acquire_open_sentinel(&mut self) -> Result<()> {
        let mode = if self.lock_mode == LockMode::Exclusive {
            RangeLockMode::Write
        } else {
            RangeLockMode::Read
        };

        range_lock(self.index.file(), FILE_OPEN_OFFSET, 1, mode).map_err(|e| match e {
            Error::Locked => Error::FileLocked,
            other => other,
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn info(&self) -> TableInfo {
        TableInfo {
            key_count: self.keys.len(),
            min_row_len: self.index.dict.min_row_len,
            max_row_len: self.index.dict.max_row_len,
            node_size: self.index.dict.node_size,
            row_count: self.index.dict.row_count,
            node_count: self.index.dict.node_count,
        }
    }

    fn require_writable(&self) -> Result<()> {
        if self.open_mode == OpenMode::Input {
            return Err(Error::BadArgument);
        }
        Ok(())
    }

    /// Takes PRIMARY and refreshes the dictionary; a moved transaction
    /// counter also forces the key descriptors to be re-read.
    pub fn enter(&mut self, write: bool) -> Result<()> {
        if write {
            self.require_writable()?;
        }

        let mode = if write {
            RangeLockMode::WriteWait
        } else {
            RangeLockMode::ReadWait
        };
        range_lock(self.index.file(), PRIMARY_OFFSET, PRIMARY_LEN, mode)?;

        let counter = self.index.dict.txn_counter;
        if let Err(e) = self.index.reload_dictionary() {
            let _ = range_lock(
                self.index.file(),
                PRIMARY_OFFSET,
                PRIMARY_LEN,
                RangeLockMode::Unlock,
            );
            return Err(e);
        }

        if self.index.dict.txn_counter != counter {
            self.keys = self.index.read_keys()?;
        }

        Ok(())
    }

    /// Flushes a dirty dictionary and releases PRIMARY.
    pub fn exit(&mut self) -> Result<()> {
        let flushed = self.index.flush_dictionary();
        let unlocked = range_lock(
            self.index.file(),
            PRIMARY_OFFSET,
            PRIMARY_LEN,
            RangeLockMode::Unlock,
        );
        flushed.and(unlocked)
    }

    /// Runs a tree operation against one key, persisting a moved root.
    fn with_tree<T>(
        &mut self,
        key_no: usize,
        f: impl FnOnce(&mut Tree<'_>) -> Result<T>,
    ) -> Result<T> {
        let stored = &self.keys[key_no];
        let mut tree = Tree::new(
            &mut self.index,
            &stored.desc,
            self.collation.as_deref(),
            stored.root,
        );

        let out = f(&mut tree);
        let root = tree.root();

        if root != self.keys[key_no].root {
            self.keys[key_no].root = root;
            self.index.write_keys(&self.keys)?;
        }

        out
    }

    /// `true` when `row` stores no entry under this key.
    fn key_inactive(desc: &KeyDescriptor, row: &[u8]) -> bool {
        desc.is_null_key() || (desc.null_suppress && is_null_value(desc, row))
    }

    // === row locking ===

    fn auto_locking(&self) -> bool {
        self.lock_mode == LockMode::Automatic && self.open_mode != OpenMode::Input
    }

    fn lock_row(&mut self, row_id: RowId, wait: bool, manual: bool) -> Result<()> {
        if self.lock_mode == LockMode::Exclusive || self.file_locked {
            return Ok(());
        }

        if self.row_locks.contains(&row_id) {
            return Ok(());
        }

        if self.auto_lock == Some(row_id) {
            if manual {
                self.auto_lock = None;
                self.row_locks.insert(row_id);
            }
            return Ok(());
        }

        let mode = if wait {
            RangeLockMode::WriteWait
        } else {
            RangeLockMode::Write
        };
        range_lock(self.index.file(), ROW_LOCK_BASE + row_id, 1, mode)?;

        if manual {
            self.row_locks.insert(row_id);
        } else {
            self.auto_lock = Some(row_id);
        }

        Ok(())
    }

    fn release_auto_lock(&mut self) -> Result<()> {
        if let Some(row_id) = self.auto_lock.take() {
            range_lock(
                self.index.file(),
                ROW_LOCK_BASE + row_id,
                1,
                RangeLockMode::Unlock,
            )?;
        }
        Ok(())
    }

    /// Drops every row lock this handle holds.
    pub fn release_locks(&mut self) -> Result<()> {
        self.release_auto_lock()?;

        for row_id in std::mem::take(&mut self.row_locks) {
            range_lock(
                self.index.file(),
                ROW_LOCK_BASE + row_id,
                1,
                RangeLockMode::Unlock,
            )?;
        }

        if self.file_locked {
            self.file_locked = false;
            range_lock(
                self.index.file(),
                ROW_LOCK_BASE,
                ROW_LOCK_LEN,
                RangeLockMode::Unlock,
            )?;
        }

        Ok(())
    }

    /// Locks the whole table's row range (manual lock mode only).
    pub fn lock_table(&mut self, wait: bool) -> Result<()> {
        if self.lock_mode != LockMode::Manual {
            return Err(Error::NotManualLock);
        }
        if self.file_locked {
            return Ok(());
        }

        let mode = if wait {
            RangeLockMode::WriteWait
        } else {
            RangeLockMode::Write
        };
        range_lock(self.index.file(), ROW_LOCK_BASE, ROW_LOCK_LEN, mode)?;

        self.file_locked = true;
        Ok(())
    }

    pub fn unlock_table(&mut self) -> Result<()> {
        if self.file_locked {
            self.file_locked = false;
            range_lock(
                self.index.file(),
                ROW_LOCK_BASE,
                ROW_LOCK_LEN,
                RangeLockMode::Unlock,
            )?;
        }
        Ok(())
    }

    /// Releases the open sentinel (close path).
    pub fn release_open_sentinel(&mut self) -> Result<()> {
        range_lock(
            self.index.file(),
            FILE_OPEN_OFFSET,
            1,
            RangeLockMode::Unlock,
        )
    }

    // === cursor positioning ===

    fn active_desc(&self) -> &KeyDescriptor {
        &self.keys[self.cursor.key_no].desc
    }

    /// Entry at or after `(key, dup_no)` on the active index.
    fn at_or_after(&mut self, key: &[u8], dup_no: DupNo) -> Result<Option<Entry>> {
        self.with_tree(self.cursor.key_no, |t| t.at_or_after(key, dup_no))
    }

    fn position_entry(
        &mut self,
        mode: ReadMode,
        seek_key: Option<&[u8]>,
    ) -> Result<Option<Entry>> {
        let key_no = self.cursor.key_no;

        match mode {
            ReadMode::First => self.with_tree(key_no, |t| t.first()),
            ReadMode::Last => self.with_tree(key_no, |t| t.last()),

            ReadMode::Next => match self.cursor.state {
                CursorState::Unpositioned => self.with_tree(key_no, |t| t.first()),
                CursorState::OnDummy => Ok(None),
                CursorState::OnEntry => {
                    let key = self.cursor.key.clone();
                    let dup_no = self.cursor.dup_no;

                    if self.cursor.disjoint {
                        // return the entry the cursor was parked on by the
                        // preceding seek (or its successor if it is gone)
                        self.at_or_after(&key, dup_no)
                    } else {
                        self.with_tree(key_no, |t| t.next_after(&key, dup_no))
                    }
                }
            },

            ReadMode::Prev => match self.cursor.state {
                CursorState::Unpositioned => Ok(None),
                CursorState::OnDummy => self.with_tree(key_no, |t| t.last()),
                CursorState::OnEntry => {
                    let key = self.cursor.key.clone();
                    let dup_no = self.cursor.dup_no;
                    self.with_tree(key_no, |t| t.prev_before(&key, dup_no))
                }
            },

            ReadMode::Current => {
                if self.cursor.state != CursorState::OnEntry {
                    return Err(Error::NoCurrent);
                }

                let key = self.cursor.key.clone();
                let dup_no = self.cursor.dup_no;

                Ok(self
                    .at_or_after(&key, dup_no)?
                    .filter(|e| e.dup_no == dup_no && e.key == key))
            }

            ReadMode::Equal => {
                let key = seek_key.ok_or(Error::BadArgument)?;
                let (outcome, e) =
                    self.with_tree(key_no, |t| t.seek(key, SeekBias::GreaterOrEqual))?;

                Ok((outcome == SearchOutcome::Exact).then_some(e))
            }

            ReadMode::Greater | ReadMode::GreaterOrEqual => {
                let key = seek_key.ok_or(Error::BadArgument)?;
                let bias = if mode == ReadMode::Greater {
                    SeekBias::Greater
                } else {
                    SeekBias::GreaterOrEqual
                };

                let (_, e) = self.with_tree(key_no, |t| t.seek(key, bias))?;
                Ok((!e.dummy).then_some(e))
            }
        }
    }

    fn exhausted_error(mode: ReadMode) -> Error {
        match mode {
            ReadMode::Equal | ReadMode::Current => Error::NoRecord,
            _ => Error::EndOfFile,
        }
    }

    /// Positions the cursor and fetches the located row into `buffer`.
    ///
    /// For the Equal/Greater/GreaterOrEqual modes the incoming buffer
    /// content supplies the search value.
    pub fn read(
        &mut self,
        buffer: &mut Vec<u8>,
        mode: ReadMode,
        flags: ReadFlags,
    ) -> Result<RowId> {
        if self.open_mode == OpenMode::Output {
            return Err(Error::BadArgument);
        }

        let desc = self.active_desc();
        if desc.is_null_key() {
            return Err(Self::exhausted_error(mode));
        }

        let seek_key = match mode {
            ReadMode::Equal | ReadMode::Greater | ReadMode::GreaterOrEqual => {
                if buffer.len() < self.index.dict.min_row_len as usize {
                    return Err(Error::BadArgument);
                }
                Some(build_key(desc, buffer))
            }
            _ => None,
        };

        let mut entry = self.position_entry(mode, seek_key.as_deref())?;

        loop {
            let Some(e) = entry else {
                if mode != ReadMode::Equal && mode != ReadMode::Current {
                    self.cursor.park_at_end();
                }
                return Err(Self::exhausted_error(mode));
            };

            if flags.lock || self.auto_locking() {
                if self.auto_locking() && !flags.keep_locks && !flags.lock {
                    self.release_auto_lock()?;
                }

                match self.lock_row(e.ptr, flags.wait, flags.lock) {
                    Ok(()) => {}
                    Err(Error::Locked) if flags.skip_locked && mode.is_sequential() => {
                        // silently step past the locked row
                        let key_no = self.cursor.key_no;
                        entry = match mode {
                            ReadMode::First | ReadMode::Next => self
                                .with_tree(key_no, |t| t.next_after(&e.key, e.dup_no))?,
                            _ => self.with_tree(key_no, |t| t.prev_before(&e.key, e.dup_no))?,
                        };
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            }

            let row = self.data.read_row(&mut self.index, e.ptr)?;
            self.cursor.place(e.key.clone(), e.dup_no, e.ptr, false);

            return match row {
                Some(bytes) => {
                    *buffer = bytes;
                    Ok(e.ptr)
                }
                // a concurrent delete got here between index and data access
                None => Err(Error::NoRecord),
            };
        }
    }

    /// Positions the cursor without fetching a row, optionally on a key
    /// prefix shorter than the full key.
    pub fn start(
        &mut self,
        desc: &KeyDescriptor,
        key_len: usize,
        buffer: &[u8],
        mode: ReadMode,
    ) -> Result<()> {
        if self.open_mode == OpenMode::Output {
            return Err(Error::BadArgument);
        }

        let key_no = self
            .keys
            .iter()
            .position(|k| k.desc.same_shape(desc))
            .ok_or(Error::BadKey)?;

        self.cursor.reset(key_no);

        let desc = self.keys[key_no].desc.clone();
        let full_len = desc.key_len();

        if desc.is_null_key() {
            return Err(Self::exhausted_error(mode));
        }

        let entry = match mode {
            ReadMode::First => self.with_tree(key_no, |t| t.first())?,
            ReadMode::Last => self.with_tree(key_no, |t| t.last())?,

            ReadMode::Equal | ReadMode::Greater | ReadMode::GreaterOrEqual => {
                if key_len > full_len || buffer.len() < self.index.dict.min_row_len as usize {
                    return Err(Error::BadArgument);
                }

                let len = if key_len == 0 { full_len } else { key_len };
                let mut prefix = build_key(&desc, buffer);
                prefix.truncate(len);

                // a short key is padded out: low bytes keep prefix matches
                // in range, high bytes skip them entirely
                let (fill, bias) = match mode {
                    ReadMode::Greater => (0xFF, SeekBias::Greater),
                    _ => (0x00, SeekBias::GreaterOrEqual),
                };

                let key = pad_key(&prefix, full_len, fill);

                let (_, e) = self.with_tree(key_no, |t| t.seek(&key, bias))?;

                if mode == ReadMode::Equal {
                    if !e.dummy && e.cmp_key_prefix(&prefix, self.collation.as_deref()) == Ordering::Equal {
                        Some(e)
                    } else {
                        None
                    }
                } else {
                    (!e.dummy).then_some(e)
                }
            }

            ReadMode::Next | ReadMode::Prev | ReadMode::Current => {
                return Err(Error::BadArgument)
            }
        };

        match entry {
            Some(e) => {
                self.cursor.place(e.key, e.dup_no, e.ptr, true);
                Ok(())
            }
            None => {
                self.cursor.park_at_end();
                Err(Self::exhausted_error(mode))
            }
        }
    }

    // === mutations ===

    /// Inserts a new row into the data file and every active index.
    ///
    /// Returns the assigned row id plus the duplicate number used per key.
    pub fn insert_row(&mut self, row: &[u8]) -> Result<(RowId, Vec<DupNo>)> {
        self.require_writable()?;
        self.data.validate_len(row.len())?;

        // unique collision pre-check keeps the unwind path rare
        for key_no in 0..self.keys.len() {
            let desc = &self.keys[key_no].desc;
            if desc.duplicates || Self::key_inactive(desc, row) {
                continue;
            }

            let key = build_key(desc, row);
            let (outcome, _) = self.with_tree(key_no, |t| t.seek(&key, SeekBias::Equal))?;
            if outcome == SearchOutcome::Exact {
                return Err(Error::Duplicate);
            }
        }

        let row_id = self.data.allocate_row(&mut self.index)?;

        let mut dups = vec![0; self.keys.len()];
        let mut inserted: Vec<(usize, Vec<u8>, DupNo)> = vec![];

        for key_no in 0..self.keys.len() {
            let desc = &self.keys[key_no].desc;
            if Self::key_inactive(desc, row) {
                continue;
            }

            let key = build_key(desc, row);
            match self.with_tree(key_no, |t| t.insert(&key, row_id)) {
                Ok(dup_no) => {
                    dups[key_no] = dup_no;
                    inserted.push((key_no, key, dup_no));
                }
                Err(err) => {
                    // undo the entries already placed before surfacing
                    for (kn, k, d) in inserted.iter().rev() {
                        let _ = self.with_tree(*kn, |t| t.delete_entry(k, *d));
                    }
                    let _ = self.data.free_row(&mut self.index, row_id);
                    return Err(err);
                }
            }
        }

        self.data.write_row(&mut self.index, row_id, row)?;
        Ok((row_id, dups))
    }

    /// Locates a row through the primary key value carried in `row`.
    pub fn locate_by_primary(&mut self, row: &[u8]) -> Result<RowId> {
        if row.len() < self.index.dict.min_row_len as usize {
            return Err(Error::BadArgument);
        }

        let primary = &self.keys[0].desc;
        if primary.is_null_key() || primary.duplicates {
            return Err(Error::NoPrimary);
        }

        let key = build_key(primary, row);
        let (outcome, e) = self.with_tree(0, |t| t.seek(&key, SeekBias::GreaterOrEqual))?;

        if outcome == SearchOutcome::Exact {
            Ok(e.ptr)
        } else {
            Err(Error::NoRecord)
        }
    }

    /// Replaces a row's bytes, re-keying every index whose derived value
    /// changed. Returns the old image.
    pub fn update_row_inner(&mut self, row_id: RowId, new: &[u8]) -> Result<Vec<u8>> {
        self.require_writable()?;
        self.data.validate_len(new.len())?;

        let old = self
            .data
            .read_row(&mut self.index, row_id)?
            .ok_or(Error::NoRecord)?;

        // unique collision pre-check against other rows
        for key_no in 0..self.keys.len() {
            let desc = &self.keys[key_no].desc;
            if desc.duplicates || Self::key_inactive(desc, new) {
                continue;
            }

            let new_key = build_key(desc, new);
            if !Self::key_inactive(desc, &old) && build_key(desc, &old) == new_key {
                continue;
            }

            let (outcome, e) =
                self.with_tree(key_no, |t| t.seek(&new_key, SeekBias::Equal))?;
            if outcome == SearchOutcome::Exact && e.ptr != row_id {
                return Err(Error::Duplicate);
            }
        }

        enum Undo {
            Reinsert(usize, Vec<u8>, DupNo),
            Remove(usize, Vec<u8>, DupNo),
        }

        let mut undo: Vec<Undo> = vec![];

        for key_no in 0..self.keys.len() {
            let desc = &self.keys[key_no].desc;

            let old_key = (!Self::key_inactive(desc, &old)).then(|| build_key(desc, &old));
            let new_key = (!Self::key_inactive(desc, new)).then(|| build_key(desc, new));

            if old_key == new_key {
                continue;
            }

            let step = (|| -> Result<()> {
                if let Some(ok) = &old_key {
                    let dup_no = self.with_tree(key_no, |t| t.delete(ok, row_id))?;
                    undo.push(Undo::Reinsert(key_no, ok.clone(), dup_no));
                }
                if let Some(nk) = &new_key {
                    let dup_no = self.with_tree(key_no, |t| t.insert(nk, row_id))?;
                    undo.push(Undo::Remove(key_no, nk.clone(), dup_no));
                }
                Ok(())
            })();

            if let Err(err) = step {
                for action in undo.iter().rev() {
                    match action {
                        Undo::Reinsert(kn, k, d) => {
                            let _ = self.with_tree(*kn, |t| t.insert_entry(k, row_id, *d));
                        }
                        Undo::Remove(kn, k, d) => {
                            let _ = self.with_tree(*kn, |t| t.delete_entry(k, *d));
                        }
                    }
                }
                return Err(err);
            }
        }

        self.data.write_row(&mut self.index, row_id, new)?;
        Ok(old)
    }

    /// Removes a row from every index and tombstones it. With `defer_free`
    /// the slot stays off the free chain (transactional delete). Returns
    /// the old image plus the duplicate number each index entry carried.
    pub fn delete_row_inner(
        &mut self,
        row_id: RowId,
        defer_free: bool,
    ) -> Result<(Vec<u8>, Vec<DupNo>)> {
        self.require_writable()?;

        let old = self
            .data
            .read_row(&mut self.index, row_id)?
            .ok_or(Error::NoRecord)?;

        let mut dups = vec![0; self.keys.len()];

        for key_no in 0..self.keys.len() {
            let desc = &self.keys[key_no].desc;
            if Self::key_inactive(desc, &old) {
                continue;
            }

            let key = build_key(desc, &old);
            dups[key_no] = self.with_tree(key_no, |t| t.delete(&key, row_id))?;
        }

        if defer_free {
            self.data.tombstone_row(&self.index, row_id)?;
        } else {
            self.data.free_row(&mut self.index, row_id)?;
        }

        if self.cursor.row_id == row_id && self.cursor.state == CursorState::OnEntry {
            // the cursor key survives as the resume point for Next/Prev
            self.cursor.disjoint = false;
        }

        Ok((old, dups))
    }

    // === secondary index lifecycle ===

    /// Adds an index and populates it from every live row.
    pub fn add_index(&mut self, desc: &KeyDescriptor) -> Result<()> {
        if self.lock_mode != LockMode::Exclusive {
            return Err(Error::NotExclusive);
        }

        desc.validate(self.index.dict.min_row_len)?;

        if self.keys.len() >= MAX_KEYS {
            return Err(Error::BadKey);
        }
        if self.keys.iter().any(|k| k.desc.same_shape(desc)) {
            return Err(Error::KeyExists);
        }

        let root = Tree::create(&mut self.index, desc)?;
        self.keys.push(StoredKey {
            root,
            desc: desc.clone(),
        });
        let keys = self.keys.clone();
        self.index.write_keys(&keys)?;

        let key_no = self.keys.len() - 1;

        let build = (|| -> Result<()> {
            for row_id in 1..=self.index.dict.row_count {
                let Some(row) = self.data.read_row(&mut self.index, row_id)? else {
                    continue;
                };

                let desc = &self.keys[key_no].desc;
                if Self::key_inactive(desc, &row) {
                    continue;
                }

                let key = build_key(desc, &row);
                self.with_tree(key_no, |t| t.insert(&key, row_id).map(|_| ()))?;
            }
            Ok(())
        })();

        if let Err(err) = build {
            let _ = self.with_tree(key_no, |t| t.free_all());
            self.keys.remove(key_no);
            let keys = self.keys.clone();
            let _ = self.index.write_keys(&keys);
            return Err(err);
        }

        Ok(())
    }

    /// Drops an index, returning its nodes to the free list.
    pub fn drop_index(&mut self, desc: &KeyDescriptor) -> Result<()> {
        if self.lock_mode != LockMode::Exclusive {
            return Err(Error::NotExclusive);
        }

        let key_no = self
            .keys
            .iter()
            .position(|k| k.desc.same_shape(desc))
            .ok_or(Error::BadKey)?;

        if key_no == 0 {
            return Err(Error::PrimaryKey);
        }

        self.with_tree(key_no, |t| t.free_all())?;
        self.keys.remove(key_no);

        let keys = self.keys.clone();
        self.index.write_keys(&keys)?;

        if self.cursor.key_no == key_no {
            self.cursor.reset(0);
        } else if self.cursor.key_no > key_no {
            self.cursor.key_no -= 1;
        }

        Ok(())
    }

    // === recovery re-apply primitives ===

    /// Re-applies a logged insert at its original row id with its original
    /// duplicate numbers. Skips silently when the row is already present
    /// (idempotent replay).
    pub fn apply_insert(&mut self, row_id: RowId, dups: &[DupNo], row: &[u8]) -> Result<()> {
        if row_id <= self.index.dict.row_count {
            if let Some(existing) = self.data.read_row(&mut self.index, row_id)? {
                if existing == row {
                    return Ok(());
                }
                return Err(Error::BadLog);
            }
        }

        self.data.force_allocate(&mut self.index, row_id)?;

        for key_no in 0..self.keys.len() {
            let desc = &self.keys[key_no].desc;
            if Self::key_inactive(desc, row) {
                continue;
            }

            let key = build_key(desc, row);
            let dup_no = dups.get(key_no).copied().unwrap_or(0);
            self.with_tree(key_no, |t| t.insert_entry(&key, row_id, dup_no))?;
        }

        self.data.write_row(&mut self.index, row_id, row)?;
        Ok(())
    }

    /// Re-applies a logged update (idempotent).
    ///
    /// A tombstoned target means a later delete record already took the
    /// row out; the update is moot.
    pub fn apply_update(&mut self, row_id: RowId, new: &[u8]) -> Result<()> {
        match self.data.read_row(&mut self.index, row_id)? {
            Some(existing) if existing == new => Ok(()),
            Some(_) => self.update_row_inner(row_id, new).map(|_| ()),
            None => Ok(()),
        }
    }

    /// Re-applies a logged delete (idempotent).
    pub fn apply_delete(&mut self, row_id: RowId) -> Result<()> {
        if row_id > self.index.dict.row_count
            || self.data.read_row(&mut self.index, row_id)?.is_none()
        {
            return Ok(());
        }
        self.delete_row_inner(row_id, false).map(|_| ())
    }

    // === rollback primitives ===

    /// Undoes an insert made inside the current transaction, restoring the
    /// row count when the slot was freshly allocated.
    pub fn undo_insert(&mut self, row_id: RowId) -> Result<()> {
        let old = self
            .data
            .read_row(&mut self.index, row_id)?
            .ok_or(Error::NoRecord)?;

        for key_no in 0..self.keys.len() {
            let desc = &self.keys[key_no].desc;
            if Self::key_inactive(desc, &old) {
                continue;
            }

            let key = build_key(desc, &old);
            self.with_tree(key_no, |t| t.delete(&key, row_id).map(|_| ()))?;
        }

        if row_id == self.index.dict.row_count {
            self.index.dict.row_count -= 1;
            self.index.mark_dirty();
        } else {
            self.data.free_row(&mut self.index, row_id)?;
        }

        Ok(())
    }

    /// Undoes a delete made inside the current transaction: the slot was
    /// kept off the free chain, so the old image moves straight back in
    /// under its original duplicate numbers.
    pub fn undo_delete(&mut self, row_id: RowId, old: &[u8], dups: &[DupNo]) -> Result<()> {
        self.data.revive_row(&self.index, row_id)?;

        for key_no in 0..self.keys.len() {
            let desc = &self.keys[key_no].desc;
            if Self::key_inactive(desc, old) {
                continue;
            }

            let key = build_key(desc, old);
            let dup_no = dups.get(key_no).copied().unwrap_or(0);
            self.with_tree(key_no, |t| t.insert_entry(&key, row_id, dup_no))?;
        }

        self.data.write_row(&mut self.index, row_id, old)?;
        Ok(())
    }

    /// Commits a deferred transactional delete: the tombstoned slot
    /// finally joins the free chain.
    pub fn finish_deferred_delete(&mut self, row_id: RowId) -> Result<()> {
        self.data.free_row(&mut self.index, row_id)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.index.sync()?;
        self.data.sync()
    }
}
