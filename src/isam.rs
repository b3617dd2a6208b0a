// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The engine context: handle table, log handle and transaction state.
//!
//! There is deliberately no process-wide state; everything a top-level
//! operation touches hangs off this value, which callers thread through
//! explicitly.

use crate::{
    cursor::{ReadFlags, ReadMode},
    format::{RowId, MAX_HANDLES},
    key::{KeyDescriptor, StoredKey},
    table::{
        erase_table_files, rename_table_files, BuildOptions, OpenOptions, Table, TableInfo,
    },
    txn::{
        log::{
            BuildPayload, DeletePayload, IndexPayload, InsertPayload, LogFile, LogOp, NamePayload,
            RenamePayload, UpdatePayload, ValuePayload,
        },
        JournalOp, TxnState,
    },
    Error, Result,
};
use crate::coding::Encode;
use crate::cursor::CursorState;
use std::path::Path;

/// Audit-trail sub-operation (currently a validated no-op).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AuditMode {
    SetName,
    GetName,
    Start,
    Stop,
    Info,
}

/// Opaque reference to an open table within one [`Isam`] context.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TableHandle(pub(crate) usize);

/// The engine context.
///
/// One context per process is the intended shape; tables within it are
/// shared across processes through the advisory byte-range locks on their
/// index files. A context (and each handle in it) is single-threaded.
pub struct Isam {
    pub(crate) tables: Vec<Option<Table>>,
    pub(crate) log: Option<LogFile>,
    pub(crate) txn: TxnState,
    pub(crate) journal: Vec<JournalOp>,
    pub(crate) pid: u32,
}

impl Default for Isam {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `f` inside the enter/exit protocol of one table.
pub(crate) fn enter_op<T>(
    table: &mut Table,
    write: bool,
    f: impl FnOnce(&mut Table) -> Result<T>,
) -> Result<T> {
    table.enter(write)?;
    let out = f(table);
    let exit = table.exit();

    match out {
        Err(e) => Err(e),
        Ok(v) => exit.map(|()| v),
    }
}

fn path_str(path: &Path) -> Result<String> {
    path.to_str().map(str::to_owned).ok_or(Error::BadArgument)
}

impl Isam {
    pub fn new() -> Self {
        Self {
            tables: vec![],
            log: None,
            txn: TxnState::Inactive,
            journal: vec![],
            pid: std::process::id(),
        }
    }

    pub(crate) fn table_mut(&mut self, handle: TableHandle) -> Result<&mut Table> {
        self.tables
            .get_mut(handle.0)
            .and_then(Option::as_mut)
            .filter(|t| !t.buffers_only)
            .ok_or(Error::NotOpen)
    }

    fn table_ref(&self, handle: TableHandle) -> Result<&Table> {
        self.tables
            .get(handle.0)
            .and_then(Option::as_ref)
            .filter(|t| !t.buffers_only)
            .ok_or(Error::NotOpen)
    }

    fn free_slot(&mut self) -> Result<usize> {
        if let Some(idx) = self.tables.iter().position(Option::is_none) {
            return Ok(idx);
        }
        if self.tables.len() >= MAX_HANDLES {
            return Err(Error::TooManyHandles);
        }
        self.tables.push(None);
        Ok(self.tables.len() - 1)
    }

    fn find_by_base(&self, base: &Path) -> Option<usize> {
        self.tables
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|t| t.base() == base))
    }

    // === lifecycle ===

    /// Creates a table and opens it in-out.
    ///
    /// Fails with [`Error::Exists`] when either file is already on disk.
    pub fn build(
        &mut self,
        base: &Path,
        opts: &BuildOptions,
        primary: &KeyDescriptor,
    ) -> Result<TableHandle> {
        let slot = self.free_slot()?;
        let table = Table::build(base, opts, primary)?;

        log::debug!("built table {base:?}");
        self.tables[slot] = Some(table);

        let payload = BuildPayload {
            handle: slot as u32,
            node_size: opts.node_size,
            min_row_len: opts.min_row_len,
            max_row_len: opts.max_row_len.unwrap_or(0),
            variable: opts.max_row_len.is_some(),
            name: path_str(base)?,
            primary: StoredKey {
                root: 0,
                desc: primary.clone(),
            },
        };
        self.log_append(LogOp::Build, &payload.encode_into_vec(), false)?;

        Ok(TableHandle(slot))
    }

    /// Opens a table, or revives the buffers-only handle a mid-transaction
    /// close left behind for the same name.
    pub fn open(&mut self, base: &Path, opts: &OpenOptions) -> Result<TableHandle> {
        let no_log = opts.no_log;

        let handle = if let Some(idx) = self.find_by_base(base) {
            let Some(table) = self.tables[idx].as_mut() else {
                return Err(Error::NotOpen);
            };

            if !table.buffers_only {
                // one active handle per file name and process
                return Err(Error::FileLocked);
            }

            table.revive(opts)?;
            TableHandle(idx)
        } else {
            let slot = self.free_slot()?;
            let table = Table::open(base, opts)?;
            self.tables[slot] = Some(table);
            TableHandle(slot)
        };

        let payload = NamePayload {
            handle: handle.0 as u32,
            name: path_str(base)?,
        };
        self.log_append(LogOp::Open, &payload.encode_into_vec(), no_log)?;

        Ok(handle)
    }

    /// Closes a handle. Inside a transaction the handle is demoted to a
    /// buffers-only state instead: row locks survive until commit or
    /// rollback and the same name can be re-opened.
    pub fn close(&mut self, handle: TableHandle) -> Result<()> {
        let in_txn = self.txn.in_transaction();

        let table = self
            .tables
            .get_mut(handle.0)
            .and_then(Option::as_mut)
            .filter(|t| !t.buffers_only)
            .ok_or(Error::NotOpen)?;

        let no_log = table.no_log;
        let name = path_str(table.base())?;

        if in_txn {
            table.buffers_only = true;
        } else {
            table.release_locks()?;
            table.release_open_sentinel()?;
            self.tables[handle.0] = None;
        }

        let payload = NamePayload {
            handle: handle.0 as u32,
            name,
        };
        self.log_append(LogOp::Close, &payload.encode_into_vec(), no_log)
    }

    /// Deletes a table's files, closing any handle on it first.
    pub fn erase(&mut self, base: &Path) -> Result<()> {
        if let Some(idx) = self.find_by_base(base) {
            if let Some(mut table) = self.tables[idx].take() {
                let _ = table.release_locks();
                let _ = table.release_open_sentinel();
            }
        }

        erase_table_files(base)?;

        let payload = NamePayload {
            handle: 0,
            name: path_str(base)?,
        };
        self.log_append(LogOp::Erase, &payload.encode_into_vec(), false)
    }

    /// Renames a table on disk. The table must not be open.
    pub fn rename(&mut self, old: &Path, new: &Path) -> Result<()> {
        if self.find_by_base(old).is_some() {
            return Err(Error::FileLocked);
        }

        rename_table_files(old, new)?;

        let payload = RenamePayload {
            old: path_str(old)?,
            new: path_str(new)?,
        };
        self.log_append(LogOp::Rename, &payload.encode_into_vec(), false)
    }

    // === cursor operations ===

    /// Positions the active-key cursor and reads the located row.
    ///
    /// For the Equal/Greater/GreaterOrEqual modes, the incoming buffer
    /// supplies the search value; on success it is overwritten with the row.
    pub fn read(
        &mut self,
        handle: TableHandle,
        buffer: &mut Vec<u8>,
        mode: ReadMode,
        flags: ReadFlags,
    ) -> Result<RowId> {
        let table = self.table_mut(handle)?;
        enter_op(table, false, |t| t.read(buffer, mode, flags))
    }

    /// Selects the index matching `desc` and positions its cursor without
    /// fetching a row. `key_len` below the full key length seeks on a
    /// prefix; 0 means the whole key.
    pub fn start(
        &mut self,
        handle: TableHandle,
        desc: &KeyDescriptor,
        key_len: usize,
        buffer: &[u8],
        mode: ReadMode,
    ) -> Result<()> {
        let table = self.table_mut(handle)?;
        enter_op(table, false, |t| t.start(desc, key_len, buffer, mode))
    }

    // === mutations ===

    /// Inserts a new row, indexing it under every key.
    pub fn insert(&mut self, handle: TableHandle, row: &[u8]) -> Result<RowId> {
        let in_txn = self.txn.in_transaction();

        let table = self.table_mut(handle)?;
        let (row_id, dups) = enter_op(table, true, |t| t.insert_row(row))?;
        let no_log = table.no_log;
        if in_txn {
            table.touched = true;
        }

        if in_txn {
            self.journal.push(JournalOp::Insert {
                handle: handle.0,
                row_id,
            });
            self.txn = TxnState::NeedFlush;
        }

        let payload = InsertPayload {
            handle: handle.0 as u32,
            row_id,
            dups,
            row: row.to_vec(),
        };
        self.log_append(LogOp::Insert, &payload.encode_into_vec(), no_log)?;

        Ok(row_id)
    }

    /// Rewrites the row whose primary-key value matches `row`'s.
    pub fn update(&mut self, handle: TableHandle, row: &[u8]) -> Result<()> {
        let table = self.table_mut(handle)?;
        let (row_id, old) = enter_op(table, true, |t| {
            let row_id = t.locate_by_primary(row)?;
            let old = t.update_row_inner(row_id, row)?;
            Ok((row_id, old))
        })?;

        self.finish_update(handle, row_id, old, row)
    }

    /// Rewrites the row under the cursor.
    pub fn update_current(&mut self, handle: TableHandle, row: &[u8]) -> Result<()> {
        let table = self.table_mut(handle)?;
        let (row_id, old) = enter_op(table, true, |t| {
            if t.cursor.state != CursorState::OnEntry {
                return Err(Error::NoCurrent);
            }
            let row_id = t.cursor.row_id;
            let old = t.update_row_inner(row_id, row)?;
            Ok((row_id, old))
        })?;

        self.finish_update(handle, row_id, old, row)
    }

    /// Rewrites a row addressed by id.
    pub fn update_row(&mut self, handle: TableHandle, row_id: RowId, row: &[u8]) -> Result<()> {
        let table = self.table_mut(handle)?;
        let old = enter_op(table, true, |t| t.update_row_inner(row_id, row))?;

        self.finish_update(handle, row_id, old, row)
    }

    fn finish_update(
        &mut self,
        handle: TableHandle,
        row_id: RowId,
        old: Vec<u8>,
        new: &[u8],
    ) -> Result<()> {
        let in_txn = self.txn.in_transaction();

        let table = self.table_mut(handle)?;
        let no_log = table.no_log;
        if in_txn {
            table.touched = true;
        }

        if in_txn {
            self.journal.push(JournalOp::Update {
                handle: handle.0,
                row_id,
                old: old.clone(),
            });
            self.txn = TxnState::NeedFlush;
        }

        let payload = UpdatePayload {
            handle: handle.0 as u32,
            row_id,
            old,
            new: new.to_vec(),
        };
        self.log_append(LogOp::Update, &payload.encode_into_vec(), no_log)
    }

    /// Deletes the row whose primary-key value matches `row`'s.
    pub fn delete(&mut self, handle: TableHandle, row: &[u8]) -> Result<()> {
        let in_txn = self.txn.in_transaction();

        let table = self.table_mut(handle)?;
        let (row_id, old, dups) = enter_op(table, true, |t| {
            let row_id = t.locate_by_primary(row)?;
            let (old, dups) = t.delete_row_inner(row_id, in_txn)?;
            Ok((row_id, old, dups))
        })?;

        self.finish_delete(handle, row_id, old, dups)
    }

    /// Deletes the row under the cursor.
    pub fn delete_current(&mut self, handle: TableHandle) -> Result<()> {
        let in_txn = self.txn.in_transaction();

        let table = self.table_mut(handle)?;
        let (row_id, old, dups) = enter_op(table, true, |t| {
            if t.cursor.state != CursorState::OnEntry {
                return Err(Error::NoCurrent);
            }
            let row_id = t.cursor.row_id;
            let (old, dups) = t.delete_row_inner(row_id, in_txn)?;
            Ok((row_id, old, dups))
        })?;

        self.finish_delete(handle, row_id, old, dups)
    }

    /// Deletes a row addressed by id.
    pub fn delete_row(&mut self, handle: TableHandle, row_id: RowId) -> Result<()> {
        let in_txn = self.txn.in_transaction();

        let table = self.table_mut(handle)?;
        let (old, dups) = enter_op(table, true, |t| t.delete_row_inner(row_id, in_txn))?;

        self.finish_delete(handle, row_id, old, dups)
    }

    fn finish_delete(
        &mut self,
        handle: TableHandle,
        row_id: RowId,
        old: Vec<u8>,
        dups: Vec<u32>,
    ) -> Result<()> {
        let in_txn = self.txn.in_transaction();

        let table = self.table_mut(handle)?;
        let no_log = table.no_log;
        if in_txn {
            table.touched = true;
        }

        if in_txn {
            self.journal.push(JournalOp::Delete {
                handle: handle.0,
                row_id,
                old: old.clone(),
                dups,
            });
            self.txn = TxnState::NeedFlush;
        }

        let payload = DeletePayload {
            handle: handle.0 as u32,
            row_id,
            row: old,
        };
        self.log_append(LogOp::Delete, &payload.encode_into_vec(), no_log)
    }

    // === secondary indexes ===

    /// Adds an index over the table, building it from every live row.
    /// Requires an exclusively opened handle.
    pub fn add_index(&mut self, handle: TableHandle, desc: &KeyDescriptor) -> Result<()> {
        let table = self.table_mut(handle)?;
        enter_op(table, true, |t| t.add_index(desc))?;
        let no_log = table.no_log;

        let payload = IndexPayload {
            handle: handle.0 as u32,
            key: StoredKey {
                root: 0,
                desc: desc.clone(),
            },
        };
        self.log_append(LogOp::CreateIndex, &payload.encode_into_vec(), no_log)
    }

    /// Drops an index, returning its nodes to the free list. Requires an
    /// exclusively opened handle; the primary key cannot be dropped.
    pub fn drop_index(&mut self, handle: TableHandle, desc: &KeyDescriptor) -> Result<()> {
        let table = self.table_mut(handle)?;
        enter_op(table, true, |t| t.drop_index(desc))?;
        let no_log = table.no_log;

        let payload = IndexPayload {
            handle: handle.0 as u32,
            key: StoredKey {
                root: 0,
                desc: desc.clone(),
            },
        };
        self.log_append(LogOp::DropIndex, &payload.encode_into_vec(), no_log)
    }

    // === locks ===

    /// Locks the whole table's row range (manual lock mode only).
    pub fn lock_table(&mut self, handle: TableHandle, wait: bool) -> Result<()> {
        self.table_mut(handle)?.lock_table(wait)
    }

    pub fn unlock_table(&mut self, handle: TableHandle) -> Result<()> {
        self.table_mut(handle)?.unlock_table()
    }

    /// Releases this handle's row locks. Inside a transaction this is a
    /// no-op: locks persist until commit or rollback.
    pub fn release(&mut self, handle: TableHandle) -> Result<()> {
        if self.txn.in_transaction() {
            let _ = self.table_mut(handle)?;
            return Ok(());
        }
        self.table_mut(handle)?.release_locks()
    }

    /// Flushes both files of the table to stable storage.
    pub fn flush(&mut self, handle: TableHandle) -> Result<()> {
        self.table_mut(handle)?.sync()
    }

    // === introspection ===

    pub fn table_info(&mut self, handle: TableHandle) -> Result<TableInfo> {
        let table = self.table_mut(handle)?;
        enter_op(table, false, |t| Ok(t.info()))
    }

    /// The descriptor of one of the table's keys (0 = primary).
    pub fn key_info(&self, handle: TableHandle, key_no: usize) -> Result<KeyDescriptor> {
        let table = self.table_ref(handle)?;
        table
            .keys
            .get(key_no)
            .map(|k| k.desc.clone())
            .ok_or(Error::BadKey)
    }

    // === unique-id sequence ===

    /// Returns the table's unique-id counter and advances it.
    pub fn unique_id(&mut self, handle: TableHandle) -> Result<u64> {
        let table = self.table_mut(handle)?;
        let value = enter_op(table, true, |t| {
            let value = t.index.dict.unique_id;
            t.index.dict.unique_id = value + 1;
            t.index.mark_dirty();
            Ok(value)
        })?;
        let no_log = table.no_log;

        let payload = ValuePayload {
            handle: handle.0 as u32,
            value,
        };
        self.log_append(LogOp::UniqueId, &payload.encode_into_vec(), no_log)?;

        Ok(value)
    }

    /// Raises the unique-id counter to `value`; lowering is ignored so the
    /// sequence never repeats.
    pub fn set_unique_id(&mut self, handle: TableHandle, value: u64) -> Result<()> {
        let table = self.table_mut(handle)?;
        enter_op(table, true, |t| {
            if value > t.index.dict.unique_id {
                t.index.dict.unique_id = value;
                t.index.mark_dirty();
            }
            Ok(())
        })?;
        let no_log = table.no_log;

        let payload = ValuePayload {
            handle: handle.0 as u32,
            value,
        };
        self.log_append(LogOp::SetUnique, &payload.encode_into_vec(), no_log)
    }

    // === stubs ===

    /// Cluster reorganisation is not implemented; validates the handle and
    /// descriptor and succeeds.
    pub fn cluster(&mut self, handle: TableHandle, desc: &KeyDescriptor) -> Result<()> {
        let table = self.table_ref(handle)?;
        desc.validate(table.index.dict.min_row_len)
    }

    /// Audit trails are not implemented; validates the handle and succeeds.
    pub fn audit(&mut self, handle: TableHandle, _mode: AuditMode) -> Result<()> {
        self.table_ref(handle).map(|_| ())
    }
}
