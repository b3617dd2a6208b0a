// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Crash recovery: forward log replay.
//!
//! Every BEGIN is classified by probing ahead for its terminator — a
//! COMMIT makes the transaction durable, another BEGIN, a ROLLBACK or the
//! end of the log means every record it covers is skipped. Durable and
//! non-transactional records are re-applied through the primary operations
//! with forced row allocation, so replaying the same log twice converges
//! on the same table state.

use super::log::{
    BuildPayload, DeletePayload, IndexPayload, InsertPayload, LogOp, LogRecord, NamePayload,
    RenamePayload, UpdatePayload, ValuePayload,
};
use super::TxnState;
use crate::{
    coding::Decode,
    isam::enter_op,
    table::{BuildOptions, LockMode, OpenOptions, Table},
    Error, Isam, Result,
};
use rustc_hash::FxHashMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Maps a `(pid, logged handle)` pair to a live slot in the context.
type HandleMap = FxHashMap<(u32, u32), usize>;

fn decode<T: Decode>(payload: &[u8]) -> Result<T> {
    T::decode_from(&mut &payload[..]).map_err(|_| Error::BadLog)
}

/// `true` when the transaction opened by the BEGIN at `begin_idx` ends in
/// a COMMIT.
fn is_durable(records: &[LogRecord], begin_idx: usize, pid: u32) -> bool {
    for record in records.iter().skip(begin_idx + 1) {
        if record.pid != pid {
            continue;
        }
        match record.op {
            LogOp::Commit => return true,
            LogOp::Begin | LogOp::Rollback => return false,
            _ => {}
        }
    }
    false
}

impl Isam {
    /// Replays the open log against the tables it names.
    pub fn recover(&mut self) -> Result<()> {
        let records = self.log.as_mut().ok_or(Error::NoLogging)?.read_all()?;
        log::debug!("recovering {} log records", records.len());

        self.txn = TxnState::Recovering;
        let result = self.replay(&records);
        self.txn = TxnState::Inactive;

        result
    }

    fn replay(&mut self, records: &[LogRecord]) -> Result<()> {
        // pid -> durability of its currently open transaction
        let mut live_txns: FxHashMap<u32, bool> = FxHashMap::default();
        let mut handles = HandleMap::default();
        let mut recovered: HashSet<usize> = HashSet::new();

        for (idx, record) in records.iter().enumerate() {
            match record.op {
                LogOp::Begin => {
                    let durable = is_durable(records, idx, record.pid);
                    log::trace!(
                        "pid {} begins a {} transaction",
                        record.pid,
                        if durable { "durable" } else { "discarded" }
                    );
                    live_txns.insert(record.pid, durable);
                    continue;
                }
                LogOp::Commit | LogOp::Rollback => {
                    live_txns.remove(&record.pid);
                    continue;
                }
                _ => {}
            }

            if live_txns.get(&record.pid) == Some(&false) {
                continue;
            }

            self.replay_one(record, &mut handles, &mut recovered)?;
        }

        // an unmatched BEGIN was already classified as discarded; nothing
        // of it reached the tables, so closing up is all that is left
        for slot in recovered {
            if let Some(mut table) = self.tables.get_mut(slot).and_then(Option::take) {
                let _ = table.release_locks();
                let _ = table.release_open_sentinel();
            }
        }

        Ok(())
    }

    /// Opens (or reuses) a table by name for replay purposes.
    fn recovery_open(
        &mut self,
        base: &Path,
        recovered: &mut HashSet<usize>,
    ) -> Result<usize> {
        for (idx, slot) in self.tables.iter().enumerate() {
            if slot.as_ref().is_some_and(|t| t.base() == base) {
                return Ok(idx);
            }
        }

        let opts = OpenOptions {
            lock: LockMode::Exclusive,
            ..OpenOptions::default()
        };

        let table = Table::open(base, &opts)?;
        let slot = self.alloc_recovery_slot()?;
        self.tables[slot] = Some(table);
        recovered.insert(slot);

        Ok(slot)
    }

    fn alloc_recovery_slot(&mut self) -> Result<usize> {
        if let Some(idx) = self.tables.iter().position(Option::is_none) {
            return Ok(idx);
        }
        if self.tables.len() >= crate::format::MAX_HANDLES {
            return Err(Error::TooManyHandles);
        }
        self.tables.push(None);
        Ok(self.tables.len() - 1)
    }

    fn replay_one(
        &mut self,
        record: &LogRecord,
        handles: &mut HandleMap,
        recovered: &mut HashSet<usize>,
    ) -> Result<()> {
        log::trace!("replaying {:?} from pid {}", record.op, record.pid);

        match record.op {
            LogOp::Build => {
                let payload: BuildPayload = decode(&record.payload)?;
                let base = PathBuf::from(&payload.name);

                let slot = if crate::table::table_files_exist(&base)? {
                    self.recovery_open(&base, recovered)?
                } else {
                    let opts = BuildOptions {
                        min_row_len: payload.min_row_len,
                        max_row_len: payload.variable.then_some(payload.max_row_len),
                        node_size: payload.node_size,
                        lock: LockMode::Exclusive,
                        collation: None,
                    };

                    let table = Table::build(&base, &opts, &payload.primary.desc)?;
                    let slot = self.alloc_recovery_slot()?;
                    self.tables[slot] = Some(table);
                    recovered.insert(slot);
                    slot
                };

                handles.insert((record.pid, payload.handle), slot);
            }

            LogOp::Open => {
                let payload: NamePayload = decode(&record.payload)?;
                let slot = self.recovery_open(&PathBuf::from(&payload.name), recovered)?;
                handles.insert((record.pid, payload.handle), slot);
            }

            LogOp::Close => {
                let payload: NamePayload = decode(&record.payload)?;
                if let Some(slot) = handles.remove(&(record.pid, payload.handle)) {
                    if recovered.remove(&slot) {
                        if let Some(mut table) = self.tables.get_mut(slot).and_then(Option::take)
                        {
                            let _ = table.release_locks();
                            let _ = table.release_open_sentinel();
                        }
                    }
                }
            }

            LogOp::Erase => {
                let payload: NamePayload = decode(&record.payload)?;
                let base = PathBuf::from(&payload.name);

                for (idx, slot) in self.tables.iter_mut().enumerate() {
                    if slot.as_ref().is_some_and(|t| t.base() == base) {
                        if let Some(mut table) = slot.take() {
                            let _ = table.release_locks();
                            let _ = table.release_open_sentinel();
                        }
                        recovered.remove(&idx);
                    }
                }

                if crate::table::table_files_exist(&base)? {
                    crate::table::erase_table_files(&base)?;
                }
            }

            LogOp::Rename => {
                let payload: RenamePayload = decode(&record.payload)?;
                let old = PathBuf::from(&payload.old);
                let new = PathBuf::from(&payload.new);

                if crate::table::table_files_exist(&old)? {
                    crate::table::rename_table_files(&old, &new)?;
                }
                // already renamed on a previous pass otherwise
            }

            LogOp::Insert => {
                let payload: InsertPayload = decode(&record.payload)?;
                if let Some(table) = self.replay_table(handles, record.pid, payload.handle) {
                    enter_op(table, true, |t| {
                        t.apply_insert(payload.row_id, &payload.dups, &payload.row)
                    })?;
                }
            }

            LogOp::Update => {
                let payload: UpdatePayload = decode(&record.payload)?;
                if let Some(table) = self.replay_table(handles, record.pid, payload.handle) {
                    enter_op(table, true, |t| t.apply_update(payload.row_id, &payload.new))?;
                }
            }

            LogOp::Delete => {
                let payload: DeletePayload = decode(&record.payload)?;
                if let Some(table) = self.replay_table(handles, record.pid, payload.handle) {
                    enter_op(table, true, |t| t.apply_delete(payload.row_id))?;
                }
            }

            LogOp::CreateIndex => {
                let payload: IndexPayload = decode(&record.payload)?;
                if let Some(table) = self.replay_table(handles, record.pid, payload.handle) {
                    match enter_op(table, true, |t| t.add_index(&payload.key.desc)) {
                        Ok(()) | Err(Error::KeyExists) => {}
                        Err(e) => return Err(e),
                    }
                }
            }

            LogOp::DropIndex => {
                let payload: IndexPayload = decode(&record.payload)?;
                if let Some(table) = self.replay_table(handles, record.pid, payload.handle) {
                    match enter_op(table, true, |t| t.drop_index(&payload.key.desc)) {
                        Ok(()) | Err(Error::BadKey) => {}
                        Err(e) => return Err(e),
                    }
                }
            }

            LogOp::SetUnique => {
                let payload: ValuePayload = decode(&record.payload)?;
                if let Some(table) = self.replay_table(handles, record.pid, payload.handle) {
                    enter_op(table, true, |t| {
                        if payload.value > t.index.dict.unique_id {
                            t.index.dict.unique_id = payload.value;
                            t.index.mark_dirty();
                        }
                        Ok(())
                    })?;
                }
            }

            LogOp::UniqueId => {
                let payload: ValuePayload = decode(&record.payload)?;
                if let Some(table) = self.replay_table(handles, record.pid, payload.handle) {
                    enter_op(table, true, |t| {
                        // the logged value was handed out; move past it
                        if payload.value >= t.index.dict.unique_id {
                            t.index.dict.unique_id = payload.value + 1;
                            t.index.mark_dirty();
                        }
                        Ok(())
                    })?;
                }
            }

            LogOp::Cluster => {
                let _: IndexPayload = decode(&record.payload)?;
            }

            LogOp::Begin | LogOp::Commit | LogOp::Rollback => {
                // handled by the caller
            }
        }

        Ok(())
    }

    fn replay_table(
        &mut self,
        handles: &HandleMap,
        pid: u32,
        logged_handle: u32,
    ) -> Option<&mut Table> {
        let slot = handles.get(&(pid, logged_handle))?;
        let table = self.tables.get_mut(*slot).and_then(Option::as_mut);

        if table.is_none() {
            log::warn!("log names handle {logged_handle} of pid {pid}, but it is not open");
        }
        table
    }
}
