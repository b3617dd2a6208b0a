// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Transactions: the write-ahead log, the in-memory undo journal, and
//! crash recovery.

pub mod log;
pub mod recover;

use crate::{
    format::RowId,
    isam::enter_op,
    tree::DupNo,
    Error, Isam, Result,
};
use self::log::{LogFile, LogOp};
use std::path::Path;

/// Process-wide transaction state carried by the context.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TxnState {
    /// No transaction open
    Inactive,

    /// Begin has been issued, nothing written yet
    Active,

    /// Begin has been issued and mutations are pending
    NeedFlush,

    /// Commit in progress
    Committing,

    /// Rollback in progress
    RollingBack,

    /// Log replay in progress
    Recovering,
}

impl TxnState {
    pub fn in_transaction(self) -> bool {
        matches!(self, Self::Active | Self::NeedFlush)
    }
}

/// One undoable step of the open transaction.
#[derive(Clone, Debug)]
pub(crate) enum JournalOp {
    Insert {
        handle: usize,
        row_id: RowId,
    },
    Update {
        handle: usize,
        row_id: RowId,
        old: Vec<u8>,
    },
    Delete {
        handle: usize,
        row_id: RowId,
        old: Vec<u8>,
        dups: Vec<DupNo>,
    },
}

fn now_secs() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| {
            // NOTE: wraps in 2106, same as the on-disk field
            #[allow(clippy::cast_possible_truncation)]
            let secs = d.as_secs() as u32;
            secs
        })
}

impl Isam {
    /// Opens (or switches) the transaction log.
    pub fn log_open(&mut self, path: &Path) -> Result<()> {
        self.log = Some(LogFile::open(path)?);
        Ok(())
    }

    /// Closes the transaction log. Mutations stop being logged.
    pub fn log_close(&mut self) {
        self.log = None;
    }

    pub fn is_logging(&self) -> bool {
        self.log.is_some()
    }

    /// Appends a record unless logging is off, the table opted out, or a
    /// replay/undo pass is itself the writer.
    pub(crate) fn log_append(&mut self, op: LogOp, payload: &[u8], no_log: bool) -> Result<()> {
        if no_log
            || matches!(
                self.txn,
                TxnState::Recovering | TxnState::RollingBack | TxnState::Committing
            )
        {
            return Ok(());
        }

        let pid = self.pid;
        let Some(log) = self.log.as_mut() else {
            return Ok(());
        };

        log.append(op, pid, now_secs(), payload)
    }

    /// Opens a transaction. Requires the log.
    pub fn begin(&mut self) -> Result<()> {
        if self.log.is_none() {
            return Err(Error::NoLogging);
        }
        if self.txn.in_transaction() {
            return Err(Error::BadArgument);
        }

        self.log_append(LogOp::Begin, &[], false)?;
        self.txn = TxnState::Active;
        self.journal.clear();

        Ok(())
    }

    /// Commits the open transaction: deferred slot frees are performed,
    /// the COMMIT record is appended and synced, then all row locks drop.
    pub fn commit(&mut self) -> Result<()> {
        if !self.txn.in_transaction() {
            return Err(Error::NoBegin);
        }

        self.txn = TxnState::Committing;

        let journal = std::mem::take(&mut self.journal);
        for op in &journal {
            if let JournalOp::Delete { handle, row_id, .. } = op {
                if let Some(table) = self.tables.get_mut(*handle).and_then(Option::as_mut) {
                    enter_op(table, true, |t| t.finish_deferred_delete(*row_id))?;
                }
            }
        }

        // the log reaches stable storage before the table files do
        self.txn = TxnState::Inactive;
        self.log_append(LogOp::Commit, &[], false)?;
        if let Some(log) = &self.log {
            log.sync()?;
        }

        self.end_transaction();
        Ok(())
    }

    /// Rolls the open transaction back: the journal is undone in reverse,
    /// the ROLLBACK record is appended, then all row locks drop.
    pub fn rollback(&mut self) -> Result<()> {
        if !self.txn.in_transaction() {
            return Err(Error::NoBegin);
        }

        self.txn = TxnState::RollingBack;

        let journal = std::mem::take(&mut self.journal);
        for op in journal.iter().rev() {
            match op {
                JournalOp::Insert { handle, row_id } => {
                    if let Some(table) = self.tables.get_mut(*handle).and_then(Option::as_mut) {
                        enter_op(table, true, |t| t.undo_insert(*row_id))?;
                    }
                }
                JournalOp::Update {
                    handle,
                    row_id,
                    old,
                } => {
                    if let Some(table) = self.tables.get_mut(*handle).and_then(Option::as_mut) {
                        enter_op(table, true, |t| t.update_row_inner(*row_id, old).map(|_| ()))?;
                    }
                }
                JournalOp::Delete {
                    handle,
                    row_id,
                    old,
                    dups,
                } => {
                    if let Some(table) = self.tables.get_mut(*handle).and_then(Option::as_mut) {
                        enter_op(table, true, |t| t.undo_delete(*row_id, old, dups))?;
                    }
                }
            }
        }

        self.txn = TxnState::Inactive;
        self.log_append(LogOp::Rollback, &[], false)?;

        self.end_transaction();
        Ok(())
    }

    /// Drops row locks everywhere and finishes buffers-only closes.
    fn end_transaction(&mut self) {
        for slot in &mut self.tables {
            if let Some(table) = slot {
                table.touched = false;
                let _ = table.release_locks();

                if table.buffers_only {
                    let _ = table.release_open_sentinel();
                    *slot = None;
                }
            }
        }

        self.txn = TxnState::Inactive;
        self.journal.clear();
    }
}
