//! Synthetic redo log generation.
//!
//! Produces byte-exact redo files for the integration suite and the
//! fixture tooling: the inverse of the reader/parser path. The engine
//! itself never writes redo; everything here exists so tests can drive
//! the real pipeline end to end against known inputs.

use std::path::Path;

use redowire_error::Result;
use redowire_types::opcode::OpCode;
use redowire_types::value::{encode_date, encode_number};
use redowire_types::{BlockSize, ColumnImage, RedoOp, RedoThread, RowLocator, Scn, Seq, Xid};

use crate::block::{seal_block, BlockHeader, RedoFileHeader, COMPAT_VERSION, FLAG_LWN_START};
use crate::lwn::{LwnHeader, LWN_PAYLOAD_CONT, LWN_PAYLOAD_FIRST};
use crate::record::{
    encode_record, VectorSpec, COLUMN_ROW_DELIMITER, RECORD_FLAG_ROLLBACK, RECORD_FLAG_SHUTDOWN,
};

/// One LWN group to be written: a group SCN plus encoded records.
#[derive(Debug, Clone, Default)]
pub struct GroupSpec {
    pub scn: u64,
    pub records: Vec<Vec<u8>>,
}

impl GroupSpec {
    #[must_use]
    pub fn new(scn: u64) -> Self {
        Self {
            scn,
            records: Vec::new(),
        }
    }

    #[must_use]
    pub fn record(mut self, bytes: Vec<u8>) -> Self {
        self.records.push(bytes);
        self
    }
}

/// A whole redo file to be written.
#[derive(Debug, Clone)]
pub struct RedoFileSpec {
    pub thread: RedoThread,
    pub sequence: Seq,
    pub first_scn: Scn,
    /// Set on sealed files; open files carry the all-ones sentinel.
    pub next_scn: Scn,
    pub resetlogs: u32,
    pub resetlogs_scn: Scn,
    pub activation: u32,
    pub block_size: BlockSize,
    pub end_of_log: bool,
    pub groups: Vec<GroupSpec>,
}

impl RedoFileSpec {
    /// A sealed (archive-like) file.
    #[must_use]
    pub fn sealed(thread: RedoThread, sequence: Seq, first_scn: u64, next_scn: u64) -> Self {
        Self {
            thread,
            sequence,
            first_scn: Scn::new(first_scn),
            next_scn: Scn::new(next_scn),
            resetlogs: 1,
            resetlogs_scn: Scn::new(1),
            activation: 0xac71_0001,
            block_size: BlockSize::B512,
            end_of_log: true,
            groups: Vec::new(),
        }
    }

    /// An online file still being written (no end-of-log marker).
    #[must_use]
    pub fn open_log(thread: RedoThread, sequence: Seq, first_scn: u64) -> Self {
        Self {
            next_scn: Scn::NONE,
            end_of_log: false,
            ..Self::sealed(thread, sequence, first_scn, 0)
        }
    }

    #[must_use]
    pub fn group(mut self, group: GroupSpec) -> Self {
        self.groups.push(group);
        self
    }

    /// Serialize to bytes: header block plus all group blocks.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let bs = self.block_size.as_usize();
        // (block bytes, is an LWN start)
        let mut data_blocks: Vec<(Vec<u8>, bool)> = Vec::new();

        for group in &self.groups {
            let mut payload: Vec<u8> = Vec::new();
            for record in &group.records {
                payload.extend_from_slice(record);
            }
            // Zero-length terminator so the parser stops cleanly.
            payload.extend_from_slice(&[0u8; 4]);

            let first_cap = bs - LWN_PAYLOAD_FIRST;
            let cont_cap = bs - LWN_PAYLOAD_CONT;
            let blocks = if payload.len() <= first_cap {
                1
            } else {
                1 + (payload.len() - first_cap).div_ceil(cont_cap)
            };

            let mut remaining = payload.as_slice();
            for i in 0..blocks {
                let mut block = vec![0u8; bs];
                let start = if i == 0 { LWN_PAYLOAD_FIRST } else { LWN_PAYLOAD_CONT };
                if i == 0 {
                    LwnHeader {
                        blocks: blocks as u32,
                        scn: Scn::new(group.scn),
                    }
                    .write_to(&mut block);
                }
                let take = remaining.len().min(bs - start);
                block[start..start + take].copy_from_slice(&remaining[..take]);
                remaining = &remaining[take..];
                data_blocks.push((block, i == 0));
            }
        }

        let num_blocks = data_blocks.len() as u32;
        let mut out = vec![0u8; bs];
        RedoFileHeader {
            block_size: self.block_size,
            num_blocks,
            thread: self.thread,
            sequence: self.sequence,
            first_scn: self.first_scn,
            next_scn: self.next_scn,
            resetlogs: self.resetlogs,
            resetlogs_scn: self.resetlogs_scn,
            activation: self.activation,
            description: format!("T {}, S {}", self.thread, self.sequence),
            end_of_log: self.end_of_log,
            compat: COMPAT_VERSION,
        }
        .write_block(&mut out);

        for (i, (mut block, is_start)) in data_blocks.into_iter().enumerate() {
            BlockHeader {
                block_number: i as u32 + 1,
                sequence: self.sequence.get(),
                checksum: 0,
                flags: if is_start { FLAG_LWN_START } else { 0 },
            }
            .write_to(&mut block);
            seal_block(&mut block);
            out.extend_from_slice(&block);
        }
        out
    }

    /// Write the file to disk.
    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_bytes())?;
        Ok(())
    }
}

// --- record builders -------------------------------------------------------

/// A NULL column image at `index`.
#[must_use]
pub fn col_null(index: u16) -> ColumnImage {
    ColumnImage::new(index, None)
}

/// A `NUMBER` column image from a decimal literal.
#[must_use]
pub fn col_number(index: u16, literal: &str) -> ColumnImage {
    ColumnImage::new(
        index,
        Some(encode_number(literal).expect("fixture number literal")),
    )
}

/// A text column image.
#[must_use]
pub fn col_text(index: u16, text: &str) -> ColumnImage {
    ColumnImage::new(index, Some(text.as_bytes().to_vec()))
}

/// A `DATE` column image.
#[must_use]
pub fn col_date(index: u16, ts: chrono::NaiveDateTime) -> ColumnImage {
    ColumnImage::new(index, Some(encode_date(ts).to_vec()))
}

/// A transaction-begin record.
#[must_use]
pub fn record_begin(xid: Xid, scn: u64) -> Vec<u8> {
    let vector = VectorSpec::new(RedoOp::TxnBegin, RowLocator { obj: 0, block: 0, slot: 0 }, xid);
    encode_record(RedoOp::TxnBegin.opcode(), 0, Scn::new(scn), &[vector])
}

/// A commit (or rollback) record, optionally carrying the shutdown
/// marker.
#[must_use]
pub fn record_end(xid: Xid, scn: u64, rollback: bool, shutdown: bool) -> Vec<u8> {
    let mut flags = 0u16;
    if rollback {
        flags |= RECORD_FLAG_ROLLBACK;
    }
    if shutdown {
        flags |= RECORD_FLAG_SHUTDOWN;
    }
    let vector = VectorSpec::new(RedoOp::TxnEnd, RowLocator { obj: 0, block: 0, slot: 0 }, xid);
    encode_record(RedoOp::TxnEnd.opcode(), flags, Scn::new(scn), &[vector])
}

/// A commit record.
#[must_use]
pub fn record_commit(xid: Xid, scn: u64) -> Vec<u8> {
    record_end(xid, scn, false, false)
}

/// An insert: redo vector only (inserts have no before-image).
#[must_use]
pub fn record_insert(xid: Xid, scn: u64, locator: RowLocator, after: Vec<ColumnImage>) -> Vec<u8> {
    let vector = VectorSpec::new(RedoOp::RowInsert, locator, xid).with_columns(after);
    encode_record(RedoOp::RowInsert.opcode(), 0, Scn::new(scn), &[vector])
}

/// An update: undo vector with the full before-image (supplemental
/// logging), redo vector with the changed columns.
#[must_use]
pub fn record_update(
    xid: Xid,
    scn: u64,
    locator: RowLocator,
    before: Vec<ColumnImage>,
    changed: Vec<ColumnImage>,
) -> Vec<u8> {
    let undo = VectorSpec::new(RedoOp::UndoData, locator, xid).with_columns(before);
    let redo = VectorSpec::new(RedoOp::RowUpdate, locator, xid).with_columns(changed);
    encode_record(RedoOp::RowUpdate.opcode(), 0, Scn::new(scn), &[undo, redo])
}

/// A delete: undo vector with the full before-image, bare delete vector.
#[must_use]
pub fn record_delete(xid: Xid, scn: u64, locator: RowLocator, before: Vec<ColumnImage>) -> Vec<u8> {
    let undo = VectorSpec::new(RedoOp::UndoData, locator, xid).with_columns(before);
    let redo = VectorSpec::new(RedoOp::RowDelete, locator, xid);
    encode_record(RedoOp::RowDelete.opcode(), 0, Scn::new(scn), &[undo, redo])
}

/// A savepoint mark.
#[must_use]
pub fn record_savepoint_mark(xid: Xid, scn: u64, id: u32) -> Vec<u8> {
    let vector = VectorSpec::new(
        RedoOp::SavepointMark,
        RowLocator { obj: 0, block: 0, slot: 0 },
        xid,
    )
    .with_columns(vec![ColumnImage::new(0, Some(id.to_le_bytes().to_vec()))]);
    encode_record(RedoOp::SavepointMark.opcode(), 0, Scn::new(scn), &[vector])
}

/// A rollback-to-savepoint record.
#[must_use]
pub fn record_savepoint_rollback(xid: Xid, scn: u64, id: u32) -> Vec<u8> {
    let vector = VectorSpec::new(
        RedoOp::SavepointRollback,
        RowLocator { obj: 0, block: 0, slot: 0 },
        xid,
    )
    .with_columns(vec![ColumnImage::new(0, Some(id.to_le_bytes().to_vec()))]);
    encode_record(RedoOp::SavepointRollback.opcode(), 0, Scn::new(scn), &[vector])
}

/// A checkpoint record: advances the LWN SCN with no DML.
#[must_use]
pub fn record_checkpoint(scn: u64) -> Vec<u8> {
    let vector = VectorSpec::new(
        RedoOp::Checkpoint,
        RowLocator { obj: 0, block: 0, slot: 0 },
        Xid::new(0, 0, 0),
    );
    encode_record(RedoOp::Checkpoint.opcode(), 0, Scn::new(scn), &[vector])
}

/// A multi-row insert record.
#[must_use]
pub fn record_multi_insert(
    xid: Xid,
    scn: u64,
    obj: u32,
    block: u32,
    rows: Vec<(u16, Vec<ColumnImage>)>,
) -> Vec<u8> {
    let mut columns = Vec::new();
    for (slot, images) in rows {
        columns.push(ColumnImage::new(
            COLUMN_ROW_DELIMITER,
            Some(slot.to_le_bytes().to_vec()),
        ));
        columns.extend(images);
    }
    let vector = VectorSpec::new(
        RedoOp::MultiInsert,
        RowLocator { obj, block, slot: 0 },
        xid,
    )
    .with_columns(columns);
    encode_record(RedoOp::MultiInsert.opcode(), 0, Scn::new(scn), &[vector])
}

/// A record with an opcode the engine does not interpret.
#[must_use]
pub fn record_unknown(scn: u64) -> Vec<u8> {
    let op = OpCode::new(13, 9);
    let vector = VectorSpec {
        op,
        flags: 0,
        locator: RowLocator { obj: 0, block: 0, slot: 0 },
        xid: Xid::new(0, 0, 0),
        columns: Vec::new(),
    };
    encode_record(op, 0, Scn::new(scn), &[vector])
}
