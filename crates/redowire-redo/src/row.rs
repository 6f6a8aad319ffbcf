//! Logical row assembly.
//!
//! A logical row operation usually spans two change vectors: the undo
//! half (5.1, the before-image) and the redo half (10.x). This module
//! joins them by `(data object id, block, slot)` and folds chained-row
//! continuation pieces and index markers into the resulting
//! [`RowChange`]s. All pieces of one logical change are written within a
//! single record, so assembly never crosses record boundaries.

use std::collections::HashMap;

use redowire_error::{RedowireError, Result};
use redowire_types::{
    ColumnImage, DdlEvent, FileOffset, RedoOp, RowChange, RowLocator, RowOpKind, Scn, Seq, Xid,
};
use tracing::{debug, warn};

use crate::record::{ChangeVector, Record, COLUMN_ROW_DELIMITER};

/// The logical effects of one redo record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// A transaction begin (5.2).
    Begin { xid: Xid, scn: Scn },
    /// A transaction end (5.4): commit or rollback.
    End {
        xid: Xid,
        scn: Scn,
        rollback: bool,
        shutdown: bool,
    },
    /// Mark a savepoint (5.11).
    SavepointMark { xid: Xid, id: u32 },
    /// Roll back to a savepoint (5.6).
    SavepointRollback { xid: Xid, id: u32 },
    /// A completed logical row change.
    Row(RowChange),
    /// A DDL record (24.1); observed for schema upkeep only.
    Ddl(DdlEvent),
    /// Checkpoint or thread marker: advances the LWN SCN without DML.
    Advance,
}

/// Join the vectors of one record into logical effects.
///
/// `strict_opcodes` controls the unknown-opcode policy: raise versus skip
/// with a debug line.
pub fn assemble_record(
    record: &Record,
    sequence: Seq,
    offset: FileOffset,
    strict_opcodes: bool,
) -> Result<Vec<Effect>> {
    let corrupt = |detail: String| RedowireError::RedoCorrupt {
        sequence,
        offset,
        detail,
    };
    let scn = record.header.scn;

    // Pass 1: collect undo images by row. Chained before-pieces arrive as
    // additional 5.1 vectors for the same locator and are concatenated.
    let mut undo: HashMap<RowLocator, Vec<ColumnImage>> = HashMap::new();
    for vector in &record.vectors {
        if vector.op == RedoOp::UndoData {
            undo.entry(vector.locator)
                .or_default()
                .extend(vector.columns.iter().cloned());
        }
    }

    let mut effects: Vec<Effect> = Vec::new();
    for vector in &record.vectors {
        match vector.op {
            RedoOp::UndoData => {}
            RedoOp::RowLock => {}
            RedoOp::TxnBegin => effects.push(Effect::Begin {
                xid: vector.xid,
                scn,
            }),
            RedoOp::TxnEnd => effects.push(Effect::End {
                xid: vector.xid,
                scn,
                rollback: record.header.is_rollback(),
                shutdown: record.header.is_shutdown_marker(),
            }),
            RedoOp::SavepointMark => effects.push(Effect::SavepointMark {
                xid: vector.xid,
                id: savepoint_id(vector).ok_or_else(|| {
                    corrupt("savepoint mark without an id column".to_owned())
                })?,
            }),
            RedoOp::SavepointRollback => effects.push(Effect::SavepointRollback {
                xid: vector.xid,
                id: savepoint_id(vector).ok_or_else(|| {
                    corrupt("savepoint rollback without an id column".to_owned())
                })?,
            }),
            RedoOp::RowInsert => effects.push(Effect::Row(RowChange {
                kind: RowOpKind::Insert,
                locator: vector.locator,
                scn,
                xid: vector.xid,
                indexed_change: false,
                before: Vec::new(),
                after: vector.columns.clone(),
            })),
            RedoOp::RowDelete => {
                let before = match undo.remove(&vector.locator) {
                    Some(images) => images,
                    None => {
                        warn!(
                            locator = ?vector.locator,
                            scn = %scn,
                            "delete without undo pair, using redo columns"
                        );
                        vector.columns.clone()
                    }
                };
                effects.push(Effect::Row(RowChange {
                    kind: RowOpKind::Delete,
                    locator: vector.locator,
                    scn,
                    xid: vector.xid,
                    indexed_change: false,
                    before,
                    after: Vec::new(),
                }));
            }
            RedoOp::RowUpdate => {
                let before = undo.remove(&vector.locator).unwrap_or_default();
                effects.push(Effect::Row(RowChange {
                    kind: RowOpKind::Update,
                    locator: vector.locator,
                    scn,
                    xid: vector.xid,
                    indexed_change: false,
                    before,
                    after: vector.columns.clone(),
                }));
            }
            RedoOp::RowPiece => {
                let target = last_row_for(&mut effects, vector.locator).ok_or_else(|| {
                    corrupt(format!(
                        "chained row piece without a leading piece for {:?}",
                        vector.locator
                    ))
                })?;
                match target.kind {
                    RowOpKind::Delete => target.before.extend(vector.columns.iter().cloned()),
                    RowOpKind::Insert | RowOpKind::Update => {
                        target.after.extend(vector.columns.iter().cloned());
                    }
                }
            }
            RedoOp::MultiInsert => {
                assemble_multi_insert(vector, scn, &mut effects, &corrupt)?;
            }
            RedoOp::IndexChange => {
                if let Some(target) = last_row_for(&mut effects, vector.locator) {
                    target.indexed_change = true;
                }
            }
            RedoOp::Ddl => effects.push(Effect::Ddl(parse_ddl(vector, scn, &corrupt)?)),
            RedoOp::Checkpoint | RedoOp::ThreadOpen => effects.push(Effect::Advance),
            RedoOp::Unknown(op) => {
                if strict_opcodes {
                    return Err(RedowireError::UnknownOpcode {
                        opcode: op.to_string(),
                        scn,
                    });
                }
                debug!(opcode = %op, scn = %scn, "skipping uninterpreted change vector");
            }
        }
    }

    // Records with no interpretable vectors still advance the group SCN.
    if effects.is_empty() && record.vectors.is_empty() {
        effects.push(Effect::Advance);
    }

    Ok(effects)
}

fn last_row_for(effects: &mut [Effect], locator: RowLocator) -> Option<&mut RowChange> {
    effects.iter_mut().rev().find_map(|e| match e {
        Effect::Row(change) if change.locator == locator => Some(change),
        _ => None,
    })
}

fn savepoint_id(vector: &ChangeVector) -> Option<u32> {
    let data = vector.columns.first()?.data.as_deref()?;
    let bytes: [u8; 4] = data.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

fn assemble_multi_insert(
    vector: &ChangeVector,
    scn: Scn,
    effects: &mut Vec<Effect>,
    corrupt: &impl Fn(String) -> RedowireError,
) -> Result<()> {
    let mut current: Option<RowChange> = None;
    for column in &vector.columns {
        if column.index == COLUMN_ROW_DELIMITER {
            if let Some(change) = current.take() {
                effects.push(Effect::Row(change));
            }
            let slot = column
                .data
                .as_deref()
                .and_then(|d| <[u8; 2]>::try_from(d).ok())
                .map(u16::from_le_bytes)
                .ok_or_else(|| corrupt("multi-insert delimiter without a slot".to_owned()))?;
            current = Some(RowChange {
                kind: RowOpKind::Insert,
                locator: RowLocator {
                    obj: vector.locator.obj,
                    block: vector.locator.block,
                    slot,
                },
                scn,
                xid: vector.xid,
                indexed_change: false,
                before: Vec::new(),
                after: Vec::new(),
            });
        } else {
            let change = current
                .as_mut()
                .ok_or_else(|| corrupt("multi-insert column before first delimiter".to_owned()))?;
            change.after.push(column.clone());
        }
    }
    if let Some(change) = current {
        effects.push(Effect::Row(change));
    }
    Ok(())
}

fn parse_ddl(
    vector: &ChangeVector,
    scn: Scn,
    corrupt: &impl Fn(String) -> RedowireError,
) -> Result<DdlEvent> {
    let text = |i: usize| -> Option<String> {
        vector
            .columns
            .get(i)
            .and_then(|c| c.data.as_deref())
            .map(|b| String::from_utf8_lossy(b).into_owned())
    };
    let op_type = vector
        .columns
        .get(2)
        .and_then(|c| c.data.as_deref())
        .and_then(|d| <[u8; 2]>::try_from(d).ok())
        .map(u16::from_le_bytes)
        .ok_or_else(|| corrupt("DDL record without an operation type".to_owned()))?;
    Ok(DdlEvent {
        scn,
        xid: vector.xid,
        owner: text(0).ok_or_else(|| corrupt("DDL record without an owner".to_owned()))?,
        object_name: text(1).ok_or_else(|| corrupt("DDL record without an object name".to_owned()))?,
        op_type,
    })
}
