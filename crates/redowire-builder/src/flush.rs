//! Flushing a committed transaction into the builder stream.
//!
//! Column images are decoded here, at emission time, against the schema
//! snapshot current when the transaction is released — not when its redo
//! was parsed. Updates assume supplemental logging supplies the full
//! before-image in the undo half; the after row is the before row with
//! the changed columns overlaid.

use std::collections::BTreeMap;

use redowire_error::{RedowireError, Result};
use redowire_metadata::schema::{SchemaSnapshot, TableDef};
use redowire_txn::{CommittedTransaction, TransactionBuffer};
use redowire_types::value::{decode_column, Charset, DataPolicy};
use redowire_types::{ColumnImage, FieldValue, RowChange, RowOpKind};
use tracing::{debug, warn};

use crate::{Builder, BuilderEvent, ColumnOut, RowEvent};

/// Value-decoding policy for the flush path.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlushOptions {
    pub charset: Charset,
    pub policy: DataPolicy,
}

/// Outcome counters for one flushed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushStats {
    pub ops: u64,
    pub skipped_untracked: u64,
}

/// Emit one committed transaction. Rolled-back transactions and partial
/// transactions without a begin record emit nothing (the latter with a
/// warning: their head predates the resume point).
pub fn flush_transaction(
    buffer: &TransactionBuffer,
    ct: &CommittedTransaction,
    schema: &SchemaSnapshot,
    options: FlushOptions,
    builder: &mut dyn Builder,
) -> Result<FlushStats> {
    let mut stats = FlushStats::default();
    if ct.rollback {
        return Ok(stats);
    }
    if !ct.txn.begin_seen {
        warn!(xid = %ct.xid, commit_scn = %ct.commit_scn,
              "discarding transaction tail without a begin record");
        return Ok(stats);
    }

    builder.emit(BuilderEvent::Begin {
        xid: ct.xid,
        commit_scn: ct.commit_scn,
        thread: ct.thread,
    })?;

    for change in buffer.decode_changes(ct) {
        let change = change?;
        match schema.table(change.locator.obj) {
            Some(table) => {
                let row = build_row(&change, table, ct, options, builder.bump_idx())?;
                builder.emit(BuilderEvent::Row(Box::new(row)))?;
                stats.ops += 1;
            }
            None if schema.schemaless => {
                let row = build_positional_row(&change, ct, builder.bump_idx());
                builder.emit(BuilderEvent::Row(Box::new(row)))?;
                stats.ops += 1;
            }
            None => {
                debug!(obj = change.locator.obj, "skipping change for untracked object");
                stats.skipped_untracked += 1;
            }
        }
    }

    builder.emit(BuilderEvent::Commit {
        xid: ct.xid,
        commit_scn: ct.commit_scn,
    })?;
    Ok(stats)
}

fn build_row(
    change: &RowChange,
    table: &TableDef,
    ct: &CommittedTransaction,
    options: FlushOptions,
    lwn_idx: u64,
) -> Result<RowEvent> {
    let before = decode_images(&change.before, table, options)?;
    let after_changed = decode_images(&change.after, table, options)?;
    // For updates the after row is the full before-image with changed
    // columns overlaid; inserts have no before, deletes no after.
    let after = match change.kind {
        RowOpKind::Update => overlay(&before, after_changed),
        RowOpKind::Insert | RowOpKind::Delete => after_changed,
    };
    Ok(RowEvent {
        op: change.kind,
        scn: change.scn,
        commit_scn: ct.commit_scn,
        xid: change.xid,
        thread: ct.thread,
        owner: table.owner.clone(),
        table: table.name.clone(),
        before,
        after,
        lwn_idx,
    })
}

fn decode_images(
    images: &[ColumnImage],
    table: &TableDef,
    options: FlushOptions,
) -> Result<Vec<ColumnOut>> {
    let mut out = Vec::with_capacity(images.len());
    for image in images {
        let (name, value) = match table.columns.get(image.index as usize) {
            Some(def) => {
                let value = match &image.data {
                    None => FieldValue::Null,
                    Some(bytes) => decode_column(bytes, def.ctype, options.charset, options.policy)
                        .map_err(|source| RedowireError::BadValue {
                            owner: table.owner.clone(),
                            table: table.name.clone(),
                            source,
                        })?,
                };
                (def.name.clone(), value)
            }
            None => {
                // Column beyond the tracked definition (added after the
                // snapshot): keep it positionally as raw bytes.
                let value = image
                    .data
                    .as_ref()
                    .map_or(FieldValue::Null, |b| FieldValue::Raw(b.clone()));
                (format!("COL_{}", image.index), value)
            }
        };
        out.push(ColumnOut { name, value });
    }
    Ok(out)
}

fn build_positional_row(
    change: &RowChange,
    ct: &CommittedTransaction,
    lwn_idx: u64,
) -> RowEvent {
    let positional = |images: &[ColumnImage]| {
        images
            .iter()
            .map(|image| ColumnOut {
                name: format!("COL_{}", image.index),
                value: image
                    .data
                    .as_ref()
                    .map_or(FieldValue::Null, |b| FieldValue::Raw(b.clone())),
            })
            .collect::<Vec<_>>()
    };
    let before = positional(&change.before);
    let after_changed = positional(&change.after);
    let after = match change.kind {
        RowOpKind::Update => overlay(&before, after_changed),
        RowOpKind::Insert | RowOpKind::Delete => after_changed,
    };
    RowEvent {
        op: change.kind,
        scn: change.scn,
        commit_scn: ct.commit_scn,
        xid: change.xid,
        thread: ct.thread,
        owner: String::new(),
        table: format!("OBJ_{}", change.locator.obj),
        before,
        after,
        lwn_idx,
    }
}

/// Overlay changed columns onto the full before-image, by column name.
fn overlay(before: &[ColumnOut], changed: Vec<ColumnOut>) -> Vec<ColumnOut> {
    let mut merged: BTreeMap<String, ColumnOut> = before
        .iter()
        .map(|c| (c.name.clone(), c.clone()))
        .collect();
    for column in changed {
        merged.insert(column.name.clone(), column);
    }
    // Preserve the before-image column order, then any new columns.
    let mut out = Vec::with_capacity(merged.len());
    for column in before {
        if let Some(c) = merged.remove(&column.name) {
            out.push(c);
        }
    }
    out.extend(merged.into_values());
    out
}
